use std::{
    collections::HashMap,
    marker::PhantomData,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::Stream;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{broadcast, oneshot},
};
use tokio_util::task::AbortOnDropHandle;

use super::{
    Callable, Gettable, HANDSHAKE_TIMEOUT, IpcError, PROTOCOL_VERSION, Sendable,
    Subscribable, decode_payload, encode_payload,
    wire::{CallId, ClientFrame, ContextId, IpcEvent, ServerFrame, read_frame, write_frame, write_frames},
};
use crate::{
    utils::{UnbRx, UnbTx, broadcast_stream, lock_mutex, unb_chan},
    window::WindowName,
};

type Reply = Result<Vec<u8>, IpcError>;

enum Pending {
    Async(oneshot::Sender<Reply>),
    Blocking(std::sync::mpsc::Sender<Reply>),
}
impl Pending {
    fn resolve(self, reply: Reply) {
        match self {
            Self::Async(tx) => {
                _ = tx.send(reply);
            }
            Self::Blocking(tx) => {
                _ = tx.send(reply);
            }
        }
    }
}

#[derive(Default)]
struct PendingTable {
    disconnected: bool,
    calls: HashMap<CallId, Pending>,
    subscriptions: HashMap<CallId, UnbTx<Reply>>,
}

struct Shared {
    table: Mutex<PendingTable>,
    events: broadcast::Sender<IpcEvent>,
}
impl Shared {
    fn register_call(&self, id: CallId, pending: Pending) -> Result<(), IpcError> {
        let mut table = lock_mutex(&self.table);
        if table.disconnected {
            return Err(IpcError::Disconnected);
        }
        table.calls.insert(id, pending);
        Ok(())
    }

    fn register_subscription(&self, id: CallId, tx: UnbTx<Reply>) -> Result<(), IpcError> {
        let mut table = lock_mutex(&self.table);
        if table.disconnected {
            return Err(IpcError::Disconnected);
        }
        table.subscriptions.insert(id, tx);
        Ok(())
    }

    fn forget_call(&self, id: CallId) {
        lock_mutex(&self.table).calls.remove(&id);
    }

    fn dispatch(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Response { id, result } => {
                let pending = lock_mutex(&self.table).calls.remove(&id);
                match pending {
                    Some(pending) => pending.resolve(result.map_err(IpcError::Remote)),
                    None => log::debug!("Dropping response to abandoned call {id}"),
                }
            }
            ServerFrame::Update { id, payload, .. } => {
                let table = lock_mutex(&self.table);
                if let Some(tx) = table.subscriptions.get(&id) {
                    _ = tx.send(Ok(payload));
                }
            }
            ServerFrame::SubscriptionEnded { id, error } => {
                let tx = lock_mutex(&self.table).subscriptions.remove(&id);
                if let (Some(tx), Some(error)) = (tx, error) {
                    _ = tx.send(Err(IpcError::Remote(error)));
                }
            }
            ServerFrame::Event { channel, payload } => {
                _ = self.events.send(IpcEvent { channel, payload });
            }
            ServerFrame::Welcome { .. } | ServerFrame::Rejected { .. } => {
                log::warn!("Unexpected handshake frame after connecting");
            }
        }
    }

    /// Rejects everything in flight. Later calls fail immediately.
    fn disconnect(&self) {
        let table = std::mem::replace(
            &mut *lock_mutex(&self.table),
            PendingTable {
                disconnected: true,
                ..Default::default()
            },
        );
        if !table.calls.is_empty() || !table.subscriptions.is_empty() {
            log::warn!(
                "Disconnected with {} pending calls and {} subscriptions",
                table.calls.len(),
                table.subscriptions.len()
            );
        }
        for pending in table.calls.into_values() {
            pending.resolve(Err(IpcError::Disconnected));
        }
        for tx in table.subscriptions.into_values() {
            _ = tx.send(Err(IpcError::Disconnected));
        }
    }
}

struct Inner {
    context: ContextId,
    shared: Arc<Shared>,
    tx: UnbTx<ClientFrame>,
    next_id: AtomicU64,
    _reader: AbortOnDropHandle<()>,
    _writer: AbortOnDropHandle<()>,
}

/// Isolated-side handle to the host. Cheap to clone.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<Inner>,
}

impl Proxy {
    /// Performs the handshake and starts the background reader and writer.
    pub async fn connect(
        stream: impl AsyncRead + AsyncWrite + Send + 'static,
        label: &str,
        window: Option<WindowName>,
    ) -> Result<Self, IpcError> {
        let (read, mut write) = tokio::io::split(stream);
        let mut read = tokio::io::BufReader::new(read);

        write_frame(
            &mut write,
            &ClientFrame::Hello {
                version: PROTOCOL_VERSION.into(),
                label: label.into(),
                window,
            },
        )
        .await?;

        let mut buf = Vec::new();
        let welcome = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut read, &mut buf))
            .await
            .map_err(|_| IpcError::Timeout(HANDSHAKE_TIMEOUT))??;
        let context = match welcome {
            Some(ServerFrame::Welcome { context }) => context,
            Some(ServerFrame::Rejected { reason }) => return Err(IpcError::Rejected(reason)),
            Some(other) => {
                return Err(IpcError::Protocol(format!(
                    "Expected a handshake, got {other:?}"
                )));
            }
            None => return Err(IpcError::Disconnected),
        };

        let shared = Arc::new(Shared {
            table: Mutex::default(),
            events: broadcast::Sender::new(64),
        });
        let (tx, rx) = unb_chan();
        let reader = tokio::spawn({
            let shared = shared.clone();
            async move {
                loop {
                    match read_frame::<ServerFrame>(&mut read, &mut buf).await {
                        Ok(Some(frame)) => shared.dispatch(frame),
                        Ok(None) | Err(IpcError::Disconnected) => break,
                        Err(err) => log::error!("{err}"),
                    }
                }
                shared.disconnect();
            }
        });
        let writer = tokio::spawn(write_frames(write, rx));

        log::debug!("Connected to host as {context}");
        Ok(Self {
            inner: Arc::new(Inner {
                context,
                shared,
                tx,
                next_id: AtomicU64::new(1),
                _reader: AbortOnDropHandle::new(reader),
                _writer: AbortOnDropHandle::new(writer),
            }),
        })
    }

    pub fn context(&self) -> ContextId {
        self.inner.context
    }

    fn next_id(&self) -> CallId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn push(&self, frame: ClientFrame) -> Result<(), IpcError> {
        self.inner
            .tx
            .send(frame)
            .map_err(|_| IpcError::Disconnected)
    }

    pub async fn call<M: Callable>(&self, args: M::Args) -> Result<M::Output, IpcError> {
        let payload = encode_payload(&args)?;
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.inner.shared.register_call(id, Pending::Async(tx))?;

        // Forgets the entry if the caller stops waiting.
        struct Forget<'a>(&'a Shared, CallId);
        impl Drop for Forget<'_> {
            fn drop(&mut self) {
                self.0.forget_call(self.1);
            }
        }
        let _forget = Forget(&self.inner.shared, id);

        self.push(ClientFrame::Request {
            id,
            channel: M::CHANNEL.into(),
            method: M::NAME.into(),
            payload,
        })?;
        let bytes = rx.await.map_err(|_| IpcError::Disconnected)??;
        decode_payload(&bytes)
    }

    pub fn send<M: Sendable>(&self, args: M::Args) -> Result<(), IpcError> {
        self.push(ClientFrame::Send {
            channel: M::CHANNEL.into(),
            method: M::NAME.into(),
            payload: encode_payload(&args)?,
        })
    }

    pub fn subscribe<M: Subscribable>(
        &self,
        args: M::Args,
    ) -> Result<Subscription<M::Output>, IpcError> {
        let payload = encode_payload(&args)?;
        let id = self.next_id();
        let (tx, rx) = unb_chan();
        self.inner.shared.register_subscription(id, tx)?;
        self.push(ClientFrame::Subscribe {
            id,
            channel: M::CHANNEL.into(),
            method: M::NAME.into(),
            payload,
        })?;
        Ok(Subscription {
            id,
            rx,
            proxy: self.clone(),
            _output: PhantomData,
        })
    }

    /// Blocking round-trip for small reads. Only usable from threads outside the runtime.
    pub fn get_blocking<M: Gettable>(
        &self,
        args: M::Args,
        timeout: Duration,
    ) -> Result<M::Output, IpcError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(IpcError::SyncUnsupported);
        }
        let payload = encode_payload(&args)?;
        let id = self.next_id();
        let (tx, rx) = std::sync::mpsc::channel();
        self.inner.shared.register_call(id, Pending::Blocking(tx))?;
        self.push(ClientFrame::Request {
            id,
            channel: M::CHANNEL.into(),
            method: M::NAME.into(),
            payload,
        })?;
        let reply = match rx.recv_timeout(timeout) {
            Ok(reply) => reply,
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                self.inner.shared.forget_call(id);
                return Err(IpcError::Timeout(timeout));
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                return Err(IpcError::Disconnected);
            }
        };
        decode_payload(&reply?)
    }

    /// Host-pushed events, lossy if the receiver lags.
    pub fn events(&self) -> impl Stream<Item = IpcEvent> + Send + 'static {
        broadcast_stream(self.inner.shared.events.subscribe())
    }
}

/// Live stream of updates. Dropping it unsubscribes.
pub struct Subscription<T> {
    id: CallId,
    rx: UnbRx<Result<Vec<u8>, IpcError>>,
    proxy: Proxy,
    _output: PhantomData<fn() -> T>,
}

impl<T: serde::de::DeserializeOwned> Subscription<T> {
    /// `None` once the host ends the subscription. A disconnect yields one
    /// `Err(Disconnected)` first.
    pub async fn next(&mut self) -> Option<Result<T, IpcError>> {
        let item = self.rx.recv().await?;
        Some(item.and_then(|bytes| decode_payload(&bytes)))
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let removed = lock_mutex(&self.proxy.inner.shared.table)
            .subscriptions
            .remove(&self.id);
        if removed.is_some() {
            _ = self.proxy.push(ClientFrame::Unsubscribe { id: self.id });
        }
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
