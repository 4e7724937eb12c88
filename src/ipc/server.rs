use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::{
    StreamExt as _,
    future::BoxFuture,
    stream::{BoxStream, Stream},
};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};

use super::{
    Callable, HANDSHAKE_TIMEOUT, IpcError, Method, PROTOCOL_VERSION, RemoteError,
    RemoteErrorKind, Sendable, Subscribable, decode_payload, encode_payload,
    wire::{CallId, ClientFrame, ContextId, ServerFrame, read_frame, write_frame, write_frames},
};
use crate::{
    utils::{CancelDropGuard, ResultExt as _, UnbTx, lock_mutex, unb_chan},
    window::WindowName,
};

type CallHandler =
    Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, RemoteError>> + Send + Sync>;
type SendHandler = Arc<dyn Fn(Vec<u8>) -> Result<(), RemoteError> + Send + Sync>;
type SubscribeHandler =
    Arc<dyn Fn(Vec<u8>) -> Result<BoxStream<'static, Vec<u8>>, RemoteError> + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Call(CallHandler),
    Send(SendHandler),
    Subscribe(SubscribeHandler),
}

/// Dispatch table from (channel, method) to the host-side implementation.
#[derive(Default, Clone)]
pub struct Router {
    handlers: HashMap<&'static str, HashMap<&'static str, Handler>>,
}

fn decode_args<M: Method>(payload: &[u8]) -> Result<M::Args, RemoteError> {
    decode_payload(payload).map_err(|err| {
        RemoteError::invalid_argument(format!("{}.{}: {err}", M::CHANNEL, M::NAME))
    })
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert<M: Method>(&mut self, handler: Handler) {
        let prev = self
            .handlers
            .entry(M::CHANNEL)
            .or_default()
            .insert(M::NAME, handler);
        if prev.is_some() {
            log::warn!("Replaced handler for {}.{}", M::CHANNEL, M::NAME);
        }
    }

    /// Mounts a request handler. Also serves blocking gets.
    pub fn handle<M, F, Fut>(&mut self, handler: F) -> &mut Self
    where
        M: Callable,
        F: Fn(M::Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<M::Output, RemoteError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert::<M>(Handler::Call(Arc::new(move |payload| {
            let handler = handler.clone();
            Box::pin(async move {
                let args = decode_args::<M>(&payload)?;
                let output = handler(args).await?;
                encode_payload(&output).map_err(|err| RemoteError::internal(err.to_string()))
            })
        })));
        self
    }

    pub fn on_send<M, F>(&mut self, handler: F) -> &mut Self
    where
        M: Sendable,
        F: Fn(M::Args) + Send + Sync + 'static,
    {
        self.insert::<M>(Handler::Send(Arc::new(move |payload| {
            handler(decode_args::<M>(&payload)?);
            Ok(())
        })));
        self
    }

    pub fn on_subscribe<M, F, S>(&mut self, source: F) -> &mut Self
    where
        M: Subscribable,
        F: Fn(M::Args) -> Result<S, RemoteError> + Send + Sync + 'static,
        S: Stream<Item = M::Output> + Send + 'static,
    {
        self.insert::<M>(Handler::Subscribe(Arc::new(move |payload| {
            let stream = source(decode_args::<M>(&payload)?)?;
            Ok(stream
                .filter_map(|item| async move { encode_payload(&item).ok_or_log() })
                .boxed())
        })));
        self
    }

    fn lookup(&self, channel: &str, method: &str) -> Result<&Handler, RemoteError> {
        self.handlers
            .get(channel)
            .and_then(|methods| methods.get(method))
            .ok_or_else(|| RemoteError::not_found(format!("No method {channel}.{method}")))
    }

    fn lookup_call(&self, channel: &str, method: &str) -> Result<CallHandler, RemoteError> {
        match self.lookup(channel, method)? {
            Handler::Call(handler) => Ok(handler.clone()),
            _ => Err(kind_mismatch(channel, method, "called")),
        }
    }
}

fn kind_mismatch(channel: &str, method: &str, how: &str) -> RemoteError {
    RemoteError::new(
        RemoteErrorKind::Unsupported,
        format!("{channel}.{method} cannot be {how}"),
    )
}

struct ContextEntry {
    label: String,
    window: Option<WindowName>,
    tx: UnbTx<ServerFrame>,
}

/// Host side of the channel: one context per connected isolated process.
pub struct IpcServer {
    router: Router,
    contexts: Mutex<HashMap<ContextId, ContextEntry>>,
    next_context: AtomicU64,
}

impl IpcServer {
    pub fn new(router: Router) -> Arc<Self> {
        Arc::new(Self {
            router,
            contexts: Mutex::default(),
            next_context: AtomicU64::new(1),
        })
    }

    pub fn context_count(&self) -> usize {
        lock_mutex(&self.contexts).len()
    }

    /// Labels of the connected contexts, for diagnostics.
    pub fn context_labels(&self) -> Vec<(ContextId, String)> {
        lock_mutex(&self.contexts)
            .iter()
            .map(|(id, ctx)| (*id, ctx.label.clone()))
            .collect()
    }

    /// Pushes an event to every context attached to `window`. Returns how many received it.
    pub fn emit<T: Serialize>(&self, window: WindowName, channel: &str, payload: &T) -> usize {
        self.broadcast(Some(window), channel, payload)
    }

    pub fn emit_all<T: Serialize>(&self, channel: &str, payload: &T) -> usize {
        self.broadcast(None, channel, payload)
    }

    fn broadcast<T: Serialize>(
        &self,
        window: Option<WindowName>,
        channel: &str,
        payload: &T,
    ) -> usize {
        let Some(payload) = encode_payload(payload).ok_or_log() else {
            return 0;
        };
        lock_mutex(&self.contexts)
            .values()
            .filter(|ctx| window.is_none() || ctx.window == window)
            .filter(|ctx| {
                ctx.tx
                    .send(ServerFrame::Event {
                        channel: channel.to_owned(),
                        payload: payload.clone(),
                    })
                    .is_ok()
            })
            .count()
    }

    pub async fn serve_unix(
        self: Arc<Self>,
        listener: tokio::net::UnixListener,
        cancel: CancellationToken,
    ) {
        let mut connections = tokio::task::JoinSet::new();
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                () = cancel.cancelled() => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => continue,
            };
            match accepted {
                Ok((stream, _)) => {
                    let server = self.clone();
                    connections.spawn(async move {
                        if let Err(err) = server.serve_connection(stream).await {
                            log::warn!("IPC connection ended: {err}");
                        }
                    });
                }
                Err(err) => {
                    log::error!("Failed to accept IPC connection: {err}");
                    break;
                }
            }
        }
        connections.abort_all();
    }

    /// Runs one context until its stream closes. Subscriptions and in-flight requests of
    /// the context are cancelled on return.
    pub async fn serve_connection(
        self: Arc<Self>,
        stream: impl AsyncRead + AsyncWrite + Send + 'static,
    ) -> Result<(), IpcError> {
        let (read, mut write) = tokio::io::split(stream);
        let mut read = tokio::io::BufReader::new(read);
        let mut buf = Vec::new();

        let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut read, &mut buf))
            .await
            .map_err(|_| IpcError::Timeout(HANDSHAKE_TIMEOUT))??;
        let (label, window) = match hello {
            Some(ClientFrame::Hello {
                version,
                label,
                window,
            }) => {
                if version != PROTOCOL_VERSION {
                    let reason = format!(
                        "Version mismatch: host is {PROTOCOL_VERSION}, context is {version}"
                    );
                    write_frame(
                        &mut write,
                        &ServerFrame::Rejected {
                            reason: reason.clone(),
                        },
                    )
                    .await
                    .ok_or_debug();
                    return Err(IpcError::Rejected(reason));
                }
                (label, window)
            }
            Some(other) => {
                return Err(IpcError::Protocol(format!(
                    "Expected a handshake, got {other:?}"
                )));
            }
            None => return Err(IpcError::Disconnected),
        };

        let context = ContextId(self.next_context.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = unb_chan();
        // Queued first, so nothing can overtake it.
        _ = tx.send(ServerFrame::Welcome { context });
        let _writer = AbortOnDropHandle::new(tokio::spawn(write_frames(write, rx)));
        lock_mutex(&self.contexts).insert(
            context,
            ContextEntry {
                label: label.clone(),
                window,
                tx: tx.clone(),
            },
        );
        log::info!("Context {context} ({label}) connected");
        let _registered = Registered {
            server: &*self,
            context,
            label,
        };

        let cancel = CancelDropGuard::new();
        let mut subscriptions = HashMap::<CallId, AbortOnDropHandle<()>>::new();
        let result = loop {
            let frame = match read_frame::<ClientFrame>(&mut read, &mut buf).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(()),
                Err(err @ IpcError::Protocol(_)) => {
                    log::error!("Context {context}: {err}");
                    continue;
                }
                Err(err) => break Err(err),
            };
            match frame {
                ClientFrame::Request {
                    id,
                    channel,
                    method,
                    payload,
                } => {
                    let tx = tx.clone();
                    let handler = self.router.lookup_call(&channel, &method);
                    let cancel = cancel.inner.clone();
                    // Requests run independently and may answer out of order.
                    tokio::spawn(async move {
                        let fut = async move {
                            let result = match handler {
                                Ok(handler) => handler(payload).await,
                                Err(err) => Err(err),
                            };
                            _ = tx.send(ServerFrame::Response { id, result });
                        };
                        cancel.run_until_cancelled(fut).await;
                    });
                }
                ClientFrame::Send {
                    channel,
                    method,
                    payload,
                } => {
                    let res = match self.router.lookup(&channel, &method) {
                        Ok(Handler::Send(handler)) => handler(payload),
                        Ok(_) => Err(kind_mismatch(&channel, &method, "sent")),
                        Err(err) => Err(err),
                    };
                    if let Err(err) = res {
                        log::warn!("Context {context}: dropped message: {err}");
                    }
                }
                ClientFrame::Subscribe {
                    id,
                    channel,
                    method,
                    payload,
                } => {
                    let stream = match self.router.lookup(&channel, &method) {
                        Ok(Handler::Subscribe(source)) => source(payload),
                        Ok(_) => Err(kind_mismatch(&channel, &method, "subscribed to")),
                        Err(err) => Err(err),
                    };
                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(err) => {
                            _ = tx.send(ServerFrame::SubscriptionEnded {
                                id,
                                error: Some(err),
                            });
                            continue;
                        }
                    };
                    subscriptions.retain(|_, task| !task.is_finished());
                    subscriptions.insert(
                        id,
                        AbortOnDropHandle::new(tokio::spawn(forward_updates(
                            id,
                            channel,
                            stream,
                            tx.clone(),
                        ))),
                    );
                }
                ClientFrame::Unsubscribe { id } => {
                    subscriptions.remove(&id);
                }
                ClientFrame::Hello { .. } => {
                    log::warn!("Context {context} sent a second handshake");
                }
            }
        };

        drop(subscriptions);
        result
    }
}

/// Unregisters a context when its connection task ends, aborted or not.
struct Registered<'a> {
    server: &'a IpcServer,
    context: ContextId,
    label: String,
}
impl Drop for Registered<'_> {
    fn drop(&mut self) {
        lock_mutex(&self.server.contexts).remove(&self.context);
        log::info!("Context {} ({}) disconnected", self.context, self.label);
    }
}

async fn forward_updates(
    id: CallId,
    channel: String,
    mut stream: BoxStream<'static, Vec<u8>>,
    tx: UnbTx<ServerFrame>,
) {
    while let Some(payload) = stream.next().await {
        if tx
            .send(ServerFrame::Update {
                id,
                channel: channel.clone(),
                payload,
            })
            .is_err()
        {
            return;
        }
    }
    _ = tx.send(ServerFrame::SubscriptionEnded { id, error: None });
}
