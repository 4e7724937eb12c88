use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncWrite, AsyncWriteExt as _};

use super::{IpcError, RemoteError};
use crate::{utils::UnbRx, window::WindowName};

pub type CallId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(pub u64);
impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum ClientFrame {
    Hello {
        version: String,
        label: String,
        window: Option<WindowName>,
    },
    Request {
        id: CallId,
        channel: String,
        method: String,
        payload: Vec<u8>,
    },
    Send {
        channel: String,
        method: String,
        payload: Vec<u8>,
    },
    Subscribe {
        id: CallId,
        channel: String,
        method: String,
        payload: Vec<u8>,
    },
    Unsubscribe {
        id: CallId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum ServerFrame {
    Welcome {
        context: ContextId,
    },
    Rejected {
        reason: String,
    },
    Response {
        id: CallId,
        result: Result<Vec<u8>, RemoteError>,
    },
    Update {
        id: CallId,
        channel: String,
        payload: Vec<u8>,
    },
    SubscriptionEnded {
        id: CallId,
        error: Option<RemoteError>,
    },
    Event {
        channel: String,
        payload: Vec<u8>,
    },
}

/// Broadcast pushed by the host outside of any request.
#[derive(Debug, Clone)]
pub struct IpcEvent {
    pub channel: String,
    pub payload: Vec<u8>,
}
impl IpcEvent {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, IpcError> {
        super::decode_payload(&self.payload)
    }
}

/// Reads one frame. `Ok(None)` means the stream ended cleanly.
pub(crate) async fn read_frame<T: DeserializeOwned>(
    read: &mut (impl AsyncBufRead + Unpin),
    buf: &mut Vec<u8>,
) -> Result<Option<T>, IpcError> {
    buf.clear();
    match read.read_until(0, buf).await {
        Ok(0) => return Ok(None),
        Ok(n) => log::trace!("Received {n} bytes"),
        Err(err) => {
            log::debug!("Failed to read frame: {err}");
            return Err(IpcError::Disconnected);
        }
    }
    postcard::from_bytes_cobs(buf).map(Some).map_err(|err| {
        IpcError::Protocol(format!(
            "Failed to deserialize {}: {err}",
            std::any::type_name::<T>()
        ))
    })
}

pub(crate) async fn write_frame<T: Serialize>(
    write: &mut (impl AsyncWrite + Unpin),
    frame: &T,
) -> Result<(), IpcError> {
    let buf = postcard::to_stdvec_cobs(frame).map_err(|err| IpcError::Encode(err.to_string()))?;
    write
        .write_all(&buf)
        .await
        .map_err(|_| IpcError::Disconnected)?;
    write.flush().await.map_err(|_| IpcError::Disconnected)
}

/// Drains `rx` into the stream, flushing once per batch.
pub(crate) async fn write_frames<T: Serialize>(
    mut write: impl AsyncWrite + Unpin,
    mut rx: UnbRx<T>,
) {
    while let Some(first) = rx.recv().await {
        let batch = std::iter::once(first).chain(std::iter::from_fn(|| rx.inner.try_recv().ok()));
        for frame in batch {
            let Ok(buf) = postcard::to_stdvec_cobs(&frame)
                .map_err(|err| log::error!("Failed to serialize frame: {err}"))
            else {
                continue;
            };
            if let Err(err) = write.write_all(&buf).await {
                log::debug!("Failed to write frame: {err}");
                return;
            }
        }
        if let Err(err) = write.flush().await {
            log::debug!("Failed to flush frames: {err}");
            return;
        }
    }
    _ = write.shutdown().await;
}
