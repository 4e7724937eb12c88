//! Typed message passing between the host and isolated content contexts.
//!
//! Both sides share the method declarations produced by [`ipc_service!`]. The host mounts
//! handlers on a [`Router`] served by an [`IpcServer`], the isolated side talks to it through
//! a [`Proxy`]. Everything travels as postcard frames over one duplex stream per context.

use std::time::Duration;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

pub mod api;
mod proxy;
mod server;
pub(crate) mod wire;

pub use proxy::*;
pub use server::*;
pub use wire::{CallId, ContextId, IpcEvent};

pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MethodKind {
    /// Asynchronous request with a result.
    Call,
    /// Small read that may also be issued as a blocking round-trip.
    Get,
    /// Fire-and-forget.
    Send,
    /// Stream of updates until unsubscribed.
    Subscribe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: &'static str,
    pub kind: MethodKind,
}

pub trait Method: 'static {
    const CHANNEL: &'static str;
    const NAME: &'static str;
    const KIND: MethodKind;
    type Args: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;
}
pub trait Callable: Method {}
pub trait Gettable: Callable {}
pub trait Sendable: Method<Output = ()> {}
pub trait Subscribable: Method {}

/// Declares a service: one marker type per method, plus `CHANNEL` and `DESCRIPTOR`.
///
/// ```ignore
/// ipc_service! {
///     pub mod clock = "clock" {
///         get Now(()) -> String;
///         send Reset(()) -> ();
///         subscribe Ticks(u32) -> u64;
///     }
/// }
/// ```
#[macro_export]
macro_rules! ipc_service {
    (@kind call) => { $crate::ipc::MethodKind::Call };
    (@kind get) => { $crate::ipc::MethodKind::Get };
    (@kind send) => { $crate::ipc::MethodKind::Send };
    (@kind subscribe) => { $crate::ipc::MethodKind::Subscribe };

    (@marker call $method:ident) => {
        impl $crate::ipc::Callable for $method {}
    };
    (@marker get $method:ident) => {
        impl $crate::ipc::Callable for $method {}
        impl $crate::ipc::Gettable for $method {}
    };
    (@marker send $method:ident) => {
        impl $crate::ipc::Sendable for $method {}
    };
    (@marker subscribe $method:ident) => {
        impl $crate::ipc::Subscribable for $method {}
    };

    (
        $(#[$meta:meta])*
        $vis:vis mod $service:ident = $channel:literal {
            $(
                $(#[$method_meta:meta])*
                $kind:ident $method:ident ($args:ty) -> $output:ty;
            )*
        }
    ) => {
        $(#[$meta])*
        $vis mod $service {
            #[allow(unused_imports)]
            use super::*;

            pub const CHANNEL: &str = $channel;
            pub const DESCRIPTOR: &[$crate::ipc::MethodDescriptor] = &[$(
                $crate::ipc::MethodDescriptor {
                    name: stringify!($method),
                    kind: $crate::ipc_service!(@kind $kind),
                },
            )*];

            $(
                $(#[$method_meta])*
                #[derive(Debug)]
                pub enum $method {}
                impl $crate::ipc::Method for $method {
                    const CHANNEL: &'static str = $channel;
                    const NAME: &'static str = stringify!($method);
                    const KIND: $crate::ipc::MethodKind = $crate::ipc_service!(@kind $kind);
                    type Args = $args;
                    type Output = $output;
                }
                $crate::ipc_service!(@marker $kind $method);
            )*
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    NotFound,
    InvalidArgument,
    Unsupported,
    Internal,
}

/// Error raised by a handler on the host, carried back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}
impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::NotFound, message)
    }
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::InvalidArgument, message)
    }
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Internal, message)
    }
}
impl From<anyhow::Error> for RemoteError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{err:#}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IpcError {
    #[error("The channel to the host was disconnected")]
    Disconnected,
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("The host rejected the connection: {0}")]
    Rejected(String),
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("Failed to encode payload: {0}")]
    Encode(String),
    #[error("Failed to decode payload: {0}")]
    Decode(String),
    #[error("Blocking requests cannot be made from inside the async runtime")]
    SyncUnsupported,
    #[error("No response after {0:?}")]
    Timeout(Duration),
}

pub(crate) fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, IpcError> {
    postcard::to_stdvec(value).map_err(|err| IpcError::Encode(err.to_string()))
}
pub(crate) fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, IpcError> {
    postcard::from_bytes(bytes).map_err(|err| IpcError::Decode(err.to_string()))
}
