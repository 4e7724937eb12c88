use tokio_util::sync::CancellationToken;

mod callback;
pub use callback::*;
mod channels;
pub use channels::*;
mod keyed_lock;
pub use keyed_lock::*;
mod reload;
pub use reload::*;

pub trait ResultExt {
    type Ok;
    fn ok_or_log(self) -> Option<Self::Ok>;
    fn ok_or_debug(self) -> Option<Self::Ok>;
}

impl<T, E: Into<anyhow::Error>> ResultExt for Result<T, E> {
    type Ok = T;
    #[track_caller]
    #[inline]
    fn ok_or_log(self) -> Option<T> {
        match self {
            Ok(val) => Some(val),
            Err(err) => {
                log::error!("{:?}", err.into());
                None
            }
        }
    }

    #[track_caller]
    #[inline]
    fn ok_or_debug(self) -> Option<T> {
        match self {
            Ok(val) => Some(val),
            Err(err) => {
                log::debug!("{:?}", err.into());
                None
            }
        }
    }
}

/// Runs every step of a teardown sequence, logging failures instead of stopping at them.
///
/// Returns the number of steps that failed.
pub async fn run_best_effort<'a>(
    what: &str,
    steps: impl IntoIterator<Item = (&'a str, futures::future::BoxFuture<'a, anyhow::Result<()>>)>,
) -> usize {
    let mut failed = 0;
    for (step, fut) in steps {
        log::debug!("{what}: {step}");
        if let Err(err) = fut.await {
            log::error!("{what}: {step} failed: {err:?}");
            failed += 1;
        }
    }
    failed
}

pub struct CancelDropGuard {
    pub inner: CancellationToken,
}
impl CancelDropGuard {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        CancellationToken::new().into()
    }
}
impl Drop for CancelDropGuard {
    fn drop(&mut self) {
        self.inner.cancel();
    }
}
impl From<CancellationToken> for CancelDropGuard {
    fn from(inner: CancellationToken) -> Self {
        Self { inner }
    }
}

pub fn lock_mutex<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}
