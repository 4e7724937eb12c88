use std::time::Duration;

use super::{WatchRx, WatchTx};

/// Receiving side of a coalescing "something changed" signal. Any number of requests made
/// while nobody is waiting are observed as one.
#[derive(Clone)]
pub struct ReloadRx {
    rx: WatchRx<()>,
}
impl ReloadRx {
    /// Returns `None` once every [`ReloadTx`] is gone.
    pub async fn wait(&mut self) -> Option<()> {
        let opt = self.rx.changed().await.ok();
        self.rx.mark_unchanged();
        opt
    }

    /// Like [`Self::wait`], but keeps absorbing requests until none arrive for `quiet`.
    pub async fn wait_debounced(&mut self, quiet: Duration) -> Option<()> {
        self.wait().await?;
        loop {
            tokio::select! {
                res = self.wait() => res?,
                () = tokio::time::sleep(quiet) => break Some(()),
            }
        }
    }
}

#[derive(Clone)]
pub struct ReloadTx {
    tx: WatchTx<()>,
}
impl Default for ReloadTx {
    fn default() -> Self {
        Self::new()
    }
}
impl ReloadTx {
    pub fn new() -> Self {
        Self {
            tx: WatchTx::new(()),
        }
    }
    pub fn request(&self) {
        self.tx.send_replace(());
    }
    pub fn subscribe(&self) -> ReloadRx {
        let mut rx = self.tx.subscribe();
        rx.mark_unchanged();
        ReloadRx { rx }
    }
}
