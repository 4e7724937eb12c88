use std::{collections::HashMap, path::Path, sync::Mutex};

use anyhow::Context as _;
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::broadcast;

use crate::{utils::lock_mutex, workspaces::WorkspaceId};

/// Watches workspace content roots for changes on disk.
pub trait ContentWatcher: Send + Sync {
    fn watch(&self, id: &WorkspaceId, root: &Path) -> anyhow::Result<()>;
    /// Returns whether the workspace was being watched.
    fn unwatch(&self, id: &WorkspaceId) -> bool;
    /// Returns how many watches were stopped.
    fn unwatch_all(&self) -> usize;
    fn changes(&self) -> broadcast::Receiver<WorkspaceId>;
}

pub struct NotifyWatcher {
    watchers: Mutex<HashMap<WorkspaceId, RecommendedWatcher>>,
    changes: broadcast::Sender<WorkspaceId>,
}

impl Default for NotifyWatcher {
    fn default() -> Self {
        Self {
            watchers: Mutex::default(),
            changes: broadcast::Sender::new(64),
        }
    }
}

impl ContentWatcher for NotifyWatcher {
    fn watch(&self, id: &WorkspaceId, root: &Path) -> anyhow::Result<()> {
        let tx = self.changes.clone();
        let owner = id.clone();
        let mut watcher = notify::recommended_watcher(
            move |res: Result<notify::Event, notify::Error>| match res {
                Ok(event) if event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove() => {
                    // No receivers is fine
                    _ = tx.send(owner.clone());
                }
                Ok(_) => {}
                Err(err) => log::warn!("Watch error for {owner}: {err}"),
            },
        )
        .context("Failed to create file watcher")?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.display()))?;

        log::debug!("Watching {} for {id}", root.display());
        if lock_mutex(&self.watchers).insert(id.clone(), watcher).is_some() {
            log::debug!("Replaced existing watcher for {id}");
        }
        Ok(())
    }

    fn unwatch(&self, id: &WorkspaceId) -> bool {
        let removed = lock_mutex(&self.watchers).remove(id).is_some();
        if removed {
            log::debug!("Stopped watching {id}");
        }
        removed
    }

    fn unwatch_all(&self) -> usize {
        let drained: Vec<_> = lock_mutex(&self.watchers).drain().collect();
        log::info!("Stopped {} content watchers", drained.len());
        drained.len()
    }

    fn changes(&self) -> broadcast::Receiver<WorkspaceId> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn reports_changes_until_unwatched() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = NotifyWatcher::default();
        let id = WorkspaceId::from("w1");
        let mut changes = watcher.changes();

        watcher.watch(&id, dir.path()).unwrap();
        std::fs::write(dir.path().join("a.tid"), "title: a").unwrap();
        let changed = tokio::time::timeout(Duration::from_secs(5), changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(changed, id);

        assert!(watcher.unwatch(&id));
        assert!(!watcher.unwatch(&id));
        assert_eq!(watcher.unwatch_all(), 0);
    }
}
