//! Content-server processes, one per running workspace.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::Context as _;
use futures::future::BoxFuture;

use crate::{
    config::{CHILD_EXIT_GRACE, CONTROL_TIMEOUT},
    utils::{ResultExt as _, lock_mutex},
};

pub mod server;
pub mod watcher;

pub use watcher::{ContentWatcher, NotifyWatcher};

/// argv[1] that turns the binary into a content server.
pub const CONTENT_SERVER_ARG: &str = "__wikishell_content_server";
pub(crate) const ROOT_VAR: &str = "WIKISHELL_CONTENT_ROOT";
pub(crate) const PORT_VAR: &str = "WIKISHELL_CONTENT_PORT";
pub(crate) const USER_VAR: &str = "WIKISHELL_CONTENT_USER";

pub(crate) const STATUS_PATH: &str = "/.wikishell/status";
pub(crate) const SHUTDOWN_PATH: &str = "/.wikishell/shutdown";
pub(crate) const DROP_SUB_WIKI_PATH: &str = "/.wikishell/drop-sub-wiki";

/// Refers to one started server. Becomes invalid once stopped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerHandle {
    pub id: u64,
    pub port: u16,
    pub root: PathBuf,
}

pub trait ContentServerSupervisor: Send + Sync {
    fn start<'a>(
        &'a self,
        root: &'a Path,
        port: u16,
        user_name: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<ServerHandle>>;

    fn stop<'a>(&'a self, handle: &'a ServerHandle) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Whether something answers HTTP on the port.
    fn probe(&self, port: u16) -> BoxFuture<'_, bool>;

    /// Tells a main workspace's server to forget a sub-workspace.
    fn drop_sub_wiki<'a>(
        &'a self,
        handle: &'a ServerHandle,
        sub_name: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    fn is_running(&self, handle: &ServerHandle) -> bool;
}

/// Runs each server as a child process of this binary.
pub struct ProcessSupervisor {
    program: PathBuf,
    log_dir: Option<PathBuf>,
    children: Mutex<HashMap<u64, tokio::process::Child>>,
    next_id: AtomicU64,
    client: reqwest::Client,
}

impl ProcessSupervisor {
    pub fn new(program: PathBuf, log_dir: Option<PathBuf>) -> Self {
        Self {
            program,
            log_dir,
            children: Mutex::default(),
            next_id: AtomicU64::new(1),
            client: reqwest::Client::new(),
        }
    }

    pub fn current_exe(log_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::new(
            std::env::current_exe().context("Failed to get current executable")?,
            log_dir,
        ))
    }
}

impl ContentServerSupervisor for ProcessSupervisor {
    fn start<'a>(
        &'a self,
        root: &'a Path,
        port: u16,
        user_name: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<ServerHandle>> {
        Box::pin(async move {
            let mut cmd = tokio::process::Command::new(&self.program);
            cmd.arg(CONTENT_SERVER_ARG)
                .env(ROOT_VAR, root)
                .env(PORT_VAR, port.to_string())
                .env(USER_VAR, user_name)
                .kill_on_drop(true)
                .stdin(std::process::Stdio::null());
            if let Some(dir) = &self.log_dir {
                cmd.env(crate::config::LOG_DIR_VAR, dir);
            }
            let child = cmd
                .spawn()
                .with_context(|| format!("Failed to spawn content server for {}", root.display()))?;

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            log::info!(
                "Started content server #{id} (pid {:?}) for {} on port {port}",
                child.id(),
                root.display()
            );
            lock_mutex(&self.children).insert(id, child);
            Ok(ServerHandle {
                id,
                port,
                root: root.to_owned(),
            })
        })
    }

    fn stop<'a>(&'a self, handle: &'a ServerHandle) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let Some(mut child) = lock_mutex(&self.children).remove(&handle.id) else {
                anyhow::bail!("Content server #{} is not running", handle.id);
            };
            // Asks nicely first. The child may already be gone.
            self.client
                .post(control_url(handle.port, SHUTDOWN_PATH))
                .timeout(CONTROL_TIMEOUT)
                .send()
                .await
                .ok_or_debug();

            match tokio::time::timeout(CHILD_EXIT_GRACE, child.wait()).await {
                Ok(status) => {
                    let status = status.context("Failed to wait for content server")?;
                    if !status.success() {
                        log::warn!("Content server #{} exited with {status}", handle.id);
                    }
                }
                Err(_) => {
                    log::error!(
                        "Killing content server #{} that failed to exit in time",
                        handle.id
                    );
                    child.kill().await.context("Failed to kill content server")?;
                }
            }
            log::info!("Stopped content server #{}", handle.id);
            Ok(())
        })
    }

    fn probe(&self, port: u16) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            self.client
                .get(control_url(port, STATUS_PATH))
                .timeout(CONTROL_TIMEOUT)
                .send()
                .await
                .is_ok_and(|response| response.status().is_success())
        })
    }

    fn drop_sub_wiki<'a>(
        &'a self,
        handle: &'a ServerHandle,
        sub_name: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.client
                .post(control_url(handle.port, DROP_SUB_WIKI_PATH))
                .timeout(CONTROL_TIMEOUT)
                .body(sub_name.to_owned())
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .with_context(|| format!("Content server #{} refused drop-sub-wiki", handle.id))?;
            Ok(())
        })
    }

    fn is_running(&self, handle: &ServerHandle) -> bool {
        lock_mutex(&self.children).contains_key(&handle.id)
    }
}

fn control_url(port: u16, path: &str) -> String {
    format!("http://127.0.0.1:{port}{path}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_and_drop_sub_wiki_reach_a_live_server() {
        let dir = tempfile::tempdir().unwrap();
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shutdown = tokio_util::sync::CancellationToken::new();
        let server = tokio::spawn(server::serve_on(
            listener,
            dir.path().to_owned(),
            shutdown.clone(),
        ));

        let supervisor = ProcessSupervisor::new("/nonexistent".into(), None);
        assert!(supervisor.probe(port).await);
        let handle = ServerHandle {
            id: 1,
            port,
            root: dir.path().to_owned(),
        };
        supervisor.drop_sub_wiki(&handle, "notes").await.unwrap();
        assert!(supervisor.drop_sub_wiki(&handle, " ").await.is_err());

        shutdown.cancel();
        drop(supervisor);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn probe_fails_on_closed_port() {
        let port = {
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let supervisor = ProcessSupervisor::new("/nonexistent".into(), None);
        assert!(!supervisor.probe(port).await);
    }
}
