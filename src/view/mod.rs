//! One content view per workspace, each backed by its own content server.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Context as _;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};

use crate::{
    config::{DEFERRED_LAYOUT_DELAYS, READY_POLL_INTERVAL},
    content::{ContentServerSupervisor, ContentWatcher, ServerHandle},
    menu::MenuBuilder,
    services::external::SharedPreferences,
    utils::{KeyedLock, ResultExt as _, lock_mutex, run_best_effort},
    window::{WindowEvent, WindowManager, WindowName},
    workspaces::{Workspace, WorkspaceError, WorkspaceId, WorkspacePatch, WorkspaceRegistry},
};

mod layout;
mod menu_items;
pub use layout::*;
pub use menu_items::*;

/// Channel views receive the notification pause flag on.
pub const PAUSE_NOTIFICATIONS_CHANNEL: &str = "pause-notifications-changed";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewState {
    #[default]
    NoView,
    /// Server launched and view created, but the server has not answered yet.
    Starting,
    Ready,
    Hibernated,
    Removed,
}

pub trait ContentView: Send + Sync {
    fn load_url(&self, url: &str) -> anyhow::Result<()>;
    fn set_bounds(&self, bounds: Bounds);
    fn set_visible(&self, visible: bool);
    fn set_audio_muted(&self, muted: bool);
    fn send(&self, channel: &str, payload: &serde_json::Value) -> anyhow::Result<()>;
    fn stop_find_in_page(&self);
    fn destroy(&self);
}

pub trait ViewHost: Send + Sync {
    /// Creates a hidden view inside the main window.
    fn create(&self, workspace: &Workspace) -> anyhow::Result<Arc<dyn ContentView>>;
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ViewError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error("Failed to start the content server of {id}: {message}")]
    StartFailed { id: WorkspaceId, message: String },
    #[error("Failed to create the view of {id}: {message}")]
    CreateFailed { id: WorkspaceId, message: String },
    #[error("Content server of {id} did not become ready within {after:?}")]
    ReadinessTimeout { id: WorkspaceId, after: Duration },
    #[error("Stopped waiting for {0} to become ready")]
    Cancelled(WorkspaceId),
    #[error("Workspace {0} has no view")]
    NoView(WorkspaceId),
    #[error("Workspace {0} is a sub-workspace and has no view of its own")]
    SubWorkspace(WorkspaceId),
    #[error("Workspace {0} was removed")]
    Removed(WorkspaceId),
}

#[derive(Default)]
struct Entry {
    state: ViewState,
    view: Option<Arc<dyn ContentView>>,
    server: Option<ServerHandle>,
}

/// Everything the view manager drives.
pub struct ViewDeps {
    pub registry: Arc<WorkspaceRegistry>,
    pub windows: Arc<WindowManager>,
    pub menu: Arc<MenuBuilder>,
    pub host: Arc<dyn ViewHost>,
    pub supervisor: Arc<dyn ContentServerSupervisor>,
    pub watcher: Arc<dyn ContentWatcher>,
    pub preferences: SharedPreferences,
    pub ready_timeout: Duration,
    /// Re-layout again shortly after maximize/unmaximize.
    pub deferred_layout: bool,
}

pub struct ViewManager {
    this: Weak<Self>,
    deps: ViewDeps,
    transitions: KeyedLock<WorkspaceId>,
    entries: Mutex<HashMap<WorkspaceId, Entry>>,
    find_in_page: AtomicBool,
    shutdown: CancellationToken,
    relayout: Mutex<Option<AbortOnDropHandle<()>>>,
    _window_events: AbortOnDropHandle<()>,
}

impl ViewManager {
    /// Must be called inside the runtime.
    pub fn new(deps: ViewDeps) -> Arc<Self> {
        let events = deps.windows.subscribe();
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            deps,
            transitions: KeyedLock::new(),
            entries: Mutex::default(),
            find_in_page: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            relayout: Mutex::default(),
            _window_events: AbortOnDropHandle::new(tokio::spawn(run_window_events(
                this.clone(),
                events,
            ))),
        })
    }

    pub fn state(&self, id: &WorkspaceId) -> ViewState {
        if let Some(entry) = lock_mutex(&self.entries).get(id) {
            return entry.state;
        }
        match self.deps.registry.get(id) {
            Some(ws) if ws.hibernated => ViewState::Hibernated,
            _ => ViewState::NoView,
        }
    }

    pub fn view(&self, id: &WorkspaceId) -> Option<Arc<dyn ContentView>> {
        lock_mutex(&self.entries).get(id)?.view.clone()
    }

    pub fn server(&self, id: &WorkspaceId) -> Option<ServerHandle> {
        lock_mutex(&self.entries).get(id)?.server.clone()
    }

    fn set_state(&self, id: &WorkspaceId, state: ViewState) {
        lock_mutex(&self.entries).entry(id.clone()).or_default().state = state;
    }

    /// Starts the content server, creates the view and waits until the server answers.
    /// `timeout` defaults to the configured readiness timeout.
    ///
    /// On timeout the view stays [`ViewState::Starting`], calling this again resumes waiting.
    pub async fn create_view(
        &self,
        id: &WorkspaceId,
        timeout: Option<Duration>,
    ) -> Result<(), ViewError> {
        let _guard = self.transitions.lock(id.clone()).await;
        let ws = self.deps.registry.require(id)?;
        self.create_view_locked(&ws, timeout).await
    }

    async fn create_view_locked(
        &self,
        ws: &Workspace,
        timeout: Option<Duration>,
    ) -> Result<(), ViewError> {
        let id = &ws.id;
        if ws.is_sub_wiki {
            // Served by the main workspace, only the content root is ours to watch.
            self.deps
                .watcher
                .watch(id, ws.content_root())
                .ok_or_log();
            return Ok(());
        }
        let (state, server, view) = match lock_mutex(&self.entries).get(id) {
            Some(entry) => (entry.state, entry.server.clone(), entry.view.clone()),
            None => Default::default(),
        };
        match state {
            ViewState::Ready => return Ok(()),
            ViewState::Removed => return Err(ViewError::Removed(id.clone())),
            _ => {}
        }
        self.deps.registry.update_metadata(id, |meta| {
            meta.is_loading = true;
            meta.did_fail_load_error_message = None;
        });

        let server = match server {
            Some(server) => server,
            None => {
                let user = ws.user_info.as_ref().map_or("", |it| it.user_name.as_str());
                match self
                    .deps
                    .supervisor
                    .start(ws.content_root(), ws.port, user)
                    .await
                {
                    Ok(server) => server,
                    Err(err) => {
                        let message = format!("{err:#}");
                        self.set_state(id, ViewState::Starting);
                        self.fail_load(id, &message);
                        return Err(ViewError::StartFailed {
                            id: id.clone(),
                            message,
                        });
                    }
                }
            }
        };
        let view = match view {
            Some(view) => Ok(view),
            None => self.deps.host.create(ws),
        };
        {
            let mut entries = lock_mutex(&self.entries);
            let entry = entries.entry(id.clone()).or_default();
            entry.state = ViewState::Starting;
            entry.server = Some(server);
            entry.view = view.as_ref().ok().cloned();
        }
        let view = view.map_err(|err| {
            let message = format!("{err:#}");
            self.fail_load(id, &message);
            ViewError::CreateFailed {
                id: id.clone(),
                message,
            }
        })?;

        if ws.hibernated {
            self.deps.registry.update(
                id,
                WorkspacePatch {
                    hibernated: Some(false),
                    ..Default::default()
                },
            )?;
        }
        self.deps
            .watcher
            .watch(id, ws.content_root())
            .ok_or_log();

        let timeout = timeout.unwrap_or(self.deps.ready_timeout);
        if let Err(err) = self.wait_until_ready(id, ws.port, timeout).await {
            self.fail_load(id, &err.to_string());
            return Err(err);
        }

        view.load_url(&ws.home_url)
            .with_context(|| format!("Failed to load {}", ws.home_url))
            .ok_or_log();
        self.set_state(id, ViewState::Ready);
        self.deps
            .registry
            .update_metadata(id, |meta| meta.is_loading = false);
        log::info!("View of {id} is ready on port {}", ws.port);

        if self.deps.registry.get(id).is_some_and(|it| it.active) {
            self.show(&*view);
        }
        Ok(())
    }

    async fn wait_until_ready(
        &self,
        id: &WorkspaceId,
        port: u16,
        timeout: Duration,
    ) -> Result<(), ViewError> {
        let poll = async {
            while !self.deps.supervisor.probe(port).await {
                tokio::time::sleep(READY_POLL_INTERVAL).await;
            }
        };
        match self
            .shutdown
            .run_until_cancelled(tokio::time::timeout(timeout, poll))
            .await
        {
            Some(Ok(())) => Ok(()),
            Some(Err(_)) => Err(ViewError::ReadinessTimeout {
                id: id.clone(),
                after: timeout,
            }),
            None => Err(ViewError::Cancelled(id.clone())),
        }
    }

    fn fail_load(&self, id: &WorkspaceId, message: &str) {
        log::error!("Loading {id} failed: {message}");
        self.deps.registry.update_metadata(id, |meta| {
            meta.is_loading = false;
            meta.did_fail_load_error_message = Some(message.into());
        });
    }

    /// Makes `id` the single active workspace and shows its view, waking it if needed.
    /// The previously active workspace is hidden, and hibernated if it asks for that.
    pub async fn set_active(&self, id: &WorkspaceId) -> Result<(), ViewError> {
        let ws = self.deps.registry.require(id)?;
        if ws.is_sub_wiki {
            return Err(ViewError::SubWorkspace(id.clone()));
        }
        let previous = self.deps.registry.set_active(id)?;
        if let Some(prev) = &previous
            && let Some(view) = self.view(&prev.id)
        {
            view.set_visible(false);
        }

        let shown = match self.state(id) {
            ViewState::Ready => self.view(id).map(|view| self.show(&*view)).is_some(),
            _ => false,
        };
        let woken = if shown {
            Ok(())
        } else {
            let _guard = self.transitions.lock(id.clone()).await;
            let ws = self.deps.registry.require(id)?;
            self.create_view_locked(&ws, None).await
        };

        if let Some(prev) = previous
            && prev.hibernate_when_unused
        {
            self.hibernate(&prev.id, false).await.ok_or_log();
        }
        self.deps.menu.build_menu();
        woken
    }

    /// Stops the content server and destroys the view, keeping the record.
    ///
    /// The active workspace is left alone unless `force` is set. Returns whether anything
    /// was hibernated.
    pub async fn hibernate(&self, id: &WorkspaceId, force: bool) -> Result<bool, ViewError> {
        let _guard = self.transitions.lock(id.clone()).await;
        let ws = self.deps.registry.require(id)?;
        if ws.is_sub_wiki {
            return Ok(false);
        }
        if ws.active && !force {
            log::info!("Not hibernating {id}: it is active");
            return Ok(false);
        }
        let entry = {
            let mut entries = lock_mutex(&self.entries);
            match entries.get(id).map(|it| it.state) {
                Some(ViewState::Removed) => return Err(ViewError::Removed(id.clone())),
                Some(ViewState::Hibernated) => return Ok(false),
                _ => {}
            }
            entries.insert(
                id.clone(),
                Entry {
                    state: ViewState::Hibernated,
                    ..Default::default()
                },
            )
        };
        if let Some(entry) = entry {
            self.teardown(id, entry).await;
        }
        self.deps.registry.update(
            id,
            WorkspacePatch {
                hibernated: Some(true),
                ..Default::default()
            },
        )?;
        if ws.active {
            self.deps.registry.clear_active()?;
        }
        log::info!("Hibernated {id}");
        Ok(true)
    }

    /// Re-creates the view of a hibernated workspace. No-op for any other state.
    pub async fn wake_up(&self, id: &WorkspaceId) -> Result<(), ViewError> {
        let _guard = self.transitions.lock(id.clone()).await;
        let ws = self.deps.registry.require(id)?;
        if self.state(id) != ViewState::Hibernated {
            log::debug!("Not waking {id}: it is not hibernated");
            return Ok(());
        }
        self.create_view_locked(&ws, None).await
    }

    /// Stops the server and watcher and destroys the view, for good. Returns the number of
    /// teardown steps that failed.
    pub async fn remove_view(&self, id: &WorkspaceId) -> usize {
        let _guard = self.transitions.lock(id.clone()).await;
        let entry = {
            let mut entries = lock_mutex(&self.entries);
            // Tombstones only matter while their record still exists.
            entries.retain(|other, entry| {
                entry.state != ViewState::Removed || self.deps.registry.get(other).is_some()
            });
            entries.insert(
                id.clone(),
                Entry {
                    state: ViewState::Removed,
                    ..Default::default()
                },
            )
        };
        self.teardown(id, entry.unwrap_or_default()).await
    }

    async fn teardown(&self, id: &WorkspaceId, entry: Entry) -> usize {
        let Entry { view, server, .. } = entry;
        let steps: [(&str, BoxFuture<'_, anyhow::Result<()>>); 3] = [
            (
                "stop content server",
                Box::pin(async move {
                    match &server {
                        Some(server) => self.deps.supervisor.stop(server).await,
                        None => Ok(()),
                    }
                }),
            ),
            (
                "stop content watcher",
                Box::pin(async move {
                    self.deps.watcher.unwatch(id);
                    Ok(())
                }),
            ),
            (
                "destroy view",
                Box::pin(async move {
                    if let Some(view) = view {
                        view.destroy();
                    }
                    Ok(())
                }),
            ),
        ];
        run_best_effort(&format!("Tearing down {id}"), steps).await
    }

    /// Restarts the content server of a running workspace and reloads its view. Returns
    /// `false` without doing anything if no server is running for it.
    pub async fn restart_server(&self, id: &WorkspaceId) -> Result<bool, ViewError> {
        let _guard = self.transitions.lock(id.clone()).await;
        let ws = self.deps.registry.require(id)?;
        let Some(server) = self
            .server(id)
            .filter(|it| self.deps.supervisor.is_running(it))
        else {
            log::debug!("Not restarting {id}: no server is running");
            return Ok(false);
        };
        log::info!("Restarting the content server of {id}");
        self.deps
            .supervisor
            .stop(&server)
            .await
            .with_context(|| format!("Failed to stop the content server of {id}"))
            .ok_or_log();
        {
            let mut entries = lock_mutex(&self.entries);
            let entry = entries.entry(id.clone()).or_default();
            entry.server = None;
            entry.state = ViewState::Starting;
        }
        self.create_view_locked(&ws, None).await?;
        Ok(true)
    }

    fn current_bounds(&self) -> Option<Bounds> {
        let main = self.deps.windows.get(WindowName::Main)?;
        let prefs = self.deps.preferences.get_all();
        let flags = LayoutFlags::new(
            &prefs,
            self.find_in_page.load(Ordering::Relaxed),
            main.is_full_screen(),
        );
        Some(compute_bounds(main.content_size(), flags))
    }

    fn show(&self, view: &dyn ContentView) {
        if let Some(bounds) = self.current_bounds() {
            view.set_bounds(bounds);
        }
        view.set_visible(true);
    }

    /// Re-applies bounds to the active view. Returns whether there was one.
    pub fn realign_active(&self) -> bool {
        let Some(ws) = self.deps.registry.get_active() else {
            return false;
        };
        let Some(view) = self.view(&ws.id) else {
            return false;
        };
        self.show(&*view);
        true
    }

    pub fn set_find_in_page(&self, open: bool) {
        self.find_in_page.store(open, Ordering::Relaxed);
        if !open
            && let Some(ws) = self.deps.registry.get_active()
            && let Some(view) = self.view(&ws.id)
        {
            view.stop_find_in_page();
        }
        self.realign_active();
    }

    pub fn is_find_in_page_open(&self) -> bool {
        self.find_in_page.load(Ordering::Relaxed)
    }

    fn on_main_window_event(&self, event: WindowEvent) {
        match event {
            WindowEvent::Resized
            | WindowEvent::EnterFullScreen
            | WindowEvent::LeaveFullScreen
            | WindowEvent::Focused => {
                self.realign_active();
            }
            WindowEvent::Maximized | WindowEvent::Unmaximized => {
                self.realign_active();
                if self.deps.deferred_layout {
                    self.schedule_deferred_relayout();
                }
            }
            WindowEvent::Closed => {}
        }
    }

    /// The content size may only be final after the window settled, so realign twice more.
    fn schedule_deferred_relayout(&self) {
        let this = self.this.clone();
        let task = tokio::spawn(async move {
            let mut elapsed = Duration::ZERO;
            for delay in DEFERRED_LAYOUT_DELAYS {
                tokio::time::sleep(delay - elapsed).await;
                elapsed = delay;
                let Some(this) = this.upgrade() else {
                    return;
                };
                this.realign_active();
            }
        });
        // Replacing aborts the previous schedule
        *lock_mutex(&self.relayout) = Some(AbortOnDropHandle::new(task));
    }

    /// Forwards the notification state to every live view.
    pub fn apply_notification_prefs(&self, mute_audio: bool, paused: bool) {
        let views: Vec<_> = lock_mutex(&self.entries)
            .values()
            .filter_map(|it| it.view.clone())
            .collect();
        for view in views {
            view.set_audio_muted(mute_audio);
            view.send(PAUSE_NOTIFICATIONS_CHANNEL, &serde_json::Value::Bool(paused))
                .ok_or_debug();
        }
    }

    pub fn load_url(&self, id: &WorkspaceId, url: &str) -> Result<(), ViewError> {
        let view = self.view(id).ok_or_else(|| ViewError::NoView(id.clone()))?;
        view.load_url(url).map_err(|err| ViewError::CreateFailed {
            id: id.clone(),
            message: format!("{err:#}"),
        })
    }

    /// Stops every content server, logging failures. Pending readiness waits are cancelled.
    /// Returns how many servers failed to stop.
    pub async fn shutdown(&self) -> usize {
        self.shutdown.cancel();
        let servers: Vec<_> = lock_mutex(&self.entries)
            .values_mut()
            .filter_map(|it| {
                let server = it.server.take()?;
                it.state = ViewState::NoView;
                Some(server)
            })
            .collect();
        let mut failed = 0;
        for server in &servers {
            if self
                .deps
                .supervisor
                .stop(server)
                .await
                .with_context(|| format!("Failed to stop content server on port {}", server.port))
                .ok_or_log()
                .is_none()
            {
                failed += 1;
            }
        }
        log::info!("Stopped {} content servers", servers.len() - failed);
        failed
    }
}

async fn run_window_events(
    this: Weak<ViewManager>,
    mut events: broadcast::Receiver<(WindowName, WindowEvent)>,
) {
    loop {
        let (name, event) = match events.recv().await {
            Ok(it) => it,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Missed {n} window events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if name != WindowName::Main {
            continue;
        }
        let Some(this) = this.upgrade() else {
            break;
        };
        this.on_main_window_event(event);
    }
}
