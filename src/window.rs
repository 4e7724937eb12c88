//! Native windows keyed by logical name.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

use futures::{
    FutureExt as _,
    future::{BoxFuture, Shared},
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{
    config::WindowGeometry,
    services::external::{Dialog, SharedPreferences},
    utils::{Callback, ResultExt as _, lock_mutex},
    workspaces::WorkspaceId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WindowName {
    Main,
    Preferences,
    About,
    Notifications,
    AddWorkspace,
    EditWorkspace,
    OpenUrlWith,
    DisplayMedia,
    SpellcheckLanguages,
}

/// Ephemeral per-window state. Every field is optional so updates can be shallow merges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowMeta {
    pub incoming_url: Option<String>,
    pub force_close: Option<bool>,
    pub display_media_requested_view: Option<WorkspaceId>,
    pub workspace_id: Option<WorkspaceId>,
}
impl WindowMeta {
    /// Fields set in `patch` replace ours, the rest stay.
    pub fn merge(&mut self, patch: WindowMeta) {
        let WindowMeta {
            incoming_url,
            force_close,
            display_media_requested_view,
            workspace_id,
        } = patch;
        if incoming_url.is_some() {
            self.incoming_url = incoming_url;
        }
        if force_close.is_some() {
            self.force_close = force_close;
        }
        if display_media_requested_view.is_some() {
            self.display_media_requested_view = display_media_requested_view;
        }
        if workspace_id.is_some() {
            self.workspace_id = workspace_id;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowEvent {
    Resized,
    Maximized,
    Unmaximized,
    EnterFullScreen,
    LeaveFullScreen,
    Focused,
    Closed,
}

pub trait NativeWindow: Send + Sync {
    fn show(&self);
    fn focus(&self);
    fn hide(&self);
    fn close(&self) -> anyhow::Result<()>;
    fn is_destroyed(&self) -> bool;
    fn is_full_screen(&self) -> bool;
    fn set_full_screen(&self, full_screen: bool);
    fn content_size(&self) -> Size;
    fn geometry(&self) -> WindowGeometry;
    fn set_geometry(&self, geometry: WindowGeometry);
    fn send(&self, channel: &str, payload: &serde_json::Value) -> anyhow::Result<()>;
}

pub trait WindowBackend: Send + Sync {
    /// Builds a window and resolves once its content finished loading. Native events must
    /// be reported through `events`.
    fn create(
        &self,
        name: WindowName,
        events: Callback<WindowEvent, ()>,
    ) -> BoxFuture<'static, anyhow::Result<Arc<dyn NativeWindow>>>;
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("Failed to create window {name:?}: {message}")]
    CreateFailed { name: WindowName, message: String },
    #[error("Window {0:?} is not open")]
    NotOpen(WindowName),
    #[error("Window manager is shutting down")]
    ShuttingDown,
}

/// What to do when `open` finds a live window.
#[derive(Clone, Default)]
pub enum Recreate {
    #[default]
    Never,
    Always,
    If(Callback<WindowMeta, bool>),
}
impl Recreate {
    fn wanted(&self, meta: &WindowMeta) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::If(pred) => pred.call(meta.clone()),
        }
    }
}

type PendingOpen = Shared<BoxFuture<'static, Result<Arc<dyn NativeWindow>, WindowError>>>;

#[derive(Default)]
struct State {
    windows: HashMap<WindowName, Arc<dyn NativeWindow>>,
    meta: HashMap<WindowName, WindowMeta>,
    pending: HashMap<WindowName, PendingOpen>,
    /// Events from an older instance of a window are ignored.
    generation: HashMap<WindowName, u64>,
    next_generation: u64,
}

pub struct WindowManager {
    this: Weak<Self>,
    backend: Arc<dyn WindowBackend>,
    preferences: SharedPreferences,
    dialog: Arc<dyn Dialog>,
    state: Mutex<State>,
    events: broadcast::Sender<(WindowName, WindowEvent)>,
    /// Closing the main window only hides it unless `force_close` is set.
    pub hide_main_on_close: bool,
}

impl WindowManager {
    pub fn new(
        backend: Arc<dyn WindowBackend>,
        preferences: SharedPreferences,
        dialog: Arc<dyn Dialog>,
        hide_main_on_close: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            backend,
            preferences,
            dialog,
            state: Mutex::default(),
            events: broadcast::Sender::new(64),
            hide_main_on_close,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(WindowName, WindowEvent)> {
        self.events.subscribe()
    }

    /// Opens `name`, or shows the existing window. Concurrent calls for the same name
    /// share one pending creation.
    pub async fn open(
        &self,
        name: WindowName,
        meta: WindowMeta,
        recreate: Recreate,
    ) -> Result<Arc<dyn NativeWindow>, WindowError> {
        let pending = {
            let mut state = lock_mutex(&self.state);
            if let Some(pending) = state.pending.get(&name) {
                pending.clone()
            } else {
                let existing = state
                    .windows
                    .get(&name)
                    .filter(|win| !win.is_destroyed())
                    .cloned();
                let mut to_close = None;
                if let Some(win) = existing {
                    let current = state.meta.entry(name).or_default();
                    if !recreate.wanted(current) {
                        current.merge(meta);
                        drop(state);
                        win.show();
                        win.focus();
                        return Ok(win);
                    }
                    to_close = Some(win);
                }
                state.windows.remove(&name);
                state.meta.insert(name, meta);
                state.next_generation += 1;
                let generation = state.next_generation;
                state.generation.insert(name, generation);
                let pending = self.create(name, generation, to_close).boxed().shared();
                state.pending.insert(name, pending.clone());
                pending
            }
        };
        pending.await
    }

    fn create(
        &self,
        name: WindowName,
        generation: u64,
        to_close: Option<Arc<dyn NativeWindow>>,
    ) -> impl Future<Output = Result<Arc<dyn NativeWindow>, WindowError>> + Send + 'static {
        let this = self.this.clone();
        let backend = self.backend.clone();
        async move {
            if let Some(old) = to_close {
                old.close()
                    .context_log(format_args!("Failed to close {name:?} for recreation"));
            }
            let events = Callback::from_fn({
                let this = this.clone();
                move |event| {
                    if let Some(this) = this.upgrade() {
                        this.on_native_event(name, generation, event);
                    }
                }
            });
            let created = backend.create(name, events).await;
            let this = this.upgrade().ok_or(WindowError::ShuttingDown)?;
            let mut state = lock_mutex(&this.state);
            state.pending.remove(&name);
            let win = created.map_err(|err| WindowError::CreateFailed {
                name,
                message: format!("{err:#}"),
            })?;
            if name == WindowName::Main
                && let Some(geometry) = this.preferences.get_all().main_window_state
            {
                win.set_geometry(geometry);
            }
            state.windows.insert(name, win.clone());
            log::info!("Opened window {name:?}");
            Ok(win)
        }
    }

    pub fn get(&self, name: WindowName) -> Option<Arc<dyn NativeWindow>> {
        lock_mutex(&self.state)
            .windows
            .get(&name)
            .filter(|win| !win.is_destroyed())
            .cloned()
    }

    /// Resolves with the window once any pending open for it finished.
    pub async fn wait_for_pending(&self, name: WindowName) -> Option<Arc<dyn NativeWindow>> {
        let pending = lock_mutex(&self.state).pending.get(&name).cloned();
        if let Some(pending) = pending {
            pending.await.ok_or_debug();
        }
        self.get(name)
    }

    pub fn close(&self, name: WindowName) -> Result<(), WindowError> {
        let win = self.get(name).ok_or(WindowError::NotOpen(name))?;
        if name == WindowName::Main {
            self.save_main_geometry(&*win);
            let force = self.get_window_meta(name).force_close.unwrap_or(false);
            if self.hide_main_on_close && !force {
                if win.is_full_screen() {
                    win.set_full_screen(false);
                }
                win.hide();
                return Ok(());
            }
        }
        self.forget(name);
        win.close()
            .context_log(format_args!("Failed to close {name:?}"));
        Ok(())
    }

    fn forget(&self, name: WindowName) {
        let mut state = lock_mutex(&self.state);
        state.windows.remove(&name);
        state.meta.remove(&name);
        state.generation.remove(&name);
        drop(state);
        _ = self.events.send((name, WindowEvent::Closed));
    }

    fn save_main_geometry(&self, win: &dyn NativeWindow) {
        let geometry = win.geometry();
        if let Ok(value) = serde_json::to_value(geometry) {
            self.preferences
                .set("mainWindowState", value)
                .context_log("Failed to save the main window geometry");
        }
    }

    fn on_native_event(&self, name: WindowName, generation: u64, event: WindowEvent) {
        let win = {
            let state = lock_mutex(&self.state);
            if state.generation.get(&name) != Some(&generation) {
                return;
            }
            state.windows.get(&name).cloned()
        };
        if event != WindowEvent::Closed {
            _ = self.events.send((name, event));
            return;
        }
        if name == WindowName::Main
            && let Some(win) = win
        {
            self.save_main_geometry(&*win);
        }
        self.forget(name);
    }

    pub fn is_full_screen(&self, name: WindowName) -> bool {
        self.get(name).is_some_and(|win| win.is_full_screen())
    }

    pub fn set_window_meta(&self, name: WindowName, meta: WindowMeta) {
        lock_mutex(&self.state).meta.insert(name, meta);
    }
    pub fn update_window_meta(&self, name: WindowName, patch: WindowMeta) {
        lock_mutex(&self.state)
            .meta
            .entry(name)
            .or_default()
            .merge(patch);
    }
    pub fn get_window_meta(&self, name: WindowName) -> WindowMeta {
        lock_mutex(&self.state)
            .meta
            .get(&name)
            .cloned()
            .unwrap_or_default()
    }

    /// Sends to every live window, skipping destroyed ones. Returns how many got it.
    pub fn send_to_all_windows(&self, channel: &str, payload: &serde_json::Value) -> usize {
        let windows: Vec<_> = lock_mutex(&self.state).windows.values().cloned().collect();
        windows
            .into_iter()
            .filter(|win| !win.is_destroyed())
            .filter(|win| win.send(channel, payload).ok_or_debug().is_some())
            .count()
    }

    /// Asks the user whether to restart now.
    pub async fn request_show_require_restart_dialog(&self) -> bool {
        self.dialog.confirm_restart().await
    }
}

trait ContextLog {
    fn context_log(self, what: impl std::fmt::Display);
}
impl<E: Into<anyhow::Error>> ContextLog for Result<(), E> {
    fn context_log(self, what: impl std::fmt::Display) {
        if let Err(err) = self {
            log::error!("{what}: {:?}", err.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{HeadlessDialog, HeadlessWindows, memory_preferences};

    fn manager(backend: &Arc<HeadlessWindows>, hide_main: bool) -> Arc<WindowManager> {
        WindowManager::new(
            backend.clone(),
            memory_preferences(),
            Arc::new(HeadlessDialog::default()),
            hide_main,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_opens_create_one_window() {
        let backend = Arc::new(HeadlessWindows::with_delay(Duration::from_millis(100)));
        let windows = manager(&backend, false);

        let opens = (0..5).map(|_| windows.open(WindowName::Main, WindowMeta::default(), Recreate::Never));
        let results = futures::future::join_all(opens).await;
        assert!(results.iter().all(|it| it.is_ok()));
        assert_eq!(backend.created(WindowName::Main), 1);

        windows
            .open(WindowName::Main, WindowMeta::default(), Recreate::Never)
            .await
            .unwrap();
        assert_eq!(backend.created(WindowName::Main), 1);
    }

    #[tokio::test]
    async fn recreate_predicate_sees_existing_meta() {
        let backend = Arc::new(HeadlessWindows::default());
        let windows = manager(&backend, false);
        let meta = WindowMeta {
            incoming_url: Some("a".into()),
            ..Default::default()
        };
        windows
            .open(WindowName::OpenUrlWith, meta.clone(), Recreate::Never)
            .await
            .unwrap();

        let differs = Recreate::If(Callback::from_fn(|meta: WindowMeta| {
            meta.incoming_url.as_deref() != Some("a")
        }));
        windows
            .open(WindowName::OpenUrlWith, meta, differs.clone())
            .await
            .unwrap();
        assert_eq!(backend.created(WindowName::OpenUrlWith), 1);

        windows.update_window_meta(
            WindowName::OpenUrlWith,
            WindowMeta {
                incoming_url: Some("b".into()),
                ..Default::default()
            },
        );
        windows
            .open(WindowName::OpenUrlWith, WindowMeta::default(), differs)
            .await
            .unwrap();
        assert_eq!(backend.created(WindowName::OpenUrlWith), 2);
    }

    #[tokio::test]
    async fn meta_updates_are_shallow_merges() {
        let backend = Arc::new(HeadlessWindows::default());
        let windows = manager(&backend, false);
        windows.set_window_meta(
            WindowName::Main,
            WindowMeta {
                incoming_url: Some("x".into()),
                ..Default::default()
            },
        );
        windows.update_window_meta(
            WindowName::Main,
            WindowMeta {
                force_close: Some(true),
                ..Default::default()
            },
        );
        let meta = windows.get_window_meta(WindowName::Main);
        assert_eq!(meta.incoming_url.as_deref(), Some("x"));
        assert_eq!(meta.force_close, Some(true));
    }

    #[tokio::test]
    async fn main_window_hides_unless_forced() {
        let backend = Arc::new(HeadlessWindows::default());
        let windows = manager(&backend, true);
        let main = windows
            .open(WindowName::Main, WindowMeta::default(), Recreate::Never)
            .await
            .unwrap();
        main.set_full_screen(true);

        windows.close(WindowName::Main).unwrap();
        assert!(!main.is_destroyed());
        assert!(!main.is_full_screen());
        assert!(windows.get(WindowName::Main).is_some());

        windows.update_window_meta(
            WindowName::Main,
            WindowMeta {
                force_close: Some(true),
                ..Default::default()
            },
        );
        windows.close(WindowName::Main).unwrap();
        assert!(main.is_destroyed());
        assert!(windows.get(WindowName::Main).is_none());
    }

    #[tokio::test]
    async fn main_geometry_is_persisted_and_restored() {
        let backend = Arc::new(HeadlessWindows::default());
        let prefs = memory_preferences();
        let windows = WindowManager::new(
            backend.clone(),
            prefs.clone(),
            Arc::new(HeadlessDialog::default()),
            false,
        );
        let geometry = WindowGeometry {
            x: 10,
            y: 20,
            width: 800,
            height: 600,
        };
        let main = windows
            .open(WindowName::Main, WindowMeta::default(), Recreate::Never)
            .await
            .unwrap();
        main.set_geometry(geometry);
        windows.close(WindowName::Main).unwrap();
        assert_eq!(prefs.get_all().main_window_state, Some(geometry));

        let main = windows
            .open(WindowName::Main, WindowMeta::default(), Recreate::Never)
            .await
            .unwrap();
        assert_eq!(main.geometry(), geometry);
    }

    #[tokio::test]
    async fn broadcast_skips_destroyed_windows() {
        let backend = Arc::new(HeadlessWindows::default());
        let windows = manager(&backend, false);
        let main = windows
            .open(WindowName::Main, WindowMeta::default(), Recreate::Never)
            .await
            .unwrap();
        windows
            .open(WindowName::About, WindowMeta::default(), Recreate::Never)
            .await
            .unwrap();
        main.close().unwrap();

        let delivered = windows.send_to_all_windows("ping", &serde_json::json!({"n": 1}));
        assert_eq!(delivered, 1);
    }
}
