//! Platform backends without any rendering. The host binary runs on these, so does the
//! test suite.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;

use crate::{
    config::WindowGeometry,
    menu::{NativeMenu, ResolvedMenuItem},
    services::external::{Dialog, MessageKind, RemoveChoice},
    utils::{Callback, lock_mutex},
    view::{Bounds, ContentView, ViewHost},
    window::{NativeWindow, Size, WindowBackend, WindowEvent, WindowName},
    workspaces::{Workspace, WorkspaceId},
};

const DEFAULT_GEOMETRY: WindowGeometry = WindowGeometry {
    x: 0,
    y: 0,
    width: 1000,
    height: 800,
};

pub struct HeadlessWindow {
    name: WindowName,
    visible: AtomicBool,
    destroyed: AtomicBool,
    full_screen: AtomicBool,
    geometry: Mutex<WindowGeometry>,
    sent: Mutex<Vec<(String, serde_json::Value)>>,
    events: Callback<WindowEvent, ()>,
}
impl HeadlessWindow {
    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Relaxed)
    }
    pub fn sent(&self) -> Vec<(String, serde_json::Value)> {
        lock_mutex(&self.sent).clone()
    }
}
impl NativeWindow for HeadlessWindow {
    fn show(&self) {
        self.visible.store(true, Ordering::Relaxed);
    }
    fn focus(&self) {
        self.events.call(WindowEvent::Focused);
    }
    fn hide(&self) {
        self.visible.store(false, Ordering::Relaxed);
    }
    fn close(&self) -> anyhow::Result<()> {
        if self.destroyed.swap(true, Ordering::Relaxed) {
            anyhow::bail!("Window {:?} is already closed", self.name);
        }
        self.visible.store(false, Ordering::Relaxed);
        self.events.call(WindowEvent::Closed);
        Ok(())
    }
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Relaxed)
    }
    fn is_full_screen(&self) -> bool {
        self.full_screen.load(Ordering::Relaxed)
    }
    fn set_full_screen(&self, full_screen: bool) {
        if self.full_screen.swap(full_screen, Ordering::Relaxed) != full_screen {
            self.events.call(if full_screen {
                WindowEvent::EnterFullScreen
            } else {
                WindowEvent::LeaveFullScreen
            });
        }
    }
    fn content_size(&self) -> Size {
        let WindowGeometry { width, height, .. } = *lock_mutex(&self.geometry);
        Size { width, height }
    }
    fn geometry(&self) -> WindowGeometry {
        *lock_mutex(&self.geometry)
    }
    fn set_geometry(&self, geometry: WindowGeometry) {
        *lock_mutex(&self.geometry) = geometry;
    }
    fn send(&self, channel: &str, payload: &serde_json::Value) -> anyhow::Result<()> {
        if self.is_destroyed() {
            anyhow::bail!("Window {:?} is destroyed", self.name);
        }
        lock_mutex(&self.sent).push((channel.into(), payload.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct HeadlessWindows {
    delay: Duration,
    windows: Mutex<HashMap<WindowName, Vec<Arc<HeadlessWindow>>>>,
}
impl HeadlessWindows {
    /// Window creation takes `delay`, like loading content would.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    /// How many windows were ever created for `name`.
    pub fn created(&self, name: WindowName) -> usize {
        lock_mutex(&self.windows).get(&name).map_or(0, Vec::len)
    }

    pub fn latest(&self, name: WindowName) -> Option<Arc<HeadlessWindow>> {
        lock_mutex(&self.windows).get(&name)?.last().cloned()
    }

    /// Reports a native event from the latest window called `name`.
    pub fn emit(&self, name: WindowName, event: WindowEvent) {
        if let Some(win) = self.latest(name) {
            win.events.call(event);
        }
    }
}
impl WindowBackend for HeadlessWindows {
    fn create(
        &self,
        name: WindowName,
        events: Callback<WindowEvent, ()>,
    ) -> BoxFuture<'static, anyhow::Result<Arc<dyn NativeWindow>>> {
        let win = Arc::new(HeadlessWindow {
            name,
            visible: AtomicBool::new(true),
            destroyed: AtomicBool::new(false),
            full_screen: AtomicBool::new(false),
            geometry: Mutex::new(DEFAULT_GEOMETRY),
            sent: Mutex::default(),
            events,
        });
        lock_mutex(&self.windows)
            .entry(name)
            .or_default()
            .push(win.clone());
        let delay = self.delay;
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            log::debug!("Created headless window {name:?}");
            Ok(win as Arc<dyn NativeWindow>)
        })
    }
}

#[derive(Debug, Default)]
struct ViewLog {
    loaded: Vec<String>,
    bounds: Vec<Bounds>,
    visible: bool,
    muted: bool,
    destroyed: bool,
    find_stopped: usize,
    sent: Vec<(String, serde_json::Value)>,
}

#[derive(Debug, Default)]
pub struct HeadlessView {
    log: Mutex<ViewLog>,
}
impl HeadlessView {
    pub fn loaded(&self) -> Vec<String> {
        lock_mutex(&self.log).loaded.clone()
    }
    pub fn bounds_history(&self) -> Vec<Bounds> {
        lock_mutex(&self.log).bounds.clone()
    }
    pub fn visible(&self) -> bool {
        lock_mutex(&self.log).visible
    }
    pub fn muted(&self) -> bool {
        lock_mutex(&self.log).muted
    }
    pub fn destroyed(&self) -> bool {
        lock_mutex(&self.log).destroyed
    }
    pub fn find_stopped(&self) -> usize {
        lock_mutex(&self.log).find_stopped
    }
    pub fn sent(&self, channel: &str) -> Vec<serde_json::Value> {
        lock_mutex(&self.log)
            .sent
            .iter()
            .filter(|(ch, _)| ch == channel)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}
impl ContentView for HeadlessView {
    fn load_url(&self, url: &str) -> anyhow::Result<()> {
        let mut log = lock_mutex(&self.log);
        anyhow::ensure!(!log.destroyed, "View is destroyed");
        log.loaded.push(url.into());
        Ok(())
    }
    fn set_bounds(&self, bounds: Bounds) {
        lock_mutex(&self.log).bounds.push(bounds);
    }
    fn set_visible(&self, visible: bool) {
        lock_mutex(&self.log).visible = visible;
    }
    fn set_audio_muted(&self, muted: bool) {
        lock_mutex(&self.log).muted = muted;
    }
    fn send(&self, channel: &str, payload: &serde_json::Value) -> anyhow::Result<()> {
        let mut log = lock_mutex(&self.log);
        anyhow::ensure!(!log.destroyed, "View is destroyed");
        log.sent.push((channel.into(), payload.clone()));
        Ok(())
    }
    fn stop_find_in_page(&self) {
        lock_mutex(&self.log).find_stopped += 1;
    }
    fn destroy(&self) {
        let mut log = lock_mutex(&self.log);
        log.destroyed = true;
        log.visible = false;
    }
}

#[derive(Default)]
pub struct HeadlessViewHost {
    views: Mutex<HashMap<WorkspaceId, Arc<HeadlessView>>>,
}
impl HeadlessViewHost {
    /// The latest view created for `id`.
    pub fn view(&self, id: &WorkspaceId) -> Option<Arc<HeadlessView>> {
        lock_mutex(&self.views).get(id).cloned()
    }
}
impl ViewHost for HeadlessViewHost {
    fn create(&self, workspace: &Workspace) -> anyhow::Result<Arc<dyn ContentView>> {
        let view = Arc::new(HeadlessView::default());
        lock_mutex(&self.views).insert(workspace.id.clone(), view.clone());
        log::debug!("Created headless view for {}", workspace.id);
        Ok(view)
    }
}

#[derive(Default)]
pub struct HeadlessMenu {
    installed: Mutex<Vec<Vec<ResolvedMenuItem>>>,
    popups: Mutex<Vec<WindowName>>,
}
impl HeadlessMenu {
    /// Number of times an application menu was installed.
    pub fn installed(&self) -> usize {
        lock_mutex(&self.installed).len()
    }
    pub fn last_installed(&self) -> Option<Vec<ResolvedMenuItem>> {
        lock_mutex(&self.installed).last().cloned()
    }
    pub fn popups(&self) -> Vec<WindowName> {
        lock_mutex(&self.popups).clone()
    }
}
impl NativeMenu for HeadlessMenu {
    fn set_application_menu(&self, menu: Vec<ResolvedMenuItem>) -> anyhow::Result<()> {
        log::debug!("Installing menu with {} entries", menu.len());
        lock_mutex(&self.installed).push(menu);
        Ok(())
    }
    fn popup(&self, menu: Vec<ResolvedMenuItem>, window: WindowName) -> anyhow::Result<()> {
        log::debug!("Popup with {} entries in {window:?}", menu.len());
        lock_mutex(&self.popups).push(window);
        Ok(())
    }
    fn open_external(&self, url: &str) -> anyhow::Result<()> {
        log::info!("Open externally: {url}");
        Ok(())
    }
}

/// Answers every dialog with preset choices.
pub struct HeadlessDialog {
    remove_choice: Mutex<Option<RemoveChoice>>,
    restart: AtomicBool,
    messages: Mutex<Vec<(MessageKind, String)>>,
}
impl Default for HeadlessDialog {
    fn default() -> Self {
        Self {
            remove_choice: Mutex::new(Some(RemoveChoice::Cancel)),
            restart: AtomicBool::new(false),
            messages: Mutex::default(),
        }
    }
}
impl HeadlessDialog {
    /// `None` leaves the removal confirmation open forever.
    pub fn answer_remove(&self, choice: Option<RemoveChoice>) {
        *lock_mutex(&self.remove_choice) = choice;
    }
    pub fn answer_restart(&self, restart: bool) {
        self.restart.store(restart, Ordering::Relaxed);
    }
    pub fn messages(&self) -> Vec<(MessageKind, String)> {
        lock_mutex(&self.messages).clone()
    }
}
impl Dialog for HeadlessDialog {
    fn confirm_remove_workspace<'a>(&'a self, workspace_name: &'a str) -> BoxFuture<'a, RemoveChoice> {
        let choice = *lock_mutex(&self.remove_choice);
        log::info!("Confirm removal of {workspace_name}: {choice:?}");
        Box::pin(async move {
            match choice {
                Some(choice) => choice,
                None => std::future::pending().await,
            }
        })
    }
    fn confirm_restart(&self) -> BoxFuture<'_, bool> {
        let restart = self.restart.load(Ordering::Relaxed);
        Box::pin(async move { restart })
    }
    fn show_message<'a>(&'a self, kind: MessageKind, message: &'a str) -> BoxFuture<'a, ()> {
        match kind {
            MessageKind::Error => log::error!("{message}"),
            MessageKind::Warning => log::warn!("{message}"),
            MessageKind::Info => log::info!("{message}"),
        }
        lock_mutex(&self.messages).push((kind, message.into()));
        Box::pin(async {})
    }
}
