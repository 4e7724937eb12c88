//! Fake collaborators and a fully wired shell built on them.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use futures::future::BoxFuture;
use tokio::sync::broadcast;

pub use crate::app::headless::*;
use crate::{
    config::{AppConfig, FIRST_CONTENT_PORT, Preferences},
    content::{ContentServerSupervisor, ContentWatcher, ServerHandle},
    notifications::{Clock, system_clock},
    services::{
        Platform, Services,
        external::{
            Authentication, ContentVersioning, JsonPreferenceStore, NoLocalization,
            SharedPreferences, UserInfo,
        },
    },
    utils::lock_mutex,
    view::ViewManager,
    window::WindowManager,
    workspaces::{NewWorkspace, WorkspaceId, WorkspaceRegistry},
};

pub fn memory_preferences() -> SharedPreferences {
    Arc::new(JsonPreferenceStore::in_memory(Preferences::default()))
}

pub fn test_windows() -> Arc<WindowManager> {
    WindowManager::new(
        Arc::new(HeadlessWindows::default()),
        memory_preferences(),
        Arc::new(HeadlessDialog::default()),
        false,
    )
}

#[derive(Default)]
struct SupervisorLog {
    next_id: u64,
    running: HashMap<u64, ServerHandle>,
    starts: HashMap<u16, usize>,
    stops: usize,
    dropped: Vec<(u16, String)>,
}

/// Pretends to run content servers. Probes succeed after a configurable number of failures.
pub struct FakeSupervisor {
    log: Mutex<SupervisorLog>,
    probes: AtomicUsize,
    /// Failing probes left before the next success. `None` never succeeds.
    failures_left: Mutex<Option<usize>>,
    fail_start: AtomicBool,
}
impl Default for FakeSupervisor {
    fn default() -> Self {
        Self {
            log: Mutex::default(),
            probes: AtomicUsize::new(0),
            failures_left: Mutex::new(Some(0)),
            fail_start: AtomicBool::new(false),
        }
    }
}
impl FakeSupervisor {
    pub fn ready_after(&self, failures: usize) {
        *lock_mutex(&self.failures_left) = Some(failures);
    }
    pub fn never_ready(&self) {
        *lock_mutex(&self.failures_left) = None;
    }
    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::Relaxed);
    }
    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::Relaxed)
    }
    pub fn starts(&self, port: u16) -> usize {
        lock_mutex(&self.log).starts.get(&port).copied().unwrap_or(0)
    }
    pub fn stops(&self) -> usize {
        lock_mutex(&self.log).stops
    }
    pub fn running(&self) -> usize {
        lock_mutex(&self.log).running.len()
    }
    /// `(port, sub-workspace name)` of every drop request.
    pub fn dropped(&self) -> Vec<(u16, String)> {
        lock_mutex(&self.log).dropped.clone()
    }
}
impl ContentServerSupervisor for FakeSupervisor {
    fn start<'a>(
        &'a self,
        root: &'a Path,
        port: u16,
        _user_name: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<ServerHandle>> {
        Box::pin(async move {
            anyhow::ensure!(
                !self.fail_start.load(Ordering::Relaxed),
                "Port {port} is already in use"
            );
            let mut log = lock_mutex(&self.log);
            log.next_id += 1;
            let handle = ServerHandle {
                id: log.next_id,
                port,
                root: root.to_owned(),
            };
            log.running.insert(handle.id, handle.clone());
            *log.starts.entry(port).or_default() += 1;
            Ok(handle)
        })
    }

    fn stop<'a>(&'a self, handle: &'a ServerHandle) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let mut log = lock_mutex(&self.log);
            anyhow::ensure!(
                log.running.remove(&handle.id).is_some(),
                "Server #{} is not running",
                handle.id
            );
            log.stops += 1;
            Ok(())
        })
    }

    fn probe(&self, _port: u16) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            self.probes.fetch_add(1, Ordering::Relaxed);
            let mut left = lock_mutex(&self.failures_left);
            match &mut *left {
                None => false,
                Some(0) => true,
                Some(n) => {
                    *n -= 1;
                    false
                }
            }
        })
    }

    fn drop_sub_wiki<'a>(
        &'a self,
        handle: &'a ServerHandle,
        sub_name: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let mut log = lock_mutex(&self.log);
            anyhow::ensure!(
                log.running.contains_key(&handle.id),
                "Server #{} is not running",
                handle.id
            );
            log.dropped.push((handle.port, sub_name.into()));
            Ok(())
        })
    }

    fn is_running(&self, handle: &ServerHandle) -> bool {
        lock_mutex(&self.log).running.contains_key(&handle.id)
    }
}

pub struct RecordingWatcher {
    watching: Mutex<HashSet<WorkspaceId>>,
    changes: broadcast::Sender<WorkspaceId>,
}
impl Default for RecordingWatcher {
    fn default() -> Self {
        Self {
            watching: Mutex::default(),
            changes: broadcast::Sender::new(16),
        }
    }
}
impl RecordingWatcher {
    pub fn is_watching(&self, id: &WorkspaceId) -> bool {
        lock_mutex(&self.watching).contains(id)
    }
}
impl ContentWatcher for RecordingWatcher {
    fn watch(&self, id: &WorkspaceId, _root: &Path) -> anyhow::Result<()> {
        lock_mutex(&self.watching).insert(id.clone());
        Ok(())
    }
    fn unwatch(&self, id: &WorkspaceId) -> bool {
        lock_mutex(&self.watching).remove(id)
    }
    fn unwatch_all(&self) -> usize {
        lock_mutex(&self.watching).drain().count()
    }
    fn changes(&self) -> broadcast::Receiver<WorkspaceId> {
        self.changes.subscribe()
    }
}

/// Records calls instead of running git. Optionally fails every call.
#[derive(Default)]
pub struct FakeVersioning {
    pub fail: AtomicBool,
    synced: Mutex<Vec<(PathBuf, String)>>,
    initialized: Mutex<Vec<(PathBuf, bool)>>,
}
impl FakeVersioning {
    pub fn synced(&self) -> Vec<(PathBuf, String)> {
        lock_mutex(&self.synced).clone()
    }
    pub fn initialized(&self) -> Vec<(PathBuf, bool)> {
        lock_mutex(&self.initialized).clone()
    }
}
impl ContentVersioning for FakeVersioning {
    fn commit_and_sync<'a>(
        &'a self,
        content_root: &'a Path,
        remote_url: &'a str,
        _user: &'a UserInfo,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            anyhow::ensure!(!self.fail.load(Ordering::Relaxed), "remote rejected the push");
            lock_mutex(&self.synced).push((content_root.to_owned(), remote_url.into()));
            Ok(())
        })
    }

    fn init_repository<'a>(
        &'a self,
        content_root: &'a Path,
        _remote_url: &'a str,
        _user: &'a UserInfo,
        is_primary: bool,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            anyhow::ensure!(!self.fail.load(Ordering::Relaxed), "authentication failed");
            lock_mutex(&self.initialized).push((content_root.to_owned(), is_primary));
            Ok(())
        })
    }

    fn get_remote_url<'a>(&'a self, _content_root: &'a Path) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async { Ok("https://example.com/wiki.git".into()) })
    }
}

#[derive(Default)]
pub struct FixedAuthentication {
    user: Mutex<Option<UserInfo>>,
}
impl FixedAuthentication {
    pub fn set(&self, user: Option<UserInfo>) {
        *lock_mutex(&self.user) = user;
    }
}
impl Authentication for FixedAuthentication {
    fn get(&self, _provider: &str) -> Option<UserInfo> {
        lock_mutex(&self.user).clone()
    }
}

pub fn test_user() -> UserInfo {
    UserInfo {
        user_name: "tester".into(),
        email: Some("tester@example.com".into()),
        access_token: None,
    }
}

/// Every service wired on top of the fakes, with the concrete fakes kept at hand.
pub struct TestShell {
    pub services: Arc<Services>,
    pub registry: Arc<WorkspaceRegistry>,
    pub views: Arc<ViewManager>,
    pub windows: Arc<WindowManager>,
    pub preferences: Arc<JsonPreferenceStore>,
    pub backend: Arc<HeadlessWindows>,
    pub native_menu: Arc<HeadlessMenu>,
    pub host: Arc<HeadlessViewHost>,
    pub supervisor: Arc<FakeSupervisor>,
    pub watcher: Arc<RecordingWatcher>,
    pub versioning: Arc<FakeVersioning>,
    pub authentication: Arc<FixedAuthentication>,
    pub dialog: Arc<HeadlessDialog>,
    pub dir: tempfile::TempDir,
}

impl TestShell {
    pub fn add_workspace(&self, name: &str) -> WorkspaceId {
        self.registry
            .create(NewWorkspace {
                name: self.content_root(name),
                ..Default::default()
            })
            .unwrap()
            .id
    }

    pub fn add_sub_workspace(&self, name: &str, main: &WorkspaceId) -> WorkspaceId {
        let main = self.registry.get(main).unwrap();
        self.registry
            .create(NewWorkspace {
                name: self.content_root(name),
                is_sub_wiki: true,
                main_wiki_to_link: Some(main.name),
                ..Default::default()
            })
            .unwrap()
            .id
    }

    fn content_root(&self, name: &str) -> String {
        self.dir.path().join(name).display().to_string()
    }
}

pub fn shell() -> TestShell {
    shell_with(|_| {})
}

pub fn shell_with_clock(clock: Clock) -> TestShell {
    build_shell(|_| {}, clock)
}

pub fn shell_with(configure: impl FnOnce(&mut AppConfig)) -> TestShell {
    build_shell(configure, system_clock())
}

fn build_shell(configure: impl FnOnce(&mut AppConfig), clock: Clock) -> TestShell {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::with_data_dir(dir.path());
    configure(&mut config);

    let preferences = Arc::new(JsonPreferenceStore::in_memory(Preferences::default()));
    let registry = Arc::new(WorkspaceRegistry::in_memory(FIRST_CONTENT_PORT));
    let backend = Arc::new(HeadlessWindows::default());
    let native_menu = Arc::new(HeadlessMenu::default());
    let host = Arc::new(HeadlessViewHost::default());
    let supervisor = Arc::new(FakeSupervisor::default());
    let watcher = Arc::new(RecordingWatcher::default());
    let versioning = Arc::new(FakeVersioning::default());
    let authentication = Arc::new(FixedAuthentication::default());
    let dialog = Arc::new(HeadlessDialog::default());

    let services = Services::build(
        config,
        Platform {
            window_backend: backend.clone(),
            native_menu: native_menu.clone(),
            view_host: host.clone(),
            supervisor: supervisor.clone(),
            watcher: watcher.clone(),
            versioning: versioning.clone(),
            authentication: authentication.clone(),
            dialog: dialog.clone(),
            localization: Arc::new(NoLocalization),
            preferences: preferences.clone(),
            registry: registry.clone(),
            clock,
        },
    );
    TestShell {
        registry,
        views: services.views.clone(),
        windows: services.windows.clone(),
        services,
        preferences,
        backend,
        native_menu,
        host,
        supervisor,
        watcher,
        versioning,
        authentication,
        dialog,
        dir,
    }
}
