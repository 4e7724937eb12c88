//! Process-wide singletons, wired by constructor injection.

use std::sync::{Arc, OnceLock, Weak};

use crate::{
    config::AppConfig,
    content::{ContentServerSupervisor, ContentWatcher},
    menu::{InsertPosition, MenuBuilder, NativeMenu, WORKSPACES_MENU_ID},
    notifications::{Clock, NotificationScheduler},
    utils::ResultExt as _,
    view::{ViewDeps, ViewHost, ViewManager, workspace_menu_items},
    window::{WindowBackend, WindowManager},
    workspace_ops::WorkspaceOps,
    workspaces::WorkspaceRegistry,
};

pub mod external;

use external::{Authentication, ContentVersioning, Dialog, Localization, SharedPreferences};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Service {0} was used before it was bound")]
    Unbound(&'static str),
    #[error("Service {0} was already dropped")]
    Dropped(&'static str),
    #[error("Service {0} was bound twice")]
    AlreadyBound(&'static str),
}

/// Late-bound weak reference for the few edges that would otherwise form a cycle,
/// e.g. menu callbacks that call back into the view manager.
pub struct Deferred<T: ?Sized> {
    name: &'static str,
    slot: OnceLock<Weak<T>>,
}
impl<T: ?Sized> Deferred<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: OnceLock::new(),
        }
    }

    pub fn bind(&self, target: &Arc<T>) -> Result<(), ServiceError> {
        self.slot
            .set(Arc::downgrade(target))
            .map_err(|_| ServiceError::AlreadyBound(self.name))
    }

    pub fn get(&self) -> Result<Arc<T>, ServiceError> {
        self.slot
            .get()
            .ok_or(ServiceError::Unbound(self.name))?
            .upgrade()
            .ok_or(ServiceError::Dropped(self.name))
    }
}
impl<T: ?Sized> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("name", &self.name)
            .field("bound", &self.slot.get().is_some())
            .finish()
    }
}

/// Flags that only apply to one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RequestContext {
    /// Open the target in a new window even if one already exists.
    pub force_new_window: bool,
}

/// What the embedding platform provides. Everything else is built from these.
pub struct Platform {
    pub window_backend: Arc<dyn WindowBackend>,
    pub native_menu: Arc<dyn NativeMenu>,
    pub view_host: Arc<dyn ViewHost>,
    pub supervisor: Arc<dyn ContentServerSupervisor>,
    pub watcher: Arc<dyn ContentWatcher>,
    pub versioning: Arc<dyn ContentVersioning>,
    pub authentication: Arc<dyn Authentication>,
    pub dialog: Arc<dyn Dialog>,
    pub localization: Arc<dyn Localization>,
    pub preferences: SharedPreferences,
    pub registry: Arc<WorkspaceRegistry>,
    pub clock: Clock,
}

pub struct Services {
    pub config: AppConfig,
    pub preferences: SharedPreferences,
    pub registry: Arc<WorkspaceRegistry>,
    pub windows: Arc<WindowManager>,
    pub menu: Arc<MenuBuilder>,
    pub views: Arc<ViewManager>,
    pub notifications: Arc<NotificationScheduler>,
    pub ops: Arc<WorkspaceOps>,
    pub supervisor: Arc<dyn ContentServerSupervisor>,
    pub watcher: Arc<dyn ContentWatcher>,
    pub versioning: Arc<dyn ContentVersioning>,
    pub authentication: Arc<dyn Authentication>,
    pub dialog: Arc<dyn Dialog>,
    pub localization: Arc<dyn Localization>,
}

impl Services {
    /// Wires every singleton in dependency order. The menu is assembled before the view
    /// manager exists, so its workspace entries reach it through a [`Deferred`].
    ///
    /// Must be called inside the runtime.
    pub fn build(config: AppConfig, platform: Platform) -> Arc<Self> {
        let Platform {
            window_backend,
            native_menu,
            view_host,
            supervisor,
            watcher,
            versioning,
            authentication,
            dialog,
            localization,
            preferences,
            registry,
            clock,
        } = platform;

        let windows = WindowManager::new(
            window_backend,
            preferences.clone(),
            dialog.clone(),
            cfg!(target_os = "macos"),
        );
        let menu = MenuBuilder::new(native_menu, windows.clone());

        let late_views = Arc::new(Deferred::<ViewManager>::new("views"));
        menu.insert_menu(
            WORKSPACES_MENU_ID,
            workspace_menu_items(
                registry.clone(),
                late_views.clone(),
                tokio::runtime::Handle::current(),
            ),
            InsertPosition::End,
            false,
        )
        .ok_or_log();

        let views = ViewManager::new(ViewDeps {
            registry: registry.clone(),
            windows: windows.clone(),
            menu: menu.clone(),
            host: view_host,
            supervisor: supervisor.clone(),
            watcher: watcher.clone(),
            preferences: preferences.clone(),
            ready_timeout: config.ready_timeout,
            deferred_layout: config.deferred_layout,
        });
        late_views.bind(&views).ok_or_log();

        let notifications =
            NotificationScheduler::new(preferences.clone(), windows.clone(), views.clone(), clock);
        let ops = Arc::new(WorkspaceOps::new(
            registry.clone(),
            views.clone(),
            menu.clone(),
            supervisor.clone(),
            versioning.clone(),
            authentication.clone(),
            dialog.clone(),
        ));

        Arc::new(Self {
            config,
            preferences,
            registry,
            windows,
            menu,
            views,
            notifications,
            ops,
            supervisor,
            watcher,
            versioning,
            authentication,
            dialog,
            localization,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferred_lifecycle() {
        let deferred = Deferred::<str>::new("greeting");
        assert_eq!(deferred.get(), Err(ServiceError::Unbound("greeting")));

        let target: Arc<str> = "hello".into();
        deferred.bind(&target).unwrap();
        assert_eq!(&*deferred.get().unwrap(), "hello");
        assert_eq!(
            deferred.bind(&target),
            Err(ServiceError::AlreadyBound("greeting"))
        );

        drop(target);
        assert_eq!(deferred.get(), Err(ServiceError::Dropped("greeting")));
    }
}
