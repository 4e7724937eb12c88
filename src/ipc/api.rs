//! Services the host exposes to isolated contexts, and their binding to [`Services`].
//!
//! Preference values travel as JSON text: postcard cannot carry untyped values.

use std::{future::Future, path::PathBuf, sync::Arc};

use futures::{Stream, StreamExt as _};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::WatchStream;

use super::{Callable, RemoteError, RemoteErrorKind, Router, Sendable, Subscribable};
use crate::{
    config::Preferences,
    notifications::{PauseDirective, PauseNotificationsInfo},
    services::{RequestContext, Services},
    view::ViewError,
    window::{Recreate, WindowError, WindowMeta, WindowName},
    workspace_ops::RemoveOutcome,
    workspaces::{Workspace, WorkspaceError, WorkspaceId, WorkspaceMetadata},
};

crate::ipc_service! {
    pub mod workspace = "workspace" {
        get List(()) -> Vec<Workspace>;
        get Get(WorkspaceId) -> Option<Workspace>;
        get GetActive(()) -> Option<Workspace>;
        get Metadata(WorkspaceId) -> WorkspaceMetadata;
        call SetActive(WorkspaceId) -> ();
        /// `(id, force)`. Resolves to whether it was hibernated.
        call Hibernate((WorkspaceId, bool)) -> bool;
        call WakeUp(WorkspaceId) -> ();
        call RestartServer(WorkspaceId) -> bool;
        /// Resolves to whether the user went through with it.
        call Remove(WorkspaceId) -> bool;
        /// Failures are messages for the user.
        call CommitAndSync(WorkspaceId) -> Result<(), String>;
        subscribe Changes(()) -> Vec<Workspace>;
    }
}

crate::ipc_service! {
    pub mod preference = "preference" {
        get GetAll(()) -> Preferences;
        get Get(String) -> Option<String>;
        call Set((String, String)) -> ();
        subscribe Changes(()) -> Preferences;
    }
}

crate::ipc_service! {
    pub mod notification = "notification" {
        get GetPauseInfo(()) -> Option<PauseNotificationsInfo>;
        /// `pause:<RFC 3339>`, `resume:<RFC 3339>` or nothing to clear.
        call SetDirective(Option<String>) -> ();
        subscribe PauseInfo(()) -> Option<PauseNotificationsInfo>;
    }
}

crate::ipc_service! {
    pub mod window = "window" {
        call Open((WindowName, WindowMeta, RequestContext)) -> ();
        call Close(WindowName) -> ();
        get IsFullScreen(WindowName) -> bool;
        get GetMeta(WindowName) -> WindowMeta;
        send SetFindInPage(bool) -> ();
        get IsFindInPageOpen(()) -> bool;
    }
}

crate::ipc_service! {
    pub mod context = "context" {
        get Constants(()) -> AppConstants;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConstants {
    pub version: String,
    pub platform: String,
    pub data_dir: PathBuf,
    pub content_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
}

impl From<WorkspaceError> for RemoteError {
    fn from(err: WorkspaceError) -> Self {
        match err {
            WorkspaceError::NotFound(_) | WorkspaceError::NameNotFound(_) => {
                Self::not_found(err.to_string())
            }
            _ => Self::invalid_argument(err.to_string()),
        }
    }
}
impl From<ViewError> for RemoteError {
    fn from(err: ViewError) -> Self {
        match err {
            ViewError::Workspace(err) => err.into(),
            ViewError::NoView(_) | ViewError::Removed(_) => Self::not_found(err.to_string()),
            ViewError::SubWorkspace(_) => Self::new(RemoteErrorKind::Unsupported, err.to_string()),
            _ => Self::internal(err.to_string()),
        }
    }
}
impl From<WindowError> for RemoteError {
    fn from(err: WindowError) -> Self {
        match err {
            WindowError::NotOpen(_) => Self::not_found(err.to_string()),
            _ => Self::internal(err.to_string()),
        }
    }
}

struct Mount<'a> {
    router: &'a mut Router,
    services: &'a Arc<Services>,
}
impl Mount<'_> {
    fn call<M, F, Fut>(&mut self, handler: F) -> &mut Self
    where
        M: Callable,
        F: Fn(Arc<Services>, M::Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<M::Output, RemoteError>> + Send + 'static,
    {
        let services = self.services.clone();
        self.router
            .handle::<M, _, _>(move |args| handler(services.clone(), args));
        self
    }

    fn send<M, F>(&mut self, handler: F) -> &mut Self
    where
        M: Sendable,
        F: Fn(&Services, M::Args) + Send + Sync + 'static,
    {
        let services = self.services.clone();
        self.router
            .on_send::<M, _>(move |args| handler(&services, args));
        self
    }

    fn subscribe<M, F, S>(&mut self, source: F) -> &mut Self
    where
        M: Subscribable,
        F: Fn(&Services, M::Args) -> S + Send + Sync + 'static,
        S: Stream<Item = M::Output> + Send + 'static,
    {
        let services = self.services.clone();
        self.router
            .on_subscribe::<M, _, _>(move |args| Ok(source(&services, args)));
        self
    }
}

/// Binds every service to its implementation.
pub fn router(services: &Arc<Services>) -> Router {
    let mut router = Router::new();
    let mut mount = Mount {
        router: &mut router,
        services,
    };

    mount
        .call::<workspace::List, _, _>(|s, ()| async move { Ok(s.registry.list()) })
        .call::<workspace::Get, _, _>(|s, id| async move { Ok(s.registry.get(&id)) })
        .call::<workspace::GetActive, _, _>(|s, ()| async move { Ok(s.registry.get_active()) })
        .call::<workspace::Metadata, _, _>(|s, id| async move {
            s.registry.require(&id)?;
            Ok(s.registry.metadata(&id))
        })
        .call::<workspace::SetActive, _, _>(|s, id| async move {
            Ok(s.views.set_active(&id).await?)
        })
        .call::<workspace::Hibernate, _, _>(|s, (id, force)| async move {
            Ok(s.views.hibernate(&id, force).await?)
        })
        .call::<workspace::WakeUp, _, _>(|s, id| async move { Ok(s.views.wake_up(&id).await?) })
        .call::<workspace::RestartServer, _, _>(|s, id| async move {
            Ok(s.views.restart_server(&id).await?)
        })
        .call::<workspace::Remove, _, _>(|s, id| async move {
            let outcome = s.ops.remove_workspace(&id).await?;
            Ok(matches!(outcome, RemoveOutcome::Removed { .. }))
        })
        .call::<workspace::CommitAndSync, _, _>(|s, id| async move {
            Ok(s.ops.commit_and_sync(&id).await)
        })
        .subscribe::<workspace::Changes, _, _>(|s, ()| {
            WatchStream::new(s.registry.subscribe()).map(|list| list.to_vec())
        });

    mount
        .call::<preference::GetAll, _, _>(|s, ()| async move { Ok(s.preferences.get_all()) })
        .call::<preference::Get, _, _>(|s, key| async move {
            Ok(s.preferences.get(&key).map(|value| value.to_string()))
        })
        .call::<preference::Set, _, _>(|s, (key, value)| async move {
            let value = serde_json::from_str(&value).map_err(|err| {
                RemoteError::invalid_argument(format!("Value of {key} is not JSON: {err}"))
            })?;
            s.preferences
                .set(&key, value)
                .map_err(|err| RemoteError::invalid_argument(format!("{err:#}")))
        })
        .subscribe::<preference::Changes, _, _>(|s, ()| WatchStream::new(s.preferences.subscribe()));

    mount
        .call::<notification::GetPauseInfo, _, _>(|s, ()| async move {
            Ok(s.notifications.get_pause_info())
        })
        .call::<notification::SetDirective, _, _>(|s, raw| async move {
            let directive = match raw.as_deref() {
                Some(raw) => Some(PauseDirective::parse(raw).ok_or_else(|| {
                    RemoteError::invalid_argument(format!("Not a pause directive: {raw:?}"))
                })?),
                None => None,
            };
            Ok(s.notifications.set_directive(directive)?)
        })
        .subscribe::<notification::PauseInfo, _, _>(|s, ()| {
            WatchStream::new(s.notifications.subscribe())
        });

    mount
        .call::<window::Open, _, _>(|s, (name, meta, ctx)| async move {
            let recreate = if ctx.force_new_window {
                Recreate::Always
            } else {
                Recreate::Never
            };
            s.windows.open(name, meta, recreate).await?;
            Ok(())
        })
        .call::<window::Close, _, _>(|s, name| async move { Ok(s.windows.close(name)?) })
        .call::<window::IsFullScreen, _, _>(|s, name| async move {
            Ok(s.windows.is_full_screen(name))
        })
        .call::<window::GetMeta, _, _>(|s, name| async move { Ok(s.windows.get_window_meta(name)) })
        .send::<window::SetFindInPage, _>(|s, open| s.views.set_find_in_page(open))
        .call::<window::IsFindInPageOpen, _, _>(|s, ()| async move {
            Ok(s.views.is_find_in_page_open())
        });

    mount.call::<context::Constants, _, _>(|s, ()| async move {
        Ok(AppConstants {
            version: env!("CARGO_PKG_VERSION").into(),
            platform: std::env::consts::OS.into(),
            data_dir: s.config.data_dir.clone(),
            content_dir: s.config.default_content_dir(),
            log_dir: s.config.log_dir.clone(),
        })
    });

    router
}
