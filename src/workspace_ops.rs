//! Multi-step workspace transactions that span the registry, views and collaborators.

use std::{path::Path, sync::Arc};

use anyhow::Context as _;
use futures::future::BoxFuture;

use crate::{
    config::CONFIRM_TIMEOUT,
    content::ContentServerSupervisor,
    menu::MenuBuilder,
    services::external::{Authentication, ContentVersioning, Dialog, RemoveChoice, UserInfo},
    utils::{KeyedLock, ResultExt as _, run_best_effort},
    view::ViewManager,
    workspaces::{Workspace, WorkspaceError, WorkspaceId, WorkspaceRegistry},
};

/// Credentials are looked up under this provider when a workspace carries none.
pub const GIT_PROVIDER: &str = "git";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// Done, with the number of teardown steps that failed along the way.
    Removed { failed_steps: usize },
    Cancelled,
    /// Another removal of the same workspace is still running.
    InProgress,
}

pub struct WorkspaceOps {
    pub registry: Arc<WorkspaceRegistry>,
    pub views: Arc<ViewManager>,
    pub menu: Arc<MenuBuilder>,
    pub supervisor: Arc<dyn ContentServerSupervisor>,
    pub versioning: Arc<dyn ContentVersioning>,
    pub authentication: Arc<dyn Authentication>,
    pub dialog: Arc<dyn Dialog>,
    removals: KeyedLock<WorkspaceId>,
}

impl WorkspaceOps {
    pub fn new(
        registry: Arc<WorkspaceRegistry>,
        views: Arc<ViewManager>,
        menu: Arc<MenuBuilder>,
        supervisor: Arc<dyn ContentServerSupervisor>,
        versioning: Arc<dyn ContentVersioning>,
        authentication: Arc<dyn Authentication>,
        dialog: Arc<dyn Dialog>,
    ) -> Self {
        Self {
            registry,
            views,
            menu,
            supervisor,
            versioning,
            authentication,
            dialog,
            removals: KeyedLock::new(),
        }
    }

    /// Asks the user, then tears the workspace down and forgets it.
    ///
    /// Every teardown step runs even if an earlier one failed. Removing a sub-workspace
    /// makes its main workspace's server drop it and restarts that server once.
    pub async fn remove_workspace(&self, id: &WorkspaceId) -> Result<RemoveOutcome, WorkspaceError> {
        let Some(_guard) = self.removals.try_lock(id.clone()) else {
            log::info!("Removal of {id} is already in progress");
            return Ok(RemoveOutcome::InProgress);
        };
        let ws = self.registry.require(id)?;
        if !ws.is_sub_wiki {
            let subs = self.registry.sub_workspaces_of(&ws.name);
            if !subs.is_empty() {
                return Err(WorkspaceError::HasSubWorkspaces {
                    main: ws.name,
                    subs: subs.into_iter().map(|it| it.name).collect(),
                });
            }
        }

        let choice = match tokio::time::timeout(
            CONFIRM_TIMEOUT,
            self.dialog.confirm_remove_workspace(ws.display_name()),
        )
        .await
        {
            Ok(choice) => choice,
            Err(_) => {
                log::warn!("No answer to the removal of {id} within {CONFIRM_TIMEOUT:?}");
                RemoveChoice::Cancel
            }
        };
        let delete_content = match choice {
            RemoveChoice::Cancel => return Ok(RemoveOutcome::Cancelled),
            RemoveChoice::Remove => false,
            RemoveChoice::RemoveAndDelete => true,
        };
        log::info!("Removing {id} ({}), delete content: {delete_content}", ws.name);

        let mut failed = self.views.remove_view(id).await;
        let steps: [(&str, BoxFuture<'_, anyhow::Result<()>>); 3] = [
            (
                "delete content",
                Box::pin(async {
                    if delete_content {
                        remove_content(ws.content_root()).await?;
                    }
                    anyhow::Ok(())
                }),
            ),
            (
                "remove record",
                Box::pin(async {
                    self.registry.remove(id)?;
                    anyhow::Ok(())
                }),
            ),
            ("detach from main workspace", Box::pin(self.detach_from_main(&ws))),
        ];
        failed += run_best_effort(&format!("Removing {id}"), steps).await;

        if ws.active
            && let Some(next) = self.registry.list().into_iter().find(|it| !it.is_sub_wiki)
        {
            self.views.set_active(&next.id).await.ok_or_log();
        }
        self.menu.build_menu();
        Ok(RemoveOutcome::Removed {
            failed_steps: failed,
        })
    }

    async fn detach_from_main(&self, ws: &Workspace) -> anyhow::Result<()> {
        let Some(main_name) = ws.main_wiki_to_link.as_deref().filter(|_| ws.is_sub_wiki) else {
            return Ok(());
        };
        let main = self
            .registry
            .get_by_name(main_name)
            .ok_or_else(|| WorkspaceError::NameNotFound(main_name.into()))?;
        let server = self
            .views
            .server(&main.id)
            .filter(|it| self.supervisor.is_running(it));
        let Some(server) = server.filter(|_| !main.hibernated) else {
            log::info!(
                "Main workspace {} is not running, it picks up the removal of {} on next start",
                main.id,
                ws.id
            );
            return Ok(());
        };
        self.supervisor
            .drop_sub_wiki(&server, ws.display_name())
            .await
            .with_context(|| format!("Failed to detach {} from {}", ws.id, main.id))?;
        self.views.restart_server(&main.id).await?;
        Ok(())
    }

    /// Initializes version control in `root`. On failure, content this call created is
    /// removed again and the error comes back as a message for the user.
    pub async fn init_repository_transaction(
        &self,
        root: &Path,
        remote_url: &str,
        user: &UserInfo,
        is_primary: bool,
    ) -> Result<(), String> {
        let existed = root.exists();
        let result: anyhow::Result<()> = async {
            tokio::fs::create_dir_all(root)
                .await
                .with_context(|| format!("Failed to create {}", root.display()))?;
            self.versioning
                .init_repository(root, remote_url, user, is_primary)
                .await
        }
        .await;
        let Err(err) = result else {
            return Ok(());
        };
        log::error!("Initializing {} failed: {err:?}", root.display());
        if !existed {
            remove_content(root).await.ok_or_log();
        }
        Err(format!("{err:#}"))
    }

    /// Commits local changes and syncs with the remote, using the workspace's own
    /// credentials or the ones of the git provider.
    pub async fn commit_and_sync(&self, id: &WorkspaceId) -> Result<(), String> {
        let ws = self.registry.require(id).map_err(|err| err.to_string())?;
        let remote = ws
            .git_url
            .as_deref()
            .ok_or_else(|| format!("Workspace {} has no remote", ws.display_name()))?;
        let user = self
            .credentials(&ws)
            .ok_or_else(|| format!("No credentials to sync {}", ws.display_name()))?;
        self.versioning
            .commit_and_sync(ws.content_root(), remote, &user)
            .await
            .map_err(|err| {
                log::error!("Sync of {id} failed: {err:?}");
                format!("{err:#}")
            })
    }

    pub fn credentials(&self, ws: &Workspace) -> Option<UserInfo> {
        ws.user_info
            .clone()
            .or_else(|| self.authentication.get(GIT_PROVIDER))
    }
}

async fn remove_content(root: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_dir_all(root).await {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        res => res.with_context(|| format!("Failed to delete {}", root.display())),
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::Ordering, time::Duration};

    use super::*;
    use crate::{
        testing::{shell, test_user},
        view::ViewState,
    };

    #[tokio::test(start_paused = true)]
    async fn removing_a_sub_workspace_restarts_only_its_main() {
        let shell = shell();
        let main = shell.add_workspace("main");
        let other = shell.add_workspace("other");
        let sub = shell.add_sub_workspace("sub", &main);
        shell.views.set_active(&main).await.unwrap();
        shell.views.create_view(&other, None).await.unwrap();
        shell.views.create_view(&sub, None).await.unwrap();
        shell.dialog.answer_remove(Some(RemoveChoice::Remove));

        let main_port = shell.registry.get(&main).unwrap().port;
        let other_port = shell.registry.get(&other).unwrap().port;
        let outcome = shell.services.ops.remove_workspace(&sub).await.unwrap();

        assert_eq!(outcome, RemoveOutcome::Removed { failed_steps: 0 });
        assert!(shell.registry.get(&sub).is_none());
        assert!(!shell.watcher.is_watching(&sub));
        assert_eq!(shell.supervisor.dropped(), vec![(main_port, "sub".to_owned())]);
        assert_eq!(shell.supervisor.starts(main_port), 2);
        assert_eq!(shell.supervisor.starts(other_port), 1);
        assert_eq!(shell.views.state(&main), ViewState::Ready);
        assert_eq!(shell.views.state(&sub), ViewState::Removed);
    }

    #[tokio::test(start_paused = true)]
    async fn hibernated_main_is_not_restarted() {
        let shell = shell();
        let main = shell.add_workspace("main");
        let sub = shell.add_sub_workspace("sub", &main);
        shell.views.create_view(&main, None).await.unwrap();
        shell.views.hibernate(&main, false).await.unwrap();
        shell.dialog.answer_remove(Some(RemoveChoice::Remove));

        let outcome = shell.services.ops.remove_workspace(&sub).await.unwrap();
        assert_eq!(outcome, RemoveOutcome::Removed { failed_steps: 0 });
        assert!(shell.supervisor.dropped().is_empty());
        assert_eq!(shell.views.state(&main), ViewState::Hibernated);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_keeps_everything() {
        let shell = shell();
        let a = shell.add_workspace("a");
        shell.views.create_view(&a, None).await.unwrap();

        let outcome = shell.services.ops.remove_workspace(&a).await.unwrap();
        assert_eq!(outcome, RemoveOutcome::Cancelled);
        assert!(shell.registry.get(&a).is_some());
        assert_eq!(shell.views.state(&a), ViewState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_confirmation_times_out_as_cancel() {
        let shell = shell();
        let a = shell.add_workspace("a");
        shell.dialog.answer_remove(None);

        let outcome = shell.services.ops.remove_workspace(&a).await.unwrap();
        assert_eq!(outcome, RemoveOutcome::Cancelled);
        assert!(shell.registry.get(&a).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_removals_are_single_flight() {
        let shell = shell();
        let a = shell.add_workspace("a");
        shell.dialog.answer_remove(None);

        let ops = &shell.services.ops;
        let (first, second) = tokio::join!(ops.remove_workspace(&a), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            ops.remove_workspace(&a).await
        });
        assert_eq!(first.unwrap(), RemoveOutcome::Cancelled);
        assert_eq!(second.unwrap(), RemoveOutcome::InProgress);
    }

    #[tokio::test(start_paused = true)]
    async fn main_with_subs_cannot_be_removed() {
        let shell = shell();
        let main = shell.add_workspace("main");
        shell.add_sub_workspace("sub", &main);
        shell.dialog.answer_remove(Some(RemoveChoice::Remove));

        let err = shell.services.ops.remove_workspace(&main).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::HasSubWorkspaces { .. }));
        assert!(shell.registry.get(&main).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn remove_and_delete_wipes_content_and_activates_another() {
        let shell = shell();
        let a = shell.add_workspace("a");
        let b = shell.add_workspace("b");
        let root = shell.registry.get(&a).unwrap().name;
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(Path::new(&root).join("index.html"), "hi").unwrap();
        shell.views.set_active(&a).await.unwrap();
        shell.dialog.answer_remove(Some(RemoveChoice::RemoveAndDelete));

        shell.services.ops.remove_workspace(&a).await.unwrap();
        assert!(!Path::new(&root).exists());
        assert_eq!(shell.registry.get_active().map(|it| it.id), Some(b));
    }

    #[tokio::test]
    async fn failed_init_removes_scaffold() {
        let shell = shell();
        let root = shell.dir.path().join("fresh");
        shell.versioning.fail.store(true, Ordering::Relaxed);

        let err = shell
            .services
            .ops
            .init_repository_transaction(&root, "https://example.com/x.git", &test_user(), true)
            .await
            .unwrap_err();
        assert!(err.contains("authentication failed"), "{err}");
        assert!(!root.exists());

        shell.versioning.fail.store(false, Ordering::Relaxed);
        shell
            .services
            .ops
            .init_repository_transaction(&root, "https://example.com/x.git", &test_user(), true)
            .await
            .unwrap();
        assert!(root.exists());
        assert_eq!(shell.versioning.initialized(), vec![(root, true)]);
    }

    #[tokio::test]
    async fn commit_and_sync_needs_remote_and_credentials() {
        let shell = shell();
        let a = shell.add_workspace("a");
        let ops = &shell.services.ops;
        assert!(ops.commit_and_sync(&a).await.unwrap_err().contains("no remote"));

        shell
            .registry
            .update(
                &a,
                crate::workspaces::WorkspacePatch {
                    git_url: Some(Some("https://example.com/a.git".into())),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(ops.commit_and_sync(&a).await.unwrap_err().contains("No credentials"));

        shell.authentication.set(Some(test_user()));
        ops.commit_and_sync(&a).await.unwrap();
        assert_eq!(shell.versioning.synced().len(), 1);
    }
}
