use std::sync::Arc;

use tokio::runtime::Handle;

use super::ViewManager;
use crate::{
    menu::{MenuField, MenuItem, Submenu},
    services::Deferred,
    utils::{Callback, ResultExt as _},
    workspaces::{WorkspaceId, WorkspaceRegistry},
};

pub const SWITCH_WORKSPACE_ID: &str = "switch-workspace";
pub const RESTART_WORKSPACE_ID: &str = "restart-workspace";

/// Entries of the Workspaces menu. Clicks run on `runtime` through the late-bound view
/// manager, which does not exist yet when the menu is assembled.
pub fn workspace_menu_items(
    registry: Arc<WorkspaceRegistry>,
    views: Arc<Deferred<ViewManager>>,
    runtime: Handle,
) -> Vec<MenuItem> {
    let switch_to = {
        let registry = registry.clone();
        let views = views.clone();
        let runtime = runtime.clone();
        Callback::from_fn(move |()| {
            registry
                .list()
                .into_iter()
                .filter(|ws| !ws.is_sub_wiki)
                .map(|ws| {
                    let click = on_click(&views, &runtime, ws.id.clone(), |views, id| {
                        Box::pin(async move { views.set_active(&id).await.ok_or_log(); })
                    });
                    MenuItem::labeled(ws.display_name().to_owned())
                        .with_id(&format!("workspace-{}", ws.id))
                        .with_checked(ws.active)
                        .with_click(click)
                })
                .collect()
        })
    };

    let has_active = MenuField::Computed(Callback::from_fn_ctx(registry.clone(), |registry, ()| {
        registry.get_active().is_some()
    }));
    let restart = Callback::from_fn(move |()| {
        let Some(active) = registry.get_active() else {
            return;
        };
        on_click(&views, &runtime, active.id, |views, id| {
            Box::pin(async move {
                views.restart_server(&id).await.ok_or_log();
            })
        })
        .call(());
    });

    vec![
        MenuItem::labeled("Switch Workspace")
            .with_id(SWITCH_WORKSPACE_ID)
            .with_submenu(Submenu::Computed(switch_to)),
        MenuItem::labeled("Restart Current Workspace")
            .with_id(RESTART_WORKSPACE_ID)
            .with_enabled(has_active)
            .with_click(restart),
    ]
}

fn on_click(
    views: &Arc<Deferred<ViewManager>>,
    runtime: &Handle,
    id: WorkspaceId,
    action: fn(Arc<ViewManager>, WorkspaceId) -> futures::future::BoxFuture<'static, ()>,
) -> Callback<(), ()> {
    let views = views.clone();
    let runtime = runtime.clone();
    Callback::from_fn(move |()| {
        let Some(views) = views.get().ok_or_log() else {
            return;
        };
        runtime.spawn(action(views, id.clone()));
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{menu::WORKSPACES_MENU_ID, testing::shell};

    #[tokio::test(start_paused = true)]
    async fn switch_submenu_lists_workspaces_and_switches() {
        let shell = shell();
        let a = shell.add_workspace("a");
        let b = shell.add_workspace("b");
        shell.views.set_active(&a).await.unwrap();

        let menu = shell.services.menu.resolved();
        let workspaces = menu
            .iter()
            .find(|it| it.id.as_deref() == Some(WORKSPACES_MENU_ID))
            .and_then(|it| it.submenu.clone())
            .unwrap();
        let switch = workspaces
            .iter()
            .find(|it| it.id.as_deref() == Some(SWITCH_WORKSPACE_ID))
            .and_then(|it| it.submenu.clone())
            .unwrap();
        assert_eq!(switch.len(), 2);
        assert_eq!(switch[0].checked, Some(true));

        switch[1].click.as_ref().unwrap().call(());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(shell.registry.get_active().map(|it| it.id), Some(b));
    }
}
