//! Process entry points and the host lifecycle: startup, url routing and shutdown.

use std::{process::ExitCode, sync::Arc};

use anyhow::Context as _;
use futures::{StreamExt as _, future::BoxFuture};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{AppConfig, FIRST_CONTENT_PORT},
    content::{CONTENT_SERVER_ARG, NotifyWatcher, ProcessSupervisor},
    ipc::{IpcServer, Proxy, api},
    logging::{ProcKind, init_logger},
    notifications::system_clock,
    services::{
        Platform, Services,
        external::{EnvAuthentication, GitCli, JsonPreferenceStore, NoLocalization},
    },
    utils::{ResultExt as _, run_best_effort, unb_chan},
    window::{Recreate, WindowMeta, WindowName},
    workspaces::{WorkspaceId, WorkspacePatch, WorkspaceRegistry},
};

pub mod headless;
mod instance;

pub use instance::Activation;

/// argv[1] that turns the binary into an isolated view process.
pub const VIEW_ARG: &str = "__wikishell_view";
/// Socket the isolated side connects to, handed down by the host.
pub const IPC_SOCKET_VAR: &str = "WIKISHELL_IPC_SOCKET";

pub fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let result = match args.next().as_deref() {
        Some(CONTENT_SERVER_ARG) => crate::content::server::main(),
        Some(VIEW_ARG) => view_main(args.next().unwrap_or_default()),
        first => host_main(first.into_iter().map(String::from).chain(args).collect()),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:?}");
            ExitCode::FAILURE
        }
    }
}

fn host_main(urls: Vec<String>) -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    config.ensure_dirs()?;
    init_logger(ProcKind::Host, config.log_dir.as_deref());

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the tokio runtime")?
        .block_on(run_host(config, Activation { urls }))
}

async fn run_host(config: AppConfig, activation: Activation) -> anyhow::Result<()> {
    let listener = match instance::acquire(&config.instance_socket(), &activation).await? {
        instance::Instance::Primary(listener) => listener,
        instance::Instance::Secondary => return Ok(()),
    };

    let platform = Platform {
        window_backend: Arc::new(headless::HeadlessWindows::default()),
        native_menu: Arc::new(headless::HeadlessMenu::default()),
        view_host: Arc::new(headless::HeadlessViewHost::default()),
        supervisor: Arc::new(ProcessSupervisor::current_exe(config.log_dir.clone())?),
        watcher: Arc::new(NotifyWatcher::default()),
        versioning: Arc::new(GitCli::default()),
        authentication: Arc::new(EnvAuthentication),
        dialog: Arc::new(headless::HeadlessDialog::default()),
        localization: Arc::new(NoLocalization),
        preferences: Arc::new(JsonPreferenceStore::load(config.preferences_file())?),
        registry: Arc::new(WorkspaceRegistry::load(
            config.workspaces_file(),
            FIRST_CONTENT_PORT,
        )?),
        clock: system_clock(),
    };
    let services = Services::build(config, platform);
    let app = App::new(services.clone());
    let cancel = CancellationToken::new();

    let ipc_socket = services.config.ipc_socket();
    std::fs::remove_file(&ipc_socket).ok_or_debug();
    let ipc_listener = tokio::net::UnixListener::bind(&ipc_socket)
        .with_context(|| format!("Failed to bind {}", ipc_socket.display()))?;
    tokio::spawn(IpcServer::new(api::router(&services)).serve_unix(ipc_listener, cancel.clone()));

    let (activation_tx, mut activations) = unb_chan();
    tokio::spawn(instance::listen(listener, activation_tx, cancel.clone()));

    app.start().await;
    for url in activation.urls {
        app.handle_open_url(&url).await.ok_or_log();
    }

    let signals = wait_for_signal();
    tokio::pin!(signals);
    loop {
        tokio::select! {
            Some(activation) = activations.next() => {
                if let Some(main) = services.windows.get(WindowName::Main) {
                    main.show();
                    main.focus();
                }
                for url in activation.urls {
                    app.handle_open_url(&url).await.ok_or_log();
                }
            }
            () = &mut signals => break,
        }
    }

    cancel.cancel();
    let failed = app.shutdown().await;
    if failed > 0 {
        log::warn!("{failed} shutdown steps failed");
    }
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (Some(mut interrupt), Some(mut terminate)) = (
        signal(SignalKind::interrupt()).ok_or_log(),
        signal(SignalKind::terminate()).ok_or_log(),
    ) else {
        return std::future::pending().await;
    };
    tokio::select! {
        _ = interrupt.recv() => log::debug!("Received SIGINT"),
        _ = terminate.recv() => log::debug!("Received SIGTERM"),
    }
}

/// The isolated side: connects to the host and follows what it publishes.
fn view_main(workspace: String) -> anyhow::Result<()> {
    let log_dir = std::env::var_os(crate::config::LOG_DIR_VAR).map(std::path::PathBuf::from);
    init_logger(ProcKind::View(workspace.clone()), log_dir.as_deref());
    let socket = std::env::var_os(IPC_SOCKET_VAR).with_context(|| format!("Missing {IPC_SOCKET_VAR}"))?;

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start the tokio runtime")?
        .block_on(async move {
            let stream = tokio::net::UnixStream::connect(&socket)
                .await
                .context("Failed to connect to the host")?;
            let proxy = Proxy::connect(stream, &workspace, Some(WindowName::Main)).await?;
            let constants = proxy.call::<api::context::Constants>(()).await?;
            log::info!("Connected to host {} on {}", constants.version, constants.platform);

            let mut pause = proxy.subscribe::<api::notification::PauseInfo>(())?;
            while let Some(info) = pause.next().await {
                match info? {
                    Some(info) => log::info!("Notifications paused until {}", info.til_date),
                    None => log::info!("Notifications resumed"),
                }
            }
            anyhow::Ok(())
        })
}

/// Host lifecycle over the wired services.
pub struct App {
    services: Arc<Services>,
}

impl App {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Opens the main window, brings up the workspaces and publishes the initial state.
    /// Failures of single workspaces are logged and do not stop the rest.
    pub async fn start(&self) {
        let s = &self.services;
        s.windows
            .open(WindowName::Main, WindowMeta::default(), Recreate::Never)
            .await
            .context("Failed to open the main window")
            .ok_or_log();

        // Something has to stay visible, so pick the active workspace before hibernating.
        let active = s.registry.get_active().or_else(|| {
            let mains: Vec<_> = s.registry.list().into_iter().filter(|it| !it.is_sub_wiki).collect();
            mains
                .iter()
                .find(|it| !it.hibernated)
                .or(mains.first())
                .cloned()
        });
        self.hibernate_unused_at_launch(active.as_ref().map(|it| &it.id));
        if let Some(active) = &active {
            s.views.set_active(&active.id).await.ok_or_log();
        }
        let others = s
            .registry
            .list()
            .into_iter()
            .filter(|ws| !ws.hibernated && Some(&ws.id) != active.as_ref().map(|it| &it.id));
        let creating = others.map(|ws| async move {
            s.views
                .create_view(&ws.id, None)
                .await
                .with_context(|| format!("Failed to start {}", ws.display_name()))
                .ok_or_log();
        });
        futures::future::join_all(creating).await;

        for ws in s.registry.list() {
            let failed_to_load = s
                .registry
                .metadata(&ws.id)
                .did_fail_load_error_message
                .is_some_and(|it| !it.is_empty());
            if failed_to_load {
                log::info!("Not syncing {} since it failed to load", ws.display_name());
                continue;
            }
            if ws.git_url.is_some() && !ws.is_sub_wiki && s.ops.credentials(&ws).is_some() {
                if let Err(err) = s.ops.commit_and_sync(&ws.id).await {
                    log::warn!("Sync of {} at startup failed: {err}", ws.display_name());
                }
            }
        }

        s.notifications.update();
        s.menu.build_menu();
        log::info!("Started with {} workspaces", s.registry.count());
    }

    /// Hibernates every main workspace but `active` that either the global preference or
    /// its own `hibernate_when_unused` marks as unused.
    fn hibernate_unused_at_launch(&self, active: Option<&WorkspaceId>) {
        let s = &self.services;
        let all_unused = s.preferences.get_all().hibernate_unused_workspaces_at_launch;
        for ws in s.registry.list() {
            if Some(&ws.id) == active || ws.is_sub_wiki || ws.hibernated {
                continue;
            }
            if !(all_unused || ws.hibernate_when_unused) {
                continue;
            }
            s.registry
                .update(
                    &ws.id,
                    WorkspacePatch {
                        hibernated: Some(true),
                        ..Default::default()
                    },
                )
                .ok_or_log();
        }
    }

    /// Routes a url opened from outside. With a single workspace it loads there, otherwise
    /// the user picks one in the open-url-with window.
    pub async fn handle_open_url(&self, url: &str) -> anyhow::Result<()> {
        let s = &self.services;
        s.windows.wait_for_pending(WindowName::Main).await;
        let candidates: Vec<_> = s
            .registry
            .list()
            .into_iter()
            .filter(|it| !it.is_sub_wiki)
            .collect();
        if let [only] = candidates.as_slice() {
            log::info!("Opening {url} in {}", only.display_name());
            if s.views.view(&only.id).is_none() {
                s.views.set_active(&only.id).await?;
            }
            s.views.load_url(&only.id, url)?;
            return Ok(());
        }
        let incoming = url.to_owned();
        s.windows
            .open(
                WindowName::OpenUrlWith,
                WindowMeta {
                    incoming_url: Some(url.into()),
                    ..Default::default()
                },
                Recreate::If(crate::utils::Callback::from_fn(move |meta: WindowMeta| {
                    meta.incoming_url.as_deref() != Some(incoming.as_str())
                })),
            )
            .await?;
        Ok(())
    }

    /// Tears everything down. Every step runs even if an earlier one failed, returns the
    /// number of failed steps.
    pub async fn shutdown(&self) -> usize {
        let s = &self.services;
        let steps: [(&str, BoxFuture<'_, anyhow::Result<()>>); 4] = [
            (
                "stop content servers",
                Box::pin(async {
                    let failed = s.views.shutdown().await;
                    anyhow::ensure!(failed == 0, "{failed} content servers did not stop");
                    anyhow::Ok(())
                }),
            ),
            (
                "stop content watchers",
                Box::pin(async {
                    let stopped = s.watcher.unwatch_all();
                    log::debug!("Stopped {stopped} watchers");
                    Ok(())
                }),
            ),
            (
                "release localization",
                Box::pin(async { s.localization.clear_bindings() }),
            ),
            (
                "allow the main window to close",
                Box::pin(async {
                    s.windows.update_window_meta(
                        WindowName::Main,
                        WindowMeta {
                            force_close: Some(true),
                            ..Default::default()
                        },
                    );
                    Ok(())
                }),
            ),
        ];
        let failed = run_best_effort("Shutting down", steps).await;
        log::info!("Shut down");
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        services::external::PreferenceStore as _,
        testing::shell,
        view::ViewState,
    };

    #[tokio::test(start_paused = true)]
    async fn startup_brings_up_workspaces_and_menu() {
        let shell = shell();
        let a = shell.add_workspace("a");
        let b = shell.add_workspace("b");
        let app = App::new(shell.services.clone());

        app.start().await;
        assert!(shell.windows.get(WindowName::Main).is_some());
        assert_eq!(shell.registry.get_active().map(|it| it.id), Some(a.clone()));
        assert_eq!(shell.views.state(&a), ViewState::Ready);
        assert_eq!(shell.views.state(&b), ViewState::Ready);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(shell.native_menu.installed() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hibernate_at_launch_spares_the_active_workspace() {
        let shell = shell();
        let a = shell.add_workspace("a");
        let b = shell.add_workspace("b");
        shell.registry.set_active(&b).unwrap();
        shell
            .preferences
            .set(
                "hibernateUnusedWorkspacesAtLaunch",
                serde_json::Value::Bool(true),
            )
            .unwrap();

        App::new(shell.services.clone()).start().await;
        assert_eq!(shell.views.state(&a), ViewState::Hibernated);
        assert_eq!(shell.views.state(&b), ViewState::Ready);
        assert_eq!(shell.supervisor.running(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hibernate_when_unused_applies_at_launch() {
        let shell = shell();
        let a = shell.add_workspace("a");
        let b = shell.add_workspace("b");
        shell.registry.set_active(&a).unwrap();
        shell
            .registry
            .update(
                &b,
                WorkspacePatch {
                    hibernate_when_unused: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();

        App::new(shell.services.clone()).start().await;
        assert_eq!(shell.views.state(&a), ViewState::Ready);
        assert_eq!(shell.views.state(&b), ViewState::Hibernated);
    }

    #[tokio::test(start_paused = true)]
    async fn hibernate_at_launch_without_active_keeps_one_visible() {
        let shell = shell();
        let a = shell.add_workspace("a");
        let b = shell.add_workspace("b");
        shell
            .preferences
            .set(
                "hibernateUnusedWorkspacesAtLaunch",
                serde_json::Value::Bool(true),
            )
            .unwrap();

        App::new(shell.services.clone()).start().await;
        assert_eq!(shell.registry.get_active().map(|it| it.id), Some(a.clone()));
        assert_eq!(shell.views.state(&a), ViewState::Ready);
        assert_eq!(shell.views.state(&b), ViewState::Hibernated);
    }

    #[tokio::test(start_paused = true)]
    async fn startup_does_not_sync_workspaces_that_failed_to_load() {
        let shell = shell();
        let a = shell.add_workspace("a");
        shell
            .registry
            .update(
                &a,
                WorkspacePatch {
                    git_url: Some(Some("https://example.com/a.git".into())),
                    ..Default::default()
                },
            )
            .unwrap();
        shell.authentication.set(Some(crate::testing::test_user()));
        shell.supervisor.fail_start(true);

        App::new(shell.services.clone()).start().await;
        assert!(shell.registry.metadata(&a).did_fail_load_error_message.is_some());
        assert!(shell.versioning.synced().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn startup_syncs_workspaces_with_credentials() {
        let shell = shell();
        let a = shell.add_workspace("a");
        shell
            .registry
            .update(
                &a,
                WorkspacePatch {
                    git_url: Some(Some("https://example.com/a.git".into())),
                    ..Default::default()
                },
            )
            .unwrap();
        shell.authentication.set(Some(crate::testing::test_user()));

        App::new(shell.services.clone()).start().await;
        assert_eq!(shell.versioning.synced().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn single_workspace_loads_urls_directly() {
        let shell = shell();
        let a = shell.add_workspace("a");
        let app = App::new(shell.services.clone());
        app.start().await;

        app.handle_open_url("http://127.0.0.1:5212/#Page").await.unwrap();
        let loaded = shell.host.view(&a).unwrap().loaded();
        assert_eq!(loaded.last().map(String::as_str), Some("http://127.0.0.1:5212/#Page"));
        assert_eq!(shell.backend.created(WindowName::OpenUrlWith), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn several_workspaces_ask_where_to_open() {
        let shell = shell();
        shell.add_workspace("a");
        shell.add_workspace("b");
        let app = App::new(shell.services.clone());
        app.start().await;

        app.handle_open_url("wikishell://x").await.unwrap();
        app.handle_open_url("wikishell://x").await.unwrap();
        assert_eq!(shell.backend.created(WindowName::OpenUrlWith), 1);
        assert_eq!(
            shell.windows.get_window_meta(WindowName::OpenUrlWith).incoming_url.as_deref(),
            Some("wikishell://x")
        );

        app.handle_open_url("wikishell://y").await.unwrap();
        assert_eq!(shell.backend.created(WindowName::OpenUrlWith), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_runs_every_step() {
        let shell = shell();
        let a = shell.add_workspace("a");
        let app = App::new(shell.services.clone());
        app.start().await;
        assert!(shell.watcher.is_watching(&a));

        assert_eq!(app.shutdown().await, 0);
        assert_eq!(shell.supervisor.running(), 0);
        assert!(!shell.watcher.is_watching(&a));
        assert_eq!(
            shell.windows.get_window_meta(WindowName::Main).force_close,
            Some(true)
        );
    }
}
