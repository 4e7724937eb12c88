//! Paths, timing constants and the typed preference snapshot.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

pub const DATA_DIR_VAR: &str = "WIKISHELL_DATA_DIR";
pub const LOG_DIR_VAR: &str = "WIKISHELL_LOG_DIR";
pub const RUNTIME_DIR_VAR: &str = "WIKISHELL_RUNTIME_DIR";
pub const READY_TIMEOUT_VAR: &str = "WIKISHELL_READY_TIMEOUT_SECS";

const APP_DIR_NAME: &str = "wikishell";

/// Interval between two readiness probes of a content server.
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);
/// Menu rebuild requests arriving within this window are coalesced.
pub const MENU_DEBOUNCE: Duration = Duration::from_millis(50);
/// Re-layout delays after maximize/unmaximize, for platforms that report the new content
/// size late.
pub const DEFERRED_LAYOUT_DELAYS: [Duration; 2] =
    [Duration::from_millis(200), Duration::from_millis(1000)];
/// How long a child process gets to exit on its own before it is killed.
pub const CHILD_EXIT_GRACE: Duration = Duration::from_secs(5);
/// Per-request limit for the host talking to a content server.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(2);
/// How long the removal confirmation dialog may stay open.
pub const CONFIRM_TIMEOUT: Duration = Duration::from_secs(300);
pub const FIRST_CONTENT_PORT: u16 = 5212;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub runtime_dir: PathBuf,
    pub ready_timeout: Duration,
    /// Whether maximize/unmaximize needs the staggered re-layout.
    pub deferred_layout: bool,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let data_dir = match std::env::var_os(DATA_DIR_VAR) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_dir()
                .context("Could not determine the data directory")?
                .join(APP_DIR_NAME),
        };
        let log_dir = match std::env::var_os(LOG_DIR_VAR) {
            Some(dir) if dir.is_empty() => None,
            Some(dir) => Some(PathBuf::from(dir)),
            None => Some(data_dir.join("logs")),
        };
        let runtime_dir = match std::env::var_os(RUNTIME_DIR_VAR) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::runtime_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(APP_DIR_NAME),
        };
        let ready_timeout = match std::env::var(READY_TIMEOUT_VAR) {
            Ok(secs) => Duration::from_secs(
                secs.parse()
                    .with_context(|| format!("{READY_TIMEOUT_VAR} is not a number: {secs:?}"))?,
            ),
            Err(_) => DEFAULT_READY_TIMEOUT,
        };

        Ok(Self {
            data_dir,
            log_dir,
            runtime_dir,
            ready_timeout,
            deferred_layout: cfg!(target_os = "linux"),
        })
    }

    pub fn with_data_dir(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_owned(),
            log_dir: None,
            runtime_dir: data_dir.join("run"),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            deferred_layout: false,
        }
    }

    pub fn workspaces_file(&self) -> PathBuf {
        self.data_dir.join("workspaces.json")
    }
    pub fn preferences_file(&self) -> PathBuf {
        self.data_dir.join("preferences.json")
    }
    pub fn default_content_dir(&self) -> PathBuf {
        self.data_dir.join("wikis")
    }
    pub fn instance_socket(&self) -> PathBuf {
        self.runtime_dir.join("instance.sock")
    }
    pub fn ipc_socket(&self) -> PathBuf {
        self.runtime_dir.join("ipc.sock")
    }

    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        for dir in [&self.data_dir, &self.runtime_dir]
            .into_iter()
            .chain(self.log_dir.as_ref())
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Main window geometry, saved when the window closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowGeometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Preferences {
    pub hibernate_unused_workspaces_at_launch: bool,
    /// Manual override: `pause:<RFC 3339>` or `resume:<RFC 3339>`.
    pub pause_notifications: Option<String>,
    pub pause_notifications_by_schedule: bool,
    /// Time of day, `HH:MM`.
    pub pause_notifications_by_schedule_from: String,
    pub pause_notifications_by_schedule_to: String,
    pub pause_notifications_mute_audio: bool,
    pub sidebar: bool,
    pub navigation_bar: bool,
    pub title_bar: bool,
    pub attach_to_menubar: bool,
    pub swipe_to_navigate: bool,
    pub main_window_state: Option<WindowGeometry>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            hibernate_unused_workspaces_at_launch: false,
            pause_notifications: None,
            pause_notifications_by_schedule: false,
            pause_notifications_by_schedule_from: "18:00".into(),
            pause_notifications_by_schedule_to: "08:00".into(),
            pause_notifications_mute_audio: false,
            sidebar: true,
            navigation_bar: false,
            title_bar: cfg!(target_os = "macos"),
            attach_to_menubar: false,
            swipe_to_navigate: true,
            main_window_state: None,
        }
    }
}
