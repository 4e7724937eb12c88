//! Collaborators the host talks to through narrow interfaces.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context as _;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::{
    config::Preferences,
    utils::{WatchRx, WatchTx},
};

/// Credential snapshot handed to the versioning service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_name: String,
    pub email: Option<String>,
    pub access_token: Option<String>,
}

pub trait Authentication: Send + Sync {
    fn get(&self, provider: &str) -> Option<UserInfo>;
}

pub const GIT_USER_VAR: &str = "WIKISHELL_GIT_USER";
pub const GIT_EMAIL_VAR: &str = "WIKISHELL_GIT_EMAIL";
pub const GIT_TOKEN_VAR: &str = "WIKISHELL_GIT_TOKEN";

/// Reads credentials from the environment. Only the `git` provider is known.
#[derive(Debug, Default)]
pub struct EnvAuthentication;
impl Authentication for EnvAuthentication {
    fn get(&self, provider: &str) -> Option<UserInfo> {
        if provider != "git" {
            return None;
        }
        Some(UserInfo {
            user_name: std::env::var(GIT_USER_VAR).ok()?,
            email: std::env::var(GIT_EMAIL_VAR).ok(),
            access_token: std::env::var(GIT_TOKEN_VAR).ok(),
        })
    }
}

pub trait ContentVersioning: Send + Sync {
    fn commit_and_sync<'a>(
        &'a self,
        content_root: &'a Path,
        remote_url: &'a str,
        user: &'a UserInfo,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    fn init_repository<'a>(
        &'a self,
        content_root: &'a Path,
        remote_url: &'a str,
        user: &'a UserInfo,
        is_primary: bool,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    fn get_remote_url<'a>(&'a self, content_root: &'a Path) -> BoxFuture<'a, anyhow::Result<String>>;
}

/// Drives the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCli {
    pub program: PathBuf,
}
impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: "git".into(),
        }
    }
}
impl GitCli {
    async fn git(&self, dir: &Path, args: &[&str]) -> anyhow::Result<String> {
        let output = tokio::process::Command::new(&self.program)
            .current_dir(dir)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))?;
        if !output.status.success() {
            anyhow::bail!(
                "git {} exited with {}. Stderr: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim(),
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    async fn configure_user(&self, dir: &Path, user: &UserInfo) -> anyhow::Result<()> {
        self.git(dir, &["config", "user.name", &user.user_name]).await?;
        if let Some(email) = &user.email {
            self.git(dir, &["config", "user.email", email]).await?;
        }
        Ok(())
    }
}
impl ContentVersioning for GitCli {
    fn commit_and_sync<'a>(
        &'a self,
        content_root: &'a Path,
        remote_url: &'a str,
        user: &'a UserInfo,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.configure_user(content_root, user).await?;
            self.git(content_root, &["add", "--all"]).await?;
            let status = self.git(content_root, &["status", "--porcelain"]).await?;
            if !status.is_empty() {
                let message = format!("Sync from {}", chrono::Local::now().to_rfc3339());
                self.git(content_root, &["commit", "-m", &message]).await?;
            }
            self.git(content_root, &["pull", "--rebase", remote_url]).await?;
            self.git(content_root, &["push", remote_url, "HEAD"]).await?;
            Ok(())
        })
    }

    fn init_repository<'a>(
        &'a self,
        content_root: &'a Path,
        remote_url: &'a str,
        user: &'a UserInfo,
        is_primary: bool,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.git(content_root, &["init"]).await?;
            self.configure_user(content_root, user).await?;
            self.git(content_root, &["remote", "add", "origin", remote_url])
                .await?;
            if is_primary {
                self.git(content_root, &["add", "--all"]).await?;
                self.git(content_root, &["commit", "--allow-empty", "-m", "Initial commit"])
                    .await?;
                self.git(content_root, &["push", "--set-upstream", "origin", "HEAD"])
                    .await?;
            }
            Ok(())
        })
    }

    fn get_remote_url<'a>(&'a self, content_root: &'a Path) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(self.git(content_root, &["remote", "get-url", "origin"]))
    }
}

pub trait PreferenceStore: Send + Sync {
    fn get_all(&self) -> Preferences;
    fn get(&self, key: &str) -> Option<serde_json::Value>;
    fn set(&self, key: &str, value: serde_json::Value) -> anyhow::Result<()>;
    fn subscribe(&self) -> WatchRx<Preferences>;
}

/// Preferences kept in memory and mirrored to a JSON file when a path is given.
#[derive(Debug)]
pub struct JsonPreferenceStore {
    path: Option<PathBuf>,
    tx: WatchTx<Preferences>,
}
impl JsonPreferenceStore {
    pub fn load(path: PathBuf) -> anyhow::Result<Self> {
        let prefs = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Malformed preferences in {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Preferences::default(),
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        Ok(Self {
            path: Some(path),
            tx: WatchTx::new(prefs),
        })
    }

    pub fn in_memory(prefs: Preferences) -> Self {
        Self {
            path: None,
            tx: WatchTx::new(prefs),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut Preferences)) -> anyhow::Result<()> {
        let mut prefs = self.get_all();
        f(&mut prefs);
        self.replace(prefs)
    }

    fn replace(&self, prefs: Preferences) -> anyhow::Result<()> {
        if let Some(path) = &self.path {
            crate::workspaces::write_json_atomic(path, &prefs)?;
        }
        self.tx.send_if_modified(|cur| {
            if *cur == prefs {
                false
            } else {
                *cur = prefs;
                true
            }
        });
        Ok(())
    }
}
impl PreferenceStore for JsonPreferenceStore {
    fn get_all(&self) -> Preferences {
        self.tx.borrow().clone()
    }

    fn get(&self, key: &str) -> Option<serde_json::Value> {
        let value = serde_json::to_value(&*self.tx.borrow()).ok()?;
        value.get(key).cloned()
    }

    fn set(&self, key: &str, value: serde_json::Value) -> anyhow::Result<()> {
        let mut object = serde_json::to_value(self.get_all())?;
        let fields = object
            .as_object_mut()
            .context("Preferences did not serialize to an object")?;
        if !fields.contains_key(key) {
            anyhow::bail!("Unknown preference {key:?}");
        }
        fields.insert(key.to_owned(), value);
        let prefs = serde_json::from_value(object)
            .with_context(|| format!("Invalid value for preference {key:?}"))?;
        self.replace(prefs)
    }

    fn subscribe(&self) -> WatchRx<Preferences> {
        self.tx.subscribe()
    }
}

pub trait Localization: Send + Sync {
    /// Releases whatever the localization backend registered with the host.
    fn clear_bindings(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct NoLocalization;
impl Localization for NoLocalization {
    fn clear_bindings(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoveChoice {
    Remove,
    RemoveAndDelete,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Info,
    Warning,
    Error,
}

pub trait Dialog: Send + Sync {
    fn confirm_remove_workspace<'a>(&'a self, workspace_name: &'a str) -> BoxFuture<'a, RemoveChoice>;
    fn confirm_restart(&self) -> BoxFuture<'_, bool>;
    fn show_message<'a>(&'a self, kind: MessageKind, message: &'a str) -> BoxFuture<'a, ()>;
}

pub type SharedPreferences = Arc<dyn PreferenceStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_validates_key_and_type() {
        let store = JsonPreferenceStore::in_memory(Preferences::default());
        store
            .set("pauseNotificationsMuteAudio", serde_json::Value::Bool(true))
            .unwrap();
        assert!(store.get_all().pause_notifications_mute_audio);
        assert_eq!(
            store.get("pauseNotificationsMuteAudio"),
            Some(serde_json::Value::Bool(true))
        );

        assert!(store.set("noSuchKey", serde_json::Value::Null).is_err());
        assert!(store
            .set("sidebar", serde_json::Value::String("yes".into()))
            .is_err());
    }

    #[test]
    fn file_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preferences.json");

        let store = JsonPreferenceStore::load(path.clone()).unwrap();
        store.update(|prefs| prefs.attach_to_menubar = true).unwrap();

        let reloaded = JsonPreferenceStore::load(path).unwrap();
        assert!(reloaded.get_all().attach_to_menubar);
    }

    #[tokio::test]
    async fn subscribers_see_changes() {
        let store = JsonPreferenceStore::in_memory(Preferences::default());
        let mut rx = store.subscribe();
        store.update(|prefs| prefs.sidebar = false).unwrap();
        rx.changed().await.unwrap();
        assert!(!rx.borrow().sidebar);
    }
}
