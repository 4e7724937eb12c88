//! Persisted workspace records.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::{
    services::external::UserInfo,
    utils::{WatchRx, WatchTx, lock_mutex},
};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct WorkspaceId(Arc<str>);
impl WorkspaceId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string().into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl std::fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
impl From<&str> for WorkspaceId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}
impl From<String> for WorkspaceId {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: WorkspaceId,
    /// Also the content root on disk.
    pub name: String,
    pub order: u32,
    pub is_sub_wiki: bool,
    /// Name of the main workspace, set iff `is_sub_wiki`.
    pub main_wiki_to_link: Option<String>,
    pub tag_name: Option<String>,
    pub port: u16,
    pub home_url: String,
    pub git_url: Option<String>,
    pub active: bool,
    pub hibernated: bool,
    pub hibernate_when_unused: bool,
    pub user_info: Option<UserInfo>,
    pub picture_path: Option<PathBuf>,
}
impl Workspace {
    pub fn content_root(&self) -> &Path {
        Path::new(&self.name)
    }
    pub fn display_name(&self) -> &str {
        self.content_root()
            .file_name()
            .and_then(|it| it.to_str())
            .unwrap_or(&self.name)
    }
}

/// Runtime-only state that sits next to a record but is never persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceMetadata {
    pub is_loading: bool,
    pub did_fail_load_error_message: Option<String>,
}

/// Input for [`WorkspaceRegistry::create`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewWorkspace {
    pub name: String,
    pub is_sub_wiki: bool,
    pub main_wiki_to_link: Option<String>,
    pub tag_name: Option<String>,
    /// Picked automatically when absent.
    pub port: Option<u16>,
    pub git_url: Option<String>,
    pub hibernate_when_unused: bool,
    pub user_info: Option<UserInfo>,
    pub picture_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspacePatch {
    pub name: Option<String>,
    pub order: Option<u32>,
    pub port: Option<u16>,
    pub home_url: Option<String>,
    pub git_url: Option<Option<String>>,
    pub hibernated: Option<bool>,
    pub hibernate_when_unused: Option<bool>,
    pub user_info: Option<Option<UserInfo>>,
    pub picture_path: Option<Option<PathBuf>>,
    pub tag_name: Option<Option<String>>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum WorkspaceError {
    #[error("No workspace with id {0}")]
    NotFound(WorkspaceId),
    #[error("No workspace named {0:?}")]
    NameNotFound(String),
    #[error("Sub-workspace {sub:?} must link to an existing main workspace, but {main:?} is not one")]
    InvalidMainLink { sub: String, main: String },
    #[error("Workspace {main:?} still has sub-workspaces {subs:?}; detach or remove them first")]
    HasSubWorkspaces { main: String, subs: Vec<String> },
    #[error("Port {0} is already used by another workspace")]
    PortInUse(u16),
    #[error("A workspace named {0:?} already exists")]
    DuplicateName(String),
    #[error("Failed to persist workspaces: {0}")]
    Persist(String),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Stored {
    workspaces: Vec<Workspace>,
}

#[derive(Debug, Default, Clone)]
struct State {
    workspaces: HashMap<WorkspaceId, Workspace>,
    metadata: HashMap<WorkspaceId, WorkspaceMetadata>,
}
impl State {
    fn sorted(&self) -> Vec<Workspace> {
        let mut list: Vec<_> = self.workspaces.values().cloned().collect();
        list.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        list
    }
    fn by_name(&self, name: &str) -> Option<&Workspace> {
        self.workspaces.values().find(|it| it.name == name)
    }
    fn check_main_link(&self, sub: &str, main: Option<&str>) -> Result<(), WorkspaceError> {
        let invalid = || WorkspaceError::InvalidMainLink {
            sub: sub.to_owned(),
            main: main.unwrap_or_default().to_owned(),
        };
        match main.and_then(|main| self.by_name(main)) {
            Some(main) if !main.is_sub_wiki => Ok(()),
            _ => Err(invalid()),
        }
    }
}

/// Owns every workspace record. All mutation goes through these methods; each successful
/// mutation is written to disk and published to subscribers.
pub struct WorkspaceRegistry {
    path: Option<PathBuf>,
    state: Mutex<State>,
    changes: WatchTx<Arc<[Workspace]>>,
    first_port: u16,
}

impl WorkspaceRegistry {
    pub fn load(path: PathBuf, first_port: u16) -> anyhow::Result<Self> {
        let stored: Stored = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Malformed workspace file {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Stored::default(),
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        let registry = Self::from_records(Some(path), stored.workspaces, first_port);
        log::info!("Loaded {} workspaces", registry.count());
        Ok(registry)
    }

    pub fn in_memory(first_port: u16) -> Self {
        Self::from_records(None, Vec::new(), first_port)
    }

    fn from_records(path: Option<PathBuf>, records: Vec<Workspace>, first_port: u16) -> Self {
        let state = State {
            workspaces: records
                .into_iter()
                .map(|ws| (ws.id.clone(), ws))
                .collect(),
            metadata: HashMap::new(),
        };
        let changes = WatchTx::new(state.sorted().into());
        Self {
            path,
            state: Mutex::new(state),
            changes,
            first_port,
        }
    }

    pub fn subscribe(&self) -> WatchRx<Arc<[Workspace]>> {
        self.changes.subscribe()
    }

    pub fn get(&self, id: &WorkspaceId) -> Option<Workspace> {
        lock_mutex(&self.state).workspaces.get(id).cloned()
    }
    pub fn require(&self, id: &WorkspaceId) -> Result<Workspace, WorkspaceError> {
        self.get(id).ok_or_else(|| WorkspaceError::NotFound(id.clone()))
    }
    pub fn get_by_name(&self, name: &str) -> Option<Workspace> {
        lock_mutex(&self.state).by_name(name).cloned()
    }
    /// Sorted by display order.
    pub fn list(&self) -> Vec<Workspace> {
        lock_mutex(&self.state).sorted()
    }
    pub fn count(&self) -> usize {
        lock_mutex(&self.state).workspaces.len()
    }
    pub fn first(&self) -> Option<Workspace> {
        self.list().into_iter().next()
    }
    pub fn get_active(&self) -> Option<Workspace> {
        lock_mutex(&self.state)
            .workspaces
            .values()
            .find(|it| it.active)
            .cloned()
    }
    pub fn sub_workspaces_of(&self, main_name: &str) -> Vec<Workspace> {
        self.list()
            .into_iter()
            .filter(|it| it.is_sub_wiki && it.main_wiki_to_link.as_deref() == Some(main_name))
            .collect()
    }

    /// Lowest port at or above the configured first port that no workspace uses.
    pub fn next_port(&self) -> u16 {
        let state = lock_mutex(&self.state);
        (self.first_port..=u16::MAX)
            .find(|port| state.workspaces.values().all(|ws| ws.port != *port))
            .unwrap_or(self.first_port)
    }

    pub fn create(&self, new: NewWorkspace) -> Result<Workspace, WorkspaceError> {
        let port = new.port.unwrap_or_else(|| self.next_port());
        self.mutate(|state| {
            if state.by_name(&new.name).is_some() {
                return Err(WorkspaceError::DuplicateName(new.name.clone()));
            }
            if new.is_sub_wiki {
                state.check_main_link(&new.name, new.main_wiki_to_link.as_deref())?;
            }
            if state.workspaces.values().any(|ws| ws.port == port) {
                return Err(WorkspaceError::PortInUse(port));
            }
            let order = state
                .workspaces
                .values()
                .map(|ws| ws.order + 1)
                .max()
                .unwrap_or(0);
            let workspace = Workspace {
                id: WorkspaceId::generate(),
                order,
                is_sub_wiki: new.is_sub_wiki,
                main_wiki_to_link: new.main_wiki_to_link.filter(|_| new.is_sub_wiki),
                tag_name: new.tag_name,
                port,
                home_url: format!("http://127.0.0.1:{port}/"),
                git_url: new.git_url,
                active: false,
                hibernated: false,
                hibernate_when_unused: new.hibernate_when_unused,
                user_info: new.user_info,
                picture_path: new.picture_path,
                name: new.name,
            };
            state
                .workspaces
                .insert(workspace.id.clone(), workspace.clone());
            Ok(workspace)
        })
    }

    /// Renaming a main workspace carries its sub-workspaces' links along. Moving to an
    /// order another workspace holds swaps the two.
    pub fn update(&self, id: &WorkspaceId, patch: WorkspacePatch) -> Result<Workspace, WorkspaceError> {
        self.mutate(|state| {
            let current = state
                .workspaces
                .get(id)
                .cloned()
                .ok_or_else(|| WorkspaceError::NotFound(id.clone()))?;
            if let Some(port) = patch.port
                && state
                    .workspaces
                    .values()
                    .any(|ws| ws.port == port && &ws.id != id)
            {
                return Err(WorkspaceError::PortInUse(port));
            }
            if let Some(name) = &patch.name
                && state.by_name(name).is_some_and(|ws| &ws.id != id)
            {
                return Err(WorkspaceError::DuplicateName(name.clone()));
            }

            for other in state.workspaces.values_mut() {
                if &other.id == id {
                    continue;
                }
                if let Some(name) = &patch.name
                    && !current.is_sub_wiki
                    && other.main_wiki_to_link.as_deref() == Some(&current.name)
                {
                    other.main_wiki_to_link = Some(name.clone());
                }
                if patch.order == Some(other.order) {
                    other.order = current.order;
                }
            }

            let ws = state
                .workspaces
                .get_mut(id)
                .ok_or_else(|| WorkspaceError::NotFound(id.clone()))?;
            let WorkspacePatch {
                name,
                order,
                port,
                home_url,
                git_url,
                hibernated,
                hibernate_when_unused,
                user_info,
                picture_path,
                tag_name,
            } = patch;
            if let Some(name) = name {
                ws.name = name;
            }
            if let Some(order) = order {
                ws.order = order;
            }
            if let Some(port) = port {
                ws.port = port;
            }
            if let Some(home_url) = home_url {
                ws.home_url = home_url;
            }
            if let Some(git_url) = git_url {
                ws.git_url = git_url;
            }
            if let Some(hibernated) = hibernated {
                ws.hibernated = hibernated;
            }
            if let Some(flag) = hibernate_when_unused {
                ws.hibernate_when_unused = flag;
            }
            if let Some(user_info) = user_info {
                ws.user_info = user_info;
            }
            if let Some(picture_path) = picture_path {
                ws.picture_path = picture_path;
            }
            if let Some(tag_name) = tag_name {
                ws.tag_name = tag_name;
            }
            Ok(ws.clone())
        })
    }

    /// Makes `id` the only active workspace. Returns the previously active one, if it changed.
    pub fn set_active(&self, id: &WorkspaceId) -> Result<Option<Workspace>, WorkspaceError> {
        self.mutate(|state| {
            if !state.workspaces.contains_key(id) {
                return Err(WorkspaceError::NotFound(id.clone()));
            }
            let mut previous = None;
            for ws in state.workspaces.values_mut() {
                let active = &ws.id == id;
                if ws.active && !active {
                    previous = Some(ws.clone());
                }
                ws.active = active;
            }
            Ok(previous)
        })
    }

    pub fn clear_active(&self) -> Result<(), WorkspaceError> {
        self.mutate(|state| {
            for ws in state.workspaces.values_mut() {
                ws.active = false;
            }
            Ok(())
        })
    }

    /// Fails for a main workspace that still has sub-workspaces linked to it.
    pub fn remove(&self, id: &WorkspaceId) -> Result<Workspace, WorkspaceError> {
        self.mutate(|state| {
            let ws = state
                .workspaces
                .get(id)
                .ok_or_else(|| WorkspaceError::NotFound(id.clone()))?;
            if !ws.is_sub_wiki {
                let subs: Vec<_> = state
                    .workspaces
                    .values()
                    .filter(|it| it.is_sub_wiki && it.main_wiki_to_link.as_deref() == Some(&ws.name))
                    .map(|it| it.name.clone())
                    .collect();
                if !subs.is_empty() {
                    return Err(WorkspaceError::HasSubWorkspaces {
                        main: ws.name.clone(),
                        subs,
                    });
                }
            }
            state.metadata.remove(id);
            state
                .workspaces
                .remove(id)
                .ok_or_else(|| WorkspaceError::NotFound(id.clone()))
        })
    }

    pub fn metadata(&self, id: &WorkspaceId) -> WorkspaceMetadata {
        lock_mutex(&self.state)
            .metadata
            .get(id)
            .cloned()
            .unwrap_or_default()
    }
    pub fn update_metadata(&self, id: &WorkspaceId, f: impl FnOnce(&mut WorkspaceMetadata)) {
        let mut state = lock_mutex(&self.state);
        if state.workspaces.contains_key(id) {
            f(state.metadata.entry(id.clone()).or_default());
        }
    }

    /// Applies `f` to a copy, persists it and only then makes it current. The lock is held
    /// throughout so writes and published snapshots keep mutation order.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut State) -> Result<T, WorkspaceError>,
    ) -> Result<T, WorkspaceError> {
        let mut state = lock_mutex(&self.state);
        let mut next = state.clone();
        let out = f(&mut next)?;
        let snapshot = next.sorted();
        if let Some(path) = &self.path {
            write_json_atomic(
                path,
                &Stored {
                    workspaces: snapshot.clone(),
                },
            )
            .map_err(|err| WorkspaceError::Persist(format!("{err:#}")))?;
        }
        *state = next;
        self.changes.send_replace(snapshot.into());
        Ok(out)
    }
}

/// Writes `value` next to `path` and renames it into place.
pub fn write_json_atomic(path: &Path, value: &impl Serialize) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let mut file = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create a temporary file in {}", dir.display()))?;
    serde_json::to_writer_pretty(&mut file, value)?;
    file.persist(path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn main_ws(name: &str) -> NewWorkspace {
        NewWorkspace {
            name: name.into(),
            ..Default::default()
        }
    }
    fn sub_ws(name: &str, main: &str) -> NewWorkspace {
        NewWorkspace {
            name: name.into(),
            is_sub_wiki: true,
            main_wiki_to_link: Some(main.into()),
            ..Default::default()
        }
    }

    #[test]
    fn create_assigns_order_and_free_ports() {
        let registry = WorkspaceRegistry::in_memory(5212);
        let a = registry.create(main_ws("/w/a")).unwrap();
        let b = registry.create(main_ws("/w/b")).unwrap();
        assert_eq!((a.order, b.order), (0, 1));
        assert_eq!((a.port, b.port), (5212, 5213));
        assert_eq!(a.home_url, "http://127.0.0.1:5212/");
        assert_eq!(
            registry.create(NewWorkspace {
                port: Some(5212),
                ..main_ws("/w/c")
            }),
            Err(WorkspaceError::PortInUse(5212))
        );
    }

    #[test]
    fn sub_workspace_needs_existing_main() {
        let registry = WorkspaceRegistry::in_memory(5212);
        assert!(matches!(
            registry.create(sub_ws("/w/sub", "/w/main")),
            Err(WorkspaceError::InvalidMainLink { .. })
        ));
        registry.create(main_ws("/w/main")).unwrap();
        registry.create(sub_ws("/w/sub", "/w/main")).unwrap();
        // A sub-workspace cannot itself be a main workspace.
        assert!(matches!(
            registry.create(sub_ws("/w/sub2", "/w/sub")),
            Err(WorkspaceError::InvalidMainLink { .. })
        ));
    }

    #[test]
    fn main_with_subs_cannot_be_removed() {
        let registry = WorkspaceRegistry::in_memory(5212);
        let main = registry.create(main_ws("/w/main")).unwrap();
        let sub = registry.create(sub_ws("/w/sub", "/w/main")).unwrap();

        assert!(matches!(
            registry.remove(&main.id),
            Err(WorkspaceError::HasSubWorkspaces { .. })
        ));
        registry.remove(&sub.id).unwrap();
        registry.remove(&main.id).unwrap();
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn at_most_one_active() {
        let registry = WorkspaceRegistry::in_memory(5212);
        let a = registry.create(main_ws("/w/a")).unwrap();
        let b = registry.create(main_ws("/w/b")).unwrap();

        assert_eq!(registry.set_active(&a.id).unwrap(), None);
        let previous = registry.set_active(&b.id).unwrap();
        assert_eq!(previous.map(|it| it.id), Some(a.id.clone()));

        let active: Vec<_> = registry.list().into_iter().filter(|it| it.active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, b.id);
        assert!(registry.set_active(&"missing".into()).is_err());
    }

    #[test]
    fn records_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workspaces.json");
        let id = {
            let registry = WorkspaceRegistry::load(path.clone(), 5212).unwrap();
            let ws = registry.create(main_ws("/w/a")).unwrap();
            registry
                .update(
                    &ws.id,
                    WorkspacePatch {
                        hibernate_when_unused: Some(true),
                        ..Default::default()
                    },
                )
                .unwrap();
            registry.update_metadata(&ws.id, |meta| meta.is_loading = true);
            ws.id
        };

        let registry = WorkspaceRegistry::load(path, 5212).unwrap();
        let ws = registry.get(&id).unwrap();
        assert!(ws.hibernate_when_unused);
        // Metadata is runtime-only.
        assert!(!registry.metadata(&id).is_loading);
    }

    #[test]
    fn rename_keeps_names_unique_and_links_intact() {
        let registry = WorkspaceRegistry::in_memory(5212);
        let main = registry.create(main_ws("/w/main")).unwrap();
        registry.create(main_ws("/w/other")).unwrap();
        let sub = registry.create(sub_ws("/w/sub", "/w/main")).unwrap();

        let rename = |name: &str| WorkspacePatch {
            name: Some(name.into()),
            ..Default::default()
        };
        assert_eq!(
            registry.update(&main.id, rename("/w/other")),
            Err(WorkspaceError::DuplicateName("/w/other".into()))
        );
        assert_eq!(registry.get(&main.id).unwrap().name, "/w/main");
        // Renaming to its own name is a no-op, not a duplicate.
        registry.update(&main.id, rename("/w/main")).unwrap();

        registry.update(&main.id, rename("/w/renamed")).unwrap();
        assert_eq!(
            registry.get(&sub.id).unwrap().main_wiki_to_link.as_deref(),
            Some("/w/renamed")
        );
        assert_eq!(registry.sub_workspaces_of("/w/renamed").len(), 1);
        assert!(matches!(
            registry.remove(&main.id),
            Err(WorkspaceError::HasSubWorkspaces { .. })
        ));
    }

    #[test]
    fn moving_onto_a_taken_order_swaps() {
        let registry = WorkspaceRegistry::in_memory(5212);
        let a = registry.create(main_ws("/w/a")).unwrap();
        let b = registry.create(main_ws("/w/b")).unwrap();
        let c = registry.create(main_ws("/w/c")).unwrap();

        registry
            .update(
                &c.id,
                WorkspacePatch {
                    order: Some(0),
                    ..Default::default()
                },
            )
            .unwrap();
        let order: Vec<_> = registry.list().into_iter().map(|it| (it.id, it.order)).collect();
        assert_eq!(order, vec![(c.id, 0), (b.id, 1), (a.id, 2)]);
    }

    #[test]
    fn failed_persist_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workspaces.json");
        let registry = WorkspaceRegistry::load(path.clone(), 5212).unwrap();
        let ws = registry.create(main_ws("/w/a")).unwrap();
        let changes = registry.subscribe();

        // A directory in place of the file makes the rename fail.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), "").unwrap();

        let result = registry.update(
            &ws.id,
            WorkspacePatch {
                hibernated: Some(true),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(WorkspaceError::Persist(_))));
        assert!(!registry.get(&ws.id).unwrap().hibernated);
        assert!(!changes.has_changed().unwrap());
        assert!(matches!(
            registry.remove(&ws.id),
            Err(WorkspaceError::Persist(_))
        ));
        assert_eq!(registry.count(), 1);
    }
}
