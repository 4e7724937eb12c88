//! Application menu assembled from fragments contributed by other services.

use std::{
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicUsize, Ordering},
    },
};

use anyhow::Context as _;
use tokio_util::task::AbortOnDropHandle;

use crate::{
    config::MENU_DEBOUNCE,
    utils::{Callback, ReloadRx, ReloadTx, ResultExt as _, lock_mutex},
    window::{WindowManager, WindowName},
};

pub const APP_MENU_ID: &str = "WikiShell";
pub const WORKSPACES_MENU_ID: &str = "Workspaces";

const ISSUES_URL: &str = "https://github.com/wikishell/wikishell/issues";
const REPO_URL: &str = "https://github.com/wikishell/wikishell";

/// A field that is either fixed or evaluated each time the menu is built.
#[derive(Clone, Debug)]
pub enum MenuField<T> {
    Literal(T),
    Computed(Callback<(), T>),
}
impl<T: Clone> MenuField<T> {
    pub fn resolve(&self) -> T {
        match self {
            Self::Literal(value) => value.clone(),
            Self::Computed(f) => f.call(()),
        }
    }
    fn literal(&self) -> Option<&T> {
        match self {
            Self::Literal(value) => Some(value),
            Self::Computed(_) => None,
        }
    }
}
impl From<&str> for MenuField<String> {
    fn from(value: &str) -> Self {
        Self::Literal(value.into())
    }
}
impl From<String> for MenuField<String> {
    fn from(value: String) -> Self {
        Self::Literal(value)
    }
}
impl From<bool> for MenuField<bool> {
    fn from(value: bool) -> Self {
        Self::Literal(value)
    }
}

#[derive(Clone, Debug)]
pub enum Submenu {
    Literal(Vec<MenuItem>),
    Computed(Callback<(), Vec<MenuItem>>),
}

#[derive(Clone, Debug, Default)]
pub struct MenuItem {
    pub id: Option<String>,
    pub role: Option<String>,
    pub label: Option<MenuField<String>>,
    pub enabled: Option<MenuField<bool>>,
    pub checked: Option<MenuField<bool>>,
    pub accelerator: Option<String>,
    pub separator: bool,
    pub click: Option<Callback<(), ()>>,
    pub submenu: Option<Submenu>,
}

impl MenuItem {
    pub fn separator() -> Self {
        Self {
            separator: true,
            ..Default::default()
        }
    }
    pub fn role(role: &str) -> Self {
        Self {
            role: Some(role.into()),
            ..Default::default()
        }
    }
    pub fn labeled(label: impl Into<MenuField<String>>) -> Self {
        Self {
            label: Some(label.into()),
            ..Default::default()
        }
    }
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.into());
        self
    }
    pub fn with_click(mut self, click: Callback<(), ()>) -> Self {
        self.click = Some(click);
        self
    }
    pub fn with_enabled(mut self, enabled: impl Into<MenuField<bool>>) -> Self {
        self.enabled = Some(enabled.into());
        self
    }
    pub fn with_checked(mut self, checked: impl Into<MenuField<bool>>) -> Self {
        self.checked = Some(checked.into());
        self
    }
    pub fn with_accelerator(mut self, accelerator: &str) -> Self {
        self.accelerator = Some(accelerator.into());
        self
    }
    pub fn with_submenu(mut self, submenu: Submenu) -> Self {
        self.submenu = Some(submenu);
        self
    }

    fn top_level(id: &str, submenu: Vec<MenuItem>) -> Self {
        Self::labeled(id)
            .with_id(id)
            .with_submenu(Submenu::Literal(submenu))
    }

    /// Same entry: equal id, else equal role, else equal literal label.
    fn same_entry(&self, other: &MenuItem) -> bool {
        if self.separator || other.separator {
            return false;
        }
        if let (Some(a), Some(b)) = (&self.id, &other.id) {
            return a == b;
        }
        if let (Some(a), Some(b)) = (&self.role, &other.role) {
            return a == b;
        }
        match (
            self.label.as_ref().and_then(MenuField::literal),
            other.label.as_ref().and_then(MenuField::literal),
        ) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    fn is_anchor(&self, anchor: &str) -> bool {
        self.id.as_deref() == Some(anchor) || self.role.as_deref() == Some(anchor)
    }

    fn resolve(&self) -> ResolvedMenuItem {
        ResolvedMenuItem {
            id: self.id.clone(),
            role: self.role.clone(),
            label: self.label.as_ref().map(MenuField::resolve),
            enabled: self.enabled.as_ref().is_none_or(MenuField::resolve),
            checked: self.checked.as_ref().map(MenuField::resolve),
            accelerator: self.accelerator.clone(),
            separator: self.separator,
            click: self.click.clone(),
            submenu: match &self.submenu {
                None => None,
                Some(Submenu::Literal(items)) => Some(resolve_all(items)),
                Some(Submenu::Computed(f)) => Some(resolve_all(&f.call(()))),
            },
        }
    }
}

fn resolve_all(items: &[MenuItem]) -> Vec<ResolvedMenuItem> {
    items.iter().map(MenuItem::resolve).collect()
}

/// A menu item with every computed field evaluated, ready for the native menu.
#[derive(Clone, Debug)]
pub struct ResolvedMenuItem {
    pub id: Option<String>,
    pub role: Option<String>,
    pub label: Option<String>,
    pub enabled: bool,
    pub checked: Option<bool>,
    pub accelerator: Option<String>,
    pub separator: bool,
    pub click: Option<Callback<(), ()>>,
    pub submenu: Option<Vec<ResolvedMenuItem>>,
}

pub trait NativeMenu: Send + Sync {
    fn set_application_menu(&self, menu: Vec<ResolvedMenuItem>) -> anyhow::Result<()>;
    fn popup(&self, menu: Vec<ResolvedMenuItem>, window: WindowName) -> anyhow::Result<()>;
    fn open_external(&self, url: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InsertPosition {
    #[default]
    End,
    Start,
    /// After the entry whose `id` or `role` matches.
    After(String),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum MenuError {
    #[error(
        "Cannot insert after {anchor:?} in menu {menu_id:?}: no entry has that id or role"
    )]
    AnchorNotFound { menu_id: String, anchor: String },
    #[error("Menu {0:?} has a computed submenu and cannot be extended")]
    ComputedSubmenu(String),
}

pub fn default_template(native: &Arc<dyn NativeMenu>) -> Vec<MenuItem> {
    let link = |label: &str, url: &'static str| {
        MenuItem::labeled(label).with_click(Callback::from_fn_ctx(native.clone(), move |native, ()| {
            native
                .open_external(url)
                .with_context(|| format!("Failed to open {url}"))
                .ok_or_log();
        }))
    };
    let roles = |roles: &[&str]| {
        roles
            .iter()
            .map(|role| match *role {
                "-" => MenuItem::separator(),
                role => MenuItem::role(role),
            })
            .collect::<Vec<_>>()
    };

    vec![
        MenuItem::labeled(APP_MENU_ID).with_id(APP_MENU_ID),
        MenuItem::top_level(
            "Edit",
            roles(&[
                "undo",
                "redo",
                "-",
                "cut",
                "copy",
                "paste",
                "pasteAndMatchStyle",
                "delete",
                "selectAll",
                "-",
            ]),
        ),
        MenuItem::labeled("View").with_id("View"),
        MenuItem::labeled("Language").with_id("Language"),
        MenuItem::labeled("History").with_id("History"),
        MenuItem::top_level(WORKSPACES_MENU_ID, Vec::new()),
        MenuItem {
            role: Some("window".into()),
            ..MenuItem::top_level("window", roles(&["minimize", "close", "-", "front", "-"]))
        },
        MenuItem {
            role: Some("help".into()),
            ..MenuItem::top_level(
                "help",
                vec![
                    link("WikiShell Support", ISSUES_URL),
                    link("Report a Bug via GitHub...", ISSUES_URL),
                    link(
                        "Request a New Feature via GitHub...",
                        "https://github.com/wikishell/wikishell/issues/new?template=feature.md",
                    ),
                    link("Learn More...", REPO_URL),
                ],
            )
        },
    ]
}

pub struct MenuBuilder {
    template: Mutex<Vec<MenuItem>>,
    native: Arc<dyn NativeMenu>,
    windows: Arc<WindowManager>,
    rebuild: ReloadTx,
    builds: AtomicUsize,
    _rebuilder: AbortOnDropHandle<()>,
}

impl MenuBuilder {
    /// Starts with the default template. Must be called inside the runtime.
    pub fn new(native: Arc<dyn NativeMenu>, windows: Arc<WindowManager>) -> Arc<Self> {
        let rebuild = ReloadTx::new();
        let rx = rebuild.subscribe();
        Arc::new_cyclic(|this| Self {
            template: Mutex::new(default_template(&native)),
            native,
            windows,
            rebuild,
            builds: AtomicUsize::new(0),
            _rebuilder: AbortOnDropHandle::new(tokio::spawn(run_rebuilder(this.clone(), rx))),
        })
    }

    /// Inserts `items` into the submenu of the top-level entry `menu_id`, creating that entry
    /// if needed. Items matching an existing entry replace it in place instead of being
    /// added again. Schedules a rebuild.
    pub fn insert_menu(
        &self,
        menu_id: &str,
        items: Vec<MenuItem>,
        position: InsertPosition,
        with_separator: bool,
    ) -> Result<(), MenuError> {
        let items = dedup_batch(items);
        {
            let mut template = lock_mutex(&self.template);
            match template
                .iter_mut()
                .find(|menu| menu.id.as_deref() == Some(menu_id))
            {
                None => template.push(MenuItem::top_level(menu_id, items)),
                Some(menu) => match &mut menu.submenu {
                    None => menu.submenu = Some(Submenu::Literal(items)),
                    Some(Submenu::Computed(_)) => {
                        return Err(MenuError::ComputedSubmenu(menu_id.into()));
                    }
                    Some(Submenu::Literal(submenu)) => {
                        insert_items(menu_id, submenu, items, position, with_separator)?;
                    }
                },
            }
        }
        self.build_menu();
        Ok(())
    }

    /// Requests a rebuild. Requests within the debounce window are coalesced.
    pub fn build_menu(&self) {
        self.rebuild.request();
    }

    /// Evaluates every computed field against current state and installs the result.
    pub fn build_menu_now(&self) -> anyhow::Result<()> {
        let resolved = self.resolved();
        self.native
            .set_application_menu(resolved)
            .context("Failed to install the application menu")?;
        self.builds.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn resolved(&self) -> Vec<ResolvedMenuItem> {
        // Resolved outside the lock, computed fields may call back into us.
        let template = lock_mutex(&self.template).clone();
        resolve_all(&template)
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }

    /// Pops up `template` in `window`. Returns `false` if the window is not open.
    pub fn build_context_menu_and_popup(
        &self,
        template: &[MenuItem],
        window: WindowName,
    ) -> anyhow::Result<bool> {
        if self.windows.get(window).is_none() {
            return Ok(false);
        }
        self.native.popup(resolve_all(template), window)?;
        Ok(true)
    }
}

/// Within one batch the last of several matching entries wins, at the first one's place.
fn dedup_batch(items: Vec<MenuItem>) -> Vec<MenuItem> {
    let mut out: Vec<MenuItem> = Vec::with_capacity(items.len());
    for item in items {
        match out.iter_mut().find(|existing| existing.same_entry(&item)) {
            Some(existing) => *existing = item,
            None => out.push(item),
        }
    }
    out
}

fn insert_items(
    menu_id: &str,
    submenu: &mut Vec<MenuItem>,
    items: Vec<MenuItem>,
    position: InsertPosition,
    with_separator: bool,
) -> Result<(), MenuError> {
    let anchor_index = match &position {
        InsertPosition::After(anchor) => Some(
            submenu
                .iter()
                .position(|item| item.is_anchor(anchor))
                .ok_or_else(|| MenuError::AnchorNotFound {
                    menu_id: menu_id.into(),
                    anchor: anchor.clone(),
                })?,
        ),
        _ => None,
    };

    let mut fresh = Vec::with_capacity(items.len() + 1);
    for item in items {
        match submenu.iter_mut().find(|existing| existing.same_entry(&item)) {
            Some(existing) => *existing = item,
            None => fresh.push(item),
        }
    }
    if fresh.is_empty() {
        return Ok(());
    }

    match position {
        InsertPosition::End => {
            if with_separator {
                submenu.push(MenuItem::separator());
            }
            submenu.extend(fresh);
        }
        InsertPosition::Start => {
            if with_separator {
                fresh.push(MenuItem::separator());
            }
            submenu.splice(0..0, fresh);
        }
        InsertPosition::After(_) => {
            let at = anchor_index.map_or(submenu.len(), |idx| idx + 1);
            if with_separator {
                fresh.insert(0, MenuItem::separator());
            }
            submenu.splice(at..at, fresh);
        }
    }
    Ok(())
}

async fn run_rebuilder(this: Weak<MenuBuilder>, mut rx: ReloadRx) {
    while rx.wait_debounced(MENU_DEBOUNCE).await.is_some() {
        let Some(this) = this.upgrade() else {
            break;
        };
        this.build_menu_now().ok_or_log();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{HeadlessMenu, test_windows};

    fn labels(items: &[ResolvedMenuItem]) -> Vec<String> {
        items
            .iter()
            .map(|it| {
                if it.separator {
                    "-".into()
                } else {
                    it.label
                        .clone()
                        .or_else(|| it.id.clone())
                        .or_else(|| it.role.clone())
                        .unwrap_or_default()
                }
            })
            .collect()
    }

    fn submenu_of(builder: &MenuBuilder, id: &str) -> Vec<String> {
        let menu = builder.resolved();
        let top = menu
            .iter()
            .find(|it| it.id.as_deref() == Some(id))
            .unwrap();
        labels(top.submenu.as_deref().unwrap_or_default())
    }

    fn item(id: &str) -> MenuItem {
        MenuItem::labeled(id).with_id(id)
    }

    fn builder() -> (Arc<MenuBuilder>, Arc<HeadlessMenu>) {
        let native = Arc::new(HeadlessMenu::default());
        (MenuBuilder::new(native.clone(), test_windows()), native)
    }

    #[tokio::test]
    async fn positions() {
        let (menu, _) = builder();
        menu.insert_menu(
            WORKSPACES_MENU_ID,
            vec![item("b"), item("c")],
            InsertPosition::End,
            false,
        )
        .unwrap();
        menu.insert_menu(WORKSPACES_MENU_ID, vec![item("a")], InsertPosition::Start, true)
            .unwrap();
        menu.insert_menu(
            WORKSPACES_MENU_ID,
            vec![item("b2")],
            InsertPosition::After("b".into()),
            false,
        )
        .unwrap();
        menu.insert_menu(WORKSPACES_MENU_ID, vec![item("z")], InsertPosition::End, true)
            .unwrap();

        assert_eq!(
            submenu_of(&menu, WORKSPACES_MENU_ID),
            ["a", "-", "b", "b2", "c", "-", "z"]
        );
    }

    #[tokio::test]
    async fn unknown_anchor_fails_without_dropping_items() {
        let (menu, _) = builder();
        let before = submenu_of(&menu, "Edit");
        let err = menu
            .insert_menu(
                "Edit",
                vec![item("x")],
                InsertPosition::After("nope".into()),
                false,
            )
            .unwrap_err();
        assert_eq!(
            err,
            MenuError::AnchorNotFound {
                menu_id: "Edit".into(),
                anchor: "nope".into()
            }
        );
        assert_eq!(submenu_of(&menu, "Edit"), before);
    }

    #[tokio::test]
    async fn duplicates_update_in_place() {
        let (menu, _) = builder();
        menu.insert_menu(
            WORKSPACES_MENU_ID,
            vec![item("a"), item("b")],
            InsertPosition::End,
            false,
        )
        .unwrap();
        menu.insert_menu(
            WORKSPACES_MENU_ID,
            vec![MenuItem::labeled("renamed").with_id("a"), item("c")],
            InsertPosition::End,
            false,
        )
        .unwrap();
        assert_eq!(submenu_of(&menu, WORKSPACES_MENU_ID), ["renamed", "b", "c"]);
    }

    #[tokio::test]
    async fn duplicates_within_one_batch_collapse() {
        let (menu, _) = builder();
        menu.insert_menu(
            WORKSPACES_MENU_ID,
            vec![
                item("a"),
                item("b"),
                MenuItem::labeled("a again").with_id("a"),
            ],
            InsertPosition::End,
            false,
        )
        .unwrap();
        assert_eq!(submenu_of(&menu, WORKSPACES_MENU_ID), ["a again", "b"]);

        menu.insert_menu("Fresh", vec![item("x"), item("x")], InsertPosition::End, false)
            .unwrap();
        assert_eq!(submenu_of(&menu, "Fresh"), ["x"]);
    }

    #[tokio::test]
    async fn unknown_menu_is_appended_at_top_level() {
        let (menu, _) = builder();
        menu.insert_menu("Sync", vec![item("now")], InsertPosition::End, false)
            .unwrap();
        let top = menu.resolved();
        assert_eq!(top.last().and_then(|it| it.id.as_deref()), Some("Sync"));
        assert_eq!(submenu_of(&menu, "Sync"), ["now"]);
    }

    #[tokio::test]
    async fn computed_fields_are_evaluated_at_build_time() {
        let (menu, _) = builder();
        let counter = Arc::new(AtomicUsize::new(0));
        let label = MenuField::Computed(Callback::from_fn_ctx(counter.clone(), |counter, ()| {
            format!("seen {}", counter.load(Ordering::Relaxed))
        }));
        menu.insert_menu(
            WORKSPACES_MENU_ID,
            vec![MenuItem::labeled(label).with_id("dyn")],
            InsertPosition::End,
            false,
        )
        .unwrap();

        assert_eq!(submenu_of(&menu, WORKSPACES_MENU_ID), ["seen 0"]);
        counter.store(3, Ordering::Relaxed);
        assert_eq!(submenu_of(&menu, WORKSPACES_MENU_ID), ["seen 3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn rebuilds_are_debounced() {
        let (menu, native) = builder();
        for id in ["a", "b", "c", "d"] {
            menu.insert_menu(WORKSPACES_MENU_ID, vec![item(id)], InsertPosition::End, false)
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(menu.build_count(), 1);
        assert_eq!(native.installed(), 1);
    }
}
