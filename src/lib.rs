//! Desktop shell hosting one content view per wiki workspace, each served by its own
//! content-server process.

pub mod app;
pub mod config;
pub mod content;
pub mod ipc;
pub mod logging;
pub mod menu;
pub mod notifications;
pub mod services;
pub mod utils;
pub mod view;
pub mod window;
pub mod workspace_ops;
pub mod workspaces;

#[cfg(test)]
pub(crate) mod testing;
