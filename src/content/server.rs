//! The content-server process: static files from the content root plus a few control
//! endpoints for the host.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::Context as _;
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse as _, Response},
    routing::{get, post},
};
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;

use super::{DROP_SUB_WIKI_PATH, PORT_VAR, ROOT_VAR, SHUTDOWN_PATH, STATUS_PATH, USER_VAR};
use crate::{
    logging::{ProcKind, init_logger},
    utils::lock_mutex,
};

struct ServerState {
    dropped_sub_wikis: Mutex<BTreeSet<String>>,
    shutdown: CancellationToken,
}

/// Entry point of the content-server mode. Configuration comes from the environment.
pub fn main() -> anyhow::Result<()> {
    let root = PathBuf::from(std::env::var_os(ROOT_VAR).with_context(|| format!("Missing {ROOT_VAR}"))?);
    let port: u16 = std::env::var(PORT_VAR)
        .with_context(|| format!("Missing {PORT_VAR}"))?
        .parse()
        .with_context(|| format!("{PORT_VAR} is not a port"))?;
    let log_dir = std::env::var_os(crate::config::LOG_DIR_VAR).map(PathBuf::from);
    init_logger(
        ProcKind::ContentServer(root.display().to_string()),
        log_dir.as_deref(),
    );
    if let Ok(user) = std::env::var(USER_VAR) {
        log::debug!("Serving as {user}");
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?
        .block_on(serve(root, port, CancellationToken::new()))
}

pub async fn serve(root: PathBuf, port: u16, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("Failed to bind 127.0.0.1:{port}"))?;
    log::info!("Serving {} on port {port}", root.display());
    serve_on(listener, root, shutdown).await
}

pub(crate) async fn serve_on(
    listener: tokio::net::TcpListener,
    root: PathBuf,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let state = Arc::new(ServerState {
        dropped_sub_wikis: Mutex::default(),
        shutdown: shutdown.clone(),
    });
    axum::serve(listener, router(&root, state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("Content server failed")?;
    log::info!("Content server shutting down");
    Ok(())
}

/// Control endpoints first, everything else is a file under `root`.
fn router(root: &Path, state: Arc<ServerState>) -> Router {
    Router::new()
        .route(STATUS_PATH, get(status))
        .route(SHUTDOWN_PATH, post(shutdown))
        .route(DROP_SUB_WIKI_PATH, post(drop_sub_wiki))
        .fallback_service(ServeDir::new(root))
        .with_state(state)
}

async fn status() -> &'static str {
    "ok"
}

async fn shutdown(State(state): State<Arc<ServerState>>) -> &'static str {
    state.shutdown.cancel();
    "bye"
}

async fn drop_sub_wiki(State(state): State<Arc<ServerState>>, body: String) -> Response {
    let name = body.trim();
    if name.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing sub-wiki name").into_response();
    }
    let mut dropped = lock_mutex(&state.dropped_sub_wikis);
    if dropped.insert(name.to_owned()) {
        log::info!("Dropped sub-wiki {name:?} ({} so far)", dropped.len());
    }
    StatusCode::OK.into_response()
}
