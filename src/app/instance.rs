//! Single-instance lock. The first process binds a Unix socket, later ones hand their
//! arguments over through it and exit.

use std::path::Path;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use crate::{
    ipc::wire::{read_frame, write_frame},
    utils::{ResultExt as _, UnbTx},
};

/// What a second instance tells the first one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activation {
    pub urls: Vec<String>,
}

pub enum Instance {
    Primary(UnixListener),
    /// Another instance is running and was notified.
    Secondary,
}

pub async fn acquire(socket: &Path, activation: &Activation) -> anyhow::Result<Instance> {
    match UnixStream::connect(socket).await {
        Ok(mut stream) => {
            write_frame(&mut stream, activation)
                .await
                .context("Failed to notify the running instance")?;
            log::info!("Handed over to the running instance");
            return Ok(Instance::Secondary);
        }
        Err(err) => log::debug!("No running instance at {}: {err}", socket.display()),
    }
    // Nobody listens on it, so it is left over from a crash.
    match std::fs::remove_file(socket) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
            return Err(err).with_context(|| format!("Failed to remove {}", socket.display()));
        }
        _ => {}
    }
    let listener = UnixListener::bind(socket)
        .with_context(|| format!("Failed to bind {}", socket.display()))?;
    Ok(Instance::Primary(listener))
}

/// Forwards the activation of every later instance until cancelled.
pub async fn listen(listener: UnixListener, tx: UnbTx<Activation>, cancel: CancellationToken) {
    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(err) => {
                    log::error!("Failed to accept instance connection: {err}");
                    continue;
                }
            },
            () = cancel.cancelled() => break,
        };
        let mut read = tokio::io::BufReader::new(stream);
        let Some(activation) = read_frame::<Activation>(&mut read, &mut Vec::new())
            .await
            .ok_or_debug()
            .flatten()
        else {
            continue;
        };
        log::info!("Activated by another instance with {} urls", activation.urls.len());
        if tx.send(activation).is_err() {
            break;
        }
    }
}
