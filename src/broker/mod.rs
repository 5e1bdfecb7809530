//! # Broker
//!
//! - `server`: TCP accept loop, one session task per connection.
//! - `session`: decodes frames and binds each command to the queue.
//!
//! [`run`] wires both together with the snapshotter: restore on startup,
//! scheduled snapshots while serving, one final snapshot on the way out.

pub mod server;
pub mod session;

pub use server::Server;
pub use session::handle_connection;

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::core::Queue;
use crate::snapshot::Snapshotter;
use crate::storage::{open_store, BlobStore, MemoryStore};

/// Runs the broker until Ctrl-C or SIGTERM.
pub async fn run(config: Config) -> anyhow::Result<()> {
    run_until(config, shutdown_signal()).await
}

/// Runs the broker until `signal` resolves, then shuts down gracefully.
pub async fn run_until<F>(config: Config, signal: F) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    let queue = Arc::new(Queue::new());

    let store: Arc<dyn BlobStore> = if config.snapshot.enabled {
        open_store(&config.storage).context("failed to open snapshot store")?
    } else {
        Arc::new(MemoryStore::new())
    };
    let snapshotter = Snapshotter::new(Arc::clone(&queue), store, config.snapshot.clone());

    if snapshotter.enabled() {
        snapshotter
            .restore()
            .await
            .context("failed to restore queue from snapshot")?;
    }
    snapshotter
        .start()
        .await
        .context("failed to schedule snapshot jobs")?;

    let server = Server::bind(
        &config.server.bind_addr,
        Arc::clone(&queue),
        config.server.max_frame_bytes,
    )
    .await
    .with_context(|| format!("failed to bind {}", config.server.bind_addr))?;

    let shutdown = CancellationToken::new();
    let mut serving = tokio::spawn(server.serve(shutdown.clone()));

    tokio::select! {
        _ = signal => info!("shutdown requested"),
        res = &mut serving => {
            error!(?res, "server exited unexpectedly");
        }
    }

    shutdown.cancel();
    if !serving.is_finished() {
        match serving.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "server error during shutdown"),
            Err(e) => error!(error = %e, "server task panicked"),
        }
    }

    if let Err(e) = snapshotter.shutdown().await {
        error!(error = %e, "final snapshot failed");
    }
    info!(remaining = queue.len(), "broker stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
