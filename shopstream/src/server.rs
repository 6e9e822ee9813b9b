//! HTTP server lifecycle: bind, serve, and shut down gracefully.
//!
//! The server stops for one of two reasons: an operator signal (SIGTERM or
//! ctrl-c, graceful) or a media worker death (fatal by design; the process
//! exits non-zero and the external supervisor restarts the whole service).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::sync::watch;
use tracing::{error, info, warn};

use shopstream_core::Config;
use shopstream_sfu::SfuManager;

/// How long to wait for in-flight connections after a shutdown is requested.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run(config: &Config, router: Router, engine: &Arc<SfuManager>) -> anyhow::Result<()> {
    let addr: SocketAddr = config.http_address().parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {addr}");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(async move {
        let graceful = async move {
            let _ = shutdown_rx.changed().await;
        };
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(graceful)
            .await
        {
            error!("HTTP server error: {e}");
        }
    });

    let outcome = tokio::select! {
        failure = engine.worker_failed() => {
            error!("{failure}");
            Err(anyhow::anyhow!(failure))
        }
        () = shutdown_signal() => {
            info!("Shutdown signal received, starting graceful shutdown...");
            Ok(())
        }
    };

    // Stop accepting and give open signaling channels a bounded window to
    // drain; long-lived WebSockets would otherwise hold the server forever.
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(DRAIN_TIMEOUT, server).await.is_err() {
        warn!(
            "Drain timeout of {}s reached with connections still open, proceeding with shutdown",
            DRAIN_TIMEOUT.as_secs()
        );
    }

    outcome
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {e}");
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
