//! Server bootstrap: bind, serve, shut down cleanly.

use crate::config::ServerConfig;
use crate::routes;
use crate::state::ServerState;
use std::sync::Arc;

/// Runs the server until interrupted.
///
/// On shutdown every cached collection is checkpointed and closed before
/// the process exits.
pub async fn run(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(ServerState::new(config)?);
    let app = routes::router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down, closing collections");
    state.store.close_all();
    Ok(())
}

/// Resolves on SIGINT or SIGTERM, so supervisors stopping the process
/// still get the checkpoint-and-close path.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install interrupt handler: {err}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to install terminate handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
