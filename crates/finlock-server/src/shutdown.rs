use std::sync::Arc;
use tracing::info;

use crate::AppState;

/// Wait for shutdown signal (SIGTERM or ctrl-c) and initiate graceful shutdown.
pub async fn wait_for_shutdown(state: Arc<AppState>) {
    shutdown_signal().await;
    info!("shutdown signal received");
    begin(&state);
}

/// Refuse new authorizations and sweeps, then stop the sweep runner.
/// In-flight requests drain through axum's graceful shutdown.
pub fn begin(state: &AppState) {
    state.engine.begin_shutdown();
    state.runner.shutdown();
}

/// Listen for SIGTERM (Kubernetes pod termination) or ctrl-c.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to listen for SIGTERM, using ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    let ctrl_c = tokio::signal::ctrl_c();

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = ctrl_c => info!("ctrl-c received"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
