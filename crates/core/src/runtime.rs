use crate::errors::RuntimeError;
use crate::server::{AppState, router};
use axum::serve;
use ferry_config::Config;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Entry point for running the proxy server until shutdown.
pub async fn run(config: Config) -> Result<(), RuntimeError> {
    let state = AppState::try_from_config(&config)?;
    run_with_state(state).await
}

/// Run the proxy with a prepared [`AppState`], for embedders that swap the invoker or
/// transforms.
pub async fn run_with_state(state: AppState) -> Result<(), RuntimeError> {
    let bind_address = state.bind_address();

    let listener = TcpListener::bind(bind_address)
        .await
        .map_err(RuntimeError::Bind)?;
    info!("ferry listening on http://{bind_address}");

    serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(RuntimeError::Server)
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {error}");
    }
}
