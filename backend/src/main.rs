use tracing_subscriber::EnvFilter;
use traffic_ledger::config::Config;
use traffic_ledger::errors::ApiError;
use traffic_ledger::state::AppState;
use traffic_ledger::{api, relayer};

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().map_err(|e| {
        tracing::error!(error = %e, "invalid configuration");
        ApiError::Internal
    })?;
    let addr = config.addr.clone();

    let state = AppState::open(config).await?;

    // The bundled decryption service runs in-process against the local network key.
    tokio::spawn(relayer::run(state.clone(), state.keys.decryptor()));

    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|_| ApiError::Internal)?;

    tracing::info!(%addr, "backend listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .map_err(|_| ApiError::Internal)?;

    Ok(())
}
