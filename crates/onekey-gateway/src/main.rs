use anyhow::Result;

mod api;
mod breaker;
mod cache;
mod config;
mod error;
mod headers;
mod kv;
mod observability;
mod pipeline;
mod ratelimit;
mod state;
mod time;
mod upstream;

use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .json()
        .init();

    let config_path = std::env::var("ONEKEY_CONFIG").unwrap_or_else(|_| "./config.toml".to_string());
    let cfg = config::Config::load(&config_path)?;

    let state = loop {
        match AppState::new(cfg.clone()).await {
            Ok(s) => break s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to initialize gateway state, retrying");
                tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            }
        }
    };

    let app = api::router(state);

    let addr = std::env::var("ONEKEY_LISTEN").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    tracing::info!(addr = %addr, "starting onekey-gateway");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(signals())
    .await?;
    tracing::info!("onekey-gateway has shut down gracefully");
    Ok(())
}

async fn signals() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}
