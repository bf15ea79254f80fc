//! Beach Lens server: supervises a streaming gateway and proxies browser
//! WebSocket sessions to it.

pub mod backend;
pub mod cast;
pub mod config;
pub mod error;
pub mod gate;
pub mod proxy;
pub mod routes;
pub mod sources;
pub mod state;
pub mod supervisor;
pub mod telemetry;

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{net::TcpListener, signal};
use tracing::info;

use crate::{
    backend::Backend,
    cast::WebhookCaster,
    config::ServerConfig,
    sources::{SourceResolver, StaticSources},
    state::AppState,
};

/// Builds the app state for `config` around an already selected backend.
pub fn build_state(
    config: &ServerConfig,
    backend: Backend,
    http: reqwest::Client,
    metrics: Option<PrometheusHandle>,
) -> Result<AppState> {
    let sources: Arc<dyn SourceResolver> = match &config.sources_file {
        Some(path) => Arc::new(
            StaticSources::from_path(path).context("failed to load camera sources")?,
        ),
        None => Arc::new(StaticSources::default()),
    };
    let caster = Arc::new(WebhookCaster::new(http.clone(), config.cast_webhook.clone()));

    let mut builder = AppState::builder(config.namespace.clone(), backend)
        .signing_secret(config.signing_secret.clone())
        .access_tokens(config.access_tokens.clone())
        .sources(sources)
        .caster(caster)
        .http(http)
        .public_url(config.public_url.clone());
    if let Some(metrics) = metrics {
        builder = builder.metrics(metrics);
    }
    Ok(builder.build())
}

/// Serves until ctrl-c, then stops the gateway.
pub async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let http = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("failed to build http client")?;
    let backend = backend::select_backend(config.gateway.clone(), &http).await?;
    let state = Arc::new(build_state(&config, backend.clone(), http, Some(metrics))?);
    let router = routes::build_router(state);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("beach-lens listening on {}", config.listen_addr);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; stopping gateway"
    );
    backend.stop().await;
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
