use std::sync::Arc;

use anyhow::Context;
use secx_extraction::ExtractionRunner;
use secx_infra::PipelineConfig;

use secx_api::app::{self, services};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    secx_observability::init();

    let config = PipelineConfig::from_env().context("invalid pipeline configuration")?;

    // The blocking HTTP clients must be built outside the async runtime.
    let extractor = services::extractor_registry(|key| std::env::var(key).ok(), config.extraction_timeout)
        .context("invalid extractor configuration")?;
    let runner = ExtractionRunner::new(extractor, config.extraction_timeout);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("secx-runtime")
        .build()
        .context("failed to start tokio runtime")?;

    let services = Arc::new(runtime.block_on(services::build_services(&config))?);
    let pipeline = services
        .spawn_pipeline(runner, &config)
        .context("failed to start workers")?;

    let bind_addr = std::env::var("SECX_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
    let served = runtime.block_on(serve(bind_addr, services));

    tracing::info!("stopping workers and scheduler");
    pipeline.shutdown();
    served
}

async fn serve(bind_addr: String, services: Arc<services::AppServices>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app::build_app(services))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
