use llm_context_engine::{
    config::{Config, ObservabilityConfig},
    enrichment::{InMemoryEmotionModule, InMemoryMemoryStore, Providers},
    runtime::ContextRuntime,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration before logging so the log format can follow it
    let (config, load_error) = match Config::load() {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };

    init_tracing(&config.observability);

    if let Some(e) = load_error {
        tracing::warn!("Failed to load configuration: {}", e);
        tracing::warn!("Using default configuration");
    }

    tracing::info!("Starting LLM Context Engine v{}", env!("CARGO_PKG_VERSION"));

    // Initialize Prometheus metrics
    if config.observability.prometheus_enabled {
        if let Err(e) = llm_context_engine::metrics::init_metrics() {
            tracing::warn!("Failed to initialize metrics: {}", e);
            tracing::warn!("Continuing without metrics");
        } else {
            tracing::info!("✅ Prometheus metrics initialized");
        }
    } else {
        tracing::info!("⚠️  Prometheus metrics disabled in configuration");
    }

    // In-process collaborators; embedders supply their own through Providers
    let providers = Providers::default()
        .with_memory(Arc::new(InMemoryMemoryStore::new()))
        .with_emotion(Arc::new(InMemoryEmotionModule::new()));

    let runtime = ContextRuntime::bootstrap(&config, providers).await?;
    tracing::info!(
        "✅ Pipeline ready with {} enrichers: {:?}",
        runtime.pipeline().enricher_count(),
        runtime.pipeline().enricher_ids()
    );

    runtime.start()?;
    tracing::info!("Press Ctrl+C to shutdown");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    runtime.shutdown().await;
    tracing::info!("Shutting down gracefully...");
    Ok(())
}

fn init_tracing(observability: &ObservabilityConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("llm_context_engine={}", observability.log_level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if observability.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
