/// Prometheus metrics for the context engine.
///
/// Covers:
/// - Pipeline runs by outcome and duration
/// - Per-enricher executions, durations and retries
/// - Enrichment cache hits, misses and evictions
/// - Transformations by transformer, strategy and outcome
///
/// Metrics are observational only; nothing in the engine reads them back.
///
/// # Example
/// ```no_run
/// use llm_context_engine::metrics::{self, ENRICHER_EXECUTIONS_TOTAL};
///
/// metrics::init_metrics().ok();
/// ENRICHER_EXECUTIONS_TOTAL
///     .with_label_values(&["memory", "executed"])
///     .inc();
/// ```

mod collectors;

pub use collectors::*;

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
};
use std::sync::atomic::{AtomicBool, Ordering};

const NAMESPACE: &str = "llm_context_engine";

lazy_static! {
    /// Registry holding every context engine metric
    pub static ref CONTEXT_ENGINE_REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Pipeline Metrics
    // ============================================================================

    /// Pipeline runs
    ///
    /// Labels: outcome (success, partial, failed)
    pub static ref PIPELINE_RUNS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("pipeline_runs_total", "Total number of enrichment pipeline runs")
            .namespace(NAMESPACE),
        &["outcome"]
    ).expect("Failed to create PIPELINE_RUNS_TOTAL metric");

    /// Whole-run duration in seconds
    pub static ref PIPELINE_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "pipeline_duration_seconds",
            "Enrichment pipeline run duration in seconds"
        )
        .namespace(NAMESPACE)
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    ).expect("Failed to create PIPELINE_DURATION_SECONDS metric");

    // ============================================================================
    // Enricher Metrics
    // ============================================================================

    /// Enricher outcomes
    ///
    /// Labels: enricher, status (executed, cached, failed, skipped)
    pub static ref ENRICHER_EXECUTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("enricher_executions_total", "Total number of enricher outcomes")
            .namespace(NAMESPACE),
        &["enricher", "status"]
    ).expect("Failed to create ENRICHER_EXECUTIONS_TOTAL metric");

    /// Enricher duration in seconds, across all attempts
    ///
    /// Labels: enricher
    pub static ref ENRICHER_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "enricher_duration_seconds",
            "Enricher duration in seconds"
        )
        .namespace(NAMESPACE)
        .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
        &["enricher"]
    ).expect("Failed to create ENRICHER_DURATION_SECONDS metric");

    /// Retries after a failed or timed-out attempt
    ///
    /// Labels: enricher
    pub static ref ENRICHER_RETRIES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("enricher_retries_total", "Total number of enricher retries")
            .namespace(NAMESPACE),
        &["enricher"]
    ).expect("Failed to create ENRICHER_RETRIES_TOTAL metric");

    // ============================================================================
    // Cache Metrics
    // ============================================================================

    /// Labels: enricher
    pub static ref CACHE_HITS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("cache_hits_total", "Total number of enrichment cache hits")
            .namespace(NAMESPACE),
        &["enricher"]
    ).expect("Failed to create CACHE_HITS_TOTAL metric");

    /// Labels: enricher
    pub static ref CACHE_MISSES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("cache_misses_total", "Total number of enrichment cache misses")
            .namespace(NAMESPACE),
        &["enricher"]
    ).expect("Failed to create CACHE_MISSES_TOTAL metric");

    /// Labels: cause (replaced, removed, expired, cleared)
    pub static ref CACHE_EVICTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("cache_evictions_total", "Total number of enrichment cache evictions")
            .namespace(NAMESPACE),
        &["cause"]
    ).expect("Failed to create CACHE_EVICTIONS_TOTAL metric");

    // ============================================================================
    // Transformation Metrics
    // ============================================================================

    /// Labels: transformer, strategy, outcome (success, cached, failed)
    pub static ref TRANSFORMATIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("transformations_total", "Total number of context transformations")
            .namespace(NAMESPACE),
        &["transformer", "strategy", "outcome"]
    ).expect("Failed to create TRANSFORMATIONS_TOTAL metric");

    /// Labels: transformer, strategy
    pub static ref TRANSFORMATION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "transformation_duration_seconds",
            "Context transformation duration in seconds"
        )
        .namespace(NAMESPACE)
        .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        &["transformer", "strategy"]
    ).expect("Failed to create TRANSFORMATION_DURATION_SECONDS metric");

    // ============================================================================
    // Runtime Metrics
    // ============================================================================

    /// Agents with a live context in the runtime cache
    pub static ref AGENT_CONTEXTS_ACTIVE: Gauge = Gauge::with_opts(
        Opts::new("agent_contexts_active", "Number of agents with a cached context")
            .namespace(NAMESPACE)
    ).expect("Failed to create AGENT_CONTEXTS_ACTIVE metric");

    /// Enrichers reporting unhealthy in the last health check
    pub static ref ENRICHERS_UNHEALTHY: Gauge = Gauge::with_opts(
        Opts::new("enrichers_unhealthy", "Number of unhealthy enrichers at last check")
            .namespace(NAMESPACE)
    ).expect("Failed to create ENRICHERS_UNHEALTHY metric");

    /// Labels: version
    pub static ref BUILD_INFO: GaugeVec = GaugeVec::new(
        Opts::new("build_info", "Build information").namespace(NAMESPACE),
        &["version"]
    ).expect("Failed to create BUILD_INFO metric");

    pub static ref UPTIME_SECONDS: Gauge = Gauge::with_opts(
        Opts::new("uptime_seconds", "Process uptime in seconds").namespace(NAMESPACE)
    ).expect("Failed to create UPTIME_SECONDS metric");
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Register every metric with [`CONTEXT_ENGINE_REGISTRY`]; later calls are no-ops
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    // Pipeline
    CONTEXT_ENGINE_REGISTRY.register(Box::new(PIPELINE_RUNS_TOTAL.clone()))?;
    CONTEXT_ENGINE_REGISTRY.register(Box::new(PIPELINE_DURATION_SECONDS.clone()))?;

    // Enrichers
    CONTEXT_ENGINE_REGISTRY.register(Box::new(ENRICHER_EXECUTIONS_TOTAL.clone()))?;
    CONTEXT_ENGINE_REGISTRY.register(Box::new(ENRICHER_DURATION_SECONDS.clone()))?;
    CONTEXT_ENGINE_REGISTRY.register(Box::new(ENRICHER_RETRIES_TOTAL.clone()))?;

    // Cache
    CONTEXT_ENGINE_REGISTRY.register(Box::new(CACHE_HITS_TOTAL.clone()))?;
    CONTEXT_ENGINE_REGISTRY.register(Box::new(CACHE_MISSES_TOTAL.clone()))?;
    CONTEXT_ENGINE_REGISTRY.register(Box::new(CACHE_EVICTIONS_TOTAL.clone()))?;

    // Transformations
    CONTEXT_ENGINE_REGISTRY.register(Box::new(TRANSFORMATIONS_TOTAL.clone()))?;
    CONTEXT_ENGINE_REGISTRY.register(Box::new(TRANSFORMATION_DURATION_SECONDS.clone()))?;

    // Runtime
    CONTEXT_ENGINE_REGISTRY.register(Box::new(AGENT_CONTEXTS_ACTIVE.clone()))?;
    CONTEXT_ENGINE_REGISTRY.register(Box::new(ENRICHERS_UNHEALTHY.clone()))?;
    CONTEXT_ENGINE_REGISTRY.register(Box::new(BUILD_INFO.clone()))?;
    CONTEXT_ENGINE_REGISTRY.register(Box::new(UPTIME_SECONDS.clone()))?;

    BUILD_INFO
        .with_label_values(&[env!("CARGO_PKG_VERSION")])
        .set(1.0);

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Render every registered metric in the Prometheus text format
pub fn gather_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = CONTEXT_ENGINE_REGISTRY.gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|e| {
        tracing::error!("Failed to convert metrics to string: {}", e);
        String::from("# Error converting metrics\n")
    })
}
