/// Recording helpers and the process collector

use super::*;
use std::time::Instant;

/// Process-level collector, refreshed by the runtime's health task
pub struct RuntimeCollector {
    started: Instant,
}

impl RuntimeCollector {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn collect(&self) {
        UPTIME_SECONDS.set(self.started.elapsed().as_secs_f64());
    }
}

impl Default for RuntimeCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper functions for common metric operations
pub mod helpers {
    use super::*;

    /// Record one enricher outcome
    pub fn record_enricher(enricher: &str, status: &str, duration_secs: Option<f64>) {
        ENRICHER_EXECUTIONS_TOTAL
            .with_label_values(&[enricher, status])
            .inc();

        if let Some(secs) = duration_secs {
            ENRICHER_DURATION_SECONDS
                .with_label_values(&[enricher])
                .observe(secs);
        }
    }

    pub fn record_retry(enricher: &str) {
        ENRICHER_RETRIES_TOTAL.with_label_values(&[enricher]).inc();
    }

    pub fn record_cache_lookup(enricher: &str, hit: bool) {
        if hit {
            CACHE_HITS_TOTAL.with_label_values(&[enricher]).inc();
        } else {
            CACHE_MISSES_TOTAL.with_label_values(&[enricher]).inc();
        }
    }

    pub fn record_pipeline_run(outcome: &str, duration_secs: f64) {
        PIPELINE_RUNS_TOTAL.with_label_values(&[outcome]).inc();
        PIPELINE_DURATION_SECONDS.observe(duration_secs);
    }

    pub fn record_transformation(
        transformer: &str,
        strategy: &str,
        outcome: &str,
        duration_secs: f64,
    ) {
        TRANSFORMATIONS_TOTAL
            .with_label_values(&[transformer, strategy, outcome])
            .inc();

        TRANSFORMATION_DURATION_SECONDS
            .with_label_values(&[transformer, strategy])
            .observe(duration_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::helpers::*;
    use super::*;

    #[test]
    fn test_runtime_collector() {
        init_metrics().ok();
        RuntimeCollector::new().collect();

        let metrics = gather_metrics();
        assert!(metrics.contains("uptime_seconds"));
    }

    #[test]
    fn test_record_enricher() {
        init_metrics().ok();
        record_enricher("memory", "executed", Some(0.002));

        let value = ENRICHER_EXECUTIONS_TOTAL
            .with_label_values(&["memory", "executed"])
            .get();
        assert!(value >= 1.0);
        assert!(gather_metrics().contains("enricher_duration_seconds"));
    }

    #[test]
    fn test_record_cache_lookup() {
        record_cache_lookup("temporal", true);
        record_cache_lookup("temporal", false);

        assert!(CACHE_HITS_TOTAL.with_label_values(&["temporal"]).get() >= 1.0);
        assert!(CACHE_MISSES_TOTAL.with_label_values(&["temporal"]).get() >= 1.0);
    }

    #[test]
    fn test_record_transformation() {
        init_metrics().ok();
        record_transformation("cognition", "MINIMAL", "success", 0.0001);
        assert!(gather_metrics().contains("transformations_total"));
    }
}
