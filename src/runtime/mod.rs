/// Runtime adapter
///
/// Owns the enrichment pipeline and the cognition transformer, keeps the
/// latest context per agent, and runs the periodic health and sweep tasks.

use crate::config::Config;
use crate::enrichment::enricher::EnricherHealth;
use crate::enrichment::enrichers::default_registry;
use crate::enrichment::models::{
    EnrichmentRequest, PipelineError, PipelineExecutionResult, SkipReason, UnifiedContext,
};
use crate::enrichment::pipeline::{EnrichmentPipeline, PipelineBuilder};
use crate::enrichment::providers::Providers;
use crate::error::{ContextError, Result};
use crate::metrics::{RuntimeCollector, AGENT_CONTEXTS_ACTIVE, ENRICHERS_UNHEALTHY};
use crate::transform::cognition::{CognitionTransformer, CognitiveContext};
use crate::transform::models::{TransformationConfig, TransformationResult, ValidationResult};
use crate::transform::transformer::TransformEngine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

/// Background task and per-agent cache policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RuntimeConfig {
    #[validate(range(min = 1))]
    pub health_check_interval_secs: u64,

    #[validate(range(min = 1))]
    pub sweep_interval_secs: u64,

    /// Agent contexts untouched for longer are swept
    #[validate(range(min = 1))]
    pub context_ttl_secs: u64,

    /// Least recently used agent is evicted beyond this
    #[validate(range(min = 1))]
    pub max_agents: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            sweep_interval_secs: 60,
            context_ttl_secs: 3_600,
            max_agents: 1_000,
        }
    }
}

/// What one enrichment run produced, without the context itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextManifest {
    pub run_id: Uuid,
    pub success: bool,
    pub executed: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
    pub skip_reasons: BTreeMap<String, SkipReason>,
    pub cache_hits: usize,
    pub errors: Vec<PipelineError>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

impl From<&PipelineExecutionResult> for ContextManifest {
    fn from(result: &PipelineExecutionResult) -> Self {
        Self {
            run_id: result.run_id,
            success: result.success,
            executed: result.enrichers_executed.clone(),
            skipped: result.enrichers_skipped.clone(),
            failed: result.enrichers_failed.clone(),
            skip_reasons: result.skip_reasons.clone(),
            cache_hits: result.cache_hits,
            errors: result.errors.clone(),
            warnings: result.warnings.clone(),
            duration_ms: result.metrics.total_duration_ms,
        }
    }
}

#[derive(Debug, Clone)]
struct AgentEntry {
    context: UnifiedContext,
    manifest: ContextManifest,
    last_access: DateTime<Utc>,
}

/// Enrichment plus cognition view for one request
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub execution: PipelineExecutionResult,
    pub validation: ValidationResult,
    pub cognition: TransformationResult<CognitiveContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStats {
    pub is_running: bool,
    pub runs: u64,
    pub failed_runs: u64,
    pub average_duration_ms: f64,
    pub active_agents: usize,
    pub sweeps: u64,
    pub enrichers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeHealth {
    pub healthy: bool,
    pub unhealthy: Vec<String>,
    pub enrichers: Vec<EnricherHealth>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Default)]
struct Counters {
    runs: AtomicU64,
    failed_runs: AtomicU64,
    total_duration_ms: AtomicU64,
    sweeps: AtomicU64,
}

struct Background {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Per-agent context lifecycle around one pipeline and transformer
pub struct ContextRuntime {
    config: RuntimeConfig,
    pipeline: Arc<EnrichmentPipeline>,
    cognition: Arc<TransformEngine<CognitionTransformer>>,
    contexts: Arc<DashMap<String, AgentEntry>>,
    counters: Arc<Counters>,
    collector: Arc<RuntimeCollector>,
    background: Mutex<Option<Background>>,
}

impl ContextRuntime {
    pub fn new(
        pipeline: EnrichmentPipeline,
        cognition: TransformEngine<CognitionTransformer>,
        config: RuntimeConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            pipeline: Arc::new(pipeline),
            cognition: Arc::new(cognition),
            contexts: Arc::new(DashMap::new()),
            counters: Arc::new(Counters::default()),
            collector: Arc::new(RuntimeCollector::new()),
            background: Mutex::new(None),
        })
    }

    /// Registry with the built-in enrichers, pipeline and cognition transformer
    pub async fn bootstrap(config: &Config, providers: Providers) -> Result<Self> {
        let registry = default_registry(&providers, &config.enrichers)?;
        let pipeline = PipelineBuilder::from_registry(
            &registry,
            &config.enrichers.overrides,
            config.pipeline.clone(),
        )?
        .build()
        .await?;

        let cognition = TransformEngine::new(CognitionTransformer::new(), &config.transform);
        info!(
            enrichers = pipeline.enricher_count(),
            order = ?pipeline.enricher_ids(),
            "Context runtime bootstrapped"
        );
        Self::new(pipeline, cognition, config.runtime.clone())
    }

    pub fn pipeline(&self) -> &EnrichmentPipeline {
        &self.pipeline
    }

    pub fn cognition(&self) -> &TransformEngine<CognitionTransformer> {
        &self.cognition
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.background.lock().is_some()
    }

    /// Spawn the health-check and sweep tasks
    pub fn start(&self) -> Result<()> {
        let mut background = self.background.lock();
        if background.is_some() {
            return Err(ContextError::Internal("context runtime already running".to_string()));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let health_task = {
            let pipeline = Arc::clone(&self.pipeline);
            let contexts = Arc::clone(&self.contexts);
            let collector = Arc::clone(&self.collector);
            let interval = Duration::from_secs(self.config.health_check_interval_secs);
            let mut shutdown = shutdown_rx.clone();

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let report = pipeline.health_check().await;
                            record_health(&report, contexts.len());
                            collector.collect();
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                debug!("Health check loop shutdown");
                                break;
                            }
                        }
                    }
                }
            })
        };

        let sweep_task = {
            let pipeline = Arc::clone(&self.pipeline);
            let contexts = Arc::clone(&self.contexts);
            let counters = Arc::clone(&self.counters);
            let interval = Duration::from_secs(self.config.sweep_interval_secs);
            let ttl = self.config.context_ttl_secs;
            let mut shutdown = shutdown_rx;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let reclaimed = pipeline.sweep() + sweep_contexts(&contexts, ttl, Utc::now());
                            counters.sweeps.fetch_add(1, Ordering::Relaxed);
                            if reclaimed > 0 {
                                debug!(reclaimed, "Periodic sweep completed");
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                debug!("Sweep loop shutdown");
                                break;
                            }
                        }
                    }
                }
            })
        };

        *background = Some(Background {
            shutdown: shutdown_tx,
            tasks: vec![health_task, sweep_task],
        });
        info!(
            health_interval_secs = self.config.health_check_interval_secs,
            sweep_interval_secs = self.config.sweep_interval_secs,
            "Context runtime started"
        );
        Ok(())
    }

    /// Signal the background tasks and wait for them to exit
    pub async fn stop(&self) -> Result<()> {
        let Some(background) = self.background.lock().take() else {
            return Err(ContextError::Internal("context runtime not running".to_string()));
        };

        let _ = background.shutdown.send(true);
        for task in background.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Context runtime stopped");
        Ok(())
    }

    /// Stop if running, then dispose enrichers and drop agent contexts
    pub async fn shutdown(&self) {
        if self.is_running() {
            let _ = self.stop().await;
        }
        self.pipeline.dispose().await;
        self.cognition.clear_cache().await;
        self.contexts.clear();
        AGENT_CONTEXTS_ACTIVE.set(0.0);
    }

    /// Enrich, validate and transform for the cognition consumer
    pub async fn process(
        &self,
        request: EnrichmentRequest,
        transform: Option<&TransformationConfig>,
    ) -> ProcessOutcome {
        let agent_id = request.agent_id.clone();
        let execution = self.pipeline.execute(request).await;

        self.counters.runs.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_duration_ms
            .fetch_add(execution.metrics.total_duration_ms, Ordering::Relaxed);
        if !execution.success {
            self.counters.failed_runs.fetch_add(1, Ordering::Relaxed);
        }

        let validation = self.cognition.validate(&execution.enriched_context);
        let cognition = self
            .cognition
            .transform(&execution.enriched_context, transform)
            .await;
        if !cognition.success {
            warn!(
                agent_id = %agent_id,
                error = ?cognition.error,
                "Cognition transform failed"
            );
        }

        self.remember(&agent_id, &execution);

        ProcessOutcome {
            execution,
            validation,
            cognition,
        }
    }

    fn remember(&self, agent_id: &str, execution: &PipelineExecutionResult) {
        if !self.contexts.contains_key(agent_id) && self.contexts.len() >= self.config.max_agents {
            let oldest = self
                .contexts
                .iter()
                .min_by_key(|entry| entry.value().last_access)
                .map(|entry| entry.key().clone());
            if let Some(oldest) = oldest {
                self.contexts.remove(&oldest);
                debug!(agent_id = %oldest, "Evicted least recently used agent context");
            }
        }

        self.contexts.insert(
            agent_id.to_string(),
            AgentEntry {
                context: execution.enriched_context.clone(),
                manifest: ContextManifest::from(execution),
                last_access: Utc::now(),
            },
        );
        AGENT_CONTEXTS_ACTIVE.set(self.contexts.len() as f64);
    }

    /// Latest context for an agent; refreshes its last access
    pub fn context_for(&self, agent_id: &str) -> Option<UnifiedContext> {
        self.contexts.get_mut(agent_id).map(|mut entry| {
            entry.last_access = Utc::now();
            entry.context.clone()
        })
    }

    pub fn manifest_for(&self, agent_id: &str) -> Option<ContextManifest> {
        self.contexts.get(agent_id).map(|entry| entry.manifest.clone())
    }

    pub fn release_agent(&self, agent_id: &str) -> bool {
        let released = self.contexts.remove(agent_id).is_some();
        if released {
            AGENT_CONTEXTS_ACTIVE.set(self.contexts.len() as f64);
            debug!(agent_id = %agent_id, "Released agent context");
        }
        released
    }

    pub fn active_agents(&self) -> usize {
        self.contexts.len()
    }

    /// One sweep pass: pipeline caches, enricher-local state, stale agents
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        self.counters.sweeps.fetch_add(1, Ordering::Relaxed);
        self.pipeline.sweep() + sweep_contexts(&self.contexts, self.config.context_ttl_secs, now)
    }

    pub async fn health(&self) -> RuntimeHealth {
        let enrichers = self.pipeline.health_check().await;
        record_health(&enrichers, self.contexts.len());
        self.collector.collect();

        let unhealthy: Vec<String> = enrichers
            .iter()
            .filter(|h| h.enabled && !h.healthy)
            .map(|h| h.enricher_id.clone())
            .collect();

        RuntimeHealth {
            healthy: unhealthy.is_empty(),
            unhealthy,
            enrichers,
            checked_at: Utc::now(),
        }
    }

    pub fn stats(&self) -> RuntimeStats {
        let runs = self.counters.runs.load(Ordering::Relaxed);
        let total = self.counters.total_duration_ms.load(Ordering::Relaxed);

        RuntimeStats {
            is_running: self.is_running(),
            runs,
            failed_runs: self.counters.failed_runs.load(Ordering::Relaxed),
            average_duration_ms: if runs == 0 {
                0.0
            } else {
                total as f64 / runs as f64
            },
            active_agents: self.contexts.len(),
            sweeps: self.counters.sweeps.load(Ordering::Relaxed),
            enrichers: self.pipeline.enricher_count(),
        }
    }
}

fn record_health(report: &[EnricherHealth], active_agents: usize) {
    let unhealthy = report.iter().filter(|h| h.enabled && !h.healthy).count();
    ENRICHERS_UNHEALTHY.set(unhealthy as f64);
    AGENT_CONTEXTS_ACTIVE.set(active_agents as f64);
    if unhealthy > 0 {
        warn!(unhealthy, "Enricher health check reported problems");
    }
}

fn sweep_contexts(contexts: &DashMap<String, AgentEntry>, ttl_secs: u64, now: DateTime<Utc>) -> usize {
    let cutoff = now - ChronoDuration::seconds(ttl_secs as i64);
    let before = contexts.len();
    contexts.retain(|_, entry| entry.last_access >= cutoff);
    let removed = before.saturating_sub(contexts.len());
    if removed > 0 {
        AGENT_CONTEXTS_ACTIVE.set(contexts.len() as f64);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::pipeline::PipelineConfig;
    use crate::transform::models::TransformSettings;
    use serde_json::json;

    async fn runtime(config: RuntimeConfig) -> ContextRuntime {
        let pipeline = EnrichmentPipeline::builder(PipelineConfig::default())
            .build()
            .await
            .unwrap();
        let cognition = TransformEngine::new(CognitionTransformer::new(), &TransformSettings::default());
        ContextRuntime::new(pipeline, cognition, config).unwrap()
    }

    #[test]
    fn test_config_validation() {
        let config = RuntimeConfig {
            sweep_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let runtime = runtime(RuntimeConfig::default()).await;
        assert!(!runtime.is_running());

        runtime.start().unwrap();
        assert!(runtime.is_running());
        assert!(runtime.start().is_err());

        runtime.stop().await.unwrap();
        assert!(!runtime.is_running());
        assert!(runtime.stop().await.is_err());
    }

    #[tokio::test]
    async fn test_lru_eviction_at_capacity() {
        let runtime = runtime(RuntimeConfig {
            max_agents: 2,
            ..Default::default()
        })
        .await;

        for agent in ["a1", "a2"] {
            runtime
                .process(EnrichmentRequest::from_json(agent, json!({})), None)
                .await;
        }
        // touch a1 so a2 becomes the oldest
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(runtime.context_for("a1").is_some());

        runtime
            .process(EnrichmentRequest::from_json("a3", json!({})), None)
            .await;

        assert_eq!(runtime.active_agents(), 2);
        assert!(runtime.context_for("a2").is_none());
        assert!(runtime.context_for("a1").is_some());
    }

    #[tokio::test]
    async fn test_sweep_drops_stale_agents() {
        let runtime = runtime(RuntimeConfig {
            context_ttl_secs: 60,
            ..Default::default()
        })
        .await;
        runtime
            .process(EnrichmentRequest::from_json("a1", json!({})), None)
            .await;

        assert_eq!(runtime.sweep_at(Utc::now()), 0);
        assert_eq!(runtime.sweep_at(Utc::now() + ChronoDuration::minutes(5)), 1);
        assert_eq!(runtime.active_agents(), 0);
        assert_eq!(runtime.stats().sweeps, 2);
    }
}
