use crate::enrichment::cache::{time_bucket, EnrichmentCache};
use crate::enrichment::enricher::{elapsed_ms, ContextEnricher, EnricherHealth};
use crate::enrichment::events::{
    ContextTrace, EventBus, NodeStatus, PipelineEvent, TraceEdge, TraceNode,
};
use crate::enrichment::graph::{DependencyGraph, NodeSpec};
use crate::enrichment::models::{
    ContextBag, ContextEnrichmentResult, ContextSource, EnricherConfig, EnricherConfigOverride,
    EnrichmentError, EnrichmentRequest, EnrichmentStage, PipelineError,
    PipelineExecutionResult, PipelineMetrics, SkipReason, UnifiedContext,
};
use crate::enrichment::registry::EnricherRegistry;
use crate::error::{ContextError, ErrorCode, Result};
use crate::metrics::helpers;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Semaphore};
use tokio::time::{timeout, timeout_at};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use validator::Validate;

/// Pipeline-wide execution policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PipelineConfig {
    /// Concurrent enrichers within one stage
    #[validate(range(min = 1))]
    pub max_concurrency: usize,

    /// Run deadline when the request carries none (milliseconds)
    #[validate(range(min = 1))]
    pub default_timeout_ms: u64,

    /// Base retry backoff (milliseconds)
    pub retry_backoff_ms: u64,

    /// Upper bound for one backoff sleep (milliseconds)
    pub max_retry_backoff_ms: u64,

    /// Master switch for the enrichment cache
    pub cache_enabled: bool,

    /// TTL used when an enricher enables caching without its own TTL (milliseconds)
    #[validate(range(min = 1))]
    pub default_cache_ttl_ms: u64,

    /// Width of the time bucket folded into cache fingerprints
    #[validate(range(min = 1))]
    pub cache_time_bucket_secs: u64,

    /// Broadcast capacity for pipeline events; 0 disables events
    pub event_channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            default_timeout_ms: 30_000,
            retry_backoff_ms: 100,
            max_retry_backoff_ms: 2_000,
            cache_enabled: true,
            default_cache_ttl_ms: 60_000,
            cache_time_bucket_secs: 60,
            event_channel_capacity: 256,
        }
    }
}

impl PipelineConfig {
    /// Backoff before retry number `retry` (1-based), capped
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2_u64.saturating_pow(retry.saturating_sub(1));
        let ms = self
            .retry_backoff_ms
            .saturating_mul(factor)
            .min(self.max_retry_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Registered enricher with its effective policy
struct EnricherSlot {
    enricher: Arc<dyn ContextEnricher>,
    config: EnricherConfig,
    provided_keys: Vec<String>,
    cache_inputs: Vec<String>,
}

/// Collects enrichers and validates them into a pipeline
pub struct PipelineBuilder {
    config: PipelineConfig,
    enrichers: Vec<(Arc<dyn ContextEnricher>, EnricherConfig)>,
    cache: Option<EnrichmentCache>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            enrichers: Vec::new(),
            cache: None,
        }
    }

    /// Instantiate every enricher in a registry, applying per-id overrides
    pub fn from_registry(
        registry: &EnricherRegistry,
        overrides: &HashMap<String, EnricherConfigOverride>,
        config: PipelineConfig,
    ) -> Result<Self> {
        for id in overrides.keys() {
            if !registry.contains(id) {
                return Err(ContextError::EnricherNotFound(format!(
                    "'{}' (config override)",
                    id
                )));
            }
        }

        let mut builder = Self::new(config);
        for (enricher, enricher_config) in registry.create_all(overrides)? {
            builder = builder.with_enricher(enricher, enricher_config);
        }
        Ok(builder)
    }

    pub fn with_enricher(
        mut self,
        enricher: Arc<dyn ContextEnricher>,
        config: EnricherConfig,
    ) -> Self {
        self.enrichers.push((enricher, config));
        self
    }

    /// Share an existing cache, e.g. one with an eviction listener
    pub fn with_cache(mut self, cache: EnrichmentCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Validate the graph and initialize every enricher; all errors are fatal
    pub async fn build(self) -> Result<EnrichmentPipeline> {
        self.config
            .validate()
            .map_err(|e| ContextError::Configuration(format!("pipeline: {}", e)))?;

        let mut specs = Vec::with_capacity(self.enrichers.len());
        for (enricher, config) in &self.enrichers {
            config.validate_policy(enricher.id())?;
            specs.push(NodeSpec {
                enricher_id: enricher.id().to_string(),
                config: config.clone(),
                provided_keys: enricher.provided_keys(),
                required_keys: enricher.required_keys(),
            });
        }

        let graph = DependencyGraph::build(specs)?;

        let mut slots = HashMap::with_capacity(self.enrichers.len());
        for (enricher, config) in self.enrichers {
            enricher.initialize(config.clone()).await?;
            slots.insert(
                enricher.id().to_string(),
                EnricherSlot {
                    provided_keys: enricher.provided_keys(),
                    cache_inputs: enricher.cache_inputs(),
                    enricher,
                    config,
                },
            );
        }

        info!(
            enrichers = slots.len(),
            order = ?graph.execution_order(),
            "Enrichment pipeline built"
        );

        Ok(EnrichmentPipeline {
            events: EventBus::new(self.config.event_channel_capacity),
            config: Arc::new(self.config),
            graph: Arc::new(graph),
            slots,
            cache: self.cache.unwrap_or_default(),
        })
    }
}

/// What one dispatched enricher produced
struct NodeOutcome {
    enricher_id: String,
    result: ContextEnrichmentResult,
    attempts: u32,
    cache_miss: bool,
}

/// Mutable bookkeeping for one run
struct RunState {
    run_id: Uuid,
    failed: Vec<String>,
    skipped: Vec<String>,
    skip_reasons: BTreeMap<String, SkipReason>,
    errors: Vec<PipelineError>,
    warnings: Vec<String>,
    metrics: PipelineMetrics,
    trace: ContextTrace,
}

impl RunState {
    fn skip(&mut self, events: &EventBus, enricher_id: &str, reason: SkipReason) {
        debug!(enricher_id = %enricher_id, reason = %reason.describe(), "Enricher skipped");
        helpers::record_enricher(enricher_id, "skipped", None);
        events.publish(PipelineEvent::EnricherSkipped {
            run_id: self.run_id,
            enricher_id: enricher_id.to_string(),
            reason: reason.describe(),
        });
        if let Some(node) = self.trace.node_mut(enricher_id) {
            node.status = NodeStatus::Skipped;
            node.error = Some(reason.describe());
        }
        self.skipped.push(enricher_id.to_string());
        self.skip_reasons.insert(enricher_id.to_string(), reason);
    }

    fn fail(&mut self, events: &EventBus, outcome: &NodeOutcome) {
        let error = outcome
            .result
            .error
            .clone()
            .unwrap_or_else(|| EnrichmentError::new(ErrorCode::InternalError, "unknown error"));

        error!(
            enricher_id = %outcome.enricher_id,
            attempts = outcome.attempts,
            code = %error.code,
            error = %error.message,
            "Enricher failed after exhausting retries"
        );
        helpers::record_enricher(
            &outcome.enricher_id,
            "failed",
            Some(outcome.result.duration_ms as f64 / 1000.0),
        );
        events.publish(PipelineEvent::EnricherFailed {
            run_id: self.run_id,
            enricher_id: outcome.enricher_id.clone(),
            code: error.code,
            message: error.message.clone(),
            attempts: outcome.attempts,
        });
        if let Some(node) = self.trace.node_mut(&outcome.enricher_id) {
            node.status = NodeStatus::Failed;
            node.attempts = outcome.attempts;
            node.duration_ms = outcome.result.duration_ms;
            node.error = Some(error.message.clone());
        }
        self.failed.push(outcome.enricher_id.clone());
        self.errors.push(PipelineError {
            enricher_id: Some(outcome.enricher_id.clone()),
            code: error.code,
            message: error.message,
            attempts: outcome.attempts,
        });
    }

    fn is_blocking(&self, enricher_id: &str) -> bool {
        self.failed.iter().any(|f| f == enricher_id)
            || self
                .skip_reasons
                .get(enricher_id)
                .map_or(false, |r| !r.is_explicit())
    }
}

enum Readiness {
    Ready,
    Wait,
    Skip(SkipReason),
}

/// Staged, bounded-concurrency enrichment executor
pub struct EnrichmentPipeline {
    config: Arc<PipelineConfig>,
    graph: Arc<DependencyGraph>,
    slots: HashMap<String, EnricherSlot>,
    cache: EnrichmentCache,
    events: EventBus,
}

impl EnrichmentPipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn cache(&self) -> &EnrichmentCache {
        &self.cache
    }

    pub fn enricher(&self, enricher_id: &str) -> Option<Arc<dyn ContextEnricher>> {
        self.slots.get(enricher_id).map(|s| Arc::clone(&s.enricher))
    }

    /// Enricher ids in canonical execution order
    pub fn enricher_ids(&self) -> Vec<String> {
        self.graph.execution_order()
    }

    pub fn enricher_count(&self) -> usize {
        self.slots.len()
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<PipelineEvent>> {
        self.events.subscribe()
    }

    /// Run every applicable enricher for one request
    ///
    /// Never fails: per-enricher errors, skips and deadline expiry are
    /// reported in the returned manifest alongside the partial context.
    pub async fn execute(&self, request: EnrichmentRequest) -> PipelineExecutionResult {
        let start = Instant::now();
        let run_id = Uuid::new_v4();
        let deadline_ms = request.timeout_ms.unwrap_or(self.config.default_timeout_ms);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(deadline_ms);

        let mut context = UnifiedContext::new(request.agent_id.clone(), request.context.clone());
        let mut state = RunState {
            run_id,
            failed: Vec::new(),
            skipped: Vec::new(),
            skip_reasons: BTreeMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            metrics: PipelineMetrics::default(),
            trace: self.new_trace(run_id, &context),
        };
        let mut executed: Vec<String> = Vec::new();
        let mut sources: Vec<ContextSource> = Vec::new();
        let mut cache_hits = 0;

        self.events.publish(PipelineEvent::RunStarted {
            run_id,
            agent_id: request.agent_id.clone(),
            enrichers: self.slots.len(),
        });
        debug!(run_id = %run_id, agent_id = %request.agent_id, "Enrichment run started");

        for id in &request.required_enrichers {
            if !self.graph.contains(id) {
                warn!(enricher_id = %id, "Required enricher is not registered");
                state.errors.push(PipelineError {
                    enricher_id: Some(id.clone()),
                    code: ErrorCode::EnricherNotFound,
                    message: ContextError::EnricherNotFound(id.clone()).to_string(),
                    attempts: 0,
                });
            }
        }

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for stage in EnrichmentStage::ALL {
            let order = self.graph.stage_order(stage);
            if order.is_empty() {
                continue;
            }
            let stage_start = Instant::now();

            let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
            let mut pending: Vec<String> = order.to_vec();
            let mut running: HashSet<String> = HashSet::new();
            let mut finished: HashSet<String> = HashSet::new();
            let mut completed: HashMap<String, ContextEnrichmentResult> = HashMap::new();
            let mut in_flight = FuturesUnordered::new();

            loop {
                let mut i = 0;
                while i < pending.len() {
                    let id = pending[i].clone();
                    match self.readiness(&id, stage, &request, &state, &finished, deadline) {
                        Readiness::Wait => {
                            i += 1;
                        }
                        Readiness::Skip(reason) => {
                            pending.remove(i);
                            state.skip(&self.events, &id, reason);
                            finished.insert(id);
                        }
                        Readiness::Ready => {
                            pending.remove(i);
                            let snapshot = self.snapshot_for(&id, order, &context, &completed);
                            let slot = &self.slots[&id];
                            if !slot.enricher.can_enrich(&snapshot) {
                                state.skip(&self.events, &id, SkipReason::NotApplicable);
                                finished.insert(id);
                                continue;
                            }

                            running.insert(id.clone());
                            in_flight.push(self.run_node(
                                run_id,
                                slot,
                                request.with_context(snapshot),
                                deadline,
                                Arc::clone(&semaphore),
                                Arc::clone(&active),
                                Arc::clone(&peak),
                            ));
                        }
                    }
                }

                if in_flight.is_empty() {
                    break;
                }

                let next = timeout_at(deadline, in_flight.next()).await;
                match next {
                    Ok(Some(outcome)) => {
                        running.remove(&outcome.enricher_id);
                        finished.insert(outcome.enricher_id.clone());
                        self.record_outcome(&mut state, &mut completed, outcome);
                    }
                    Ok(None) => break,
                    Err(_) => {
                        self.cut_at_deadline(&mut state, deadline_ms, &mut running, &mut pending);
                        break;
                    }
                }
            }

            // Deadline may expire with nothing in flight
            for id in std::mem::take(&mut pending) {
                state.skip(&self.events, &id, SkipReason::DeadlineExceeded);
            }

            for id in order {
                let Some(result) = completed.remove(id) else {
                    continue;
                };
                let slot = &self.slots[id];
                let merge = context.merge(id, &slot.provided_keys, &result.enriched_context);
                for key in &merge.rejected {
                    let message = format!("enricher '{}' wrote undeclared key '{}'; dropped", id, key);
                    warn!(enricher_id = %id, key = %key, "Undeclared key dropped");
                    state.warnings.push(message);
                }
                for (key, previous) in &merge.overwritten {
                    state.warnings.push(format!(
                        "key '{}' from '{}' overwritten by '{}'",
                        key, previous, id
                    ));
                }
                state
                    .warnings
                    .extend(result.warnings.iter().map(|w| format!("{}: {}", id, w)));
                if result.cached {
                    cache_hits += 1;
                }
                sources.extend(result.sources);
                executed.push(id.clone());
            }

            state
                .metrics
                .stage_durations_ms
                .insert(stage.to_string(), elapsed_ms(stage_start));
        }

        let rank = |id: &String| self.graph.rank(id).unwrap_or(usize::MAX);
        state.failed.sort_by_key(rank);
        state.skipped.sort_by_key(rank);

        let success = request
            .required_enrichers
            .iter()
            .all(|id| executed.contains(id));

        let total_duration_ms = elapsed_ms(start);
        state.metrics.total_duration_ms = total_duration_ms;
        state.metrics.peak_concurrency = peak.load(Ordering::Relaxed);
        state.trace.finish();

        let result = PipelineExecutionResult {
            run_id,
            success,
            enriched_context: context,
            enrichers_executed: executed,
            enrichers_skipped: state.skipped,
            enrichers_failed: state.failed,
            skip_reasons: state.skip_reasons,
            cache_hits,
            errors: state.errors,
            sources,
            warnings: state.warnings,
            metrics: state.metrics,
            trace: state.trace,
        };

        let outcome = match (result.success, result.is_partial()) {
            (false, _) => "failed",
            (true, true) => "partial",
            (true, false) => "success",
        };
        helpers::record_pipeline_run(outcome, start.elapsed().as_secs_f64());
        self.events.publish(PipelineEvent::RunCompleted {
            run_id,
            success,
            duration_ms: total_duration_ms,
        });

        info!(
            run_id = %run_id,
            agent_id = %request.agent_id,
            outcome = outcome,
            executed = result.enrichers_executed.len(),
            skipped = result.enrichers_skipped.len(),
            failed = result.enrichers_failed.len(),
            cache_hits = result.cache_hits,
            duration_ms = total_duration_ms,
            "Enrichment run completed"
        );

        result
    }

    fn new_trace(&self, run_id: Uuid, context: &UnifiedContext) -> ContextTrace {
        let mut trace = ContextTrace::new(run_id, context.context_id, context.agent_id.clone());
        for id in self.graph.execution_order() {
            if let Some(node) = self.graph.node(&id) {
                trace.nodes.push(TraceNode {
                    enricher_id: id.clone(),
                    stage: node.stage,
                    priority: node.priority,
                    status: NodeStatus::Pending,
                    dependencies: node.dependencies.clone(),
                    attempts: 0,
                    duration_ms: 0,
                    cached: false,
                    confidence: None,
                    error: None,
                });
            }
        }
        trace.edges = self
            .graph
            .edges()
            .into_iter()
            .map(|(from, to)| TraceEdge { from, to })
            .collect();
        trace
    }

    fn readiness(
        &self,
        enricher_id: &str,
        stage: EnrichmentStage,
        request: &EnrichmentRequest,
        state: &RunState,
        finished: &HashSet<String>,
        deadline: tokio::time::Instant,
    ) -> Readiness {
        let slot = &self.slots[enricher_id];
        if !slot.config.enabled {
            return Readiness::Skip(SkipReason::Disabled);
        }
        if request.is_excluded(enricher_id) {
            return Readiness::Skip(SkipReason::Excluded);
        }
        if !slot.enricher.is_operational() {
            return Readiness::Skip(SkipReason::NotOperational);
        }

        let mut waiting = false;
        for dep in &slot.config.depends_on {
            if state.is_blocking(dep) {
                return Readiness::Skip(SkipReason::DependencyFailed {
                    dependency: dep.clone(),
                });
            }
            let same_stage = self.graph.node(dep).map_or(false, |n| n.stage == stage);
            if same_stage && !finished.contains(dep) {
                waiting = true;
            }
        }
        if waiting {
            return Readiness::Wait;
        }

        if tokio::time::Instant::now() >= deadline {
            return Readiness::Skip(SkipReason::DeadlineExceeded);
        }
        Readiness::Ready
    }

    /// Committed context plus results of completed same-stage dependencies
    fn snapshot_for(
        &self,
        enricher_id: &str,
        stage_order: &[String],
        context: &UnifiedContext,
        completed: &HashMap<String, ContextEnrichmentResult>,
    ) -> ContextBag {
        let mut snapshot = context.snapshot();
        let upstream = self.graph.transitive_dependencies(enricher_id);

        for dep in stage_order.iter().filter(|d| upstream.contains(*d)) {
            let (Some(result), Some(slot)) = (completed.get(dep), self.slots.get(dep)) else {
                continue;
            };
            for (key, value) in &result.enriched_context {
                if slot.provided_keys.contains(key) {
                    snapshot.insert(key.clone(), value.clone());
                }
            }
        }
        snapshot
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_node(
        &self,
        run_id: Uuid,
        slot: &EnricherSlot,
        request: EnrichmentRequest,
        deadline: tokio::time::Instant,
        semaphore: Arc<Semaphore>,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    ) -> NodeOutcome {
        let start = Instant::now();
        let id = slot.enricher.id().to_string();

        let _permit = match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                return NodeOutcome {
                    result: ContextEnrichmentResult::failure(
                        id.clone(),
                        elapsed_ms(start),
                        EnrichmentError::new(ErrorCode::InternalError, e.to_string()),
                    ),
                    enricher_id: id,
                    attempts: 0,
                    cache_miss: false,
                };
            }
        };
        let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now_active, Ordering::SeqCst);

        let outcome = self
            .attempt_with_cache(run_id, slot, &request, deadline, start)
            .await;

        active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn attempt_with_cache(
        &self,
        run_id: Uuid,
        slot: &EnricherSlot,
        request: &EnrichmentRequest,
        deadline: tokio::time::Instant,
        start: Instant,
    ) -> NodeOutcome {
        let id = slot.enricher.id().to_string();

        let cache_key = (self.config.cache_enabled && slot.config.cache_enabled).then(|| {
            EnrichmentCache::key_for(
                &context_identity(request),
                &request.agent_id,
                &id,
                &slot.cache_inputs,
                &request.context,
                time_bucket(Utc::now(), self.config.cache_time_bucket_secs),
            )
        });

        if let Some(key) = &cache_key {
            if let Some(mut hit) = self.cache.get(key) {
                helpers::record_cache_lookup(&id, true);
                debug!(enricher_id = %id, "Enrichment cache hit");
                hit.cached = true;
                return NodeOutcome {
                    enricher_id: id,
                    result: hit,
                    attempts: 0,
                    cache_miss: false,
                };
            }
            helpers::record_cache_lookup(&id, false);
        }

        let max_attempts = slot.config.max_retries + 1;
        let per_attempt = Duration::from_millis(slot.config.timeout_ms);
        let mut attempt = 0;

        let result = loop {
            attempt += 1;
            self.events.publish(PipelineEvent::EnricherStarted {
                run_id,
                enricher_id: id.clone(),
                attempt,
            });

            let result = match timeout(per_attempt, slot.enricher.enrich(request)).await {
                Ok(result) => result,
                Err(_) => ContextEnrichmentResult::failure(
                    id.clone(),
                    slot.config.timeout_ms,
                    EnrichmentError::from(&ContextError::Timeout(format!(
                        "enricher '{}' exceeded {}ms",
                        id, slot.config.timeout_ms
                    ))),
                ),
            };

            if result.success || attempt >= max_attempts {
                break result;
            }

            let backoff = self.config.backoff_for(attempt);
            if tokio::time::Instant::now() + backoff >= deadline {
                warn!(enricher_id = %id, attempt = attempt, "Retry abandoned, backoff would pass the run deadline");
                break result;
            }

            warn!(
                enricher_id = %id,
                attempt = attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %result.error_message(),
                "Enricher attempt failed, retrying"
            );
            helpers::record_retry(&id);
            tokio::time::sleep(backoff).await;
        };

        let mut result = result;
        result.duration_ms = elapsed_ms(start);

        if result.success {
            if let Some(key) = cache_key.clone() {
                let ttl_ms = slot
                    .config
                    .cache_ttl_ms
                    .unwrap_or(self.config.default_cache_ttl_ms);
                self.cache
                    .insert(key, result.clone(), chrono::Duration::milliseconds(ttl_ms as i64));
            }
        }

        NodeOutcome {
            enricher_id: id,
            result,
            attempts: attempt,
            cache_miss: cache_key.is_some(),
        }
    }

    fn record_outcome(
        &self,
        state: &mut RunState,
        completed: &mut HashMap<String, ContextEnrichmentResult>,
        outcome: NodeOutcome,
    ) {
        let id = outcome.enricher_id.clone();
        state
            .metrics
            .enricher_durations_ms
            .insert(id.clone(), outcome.result.duration_ms);
        state.metrics.total_retries += outcome.attempts.saturating_sub(1);
        if outcome.cache_miss {
            state.metrics.cache_misses += 1;
        }

        if !outcome.result.success {
            state.fail(&self.events, &outcome);
            return;
        }

        let status = if outcome.result.cached {
            NodeStatus::Cached
        } else {
            NodeStatus::Executed
        };
        helpers::record_enricher(
            &id,
            if outcome.result.cached { "cached" } else { "executed" },
            Some(outcome.result.duration_ms as f64 / 1000.0),
        );
        self.events.publish(PipelineEvent::EnricherCompleted {
            run_id: state.run_id,
            enricher_id: id.clone(),
            duration_ms: outcome.result.duration_ms,
            cached: outcome.result.cached,
            confidence: outcome.result.confidence,
        });
        if let Some(node) = state.trace.node_mut(&id) {
            node.status = status;
            node.attempts = outcome.attempts;
            node.duration_ms = outcome.result.duration_ms;
            node.cached = outcome.result.cached;
            node.confidence = Some(outcome.result.confidence);
        }

        completed.insert(id, outcome.result);
    }

    fn cut_at_deadline(
        &self,
        state: &mut RunState,
        deadline_ms: u64,
        running: &mut HashSet<String>,
        pending: &mut Vec<String>,
    ) {
        warn!(
            deadline_ms = deadline_ms,
            in_flight = running.len(),
            pending = pending.len(),
            "Run deadline exceeded, returning partial context"
        );
        state.errors.push(PipelineError {
            enricher_id: None,
            code: ErrorCode::Timeout,
            message: format!("request deadline of {}ms exceeded", deadline_ms),
            attempts: 0,
        });

        let mut cut: Vec<String> = running.drain().collect();
        cut.append(pending);
        cut.sort_by_key(|id| self.graph.rank(id).unwrap_or(usize::MAX));
        for id in cut {
            state.skip(&self.events, &id, SkipReason::DeadlineExceeded);
        }
    }

    /// Reclaim expired cache entries and enricher-local state
    pub fn sweep(&self) -> usize {
        let purged = self.cache.purge_expired();
        let local: usize = self
            .graph
            .execution_order()
            .iter()
            .filter_map(|id| self.slots.get(id))
            .map(|slot| slot.enricher.sweep_expired())
            .sum();
        if purged + local > 0 {
            debug!(cache = purged, local = local, "Sweep reclaimed entries");
        }
        purged + local
    }

    /// Health of every enricher in execution order
    pub async fn health_check(&self) -> Vec<EnricherHealth> {
        let checks = self
            .graph
            .execution_order()
            .into_iter()
            .filter_map(|id| self.slots.get(&id).map(|s| Arc::clone(&s.enricher)))
            .map(|enricher| async move { enricher.health_check().await });
        futures::future::join_all(checks).await
    }

    /// Dispose every enricher and drop cached results
    pub async fn dispose(&self) {
        for id in self.graph.execution_order() {
            if let Some(slot) = self.slots.get(&id) {
                slot.enricher.dispose().await;
            }
        }
        self.cache.clear();
        info!("Enrichment pipeline disposed");
    }
}

/// Cache identity: explicit key, then session/conversation id, else anonymous
fn context_identity(request: &EnrichmentRequest) -> String {
    request
        .cache_key
        .clone()
        .or_else(|| request.str_value("sessionId").map(str::to_string))
        .or_else(|| request.str_value("conversationId").map(str::to_string))
        .unwrap_or_else(|| "anonymous".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::enricher::{EnricherBase, EnrichmentOutput};
    use crate::enrichment::models::EnricherPriority;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    struct Counting {
        base: EnricherBase,
        key: String,
        calls: AtomicU32,
        fail_first: u32,
    }

    impl Counting {
        fn new(id: &str, fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                base: EnricherBase::new(id, id, EnricherConfig::default()),
                key: format!("{}Context", id),
                calls: AtomicU32::new(0),
                fail_first,
            })
        }
    }

    #[async_trait]
    impl ContextEnricher for Counting {
        fn base(&self) -> &EnricherBase {
            &self.base
        }

        fn provided_keys(&self) -> Vec<String> {
            vec![self.key.clone()]
        }

        async fn do_enrich(&self, _request: &EnrichmentRequest) -> Result<EnrichmentOutput> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                return Err(ContextError::ResourceUnavailable(format!("call {}", call)));
            }
            Ok(EnrichmentOutput::slice(&self.key, json!({ "call": call })))
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            retry_backoff_ms: 1,
            max_retry_backoff_ms: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let config = PipelineConfig {
            retry_backoff_ms: 100,
            max_retry_backoff_ms: 350,
            ..Default::default()
        };
        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for(3), Duration::from_millis(350));
        assert_eq!(config.backoff_for(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let flaky = Counting::new("flaky", 1);
        let pipeline = PipelineBuilder::new(config())
            .with_enricher(flaky.clone(), EnricherConfig::default().with_max_retries(2))
            .build()
            .await
            .unwrap();

        let result = pipeline
            .execute(EnrichmentRequest::from_json("a1", json!({})).require(["flaky"]))
            .await;

        assert!(result.success);
        assert_eq!(result.enrichers_executed, vec!["flaky"]);
        assert_eq!(result.metrics.total_retries, 1);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.trace.node("flaky").unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_cache_hit_on_second_run() {
        let cached = Counting::new("cached", 0);
        let pipeline = PipelineBuilder::new(config())
            .with_enricher(cached.clone(), EnricherConfig::default().with_cache(60_000))
            .build()
            .await
            .unwrap();

        let request = EnrichmentRequest::from_json("a1", json!({"sessionId": "s1"}));
        let first = pipeline.execute(request.clone()).await;
        let second = pipeline.execute(request).await;

        assert_eq!(first.cache_hits, 0);
        assert_eq!(second.cache_hits, 1);
        assert_eq!(cached.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            first.enriched_context.get("cachedContext"),
            second.enriched_context.get("cachedContext")
        );
        assert_eq!(second.trace.node("cached").unwrap().status, NodeStatus::Cached);
    }

    #[tokio::test]
    async fn test_excluded_and_disabled_are_explicit_skips() {
        let pipeline = PipelineBuilder::new(config())
            .with_enricher(Counting::new("a", 0), EnricherConfig::default())
            .with_enricher(Counting::new("b", 0), EnricherConfig::default().disabled())
            .with_enricher(
                Counting::new("c", 0),
                EnricherConfig::default().with_dependencies(["a", "b"]),
            )
            .build()
            .await
            .unwrap();

        let result = pipeline
            .execute(EnrichmentRequest::from_json("a1", json!({})).exclude(["a"]))
            .await;

        assert_eq!(result.enrichers_executed, vec!["c"]);
        assert_eq!(result.skip_reasons["a"], SkipReason::Excluded);
        assert_eq!(result.skip_reasons["b"], SkipReason::Disabled);
        assert!(result.success);
        assert!(!result.is_partial());
    }

    #[tokio::test]
    async fn test_unknown_required_enricher_fails_run() {
        let pipeline = PipelineBuilder::new(config())
            .with_enricher(Counting::new("a", 0), EnricherConfig::default())
            .build()
            .await
            .unwrap();

        let result = pipeline
            .execute(EnrichmentRequest::from_json("a1", json!({})).require(["ghost"]))
            .await;
        assert!(!result.success);
        assert_eq!(result.errors[0].code, ErrorCode::EnricherNotFound);
    }

    #[tokio::test]
    async fn test_events_published() {
        let pipeline = PipelineBuilder::new(config())
            .with_enricher(
                Counting::new("a", 0),
                EnricherConfig::new(EnrichmentStage::PreProcessing, EnricherPriority::High),
            )
            .build()
            .await
            .unwrap();
        let mut rx = pipeline.subscribe().unwrap();

        let result = pipeline.execute(EnrichmentRequest::from_json("a1", json!({}))).await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.run_id(), result.run_id);
            kinds.push(match event {
                PipelineEvent::RunStarted { .. } => "run_started",
                PipelineEvent::EnricherStarted { .. } => "started",
                PipelineEvent::EnricherCompleted { .. } => "completed",
                PipelineEvent::RunCompleted { .. } => "run_completed",
                _ => "other",
            });
        }
        assert_eq!(kinds, vec!["run_started", "started", "completed", "run_completed"]);
    }

    #[tokio::test]
    async fn test_invalid_pipeline_config_is_fatal() {
        let err = PipelineBuilder::new(PipelineConfig {
            max_concurrency: 0,
            ..Default::default()
        })
        .build()
        .await
        .err()
        .unwrap();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn test_context_identity() {
        let explicit = EnrichmentRequest::from_json("a1", json!({"sessionId": "s1"})).with_cache_key("k");
        assert_eq!(context_identity(&explicit), "k");
        let session = EnrichmentRequest::from_json("a1", json!({"sessionId": "s1"}));
        assert_eq!(context_identity(&session), "s1");
        let anonymous = EnrichmentRequest::from_json("a1", json!({}));
        assert_eq!(context_identity(&anonymous), "anonymous");
    }
}
