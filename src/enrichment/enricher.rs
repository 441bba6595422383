use crate::enrichment::models::{
    clamp_unit, ContextBag, ContextEnrichmentResult, EnricherConfig, EnrichmentError,
    EnrichmentRequest,
};
use crate::error::{ContextError, ErrorCode, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Enricher lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Initialized,
    Disposed,
}

/// Health report for one enricher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnricherHealth {
    pub enricher_id: String,
    pub healthy: bool,
    pub state: LifecycleState,
    pub enabled: bool,
    pub message: Option<String>,
    pub last_error: Option<String>,
    pub invocations: u64,
    pub failures: u64,
    pub checked_at: DateTime<Utc>,
}

/// Domain output of one enrichment before it is wrapped with provenance
#[derive(Debug, Clone, Default)]
pub struct EnrichmentOutput {
    pub data: ContextBag,
    /// Domain-specific confidence; the volume formula applies when unset
    pub confidence: Option<f64>,
    pub warnings: Vec<String>,
    pub description: Option<String>,
}

impl EnrichmentOutput {
    pub fn new(data: ContextBag) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    /// Single namespaced slice
    pub fn slice(key: &str, value: serde_json::Value) -> Self {
        let mut data = ContextBag::new();
        data.insert(key.to_string(), value);
        Self::new(data)
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Lifecycle and policy state every enricher carries
pub struct EnricherBase {
    id: String,
    name: String,
    version: String,
    config: RwLock<EnricherConfig>,
    state: RwLock<LifecycleState>,
    last_error: RwLock<Option<String>>,
    invocations: AtomicU64,
    failures: AtomicU64,
}

impl EnricherBase {
    pub fn new(id: impl Into<String>, name: impl Into<String>, config: EnricherConfig) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            config: RwLock::new(config),
            state: RwLock::new(LifecycleState::Uninitialized),
            last_error: RwLock::new(None),
            invocations: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn config(&self) -> EnricherConfig {
        self.config.read().clone()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    fn set_state(&self, state: LifecycleState) {
        *self.state.write() = state;
    }

    fn set_config(&self, config: EnricherConfig) {
        *self.config.write() = config;
    }

    fn record_invocation(&self) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self, message: &str) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.write() = Some(message.to_string());
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// enabled && initialized && !disposed
    pub fn is_operational(&self) -> bool {
        self.state() == LifecycleState::Initialized && self.config.read().enabled
    }
}

/// Pluggable component deriving one namespaced slice of context
///
/// Implementors supply the domain hooks (`provided_keys`, `required_keys`,
/// `can_enrich`, `do_enrich`, `calculate_confidence`); lifecycle handling,
/// operability checks, provenance and timing are provided.
#[async_trait]
pub trait ContextEnricher: Send + Sync + 'static {
    /// Shared lifecycle state
    fn base(&self) -> &EnricherBase;

    fn id(&self) -> &str {
        self.base().id()
    }

    fn name(&self) -> &str {
        self.base().name()
    }

    /// Top-level keys this enricher writes
    fn provided_keys(&self) -> Vec<String>;

    /// Top-level keys this enricher reads
    fn required_keys(&self) -> Vec<String> {
        Vec::new()
    }

    /// Context keys whose values feed the cache fingerprint
    fn cache_inputs(&self) -> Vec<String> {
        self.required_keys()
    }

    /// Applicability for a given context
    fn can_enrich(&self, context: &ContextBag) -> bool {
        self.required_keys()
            .iter()
            .all(|key| context.get(key).map_or(false, |v| !v.is_null()))
    }

    /// Enricher-specific setup run by `initialize`
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    /// Domain logic
    async fn do_enrich(&self, request: &EnrichmentRequest) -> Result<EnrichmentOutput>;

    /// Confidence in [0, 1]
    fn calculate_confidence(&self, base: &ContextBag, output: &EnrichmentOutput) -> f64 {
        output
            .confidence
            .map(clamp_unit)
            .unwrap_or_else(|| volume_confidence(base.len(), output.data.len()))
    }

    /// Health of external collaborators
    async fn check_collaborators(&self) -> Result<()> {
        Ok(())
    }

    /// Reclaim long-lived local state; returns entries removed
    fn sweep_expired(&self) -> usize {
        0
    }

    /// Enricher-specific teardown run once by `dispose`
    async fn teardown(&self) {}

    fn config(&self) -> EnricherConfig {
        self.base().config()
    }

    fn is_operational(&self) -> bool {
        self.base().is_operational()
    }

    /// Validate policy and run setup
    async fn initialize(&self, config: EnricherConfig) -> Result<()> {
        if self.base().state() == LifecycleState::Disposed {
            return Err(ContextError::Configuration(format!(
                "enricher '{}' is disposed",
                self.id()
            )));
        }

        config.validate_policy(self.id())?;
        self.base().set_config(config);
        self.setup().await?;
        self.base().set_state(LifecycleState::Initialized);

        info!(enricher_id = %self.id(), "Enricher initialized");
        Ok(())
    }

    /// Run the domain logic and wrap the result with provenance and timing
    async fn enrich(&self, request: &EnrichmentRequest) -> ContextEnrichmentResult {
        let start = Instant::now();
        let id = self.id().to_string();

        if !self.is_operational() {
            return ContextEnrichmentResult::failure(
                id.clone(),
                elapsed_ms(start),
                EnrichmentError::new(
                    ErrorCode::ResourceUnavailable,
                    format!("enricher '{}' is not operational", id),
                ),
            );
        }

        if !self.can_enrich(&request.context) {
            return ContextEnrichmentResult::failure(
                id.clone(),
                elapsed_ms(start),
                EnrichmentError::new(
                    ErrorCode::ValidationFailed,
                    format!("enricher '{}' cannot enrich this context", id),
                ),
            );
        }

        self.base().record_invocation();

        match self.do_enrich(request).await {
            Ok(output) => {
                let confidence = clamp_unit(self.calculate_confidence(&request.context, &output));
                let duration_ms = elapsed_ms(start);
                debug!(
                    enricher_id = %id,
                    duration_ms = duration_ms,
                    confidence = confidence,
                    "Enrichment succeeded"
                );

                let description = output.description.clone();
                let mut result = ContextEnrichmentResult::success(
                    id,
                    output.data,
                    confidence,
                    duration_ms,
                )
                .with_warnings(output.warnings);
                if let Some(description) = description {
                    result = result.with_description(description);
                }
                result
            }
            Err(e) => {
                self.base().record_failure(&e.to_string());
                warn!(enricher_id = %id, error = %e, "Enrichment failed");
                ContextEnrichmentResult::failure(id, elapsed_ms(start), EnrichmentError::from(&e))
            }
        }
    }

    async fn health_check(&self) -> EnricherHealth {
        let base = self.base();
        let collaborators = self.check_collaborators().await;
        let operational = base.is_operational();

        let message = match (&collaborators, operational) {
            (Err(e), _) => Some(e.to_string()),
            (Ok(()), false) => Some(format!("state={}", base.state())),
            (Ok(()), true) => None,
        };

        EnricherHealth {
            enricher_id: self.id().to_string(),
            healthy: operational && collaborators.is_ok(),
            state: base.state(),
            enabled: base.config().enabled,
            message,
            last_error: base.last_error(),
            invocations: base.invocations(),
            failures: base.failures(),
            checked_at: Utc::now(),
        }
    }

    /// Idempotent
    async fn dispose(&self) {
        if self.base().state() == LifecycleState::Disposed {
            return;
        }
        self.teardown().await;
        self.base().set_state(LifecycleState::Disposed);
        debug!(enricher_id = %self.id(), "Enricher disposed");
    }
}

/// Default confidence: enriched volume weighed against base context size
pub fn volume_confidence(base_keys: usize, enriched_keys: usize) -> f64 {
    if enriched_keys == 0 {
        return 0.0;
    }
    let ratio = enriched_keys as f64 / (enriched_keys + base_keys) as f64;
    clamp_unit(0.5 + 0.5 * ratio)
}

pub(crate) fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
