use crate::enrichment::events::ContextTrace;
use crate::error::{ContextError, ErrorCode, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;
use validator::Validate;

/// Plain keyed bag carried through enrichment
pub type ContextBag = serde_json::Map<String, Value>;

/// Enricher priority, ordered LOW < MEDIUM < HIGH < CRITICAL
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EnricherPriority {
    Low = 0,
    #[default]
    Medium = 1,
    High = 2,
    Critical = 3,
}

/// Ordered execution phase
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrichmentStage {
    PreProcessing,
    #[default]
    CoreEnrichment,
    PostProcessing,
    Finalization,
}

impl EnrichmentStage {
    pub const ALL: [EnrichmentStage; 4] = [
        EnrichmentStage::PreProcessing,
        EnrichmentStage::CoreEnrichment,
        EnrichmentStage::PostProcessing,
        EnrichmentStage::Finalization,
    ];
}

/// Policy for one enricher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EnricherConfig {
    /// Enricher participates in runs
    pub enabled: bool,

    /// Tie-break within a stage
    pub priority: EnricherPriority,

    /// Execution phase
    pub stage: EnrichmentStage,

    /// Per-attempt timeout (milliseconds)
    #[validate(range(min = 1))]
    pub timeout_ms: u64,

    /// Retries after the first attempt
    pub max_retries: u32,

    /// Memoize results in the enrichment cache
    pub cache_enabled: bool,

    /// Cache TTL (milliseconds); pipeline default when unset
    #[validate(range(min = 1))]
    pub cache_ttl_ms: Option<u64>,

    /// Enricher ids that must finish first
    pub depends_on: Vec<String>,
}

impl Default for EnricherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: EnricherPriority::Medium,
            stage: EnrichmentStage::CoreEnrichment,
            timeout_ms: 5_000,
            max_retries: 1,
            cache_enabled: false,
            cache_ttl_ms: None,
            depends_on: Vec::new(),
        }
    }
}

impl EnricherConfig {
    pub fn new(stage: EnrichmentStage, priority: EnricherPriority) -> Self {
        Self {
            stage,
            priority,
            ..Default::default()
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_cache(mut self, ttl_ms: u64) -> Self {
        self.cache_enabled = true;
        self.cache_ttl_ms = Some(ttl_ms);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Validate the policy; failures are CONFIGURATION_ERROR
    pub fn validate_policy(&self, enricher_id: &str) -> Result<()> {
        self.validate().map_err(|e| {
            ContextError::Configuration(format!("enricher '{}': {}", enricher_id, e))
        })?;

        if self.depends_on.iter().any(|d| d == enricher_id) {
            return Err(ContextError::Configuration(format!(
                "enricher '{}' depends on itself",
                enricher_id
            )));
        }

        let mut seen = HashSet::new();
        for dep in &self.depends_on {
            if !seen.insert(dep) {
                return Err(ContextError::Configuration(format!(
                    "enricher '{}' lists dependency '{}' twice",
                    enricher_id, dep
                )));
            }
        }

        Ok(())
    }
}

/// Partial override applied on top of a registered default config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnricherConfigOverride {
    pub enabled: Option<bool>,
    pub priority: Option<EnricherPriority>,
    pub stage: Option<EnrichmentStage>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub cache_enabled: Option<bool>,
    pub cache_ttl_ms: Option<u64>,
    pub depends_on: Option<Vec<String>>,
}

impl EnricherConfigOverride {
    pub fn apply(&self, base: &EnricherConfig) -> EnricherConfig {
        EnricherConfig {
            enabled: self.enabled.unwrap_or(base.enabled),
            priority: self.priority.unwrap_or(base.priority),
            stage: self.stage.unwrap_or(base.stage),
            timeout_ms: self.timeout_ms.unwrap_or(base.timeout_ms),
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            cache_enabled: self.cache_enabled.unwrap_or(base.cache_enabled),
            cache_ttl_ms: self.cache_ttl_ms.or(base.cache_ttl_ms),
            depends_on: self
                .depends_on
                .clone()
                .unwrap_or_else(|| base.depends_on.clone()),
        }
    }
}

/// One enrichment call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentRequest {
    pub request_id: Uuid,

    /// Agent the context is assembled for
    pub agent_id: String,

    /// Input bag; enrichers receive a snapshot of it plus upstream output
    pub context: ContextBag,

    /// Enrichers whose failure fails the run
    #[serde(default)]
    pub required_enrichers: Vec<String>,

    /// Enrichers not to run for this request
    #[serde(default)]
    pub excluded_enrichers: Vec<String>,

    /// Whole-run deadline (milliseconds)
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub priority: EnricherPriority,

    /// Caller-supplied context identity for cache fingerprints
    pub cache_key: Option<String>,
}

impl EnrichmentRequest {
    pub fn new(agent_id: impl Into<String>, context: ContextBag) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            context,
            required_enrichers: Vec::new(),
            excluded_enrichers: Vec::new(),
            timeout_ms: None,
            priority: EnricherPriority::Medium,
            cache_key: None,
        }
    }

    /// Build from a JSON object literal; non-objects yield an empty bag
    pub fn from_json(agent_id: impl Into<String>, context: Value) -> Self {
        let bag = match context {
            Value::Object(map) => map,
            _ => ContextBag::new(),
        };
        Self::new(agent_id, bag)
    }

    pub fn require<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_enrichers = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn exclude<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_enrichers = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    /// Same request carrying a different context bag
    pub fn with_context(&self, context: ContextBag) -> Self {
        Self {
            context,
            ..self.clone()
        }
    }

    /// String value of a top-level key
    pub fn str_value(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str)
    }

    pub fn is_required(&self, enricher_id: &str) -> bool {
        self.required_enrichers.iter().any(|id| id == enricher_id)
    }

    pub fn is_excluded(&self, enricher_id: &str) -> bool {
        self.excluded_enrichers.iter().any(|id| id == enricher_id)
    }
}

/// Provenance of an enriched slice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSource {
    pub enricher_id: String,
    pub timestamp: DateTime<Utc>,
    /// 0.0 - 1.0
    pub confidence: f64,
    pub description: Option<String>,
}

/// Error record attached to results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentError {
    pub code: ErrorCode,
    pub message: String,
}

impl EnrichmentError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<&ContextError> for EnrichmentError {
    fn from(err: &ContextError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// One enricher's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEnrichmentResult {
    pub enricher_id: String,
    pub success: bool,
    pub enriched_context: ContextBag,
    pub sources: Vec<ContextSource>,
    /// 0.0 - 1.0
    pub confidence: f64,
    pub duration_ms: u64,
    pub cached: bool,
    pub error: Option<EnrichmentError>,
    pub warnings: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl ContextEnrichmentResult {
    pub fn success(
        enricher_id: impl Into<String>,
        enriched_context: ContextBag,
        confidence: f64,
        duration_ms: u64,
    ) -> Self {
        let enricher_id = enricher_id.into();
        let confidence = clamp_unit(confidence);
        let timestamp = Utc::now();
        Self {
            sources: vec![ContextSource {
                enricher_id: enricher_id.clone(),
                timestamp,
                confidence,
                description: None,
            }],
            enricher_id,
            success: true,
            enriched_context,
            confidence,
            duration_ms,
            cached: false,
            error: None,
            warnings: Vec::new(),
            timestamp,
        }
    }

    pub fn failure(enricher_id: impl Into<String>, duration_ms: u64, error: EnrichmentError) -> Self {
        Self {
            enricher_id: enricher_id.into(),
            success: false,
            enriched_context: ContextBag::new(),
            sources: Vec::new(),
            confidence: 0.0,
            duration_ms,
            cached: false,
            error: Some(error),
            warnings: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        let description = description.into();
        for source in &mut self.sources {
            source.description = Some(description.clone());
        }
        self
    }

    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "unknown error".to_string())
    }
}

/// Keys written and discarded by one merge
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    pub written: Vec<String>,
    /// (key, previous writer)
    pub overwritten: Vec<(String, String)>,
    /// Keys outside the writer's declared set
    pub rejected: Vec<String>,
}

/// Accumulated, namespaced context for one interaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedContext {
    pub context_id: Uuid,
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Request input
    pub base: ContextBag,

    /// Enriched slices keyed by namespace
    pub data: ContextBag,

    /// key -> enricher that wrote it
    pub provenance: BTreeMap<String, String>,
}

impl UnifiedContext {
    pub fn new(agent_id: impl Into<String>, base: ContextBag) -> Self {
        let now = Utc::now();
        Self {
            context_id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            created_at: now,
            updated_at: now,
            base,
            data: ContextBag::new(),
            provenance: BTreeMap::new(),
        }
    }

    /// Rebuild an existing context identity around a fresh base bag
    pub fn restore(
        context_id: Uuid,
        agent_id: impl Into<String>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        base: ContextBag,
    ) -> Self {
        Self {
            context_id,
            agent_id: agent_id.into(),
            created_at,
            updated_at,
            base,
            data: ContextBag::new(),
            provenance: BTreeMap::new(),
        }
    }

    /// Enriched value first, then request input
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key).or_else(|| self.base.get(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn writer_of(&self, key: &str) -> Option<&str> {
        self.provenance.get(key).map(String::as_str)
    }

    /// Merge one enricher's bag; only declared keys are accepted
    pub fn merge(
        &mut self,
        enricher_id: &str,
        declared_keys: &[String],
        bag: &ContextBag,
    ) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        for (key, value) in bag {
            if !declared_keys.iter().any(|k| k == key) {
                outcome.rejected.push(key.clone());
                continue;
            }

            if let Some(previous) = self.provenance.get(key) {
                if previous != enricher_id {
                    outcome.overwritten.push((key.clone(), previous.clone()));
                }
            }

            self.data.insert(key.clone(), value.clone());
            self.provenance.insert(key.clone(), enricher_id.to_string());
            outcome.written.push(key.clone());
        }

        if !outcome.written.is_empty() {
            self.updated_at = Utc::now();
        }

        outcome
    }

    /// Flattened view: request input overlaid with enriched slices
    pub fn snapshot(&self) -> ContextBag {
        let mut bag = self.base.clone();
        for (key, value) in &self.data {
            bag.insert(key.clone(), value.clone());
        }
        bag
    }

    /// Serialized size in bytes
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

/// Why an enricher did not run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    Excluded,
    NotApplicable,
    NotOperational,
    DependencyFailed { dependency: String },
    DeadlineExceeded,
}

impl SkipReason {
    /// Explicit skips let dependents proceed
    pub fn is_explicit(&self) -> bool {
        matches!(
            self,
            SkipReason::Disabled
                | SkipReason::Excluded
                | SkipReason::NotApplicable
                | SkipReason::NotOperational
        )
    }

    pub fn describe(&self) -> String {
        match self {
            SkipReason::Disabled => "enricher disabled".to_string(),
            SkipReason::Excluded => "excluded by request".to_string(),
            SkipReason::NotApplicable => "context not applicable".to_string(),
            SkipReason::NotOperational => "enricher not operational".to_string(),
            SkipReason::DependencyFailed { dependency } => {
                format!("dependency '{}' did not complete", dependency)
            }
            SkipReason::DeadlineExceeded => "request deadline exceeded".to_string(),
        }
    }
}

/// Error recorded by a pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineError {
    pub enricher_id: Option<String>,
    pub code: ErrorCode,
    pub message: String,
    pub attempts: u32,
}

/// Per-run measurements
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineMetrics {
    pub total_duration_ms: u64,
    pub enricher_durations_ms: BTreeMap<String, u64>,
    pub stage_durations_ms: BTreeMap<String, u64>,
    pub total_retries: u32,
    pub cache_misses: usize,
    pub peak_concurrency: usize,
}

/// Outcome of one pipeline run: the context plus its manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineExecutionResult {
    pub run_id: Uuid,
    pub success: bool,
    pub enriched_context: UnifiedContext,
    pub enrichers_executed: Vec<String>,
    pub enrichers_skipped: Vec<String>,
    pub enrichers_failed: Vec<String>,
    pub skip_reasons: BTreeMap<String, SkipReason>,
    pub cache_hits: usize,
    pub errors: Vec<PipelineError>,
    pub sources: Vec<ContextSource>,
    pub warnings: Vec<String>,
    pub metrics: PipelineMetrics,
    pub trace: ContextTrace,
}

impl PipelineExecutionResult {
    /// Get total enrichers considered
    pub fn total_enrichers(&self) -> usize {
        self.enrichers_executed.len() + self.enrichers_skipped.len() + self.enrichers_failed.len()
    }

    /// Fraction of attempted enrichers that succeeded
    pub fn success_rate(&self) -> f64 {
        let attempted = self.enrichers_executed.len() + self.enrichers_failed.len();
        if attempted == 0 {
            return 0.0;
        }
        self.enrichers_executed.len() as f64 / attempted as f64
    }

    /// Some enricher failed or was skipped for a non-explicit reason
    pub fn is_partial(&self) -> bool {
        !self.enrichers_failed.is_empty()
            || self.skip_reasons.values().any(|r| !r.is_explicit())
    }

    pub fn confidence_of(&self, enricher_id: &str) -> Option<f64> {
        self.sources
            .iter()
            .find(|s| s.enricher_id == enricher_id)
            .map(|s| s.confidence)
    }
}

/// Clamp a score to [0, 1]; NaN maps to 0
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
