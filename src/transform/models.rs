use crate::enrichment::models::clamp_unit;
use crate::error::{ContextError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;
use validator::Validate;

/// How much of the extracted view survives a transform
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TransformationStrategy {
    /// No pruning
    Full,
    /// Default field subset, lists truncated
    #[default]
    Selective,
    /// Threshold filter, sorted by significance
    Optimized,
    /// Hard caps on every list
    Minimal,
    /// Selective with caching forced on
    Cached,
}

impl TransformationStrategy {
    pub const ALL: [TransformationStrategy; 5] = [
        TransformationStrategy::Full,
        TransformationStrategy::Selective,
        TransformationStrategy::Optimized,
        TransformationStrategy::Minimal,
        TransformationStrategy::Cached,
    ];

    /// Pruning strategy actually applied
    pub fn effective(self) -> Self {
        match self {
            TransformationStrategy::Cached => TransformationStrategy::Selective,
            other => other,
        }
    }

    pub fn forces_cache(self) -> bool {
        matches!(self, TransformationStrategy::Cached)
    }
}

/// Per-list caps used by MINIMAL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinimalCaps {
    pub thought_history: usize,
    pub reasoning_chain: usize,
    pub decisions: usize,
    pub goals: usize,
    pub plans: usize,
    pub constraints: usize,
    pub focus_terms: usize,
    pub memory_references: usize,
}

impl Default for MinimalCaps {
    fn default() -> Self {
        Self {
            thought_history: 3,
            reasoning_chain: 5,
            decisions: 3,
            goals: 3,
            plans: 2,
            constraints: 3,
            focus_terms: 5,
            memory_references: 3,
        }
    }
}

impl MinimalCaps {
    fn largest(&self) -> usize {
        [
            self.thought_history,
            self.reasoning_chain,
            self.decisions,
            self.goals,
            self.plans,
            self.constraints,
            self.focus_terms,
            self.memory_references,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }
}

/// Options for one transform call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TransformationConfig {
    pub strategy: TransformationStrategy,

    /// Cache the result regardless of strategy
    pub cache: bool,

    #[validate(range(min = 0.0, max = 1.0))]
    pub relevance_threshold: f64,

    #[validate(range(min = 0.0, max = 1.0))]
    pub importance_threshold: f64,

    /// List length kept by SELECTIVE
    #[validate(range(min = 1))]
    pub selective_limit: usize,

    pub minimal: MinimalCaps,
}

impl Default for TransformationConfig {
    fn default() -> Self {
        Self {
            strategy: TransformationStrategy::Selective,
            cache: false,
            relevance_threshold: 0.5,
            importance_threshold: 0.5,
            selective_limit: 10,
            minimal: MinimalCaps::default(),
        }
    }
}

impl TransformationConfig {
    pub fn with_strategy(strategy: TransformationStrategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    pub fn cached(mut self) -> Self {
        self.cache = true;
        self
    }

    /// Derive-level rules plus MINIMAL never exceeding SELECTIVE
    pub fn check(&self) -> Result<()> {
        self.validate()?;
        if self.minimal.largest() > self.selective_limit {
            return Err(ContextError::Configuration(format!(
                "minimal caps ({}) exceed selective_limit ({})",
                self.minimal.largest(),
                self.selective_limit
            )));
        }
        Ok(())
    }

    pub fn should_cache(&self) -> bool {
        self.cache || self.strategy.forces_cache()
    }
}

/// Transformer-level settings loaded from configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformSettings {
    /// Applied when the caller passes no config
    pub defaults: TransformationConfig,
    pub cache_ttl_secs: u64,
    pub cache_capacity: u64,
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            defaults: TransformationConfig::default(),
            cache_ttl_secs: 60,
            cache_capacity: 1_000,
        }
    }
}

/// What a transform changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformationMetadata {
    pub transformer_id: String,
    pub transformer_version: String,
    pub strategy: TransformationStrategy,
    pub effective_strategy: TransformationStrategy,
    pub fields_transformed: Vec<String>,
    pub fields_dropped: Vec<String>,
    pub fields_added: Vec<String>,
    /// List entries removed by pruning
    pub items_pruned: usize,
    /// Surviving entries moved out of their input order
    #[serde(default)]
    pub items_reordered: usize,
    /// Serialized JSON bytes
    pub input_size: usize,
    pub output_size: usize,
    pub source_context_id: Uuid,
    pub source_agent_id: String,
    pub source_created_at: DateTime<Utc>,
    pub source_updated_at: DateTime<Utc>,
    pub transformed_at: DateTime<Utc>,
}

impl TransformationMetadata {
    /// Information was removed or reordered and cannot be reconstructed
    pub fn is_lossy(&self) -> bool {
        !self.fields_dropped.is_empty() || self.items_pruned > 0 || self.items_reordered > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformationPerformance {
    pub duration_ms: f64,
    /// Output bytes minus input bytes
    pub memory_delta: i64,
    /// Input bytes over output bytes
    pub compression_ratio: f64,
    /// Input bytes per second
    pub throughput: f64,
}

impl TransformationPerformance {
    pub fn measure(input_size: usize, output_size: usize, duration_ms: f64) -> Self {
        let compression_ratio = if output_size == 0 {
            0.0
        } else {
            input_size as f64 / output_size as f64
        };
        let throughput = if duration_ms > 0.0 {
            input_size as f64 / (duration_ms / 1_000.0)
        } else {
            0.0
        };

        Self {
            duration_ms,
            memory_delta: output_size as i64 - input_size as i64,
            compression_ratio,
            throughput,
        }
    }
}

/// Outcome of one transform call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformationResult<T> {
    pub success: bool,
    pub transformed_context: Option<T>,
    pub strategy: TransformationStrategy,
    pub metadata: Option<TransformationMetadata>,
    pub performance: TransformationPerformance,
    pub reversible: bool,
    pub cached: bool,
    pub error: Option<String>,
}

impl<T> TransformationResult<T> {
    pub fn failure(strategy: TransformationStrategy, error: impl Into<String>) -> Self {
        Self {
            success: false,
            transformed_context: None,
            strategy,
            metadata: None,
            performance: TransformationPerformance::default(),
            reversible: false,
            cached: false,
            error: Some(error.into()),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    fn penalty(self) -> f64 {
        match self {
            Severity::Info => 0.0,
            Severity::Warning => 0.05,
            Severity::Error => 0.25,
            Severity::Critical => 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
    pub severity: Severity,
}

impl ValidationIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity,
        }
    }
}

/// Field-level validation report; never raised as an error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    /// 1.0 minus severity penalties, clamped
    pub score: f64,
    /// Error and Critical issues
    pub errors: Vec<ValidationIssue>,
    /// Info and Warning issues
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn from_issues(issues: Vec<ValidationIssue>) -> Self {
        let penalty: f64 = issues.iter().map(|i| i.severity.penalty()).sum();
        let (errors, warnings): (Vec<_>, Vec<_>) = issues
            .into_iter()
            .partition(|i| i.severity >= Severity::Error);

        Self {
            valid: errors.is_empty(),
            score: clamp_unit(1.0 - penalty),
            errors,
            warnings,
        }
    }

    pub fn has_critical(&self) -> bool {
        self.errors.iter().any(|i| i.severity == Severity::Critical)
    }
}

/// Static limits and features of a transformer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformerCapabilities {
    pub max_input_size: usize,
    pub max_output_size: usize,
    pub cacheable: bool,
    pub streamable: bool,
    pub reversible: bool,
    pub supported_strategies: Vec<TransformationStrategy>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_strategy_names() {
        assert_eq!(TransformationStrategy::Minimal.to_string(), "MINIMAL");
        assert_eq!(
            TransformationStrategy::from_str("OPTIMIZED").unwrap(),
            TransformationStrategy::Optimized
        );
        assert_eq!(
            serde_json::to_value(TransformationStrategy::Cached).unwrap(),
            serde_json::json!("CACHED")
        );
    }

    #[test]
    fn test_cached_means_selective() {
        assert_eq!(
            TransformationStrategy::Cached.effective(),
            TransformationStrategy::Selective
        );
        assert!(TransformationConfig::with_strategy(TransformationStrategy::Cached).should_cache());
        assert!(!TransformationConfig::default().should_cache());
        assert!(TransformationConfig::default().cached().should_cache());
    }

    #[test]
    fn test_config_check() {
        assert!(TransformationConfig::default().check().is_ok());

        let bad_threshold = TransformationConfig {
            relevance_threshold: 1.5,
            ..Default::default()
        };
        assert!(bad_threshold.check().is_err());

        let caps_too_large = TransformationConfig {
            selective_limit: 2,
            ..Default::default()
        };
        assert!(matches!(
            caps_too_large.check(),
            Err(ContextError::Configuration(_))
        ));
    }

    #[test]
    fn test_validation_scoring() {
        let result = ValidationResult::from_issues(vec![
            ValidationIssue::new("thoughts", "empty", Severity::Warning),
            ValidationIssue::new("thoughts[0].content", "blank", Severity::Error),
            ValidationIssue::new("memoryContext", "absent", Severity::Info),
        ]);

        assert!(!result.valid);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.warnings.len(), 2);
        assert!((result.score - 0.7).abs() < 1e-9);
        assert!(!result.has_critical());
    }

    #[test]
    fn test_performance_measure() {
        let perf = TransformationPerformance::measure(1000, 250, 2.0);
        assert_eq!(perf.memory_delta, -750);
        assert_eq!(perf.compression_ratio, 4.0);
        assert_eq!(perf.throughput, 500_000.0);
    }
}
