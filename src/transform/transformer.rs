use crate::enrichment::models::{ContextBag, UnifiedContext};
use crate::error::{ContextError, Result};
use crate::metrics::helpers;
use crate::transform::models::{
    TransformSettings, TransformationConfig, TransformationMetadata, TransformationPerformance,
    TransformationResult, TransformationStrategy, TransformerCapabilities, ValidationResult,
};
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Pruned view plus what pruning removed
#[derive(Debug, Clone, PartialEq)]
pub struct PruneOutcome<T> {
    pub output: T,
    pub fields_dropped: Vec<String>,
    pub items_pruned: usize,
    pub items_reordered: usize,
}

impl<T> PruneOutcome<T> {
    pub fn untouched(output: T) -> Self {
        Self {
            output,
            fields_dropped: Vec::new(),
            items_pruned: 0,
            items_reordered: 0,
        }
    }
}

/// Converts a unified context into a consumer-specific shape
pub trait ContextTransformer: Send + Sync + 'static {
    type Output: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    fn id(&self) -> &str;

    fn version(&self) -> &str;

    /// Consumer the output is shaped for
    fn target(&self) -> &str;

    fn supported_strategies(&self) -> Vec<TransformationStrategy> {
        TransformationStrategy::ALL.to_vec()
    }

    fn reversible(&self) -> bool {
        false
    }

    fn capabilities(&self) -> TransformerCapabilities {
        TransformerCapabilities {
            max_input_size: 1024 * 1024,
            max_output_size: 1024 * 1024,
            cacheable: true,
            streamable: false,
            reversible: self.reversible(),
            supported_strategies: self.supported_strategies(),
        }
    }

    /// Unpruned view of the context
    fn extract(&self, context: &UnifiedContext) -> Result<Self::Output>;

    /// Apply a non-caching strategy to an extracted view
    fn prune(
        &self,
        view: Self::Output,
        strategy: TransformationStrategy,
        config: &TransformationConfig,
    ) -> PruneOutcome<Self::Output>;

    fn validate(&self, context: &UnifiedContext) -> ValidationResult;

    /// Rebuild a context bag from a lossless output
    fn reverse(&self, _output: &Self::Output) -> Result<ContextBag> {
        Err(ContextError::Transformation(format!(
            "transformer '{}' is not reversible",
            self.id()
        )))
    }
}

/// Drives a transformer: config checks, strategy application, metadata and caching
pub struct TransformEngine<T: ContextTransformer> {
    transformer: Arc<T>,
    cache: Cache<String, TransformationResult<T::Output>>,
    defaults: TransformationConfig,
}

impl<T: ContextTransformer> TransformEngine<T> {
    pub fn new(transformer: T, settings: &TransformSettings) -> Self {
        let cache = Cache::builder()
            .max_capacity(settings.cache_capacity)
            .time_to_live(Duration::from_secs(settings.cache_ttl_secs.max(1)))
            .build();

        Self {
            transformer: Arc::new(transformer),
            cache,
            defaults: settings.defaults.clone(),
        }
    }

    pub fn transformer(&self) -> &T {
        &self.transformer
    }

    pub fn defaults(&self) -> &TransformationConfig {
        &self.defaults
    }

    /// `context_id:version:strategy:minute`
    pub fn cache_key(
        context: &UnifiedContext,
        version: &str,
        strategy: TransformationStrategy,
        now: DateTime<Utc>,
    ) -> String {
        format!(
            "{}:{}:{}:{}",
            context.context_id,
            version,
            strategy,
            now.timestamp().div_euclid(60)
        )
    }

    pub fn validate(&self, context: &UnifiedContext) -> ValidationResult {
        self.transformer.validate(context)
    }

    pub async fn transform(
        &self,
        context: &UnifiedContext,
        config: Option<&TransformationConfig>,
    ) -> TransformationResult<T::Output> {
        self.transform_at(context, config, Utc::now()).await
    }

    pub async fn transform_at(
        &self,
        context: &UnifiedContext,
        config: Option<&TransformationConfig>,
        now: DateTime<Utc>,
    ) -> TransformationResult<T::Output> {
        let config = config.unwrap_or(&self.defaults);
        let strategy = config.strategy;
        let transformer_id = self.transformer.id().to_string();

        if let Err(e) = config.check() {
            warn!(transformer = %transformer_id, error = %e, "Rejected transformation config");
            return TransformationResult::failure(strategy, e.to_string());
        }
        if !self.transformer.supported_strategies().contains(&strategy) {
            return TransformationResult::failure(
                strategy,
                format!("transformer '{}' does not support {}", transformer_id, strategy),
            );
        }

        let cache_key = config.should_cache().then(|| {
            Self::cache_key(context, self.transformer.version(), strategy.effective(), now)
        });

        if let Some(key) = &cache_key {
            if let Some(mut hit) = self.cache.get(key).await {
                debug!(transformer = %transformer_id, key = %key, "Transformation cache hit");
                hit.cached = true;
                hit.strategy = strategy;
                if let Some(metadata) = hit.metadata.as_mut() {
                    metadata.strategy = strategy;
                }
                return hit;
            }
        }

        let start = Instant::now();
        let result = match self.run(context, config, now) {
            Ok(result) => result,
            Err(e) => {
                warn!(transformer = %transformer_id, strategy = %strategy, error = %e, "Transformation failed");
                helpers::record_transformation(
                    &transformer_id,
                    &strategy.to_string(),
                    "failure",
                    start.elapsed().as_secs_f64(),
                );
                return TransformationResult::failure(strategy, e.to_string());
            }
        };

        helpers::record_transformation(
            &transformer_id,
            &strategy.to_string(),
            "success",
            start.elapsed().as_secs_f64(),
        );

        if let Some(key) = cache_key {
            self.cache.insert(key, result.clone()).await;
        }
        result
    }

    fn run(
        &self,
        context: &UnifiedContext,
        config: &TransformationConfig,
        now: DateTime<Utc>,
    ) -> Result<TransformationResult<T::Output>> {
        let start = Instant::now();
        let capabilities = self.transformer.capabilities();
        let snapshot = context.snapshot();
        let input_size = serde_json::to_vec(&snapshot)?.len();

        if input_size > capabilities.max_input_size {
            return Err(ContextError::Transformation(format!(
                "input of {} bytes exceeds limit of {}",
                input_size, capabilities.max_input_size
            )));
        }

        let view = self.transformer.extract(context)?;
        let pruned = self
            .transformer
            .prune(view, config.strategy.effective(), config);

        let output_json = serde_json::to_value(&pruned.output)?;
        let output_size = serde_json::to_vec(&output_json)?.len();
        if output_size > capabilities.max_output_size {
            return Err(ContextError::Transformation(format!(
                "output of {} bytes exceeds limit of {}",
                output_size, capabilities.max_output_size
            )));
        }

        let (fields_transformed, fields_added) = field_report(&output_json, &snapshot);
        let duration_ms = start.elapsed().as_secs_f64() * 1_000.0;

        let metadata = TransformationMetadata {
            transformer_id: self.transformer.id().to_string(),
            transformer_version: self.transformer.version().to_string(),
            strategy: config.strategy,
            effective_strategy: config.strategy.effective(),
            fields_transformed,
            fields_dropped: pruned.fields_dropped,
            fields_added,
            items_pruned: pruned.items_pruned,
            items_reordered: pruned.items_reordered,
            input_size,
            output_size,
            source_context_id: context.context_id,
            source_agent_id: context.agent_id.clone(),
            source_created_at: context.created_at,
            source_updated_at: context.updated_at,
            transformed_at: now,
        };

        debug!(
            transformer = %metadata.transformer_id,
            strategy = %config.strategy,
            input_size,
            output_size,
            items_pruned = metadata.items_pruned,
            "Transformation completed"
        );

        Ok(TransformationResult {
            success: true,
            reversible: self.transformer.reversible() && !metadata.is_lossy(),
            transformed_context: Some(pruned.output),
            strategy: config.strategy,
            metadata: Some(metadata),
            performance: TransformationPerformance::measure(input_size, output_size, duration_ms),
            cached: false,
            error: None,
        })
    }

    /// Reconstruct the source context; fails when the strategy removed or reordered information
    pub fn reverse(&self, result: &TransformationResult<T::Output>) -> Result<UnifiedContext> {
        if !self.transformer.reversible() {
            return Err(ContextError::Transformation(format!(
                "transformer '{}' is not reversible",
                self.transformer.id()
            )));
        }

        let (Some(output), Some(metadata)) = (&result.transformed_context, &result.metadata) else {
            return Err(ContextError::Transformation(
                "nothing to reverse: transformation did not succeed".to_string(),
            ));
        };

        if metadata.is_lossy() {
            return Err(ContextError::Transformation(format!(
                "cannot reverse {} transformation: {} field(s) dropped, {} item(s) pruned, {} item(s) reordered",
                metadata.strategy,
                metadata.fields_dropped.len(),
                metadata.items_pruned,
                metadata.items_reordered
            )));
        }

        let base = self.transformer.reverse(output)?;
        Ok(UnifiedContext::restore(
            metadata.source_context_id,
            metadata.source_agent_id.clone(),
            metadata.source_created_at,
            metadata.source_updated_at,
            base,
        ))
    }

    pub async fn clear_cache(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }

    pub async fn cached_entries(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }
}

/// Populated output fields, and the subset absent from the input
fn field_report(output: &Value, input: &ContextBag) -> (Vec<String>, Vec<String>) {
    let Some(fields) = output.as_object() else {
        return (Vec::new(), Vec::new());
    };

    let populated: Vec<String> = fields
        .iter()
        .filter(|(_, v)| match v {
            Value::Null => false,
            Value::Array(a) => !a.is_empty(),
            Value::Object(o) => !o.is_empty(),
            _ => true,
        })
        .map(|(k, _)| k.clone())
        .collect();

    let added = populated
        .iter()
        .filter(|k| !input.contains_key(k.as_str()))
        .cloned()
        .collect();

    (populated, added)
}
