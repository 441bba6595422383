//! Context enrichment and transformation engine for LLM agents.
//!
//! An [`EnrichmentPipeline`] runs registered enrichers in dependency order,
//! merges their slices into a [`UnifiedContext`], and a [`TransformEngine`]
//! prunes that context into consumer-specific shapes. [`ContextRuntime`]
//! ties both together per agent and owns the periodic maintenance tasks.

pub mod config;
pub mod enrichment;
pub mod error;
pub mod metrics;
pub mod runtime;
pub mod transform;

pub use config::Config;
pub use enrichment::{
    ContextEnricher, EnricherConfig, EnricherRegistry, EnrichmentPipeline, EnrichmentRequest,
    PipelineBuilder, PipelineConfig, PipelineExecutionResult, Providers, UnifiedContext,
};
pub use error::{ContextError, ErrorCode, Result};
pub use runtime::{ContextRuntime, RuntimeConfig};
pub use transform::{
    CognitionTransformer, ContextTransformer, TransformEngine, TransformationConfig,
    TransformationStrategy,
};
