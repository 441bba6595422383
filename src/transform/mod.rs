/// Context transformation
///
/// Converts a `UnifiedContext` into consumer-specific shapes under a
/// pruning strategy (FULL, SELECTIVE, OPTIMIZED, MINIMAL, CACHED), with
/// field-level validation and reversal of lossless results.

pub mod cognition;
pub mod models;
pub mod transformer;

pub use cognition::{
    CognitionTransformer, CognitiveContext, CognitiveItem, ContextualFactors, MemoryReference,
    COGNITION_TRANSFORMER_ID,
};
pub use models::{
    MinimalCaps, Severity, TransformSettings, TransformationConfig, TransformationMetadata,
    TransformationPerformance, TransformationResult, TransformationStrategy,
    TransformerCapabilities, ValidationIssue, ValidationResult,
};
pub use transformer::{ContextTransformer, PruneOutcome, TransformEngine};
