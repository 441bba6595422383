/// Context enrichment for agent interactions
///
/// This module provides:
/// - The `ContextEnricher` contract and its lifecycle base
/// - Five built-in enrichers (memory, temporal, emotional, social, environment)
/// - A dependency graph validated before any request runs
/// - A staged, bounded-concurrency pipeline with per-enricher timeout, retry and cache
/// - Run events and a per-context trace record

pub mod cache;
pub mod enricher;
pub mod enrichers;
pub mod events;
pub mod graph;
pub mod models;
pub mod pipeline;
pub mod providers;
pub mod registry;
pub mod scoring;

pub use cache::{CacheStats, EnrichmentCache, EnrichmentCacheEntry, EvictionCause};
pub use enricher::{ContextEnricher, EnricherBase, EnricherHealth, EnrichmentOutput, LifecycleState};
pub use enrichers::{default_registry, register_defaults, EnricherSettings};
pub use events::{ContextTrace, EventBus, NodeStatus, PipelineEvent, TraceEdge, TraceNode};
pub use graph::{DependencyGraph, DependencyGraphNode, NodeSpec};
pub use models::{
    ContextBag, ContextEnrichmentResult, ContextSource, EnricherConfig, EnricherConfigOverride,
    EnricherPriority, EnrichmentError, EnrichmentRequest, EnrichmentStage, PipelineError,
    PipelineExecutionResult, PipelineMetrics, SkipReason, UnifiedContext,
};
pub use pipeline::{EnrichmentPipeline, PipelineBuilder, PipelineConfig};
pub use providers::{
    AgentAccessor, AgentSnapshot, EmotionProvider, EmotionState, InMemoryEmotionModule,
    InMemoryMemoryStore, MemoryProvider, MemoryQuery, MemoryRecord, MemorySearchResponse,
    Providers,
};
pub use registry::{EnricherFactory, EnricherMetadata, EnricherRegistry};
pub use scoring::{LexiconScorer, ScoringStrategy};
