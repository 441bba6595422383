//! Built-in enrichers
//!
//! Each enricher owns one namespaced key of the unified context and reports
//! a confidence in [0, 1]. `default_registry` wires all five against a set
//! of providers.

pub mod emotional;
pub mod environment;
pub mod memory;
pub mod social;
pub mod temporal;

pub use emotional::{EmotionalEnricher, EmotionalSettings, EMOTIONAL_CONTEXT_KEY, EMOTIONAL_ENRICHER_ID};
pub use environment::{
    EnvironmentEnricher, EnvironmentSettings, SystemSnapshot, ENVIRONMENT_CONTEXT_KEY,
    ENVIRONMENT_ENRICHER_ID,
};
pub use memory::{MemoryEnricher, MemorySettings, MEMORY_CONTEXT_KEY, MEMORY_ENRICHER_ID};
pub use social::{Relationship, SocialEnricher, SocialSettings, SOCIAL_CONTEXT_KEY, SOCIAL_ENRICHER_ID};
pub use temporal::{TemporalEnricher, TemporalSettings, TEMPORAL_CONTEXT_KEY, TEMPORAL_ENRICHER_ID};

use crate::enrichment::enricher::ContextEnricher;
use crate::enrichment::models::{ContextBag, EnricherConfigOverride};
use crate::enrichment::providers::Providers;
use crate::enrichment::registry::{EnricherMetadata, EnricherRegistry};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Context keys that may carry the free-text message, in lookup order
pub const TEXT_KEYS: [&str; 4] = ["message", "content", "text", "query"];

/// First non-empty free-text field of the context
pub(crate) fn message_text(context: &ContextBag) -> Option<&str> {
    TEXT_KEYS
        .iter()
        .filter_map(|key| context.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|text| !text.is_empty())
}

/// Per-enricher settings plus policy overrides keyed by enricher id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnricherSettings {
    pub memory: MemorySettings,
    pub temporal: TemporalSettings,
    pub emotional: EmotionalSettings,
    pub social: SocialSettings,
    pub environment: EnvironmentSettings,
    pub overrides: HashMap<String, EnricherConfigOverride>,
}

/// Register the five built-in enrichers into `registry`
pub fn register_defaults(
    registry: &mut EnricherRegistry,
    providers: &Providers,
    settings: &EnricherSettings,
) -> Result<()> {
    let temporal = settings.temporal.clone();
    registry.register(
        EnricherMetadata::new(TEMPORAL_ENRICHER_ID, "Temporal Enricher")
            .with_description("Wall-clock, business hours and session tracking")
            .with_tags(["builtin", "time"]),
        TemporalEnricher::default_config(),
        Arc::new(move || Arc::new(TemporalEnricher::new(temporal.clone())) as Arc<dyn ContextEnricher>),
    )?;

    let agent = providers.agent.clone();
    let environment = settings.environment.clone();
    registry.register(
        EnricherMetadata::new(ENVIRONMENT_ENRICHER_ID, "Environment Enricher")
            .with_description("Process metrics and agent liveness")
            .with_tags(["builtin", "system"]),
        EnvironmentEnricher::default_config(),
        Arc::new(move || {
            Arc::new(EnvironmentEnricher::new(agent.clone(), environment.clone()))
                as Arc<dyn ContextEnricher>
        }),
    )?;

    let memory_provider = providers.memory.clone();
    let memory = settings.memory.clone();
    registry.register(
        EnricherMetadata::new(MEMORY_ENRICHER_ID, "Memory Enricher")
            .with_description("Relevant past interactions")
            .with_tags(["builtin", "memory"]),
        MemoryEnricher::default_config(),
        Arc::new(move || {
            Arc::new(MemoryEnricher::new(memory_provider.clone(), memory.clone()))
                as Arc<dyn ContextEnricher>
        }),
    )?;

    let emotion_provider = providers.emotion.clone();
    let emotional = settings.emotional.clone();
    registry.register(
        EnricherMetadata::new(EMOTIONAL_ENRICHER_ID, "Emotional Enricher")
            .with_description("Emotion history and message cues")
            .with_tags(["builtin", "emotion"]),
        EmotionalEnricher::default_config(),
        Arc::new(move || {
            Arc::new(EmotionalEnricher::new(emotion_provider.clone(), emotional.clone()))
                as Arc<dyn ContextEnricher>
        }),
    )?;

    let social_provider = providers.memory.clone();
    let social = settings.social.clone();
    registry.register(
        EnricherMetadata::new(SOCIAL_ENRICHER_ID, "Social Enricher")
            .with_description("Participants and relationship strength")
            .with_tags(["builtin", "social"]),
        SocialEnricher::default_config(),
        Arc::new(move || {
            Arc::new(SocialEnricher::new(social_provider.clone(), social.clone()))
                as Arc<dyn ContextEnricher>
        }),
    )?;

    Ok(())
}

/// Fresh registry holding the built-in enrichers
pub fn default_registry(providers: &Providers, settings: &EnricherSettings) -> Result<EnricherRegistry> {
    let mut registry = EnricherRegistry::new();
    register_defaults(&mut registry, providers, settings)?;
    Ok(registry)
}
