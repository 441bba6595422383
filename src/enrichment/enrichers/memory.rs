use crate::enrichment::enricher::{ContextEnricher, EnricherBase, EnrichmentOutput};
use crate::enrichment::enrichers::{message_text, TEXT_KEYS};
use crate::enrichment::models::{
    clamp_unit, ContextBag, EnricherConfig, EnricherPriority, EnrichmentRequest, EnrichmentStage,
};
use crate::enrichment::providers::{system_clock, Clock, MemoryProvider, MemoryQuery, MemoryRecord};
use crate::enrichment::scoring::{LexiconScorer, ScoringStrategy};
use crate::error::{ContextError, Result};
use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const MEMORY_ENRICHER_ID: &str = "memory";
pub const MEMORY_CONTEXT_KEY: &str = "memoryContext";

/// Memory search policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    /// Only memories from the last N days are searched
    pub search_radius_days: i64,
    pub relevance_threshold: f64,
    pub max_results: usize,
    /// Memories newer than this count as recent
    pub recent_window_days: i64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            search_radius_days: 30,
            relevance_threshold: 0.3,
            max_results: 20,
            recent_window_days: 7,
        }
    }
}

/// Relevant past interactions from the memory provider
pub struct MemoryEnricher {
    base: EnricherBase,
    provider: Option<Arc<dyn MemoryProvider>>,
    settings: MemorySettings,
    scorer: Arc<dyn ScoringStrategy>,
    clock: Clock,
}

impl MemoryEnricher {
    pub fn new(provider: Option<Arc<dyn MemoryProvider>>, settings: MemorySettings) -> Self {
        Self {
            base: EnricherBase::new(MEMORY_ENRICHER_ID, "Memory Enricher", Self::default_config()),
            provider,
            settings,
            scorer: Arc::new(LexiconScorer::new()),
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn ScoringStrategy>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn default_config() -> EnricherConfig {
        EnricherConfig::new(EnrichmentStage::CoreEnrichment, EnricherPriority::High)
            .with_cache(60_000)
    }

    /// Confidence grows with match count (saturating at 10) and mean relevance
    pub fn confidence_for(matches: usize, average_relevance: f64) -> f64 {
        if matches == 0 {
            return 0.1;
        }
        let volume = (matches as f64 / 10.0).min(1.0);
        clamp_unit(0.3 + 0.4 * volume + 0.3 * clamp_unit(average_relevance))
    }

    /// Enforce the search window and relevance floor on provider results
    fn within_policy(&self, query: &MemoryQuery, memories: Vec<MemoryRecord>) -> Vec<MemoryRecord> {
        let returned = memories.len();
        let mut kept: Vec<MemoryRecord> = memories
            .into_iter()
            .filter(|m| query.since.map_or(true, |since| m.timestamp >= since))
            .map(|mut m| {
                if m.relevance.is_none() {
                    m.relevance = Some(clamp_unit(self.scorer.relevance(&query.text, &m.content)));
                }
                m
            })
            .filter(|m| m.relevance.unwrap_or(0.0) >= self.settings.relevance_threshold)
            .collect();
        kept.truncate(self.settings.max_results);

        if kept.len() < returned {
            debug!(
                returned,
                kept = kept.len(),
                "Dropped memories outside search radius or below relevance threshold"
            );
        }
        kept
    }

    fn empty(&self, query: &str, reason: String) -> EnrichmentOutput {
        EnrichmentOutput::slice(
            MEMORY_CONTEXT_KEY,
            json!({
                "query": query,
                "available": false,
                "totalMatches": 0,
                "memories": [],
                "themes": {},
                "emotions": {},
                "dominantThemes": [],
                "recentCount": 0,
                "historicalCount": 0,
                "averageRelevance": 0.0,
            }),
        )
        .with_confidence(Self::confidence_for(0, 0.0))
        .with_warning(reason)
    }

    fn summarize(&self, query: &str, memories: &[MemoryRecord]) -> EnrichmentOutput {
        let now = (self.clock)();
        let recent_cutoff = now - Duration::days(self.settings.recent_window_days);

        let mut themes: BTreeMap<String, usize> = BTreeMap::new();
        let mut emotions: BTreeMap<String, usize> = BTreeMap::new();
        let mut recent = 0;

        for memory in memories {
            for theme in &memory.themes {
                *themes.entry(theme.clone()).or_insert(0) += 1;
            }
            if let Some(emotion) = &memory.emotion {
                *emotions.entry(emotion.clone()).or_insert(0) += 1;
            }
            if memory.timestamp >= recent_cutoff {
                recent += 1;
            }
        }

        let average_relevance = if memories.is_empty() {
            0.0
        } else {
            memories.iter().map(|m| m.relevance.unwrap_or(0.0)).sum::<f64>() / memories.len() as f64
        };

        let mut ranked: Vec<(&String, &usize)> = themes.iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        let dominant: Vec<&String> = ranked.into_iter().take(3).map(|(t, _)| t).collect();

        let items: Vec<serde_json::Value> = memories
            .iter()
            .map(|m| {
                json!({
                    "id": m.id,
                    "content": m.content,
                    "timestamp": m.timestamp.to_rfc3339(),
                    "relevance": m.relevance.unwrap_or(0.0),
                    "themes": m.themes,
                    "emotion": m.emotion,
                })
            })
            .collect();

        EnrichmentOutput::slice(
            MEMORY_CONTEXT_KEY,
            json!({
                "query": query,
                "available": true,
                "keyTerms": self.scorer.key_terms(query, 5),
                "totalMatches": memories.len(),
                "memories": items,
                "themes": themes,
                "emotions": emotions,
                "dominantThemes": dominant,
                "recentCount": recent,
                "historicalCount": memories.len() - recent,
                "averageRelevance": average_relevance,
                "searchRadiusDays": self.settings.search_radius_days,
            }),
        )
        .with_confidence(Self::confidence_for(memories.len(), average_relevance))
        .with_description(format!("{} relevant memories", memories.len()))
    }
}

#[async_trait]
impl ContextEnricher for MemoryEnricher {
    fn base(&self) -> &EnricherBase {
        &self.base
    }

    fn provided_keys(&self) -> Vec<String> {
        vec![MEMORY_CONTEXT_KEY.to_string()]
    }

    fn cache_inputs(&self) -> Vec<String> {
        TEXT_KEYS.iter().map(|k| k.to_string()).collect()
    }

    fn can_enrich(&self, context: &ContextBag) -> bool {
        message_text(context).is_some()
    }

    async fn do_enrich(&self, request: &EnrichmentRequest) -> Result<EnrichmentOutput> {
        let query_text = message_text(&request.context).unwrap_or_default().to_string();

        let Some(provider) = &self.provider else {
            return Ok(self.empty(&query_text, "memory provider not configured".to_string()));
        };

        let now = (self.clock)();
        let query = MemoryQuery {
            since: Some(now - Duration::days(self.settings.search_radius_days)),
            min_relevance: self.settings.relevance_threshold,
            limit: self.settings.max_results,
            ..MemoryQuery::text(query_text.clone())
        };

        let memories = match provider.search(&request.agent_id, &query).await {
            Ok(response) if response.success => response.memories,
            Ok(response) => {
                let reason = response.error.unwrap_or_else(|| "unknown error".to_string());
                warn!(agent_id = %request.agent_id, error = %reason, "Memory search unsuccessful");
                return Ok(self.empty(&query_text, format!("memory search failed: {}", reason)));
            }
            Err(e) => {
                warn!(agent_id = %request.agent_id, error = %e, "Memory search errored");
                return Ok(self.empty(&query_text, format!("memory search failed: {}", e)));
            }
        };

        let memories = self.within_policy(&query, memories);
        debug!(agent_id = %request.agent_id, matches = memories.len(), "Memory search completed");
        Ok(self.summarize(&query_text, &memories))
    }

    async fn check_collaborators(&self) -> Result<()> {
        match &self.provider {
            Some(provider) => provider.health_check().await,
            None => Err(ContextError::ResourceUnavailable(
                "memory provider not configured".to_string(),
            )),
        }
    }
}
