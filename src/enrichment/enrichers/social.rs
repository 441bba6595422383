use crate::enrichment::enricher::{ContextEnricher, EnricherBase, EnrichmentOutput};
use crate::enrichment::models::{
    clamp_unit, ContextBag, EnricherConfig, EnricherPriority, EnrichmentRequest, EnrichmentStage,
};
use crate::enrichment::providers::{system_clock, Clock, MemoryProvider, MemoryQuery, MemoryRecord};
use crate::enrichment::scoring::{LexiconScorer, ScoringStrategy};
use crate::error::{ContextError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const SOCIAL_ENRICHER_ID: &str = "social";
pub const SOCIAL_CONTEXT_KEY: &str = "socialContext";

const IDENTITY_KEYS: [&str; 3] = ["userId", "sessionId", "sender"];

/// Relationship derivation policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocialSettings {
    pub max_participants: usize,
    /// e-folding time of the recency term, in days
    pub recency_decay_days: f64,
    pub relationship_cache_ttl_secs: u64,
    /// Interaction memories fetched per entity
    pub memory_limit: usize,
    /// Interaction count at which frequency saturates
    pub frequency_cap: usize,
}

impl Default for SocialSettings {
    fn default() -> Self {
        Self {
            max_participants: 10,
            recency_decay_days: 30.0,
            relationship_cache_ttl_secs: 300,
            memory_limit: 50,
            frequency_cap: 10,
        }
    }
}

/// Derived relationship with one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub entity: String,
    pub relationship_type: String,
    pub strength: f64,
    pub trust: f64,
    pub familiarity: f64,
    pub interaction_count: usize,
    pub last_interaction: DateTime<Utc>,
}

/// 0.6 x recency decay + 0.4 x capped frequency
pub fn relationship_strength(days_since_last: f64, interactions: usize, decay_days: f64, cap: usize) -> f64 {
    let recency = if decay_days > 0.0 {
        (-days_since_last.max(0.0) / decay_days).exp()
    } else {
        0.0
    };
    let cap = cap.max(1);
    let frequency = interactions.min(cap) as f64 / cap as f64;
    clamp_unit(0.6 * recency + 0.4 * frequency)
}

/// Participant count, relationship count and trust spread, each saturating
pub fn social_complexity(participants: usize, relationships: usize, trust_variance: f64) -> f64 {
    let participants = participants.min(10) as f64 / 10.0;
    let relationships = relationships.min(10) as f64 / 10.0;
    let variance = (trust_variance.max(0.0) * 4.0).min(1.0);
    clamp_unit(0.4 * participants + 0.3 * relationships + 0.3 * variance)
}

struct CachedRelationship {
    relationship: Option<Relationship>,
    expires_at: Instant,
}

/// Social entities in the interaction and the agent's relationships with them
pub struct SocialEnricher {
    base: EnricherBase,
    provider: Option<Arc<dyn MemoryProvider>>,
    settings: SocialSettings,
    scorer: Arc<dyn ScoringStrategy>,
    clock: Clock,
    relationships: DashMap<(String, String), CachedRelationship>,
}

impl SocialEnricher {
    pub fn new(provider: Option<Arc<dyn MemoryProvider>>, settings: SocialSettings) -> Self {
        Self {
            base: EnricherBase::new(SOCIAL_ENRICHER_ID, "Social Enricher", Self::default_config()),
            provider,
            settings,
            scorer: Arc::new(LexiconScorer::new()),
            clock: system_clock(),
            relationships: DashMap::new(),
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
        EnricherConfig::new(EnrichmentStage::CoreEnrichment, EnricherPriority::Medium)
    }

    pub fn cached_relationships(&self) -> usize {
        self.relationships.len()
    }

    /// userId, sender, recipient then participants; deduplicated, capped
    pub fn extract_entities(&self, context: &ContextBag) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut entities = Vec::new();

        let mut push = |value: &str| {
            let value = value.trim();
            if !value.is_empty() && seen.insert(value.to_string()) {
                entities.push(value.to_string());
            }
        };

        for key in ["userId", "sender", "recipient"] {
            if let Some(value) = context.get(key).and_then(Value::as_str) {
                push(value);
            }
        }
        if let Some(participants) = context.get("participants").and_then(Value::as_array) {
            for participant in participants {
                match participant {
                    Value::String(name) => push(name),
                    Value::Object(obj) => {
                        if let Some(id) = obj.get("id").and_then(Value::as_str) {
                            push(id);
                        }
                    }
                    _ => {}
                }
            }
        }

        entities.truncate(self.settings.max_participants);
        entities
    }

    fn derive(&self, entity: &str, memories: &[MemoryRecord]) -> Option<Relationship> {
        let last = memories.iter().map(|m| m.timestamp).max()?;
        let now = (self.clock)();
        let days = (now - last).num_seconds() as f64 / 86_400.0;

        let strength = relationship_strength(
            days,
            memories.len(),
            self.settings.recency_decay_days,
            self.settings.frequency_cap,
        );

        let sentiment = memories
            .iter()
            .map(|m| self.scorer.sentiment(&m.content))
            .sum::<f64>()
            / memories.len() as f64;
        let trust = clamp_unit(0.5 + 0.5 * sentiment);

        let variety: HashSet<&str> = memories
            .iter()
            .filter_map(|m| m.interaction_type.as_deref())
            .collect();
        let cap = self.settings.frequency_cap.max(1);
        let frequency = memories.len().min(cap) as f64 / cap as f64;
        let familiarity = clamp_unit(0.7 * frequency + 0.3 * variety.len().min(5) as f64 / 5.0);

        let corpus = memories
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let relationship_type = self.scorer.relationship_hint(&corpus).unwrap_or_else(|| {
            if strength >= 0.7 {
                "close".to_string()
            } else if strength >= 0.4 {
                "regular".to_string()
            } else {
                "acquaintance".to_string()
            }
        });

        Some(Relationship {
            entity: entity.to_string(),
            relationship_type,
            strength,
            trust,
            familiarity,
            interaction_count: memories.len(),
            last_interaction: last,
        })
    }

    async fn relationship(
        &self,
        provider: &dyn MemoryProvider,
        agent_id: &str,
        entity: &str,
        warnings: &mut Vec<String>,
    ) -> Option<Relationship> {
        let key = (agent_id.to_string(), entity.to_string());
        if let Some(cached) = self.relationships.get(&key) {
            if cached.expires_at > Instant::now() {
                return cached.relationship.clone();
            }
        }

        let query = MemoryQuery {
            limit: self.settings.memory_limit,
            ..MemoryQuery::entity(entity)
        };
        let memories = match provider.search(agent_id, &query).await {
            Ok(response) if response.success => response.memories,
            Ok(response) => {
                let reason = response.error.unwrap_or_else(|| "unknown error".to_string());
                warn!(agent_id, entity, error = %reason, "Interaction search unsuccessful");
                warnings.push(format!("interactions for {} unavailable: {}", entity, reason));
                return None;
            }
            Err(e) => {
                warn!(agent_id, entity, error = %e, "Interaction search errored");
                warnings.push(format!("interactions for {} unavailable: {}", entity, e));
                return None;
            }
        };

        let relationship = self.derive(entity, &memories);
        self.relationships.insert(
            key,
            CachedRelationship {
                relationship: relationship.clone(),
                expires_at: Instant::now()
                    + Duration::from_secs(self.settings.relationship_cache_ttl_secs),
            },
        );
        relationship
    }

    fn metrics(participants: usize, relationships: &[Relationship]) -> Value {
        if relationships.is_empty() {
            return json!({
                "trustLevel": 0.0,
                "familiarity": 0.0,
                "relationshipCount": 0,
                "dominantRelationshipType": Value::Null,
                "socialComplexity": social_complexity(participants, 0, 0.0),
            });
        }

        let n = relationships.len() as f64;
        let trust = relationships.iter().map(|r| r.trust).sum::<f64>() / n;
        let familiarity = relationships.iter().map(|r| r.familiarity).sum::<f64>() / n;
        let variance = relationships
            .iter()
            .map(|r| (r.trust - trust).powi(2))
            .sum::<f64>()
            / n;

        let mut types: BTreeMap<&str, usize> = BTreeMap::new();
        for r in relationships {
            *types.entry(r.relationship_type.as_str()).or_insert(0) += 1;
        }
        let dominant = types
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(kind, _)| kind.to_string());

        json!({
            "trustLevel": trust,
            "familiarity": familiarity,
            "relationshipCount": relationships.len(),
            "dominantRelationshipType": dominant,
            "socialComplexity": social_complexity(participants, relationships.len(), variance),
        })
    }
}

#[async_trait]
impl ContextEnricher for SocialEnricher {
    fn base(&self) -> &EnricherBase {
        &self.base
    }

    fn provided_keys(&self) -> Vec<String> {
        vec![SOCIAL_CONTEXT_KEY.to_string()]
    }

    fn cache_inputs(&self) -> Vec<String> {
        ["userId", "sessionId", "sender", "recipient", "participants"]
            .iter()
            .map(|k| k.to_string())
            .collect()
    }

    fn can_enrich(&self, context: &ContextBag) -> bool {
        IDENTITY_KEYS.iter().any(|key| {
            context
                .get(*key)
                .and_then(Value::as_str)
                .is_some_and(|v| !v.trim().is_empty())
        })
    }

    async fn do_enrich(&self, request: &EnrichmentRequest) -> Result<EnrichmentOutput> {
        let entities = self.extract_entities(&request.context);
        let mut warnings = Vec::new();
        let mut relationships = Vec::new();

        match &self.provider {
            Some(provider) => {
                for entity in &entities {
                    if let Some(r) = self
                        .relationship(provider.as_ref(), &request.agent_id, entity, &mut warnings)
                        .await
                    {
                        relationships.push(r);
                    }
                }
            }
            None => warnings.push("memory provider not configured".to_string()),
        }

        let confidence = if entities.is_empty() {
            0.2
        } else {
            0.3 + 0.7 * relationships.len() as f64 / entities.len() as f64
        };

        debug!(
            agent_id = %request.agent_id,
            entities = entities.len(),
            relationships = relationships.len(),
            "Social context derived"
        );

        let mut output = EnrichmentOutput::slice(
            SOCIAL_CONTEXT_KEY,
            json!({
                "entities": entities,
                "participantCount": entities.len(),
                "relationships": relationships,
                "socialMetrics": Self::metrics(entities.len(), &relationships),
            }),
        )
        .with_confidence(confidence);
        output.warnings = warnings;
        Ok(output)
    }

    async fn check_collaborators(&self) -> Result<()> {
        match &self.provider {
            Some(provider) => provider.health_check().await,
            None => Err(ContextError::ResourceUnavailable(
                "memory provider not configured".to_string(),
            )),
        }
    }

    fn sweep_expired(&self) -> usize {
        let before = self.relationships.len();
        let now = Instant::now();
        self.relationships.retain(|_, cached| cached.expires_at > now);
        before.saturating_sub(self.relationships.len())
    }

    async fn teardown(&self) {
        self.relationships.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::providers::{fixed_clock, InMemoryMemoryStore};
    use chrono::Duration as ChronoDuration;

    async fn enricher(store: Arc<InMemoryMemoryStore>, settings: SocialSettings) -> SocialEnricher {
        let enricher = SocialEnricher::new(Some(store), settings);
        enricher
            .initialize(SocialEnricher::default_config())
            .await
            .unwrap();
        enricher
    }

    #[test]
    fn test_extract_entities_dedup_and_cap() {
        let enricher = SocialEnricher::new(
            None,
            SocialSettings {
                max_participants: 3,
                ..Default::default()
            },
        );
        let ctx = json!({
            "userId": "alice",
            "sender": "alice",
            "recipient": "bob",
            "participants": ["carol", {"id": "dave"}, "erin"],
        });
        let ctx = ctx.as_object().unwrap();
        assert_eq!(enricher.extract_entities(ctx), vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn test_requires_identity() {
        let enricher = SocialEnricher::new(None, SocialSettings::default());
        let mut ctx = ContextBag::new();
        ctx.insert("message".into(), json!("hi"));
        assert!(!enricher.can_enrich(&ctx));
        ctx.insert("sessionId".into(), json!("s-1"));
        assert!(enricher.can_enrich(&ctx));
    }

    #[tokio::test]
    async fn test_relationship_from_memories() {
        let now = Utc::now();
        let store = Arc::new(InMemoryMemoryStore::new());
        for i in 0..5 {
            store.add(
                MemoryRecord::new("a1", "thanks, great work on the project", now - ChronoDuration::days(i))
                    .with_entities(["bob"])
                    .with_interaction_type(if i % 2 == 0 { "chat" } else { "review" }),
            );
        }

        let enricher = enricher(store, SocialSettings::default())
            .await
            .with_clock(fixed_clock(now));
        let request = EnrichmentRequest::from_json("a1", json!({"userId": "bob"}));
        let result = enricher.enrich(&request).await;

        assert!(result.success);
        let ctx = &result.enriched_context[SOCIAL_CONTEXT_KEY];
        let rel = &ctx["relationships"][0];
        assert_eq!(rel["entity"], json!("bob"));
        assert_eq!(rel["relationshipType"], json!("professional"));
        assert_eq!(rel["interactionCount"], json!(5));
        assert_eq!(rel["trust"], json!(1.0));
        assert_eq!(ctx["socialMetrics"]["relationshipCount"], json!(1));
        assert!((result.confidence - 1.0).abs() < 1e-9);
        assert_eq!(enricher.cached_relationships(), 1);
    }

    #[tokio::test]
    async fn test_sweep_drops_expired_relationships() {
        let enricher = enricher(
            Arc::new(InMemoryMemoryStore::new()),
            SocialSettings {
                relationship_cache_ttl_secs: 0,
                ..Default::default()
            },
        )
        .await;
        let request = EnrichmentRequest::from_json("a1", json!({"userId": "bob"}));
        enricher.enrich(&request).await;

        assert_eq!(enricher.cached_relationships(), 1);
        assert_eq!(enricher.sweep_expired(), 1);
        assert_eq!(enricher.cached_relationships(), 0);
    }

    #[test]
    fn test_strength_terms() {
        assert!((relationship_strength(0.0, 10, 30.0, 10) - 1.0).abs() < 1e-9);
        assert!((relationship_strength(0.0, 0, 30.0, 10) - 0.6).abs() < 1e-9);
        assert!((relationship_strength(0.0, 50, 30.0, 10) - 1.0).abs() < 1e-9);
        assert!(relationship_strength(90.0, 1, 30.0, 10) < 0.1);
    }

    #[test]
    fn test_social_complexity() {
        assert_eq!(social_complexity(0, 0, 0.0), 0.0);
        assert!((social_complexity(10, 10, 1.0) - 1.0).abs() < 1e-9);
        assert!((social_complexity(5, 0, 0.0) - 0.2).abs() < 1e-9);
    }
}
