//! Narrow interfaces to external collaborators plus in-memory implementations.

use crate::enrichment::models::ContextBag;
use crate::enrichment::scoring::jaccard_similarity;
use crate::error::{ContextError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Wall-clock source, injectable for tests
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Fixed clock
pub fn fixed_clock(at: DateTime<Utc>) -> Clock {
    Arc::new(move || at)
}

/// Stored memory record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    pub id: String,
    pub agent_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Provider-computed relevance; computed from the query when absent
    pub relevance: Option<f64>,
    #[serde(default)]
    pub themes: Vec<String>,
    pub emotion: Option<String>,
    /// Participants the memory involves
    #[serde(default)]
    pub entities: Vec<String>,
    pub interaction_type: Option<String>,
    #[serde(default)]
    pub metadata: ContextBag,
}

impl MemoryRecord {
    pub fn new(agent_id: impl Into<String>, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            content: content.into(),
            timestamp,
            relevance: None,
            themes: Vec::new(),
            emotion: None,
            entities: Vec::new(),
            interaction_type: None,
            metadata: ContextBag::new(),
        }
    }

    pub fn with_relevance(mut self, relevance: f64) -> Self {
        self.relevance = Some(relevance);
        self
    }

    pub fn with_themes<I, S>(mut self, themes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.themes = themes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_emotion(mut self, emotion: impl Into<String>) -> Self {
        self.emotion = Some(emotion.into());
        self
    }

    pub fn with_entities<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entities = entities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_interaction_type(mut self, kind: impl Into<String>) -> Self {
        self.interaction_type = Some(kind.into());
        self
    }
}

/// Memory search parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryQuery {
    pub text: String,
    /// Restrict to memories involving this entity
    pub entity: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub min_relevance: f64,
    pub limit: usize,
}

impl MemoryQuery {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            entity: None,
            since: None,
            min_relevance: 0.0,
            limit: 50,
        }
    }

    pub fn entity(entity: impl Into<String>) -> Self {
        Self {
            entity: Some(entity.into()),
            ..Self::text("")
        }
    }
}

/// Memory search reply
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemorySearchResponse {
    pub success: bool,
    pub memories: Vec<MemoryRecord>,
    pub error: Option<String>,
}

impl MemorySearchResponse {
    pub fn ok(memories: Vec<MemoryRecord>) -> Self {
        Self {
            success: true,
            memories,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            memories: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// External memory store
#[async_trait]
pub trait MemoryProvider: Send + Sync {
    async fn search(&self, agent_id: &str, query: &MemoryQuery) -> Result<MemorySearchResponse>;

    async fn health_check(&self) -> Result<()>;
}

/// Process-local memory store
#[derive(Default)]
pub struct InMemoryMemoryStore {
    records: DashMap<String, Vec<MemoryRecord>>,
    offline: AtomicBool,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, record: MemoryRecord) {
        self.records
            .entry(record.agent_id.clone())
            .or_default()
            .push(record);
    }

    pub fn len(&self) -> usize {
        self.records.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Simulate an outage: searches report `success: false`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    fn score(query: &MemoryQuery, record: &MemoryRecord) -> f64 {
        if let Some(relevance) = record.relevance {
            return relevance;
        }
        if query.text.trim().is_empty() {
            return 1.0;
        }
        jaccard_similarity(&query.text, &record.content)
    }
}

#[async_trait]
impl MemoryProvider for InMemoryMemoryStore {
    async fn search(&self, agent_id: &str, query: &MemoryQuery) -> Result<MemorySearchResponse> {
        if self.offline.load(Ordering::Relaxed) {
            return Ok(MemorySearchResponse::failed("memory store offline"));
        }

        let Some(records) = self.records.get(agent_id) else {
            return Ok(MemorySearchResponse::ok(Vec::new()));
        };

        let mut matches: Vec<MemoryRecord> = records
            .iter()
            .filter(|r| query.since.map_or(true, |since| r.timestamp >= since))
            .filter(|r| {
                query
                    .entity
                    .as_ref()
                    .map_or(true, |entity| r.entities.iter().any(|e| e == entity))
            })
            .map(|r| {
                let mut r = r.clone();
                r.relevance = Some(Self::score(query, &r));
                r
            })
            .filter(|r| r.relevance.unwrap_or(0.0) >= query.min_relevance)
            .collect();

        matches.sort_by(|a, b| {
            b.relevance
                .unwrap_or(0.0)
                .total_cmp(&a.relevance.unwrap_or(0.0))
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });
        matches.truncate(query.limit);

        Ok(MemorySearchResponse::ok(matches))
    }

    async fn health_check(&self) -> Result<()> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(ContextError::ResourceUnavailable(
                "memory store offline".to_string(),
            ));
        }
        Ok(())
    }
}

/// One emotion reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmotionState {
    pub emotion: String,
    /// 0.0 - 1.0
    pub intensity: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub triggers: Vec<String>,
}

impl EmotionState {
    pub fn new(emotion: impl Into<String>, intensity: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            emotion: emotion.into(),
            intensity,
            timestamp,
            triggers: Vec::new(),
        }
    }
}

/// External emotion module
#[async_trait]
pub trait EmotionProvider: Send + Sync {
    async fn current_state(&self) -> Result<Option<EmotionState>>;

    /// Most recent `limit` readings, oldest first
    async fn history(&self, limit: usize) -> Result<Vec<EmotionState>>;
}

/// Process-local emotion module
#[derive(Default)]
pub struct InMemoryEmotionModule {
    current: RwLock<Option<EmotionState>>,
    history: RwLock<Vec<EmotionState>>,
}

impl InMemoryEmotionModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the current state; the previous one moves into history
    pub fn set_state(&self, state: EmotionState) {
        let previous = self.current.write().replace(state);
        if let Some(previous) = previous {
            self.history.write().push(previous);
        }
    }

    pub fn push_history(&self, state: EmotionState) {
        self.history.write().push(state);
    }
}

#[async_trait]
impl EmotionProvider for InMemoryEmotionModule {
    async fn current_state(&self) -> Result<Option<EmotionState>> {
        Ok(self.current.read().clone())
    }

    async fn history(&self, limit: usize) -> Result<Vec<EmotionState>> {
        let history = self.history.read();
        let skip = history.len().saturating_sub(limit);
        Ok(history.iter().skip(skip).cloned().collect())
    }
}

/// Agent liveness snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub name: String,
    pub status: String,
    pub alive: bool,
    pub active_modules: Vec<String>,
    pub last_update: DateTime<Utc>,
}

/// Zero-argument accessor for the current agent snapshot
pub type AgentAccessor = Arc<dyn Fn() -> Option<AgentSnapshot> + Send + Sync>;

/// Collaborators handed to the default enrichers
#[derive(Clone, Default)]
pub struct Providers {
    pub memory: Option<Arc<dyn MemoryProvider>>,
    pub emotion: Option<Arc<dyn EmotionProvider>>,
    pub agent: Option<AgentAccessor>,
}

impl Providers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryProvider>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_emotion(mut self, emotion: Arc<dyn EmotionProvider>) -> Self {
        self.emotion = Some(emotion);
        self
    }

    pub fn with_agent(mut self, agent: AgentAccessor) -> Self {
        self.agent = Some(agent);
        self
    }
}
