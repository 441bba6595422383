use crate::enrichment::models::{ContextBag, ContextEnrichmentResult};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Why an entry left the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum EvictionCause {
    Replaced,
    Removed,
    Expired,
    Cleared,
}

/// Callback fired when an entry is overwritten or removed
pub type EvictionListener = Arc<dyn Fn(&str, &EnrichmentCacheEntry, EvictionCause) + Send + Sync>;

/// Memoized enrichment result
#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentCacheEntry {
    pub key: String,
    pub result: ContextEnrichmentResult,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub access_count: u64,
}

impl EnrichmentCacheEntry {
    /// Valid only while `now < expires_at`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// Components of a content-addressed cache key
#[derive(Debug, Clone, Serialize)]
pub struct CacheKeyParts<'a> {
    pub context_id: &'a str,
    pub agent_id: &'a str,
    pub enricher_id: &'a str,
    /// Declared input values, sorted by key
    pub inputs: Vec<(&'a str, &'a serde_json::Value)>,
    pub time_bucket: i64,
}

/// Per-enricher TTL cache keyed by fingerprint
#[derive(Clone, Default)]
pub struct EnrichmentCache {
    entries: Arc<DashMap<String, EnrichmentCacheEntry>>,
    listener: Option<EvictionListener>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    evictions: Arc<AtomicU64>,
}

impl EnrichmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_eviction_listener(mut self, listener: EvictionListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Fingerprint from context identity, agent, enricher, declared inputs and time bucket
    pub fn fingerprint(parts: &CacheKeyParts<'_>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(parts.context_id.as_bytes());
        hasher.update(b"|");
        hasher.update(parts.agent_id.as_bytes());
        hasher.update(b"|");
        hasher.update(parts.enricher_id.as_bytes());
        hasher.update(b"|");
        for (key, value) in &parts.inputs {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.to_string().as_bytes());
            hasher.update(b";");
        }
        hasher.update(b"|");
        hasher.update(parts.time_bucket.to_le_bytes());

        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Build the key for an enricher invocation
    pub fn key_for(
        context_id: &str,
        agent_id: &str,
        enricher_id: &str,
        input_keys: &[String],
        context: &ContextBag,
        time_bucket: i64,
    ) -> String {
        let mut keys: Vec<&String> = input_keys.iter().collect();
        keys.sort();
        keys.dedup();

        let null = serde_json::Value::Null;
        let inputs = keys
            .into_iter()
            .map(|k| (k.as_str(), context.get(k).unwrap_or(&null)))
            .collect();

        Self::fingerprint(&CacheKeyParts {
            context_id,
            agent_id,
            enricher_id,
            inputs,
            time_bucket,
        })
    }

    pub fn get(&self, key: &str) -> Option<ContextEnrichmentResult> {
        self.get_at(key, Utc::now())
    }

    /// Lookup against an explicit clock; expired entries are dropped lazily
    pub fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<ContextEnrichmentResult> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.is_valid_at(now) {
                entry.access_count += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.result.clone());
            }
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        if let Some((k, entry)) = self.entries.remove_if(key, |_, e| !e.is_valid_at(now)) {
            debug!(key = %k, "Enrichment cache entry expired");
            self.notify(&k, &entry, EvictionCause::Expired);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn insert(&self, key: impl Into<String>, result: ContextEnrichmentResult, ttl: Duration) {
        self.insert_at(key, result, ttl, Utc::now());
    }

    /// At most one live entry per key; an overwrite fires `Replaced`
    pub fn insert_at(
        &self,
        key: impl Into<String>,
        result: ContextEnrichmentResult,
        ttl: Duration,
        now: DateTime<Utc>,
    ) {
        let key = key.into();
        let entry = EnrichmentCacheEntry {
            key: key.clone(),
            result,
            created_at: now,
            expires_at: now + ttl,
            access_count: 0,
        };

        if let Some(previous) = self.entries.insert(key.clone(), entry) {
            self.notify(&key, &previous, EvictionCause::Replaced);
        }
    }

    pub fn remove(&self, key: &str) -> Option<EnrichmentCacheEntry> {
        let (k, entry) = self.entries.remove(key)?;
        self.notify(&k, &entry, EvictionCause::Removed);
        Some(entry)
    }

    pub fn clear(&self) {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((k, entry)) = self.entries.remove(&key) {
                self.notify(&k, &entry, EvictionCause::Cleared);
            }
        }
    }

    /// Drop every expired entry; returns the number removed
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.value().is_valid_at(now))
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for key in expired {
            if let Some((k, entry)) = self.entries.remove_if(&key, |_, e| !e.is_valid_at(now)) {
                self.notify(&k, &entry, EvictionCause::Expired);
                removed += 1;
            }
        }
        removed
    }

    pub fn entry(&self, key: &str) -> Option<EnrichmentCacheEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn notify(&self, key: &str, entry: &EnrichmentCacheEntry, cause: EvictionCause) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        crate::metrics::CACHE_EVICTIONS_TOTAL
            .with_label_values(&[cause.to_string().as_str()])
            .inc();
        if let Some(listener) = &self.listener {
            listener(key, entry, cause);
        }
    }
}

/// Coarse time bucket for fingerprints
pub fn time_bucket(now: DateTime<Utc>, bucket_secs: u64) -> i64 {
    let bucket_secs = bucket_secs.max(1) as i64;
    now.timestamp().div_euclid(bucket_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn result() -> ContextEnrichmentResult {
        let mut bag = ContextBag::new();
        bag.insert("temporalContext".into(), json!({"timeOfDay": "morning"}));
        ContextEnrichmentResult::success("temporal", bag, 0.9, 4)
    }

    #[test]
    fn test_round_trip_before_expiry_and_miss_after() {
        let cache = EnrichmentCache::new();
        let now = Utc::now();
        let stored = result();
        cache.insert_at("k", stored.clone(), Duration::milliseconds(500), now);

        let expires_at = cache.entry("k").unwrap().expires_at;
        let hit = cache.get_at("k", expires_at - Duration::milliseconds(1));
        assert_eq!(hit, Some(stored));

        assert!(cache.get_at("k", expires_at).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_hit_returns_stored_value_unchanged() {
        let cache = EnrichmentCache::new();
        let stored = result();
        cache.insert("k", stored.clone(), Duration::seconds(60));
        assert_eq!(cache.get("k"), Some(stored));
        assert_eq!(cache.entry("k").unwrap().access_count, 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_eviction_listener_on_overwrite_and_remove() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let cache = EnrichmentCache::new().with_eviction_listener(Arc::new(
            move |key: &str, _: &EnrichmentCacheEntry, cause: EvictionCause| {
                sink.lock().push((key.to_string(), cause));
            },
        ));

        cache.insert("k", result(), Duration::seconds(60));
        cache.insert("k", result(), Duration::seconds(60));
        cache.remove("k");

        let events = events.lock();
        assert_eq!(
            *events,
            vec![
                ("k".to_string(), EvictionCause::Replaced),
                ("k".to_string(), EvictionCause::Removed)
            ]
        );
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_purge_expired() {
        let cache = EnrichmentCache::new();
        let now = Utc::now();
        cache.insert_at("old", result(), Duration::seconds(1), now - Duration::seconds(10));
        cache.insert_at("new", result(), Duration::seconds(60), now);

        assert_eq!(cache.purge_expired_at(now), 1);
        assert!(cache.entry("new").is_some());
        assert!(cache.entry("old").is_none());
    }

    #[test]
    fn test_fingerprint_depends_on_inputs_and_bucket() {
        let mut ctx = ContextBag::new();
        ctx.insert("message".into(), json!("hello"));
        let inputs = vec!["message".to_string()];

        let a = EnrichmentCache::key_for("s1", "a1", "memory", &inputs, &ctx, 10);
        let b = EnrichmentCache::key_for("s1", "a1", "memory", &inputs, &ctx, 10);
        let c = EnrichmentCache::key_for("s1", "a1", "memory", &inputs, &ctx, 11);
        ctx.insert("message".into(), json!("bye"));
        let d = EnrichmentCache::key_for("s1", "a1", "memory", &inputs, &ctx, 10);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_time_bucket() {
        let at = DateTime::from_timestamp(125, 0).unwrap();
        assert_eq!(time_bucket(at, 60), 2);
        assert_eq!(time_bucket(at, 0), 125);
    }
}
