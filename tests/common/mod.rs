//! Common test utilities for pipeline and runtime testing
//!
//! Provides a scriptable enricher and a small parser for the Prometheus
//! exposition format.

#![allow(dead_code)]

use async_trait::async_trait;
use llm_context_engine::enrichment::{
    ContextEnricher, EnricherBase, EnricherConfig, EnrichmentOutput, EnrichmentRequest,
};
use llm_context_engine::error::{ContextError, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a scripted enricher does on each call
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Write `value` under the configured key
    Write(Value),
    /// Fail the first `n` calls, then write `{"call": n}`
    FailFirst(u32),
    /// Fail every call
    AlwaysFail,
    /// Sleep, then write `{"slept_ms": ms}`
    Sleep(u64),
}

/// Enricher driven by a [`Behavior`], counting its calls
pub struct ScriptedEnricher {
    base: EnricherBase,
    keys: Vec<String>,
    required: Vec<String>,
    behavior: Behavior,
    calls: AtomicU32,
}

impl ScriptedEnricher {
    pub fn new(id: &str, key: &str, behavior: Behavior) -> Arc<Self> {
        Self::with_required(id, key, &[], behavior)
    }

    pub fn with_required(id: &str, key: &str, required: &[&str], behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            base: EnricherBase::new(id, format!("Scripted {}", id), EnricherConfig::default()),
            keys: vec![key.to_string()],
            required: required.iter().map(|k| k.to_string()).collect(),
            behavior,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContextEnricher for ScriptedEnricher {
    fn base(&self) -> &EnricherBase {
        &self.base
    }

    fn provided_keys(&self) -> Vec<String> {
        self.keys.clone()
    }

    fn required_keys(&self) -> Vec<String> {
        self.required.clone()
    }

    async fn do_enrich(&self, request: &EnrichmentRequest) -> Result<EnrichmentOutput> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let key = &self.keys[0];

        let value = match &self.behavior {
            Behavior::Write(value) => value.clone(),
            Behavior::FailFirst(n) if call <= *n => {
                return Err(ContextError::ResourceUnavailable(format!("call {} refused", call)));
            }
            Behavior::FailFirst(_) => json!({ "call": call }),
            Behavior::AlwaysFail => {
                return Err(ContextError::ResourceUnavailable(format!(
                    "{} is down",
                    self.base.id()
                )));
            }
            Behavior::Sleep(ms) => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                json!({ "slept_ms": ms })
            }
        };

        // Echo the required inputs so tests can see what the enricher observed
        let seen: serde_json::Map<String, Value> = self
            .required
            .iter()
            .filter_map(|k| request.context.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        let value = if seen.is_empty() {
            value
        } else {
            json!({ "value": value, "seen": seen })
        };

        Ok(EnrichmentOutput::slice(key, value).with_confidence(0.9))
    }
}

/// Fast retry policy for tests
pub fn fast_pipeline_config() -> llm_context_engine::enrichment::PipelineConfig {
    llm_context_engine::enrichment::PipelineConfig {
        retry_backoff_ms: 1,
        max_retry_backoff_ms: 4,
        ..Default::default()
    }
}

/// Parse Prometheus exposition format into metric name -> lines
pub fn parse_prometheus_output(output: &str) -> HashMap<String, Vec<String>> {
    let mut metrics = HashMap::new();
    let mut current_metric = String::new();

    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line.starts_with("# HELP") || line.starts_with("# TYPE") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 3 {
                current_metric = parts[2].to_string();
                metrics
                    .entry(current_metric.clone())
                    .or_insert_with(Vec::new)
                    .push(line.to_string());
            }
        } else if !line.starts_with('#') && !current_metric.is_empty() {
            metrics
                .entry(current_metric.clone())
                .or_insert_with(Vec::new)
                .push(line.to_string());
        }
    }

    metrics
}
