use crate::enrichment::enricher::{ContextEnricher, EnricherBase, EnrichmentOutput};
use crate::enrichment::models::{
    ContextBag, EnricherConfig, EnricherPriority, EnrichmentRequest, EnrichmentStage,
};
use crate::enrichment::providers::{AgentAccessor, AgentSnapshot};
use crate::error::{ContextError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use sysinfo::{ProcessesToUpdate, System};
use tracing::debug;

pub const ENVIRONMENT_ENRICHER_ID: &str = "environment";
pub const ENVIRONMENT_CONTEXT_KEY: &str = "environmentContext";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentSettings {
    /// System metrics are re-read at most this often
    pub refresh_interval_secs: u64,
}

impl Default for EnvironmentSettings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 30,
        }
    }
}

/// Process and host metrics at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    pub process_memory_bytes: u64,
    pub total_memory_bytes: u64,
    pub used_memory_bytes: u64,
    pub memory_usage: f64,
    pub cpu_count: usize,
    pub host_name: Option<String>,
    pub os: Option<String>,
    pub system_uptime_secs: u64,
    pub captured_at: DateTime<Utc>,
}

impl SystemSnapshot {
    pub fn capture() -> Self {
        let mut system = System::new();
        system.refresh_memory();

        let total = system.total_memory();
        let used = system.used_memory();

        Self {
            process_memory_bytes: process_memory(&mut system),
            total_memory_bytes: total,
            used_memory_bytes: used,
            memory_usage: if total == 0 {
                0.0
            } else {
                used as f64 / total as f64
            },
            cpu_count: std::thread::available_parallelism().map_or(1, |n| n.get()),
            host_name: System::host_name(),
            os: System::long_os_version(),
            system_uptime_secs: System::uptime(),
            captured_at: Utc::now(),
        }
    }
}

/// Resident memory of the current process in bytes, 0 when unavailable
pub fn process_memory(system: &mut System) -> u64 {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    let _ = system.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
    system.process(pid).map_or(0, sysinfo::Process::memory)
}

/// Runtime environment and agent liveness
pub struct EnvironmentEnricher {
    base: EnricherBase,
    agent: Option<AgentAccessor>,
    settings: EnvironmentSettings,
    snapshot: Mutex<Option<(Instant, SystemSnapshot)>>,
    refreshes: AtomicU64,
}

impl EnvironmentEnricher {
    pub fn new(agent: Option<AgentAccessor>, settings: EnvironmentSettings) -> Self {
        Self {
            base: EnricherBase::new(
                ENVIRONMENT_ENRICHER_ID,
                "Environment Enricher",
                Self::default_config(),
            ),
            agent,
            settings,
            snapshot: Mutex::new(None),
            refreshes: AtomicU64::new(0),
        }
    }

    pub fn default_config() -> EnricherConfig {
        EnricherConfig::new(EnrichmentStage::PreProcessing, EnricherPriority::Low)
            .with_timeout_ms(2_000)
    }

    /// Number of times system metrics were actually read
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    fn fresh_snapshot(&self) -> Option<SystemSnapshot> {
        let interval = Duration::from_secs(self.settings.refresh_interval_secs);
        self.snapshot
            .lock()
            .as_ref()
            .filter(|(taken, _)| taken.elapsed() < interval)
            .map(|(_, snapshot)| snapshot.clone())
    }

    /// Cached snapshot, re-captured once the refresh interval has elapsed.
    /// sysinfo reads /proc synchronously, so capture runs on the blocking pool.
    pub async fn system_snapshot(&self) -> Result<SystemSnapshot> {
        if let Some(snapshot) = self.fresh_snapshot() {
            return Ok(snapshot);
        }

        let snapshot = tokio::task::spawn_blocking(SystemSnapshot::capture)
            .await
            .map_err(|e| ContextError::Internal(format!("system snapshot task failed: {}", e)))?;
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        debug!(
            process_memory_bytes = snapshot.process_memory_bytes,
            memory_usage = snapshot.memory_usage,
            "System snapshot refreshed"
        );
        *self.snapshot.lock() = Some((Instant::now(), snapshot.clone()));
        Ok(snapshot)
    }

    fn agent_status(&self) -> Value {
        let snapshot: Option<AgentSnapshot> = self.agent.as_ref().and_then(|accessor| accessor());
        match snapshot {
            Some(agent) => json!({
                "agentId": agent.agent_id,
                "name": agent.name,
                "status": agent.status,
                "alive": agent.alive,
                "activeModules": agent.active_modules,
                "moduleCount": agent.active_modules.len(),
                "lastUpdate": agent.last_update.to_rfc3339(),
            }),
            None => Value::Null,
        }
    }
}

#[async_trait]
impl ContextEnricher for EnvironmentEnricher {
    fn base(&self) -> &EnricherBase {
        &self.base
    }

    fn provided_keys(&self) -> Vec<String> {
        vec![ENVIRONMENT_CONTEXT_KEY.to_string()]
    }

    fn can_enrich(&self, _context: &ContextBag) -> bool {
        true
    }

    async fn do_enrich(&self, _request: &EnrichmentRequest) -> Result<EnrichmentOutput> {
        let system = self.system_snapshot().await?;
        let agent = self.agent_status();

        let confidence = match (&agent, self.agent.is_some()) {
            (Value::Null, true) => 0.6,
            (Value::Null, false) => 0.8,
            _ => 0.95,
        };

        let mut output = EnrichmentOutput::slice(
            ENVIRONMENT_CONTEXT_KEY,
            json!({
                "system": system,
                "agent": agent,
                "refreshIntervalSecs": self.settings.refresh_interval_secs,
            }),
        )
        .with_confidence(confidence);

        if agent.is_null() && self.agent.is_some() {
            output = output.with_warning("agent snapshot unavailable");
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn agent() -> AgentAccessor {
        Arc::new(|| {
            Some(AgentSnapshot {
                agent_id: "a1".to_string(),
                name: "Ada".to_string(),
                status: "running".to_string(),
                alive: true,
                active_modules: vec!["memory".to_string(), "emotion".to_string()],
                last_update: Utc::now(),
            })
        })
    }

    #[tokio::test]
    async fn test_snapshot_reused_within_interval() {
        let enricher = EnvironmentEnricher::new(None, EnvironmentSettings::default());
        enricher
            .initialize(EnvironmentEnricher::default_config())
            .await
            .unwrap();

        let request = EnrichmentRequest::from_json("a1", json!({}));
        enricher.enrich(&request).await;
        enricher.enrich(&request).await;

        assert_eq!(enricher.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_zero_interval_refreshes_every_call() {
        let enricher = EnvironmentEnricher::new(
            None,
            EnvironmentSettings {
                refresh_interval_secs: 0,
            },
        );
        enricher.system_snapshot().await.unwrap();
        enricher.system_snapshot().await.unwrap();
        assert_eq!(enricher.refresh_count(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_capture_leaves_runtime_responsive() {
        let enricher = Arc::new(EnvironmentEnricher::new(None, EnvironmentSettings::default()));
        let ticker = tokio::spawn(async {
            tokio::task::yield_now().await;
            true
        });

        let snapshot = enricher.system_snapshot().await.unwrap();
        assert!(snapshot.cpu_count >= 1);
        assert!(ticker.await.unwrap());
        assert_eq!(enricher.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_agent_liveness_included() {
        let enricher = EnvironmentEnricher::new(Some(agent()), EnvironmentSettings::default());
        enricher
            .initialize(EnvironmentEnricher::default_config())
            .await
            .unwrap();

        let result = enricher
            .enrich(&EnrichmentRequest::from_json("a1", json!({"message": "hi"})))
            .await;

        assert!(result.success);
        let ctx = &result.enriched_context[ENVIRONMENT_CONTEXT_KEY];
        assert_eq!(ctx["agent"]["alive"], json!(true));
        assert_eq!(ctx["agent"]["moduleCount"], json!(2));
        assert!(ctx["system"]["cpuCount"].as_u64().unwrap() >= 1);
        assert_eq!(result.confidence, 0.95);
    }

    #[tokio::test]
    async fn test_missing_agent_snapshot_warns() {
        let accessor: AgentAccessor = Arc::new(|| None);
        let enricher = EnvironmentEnricher::new(Some(accessor), EnvironmentSettings::default());
        enricher
            .initialize(EnvironmentEnricher::default_config())
            .await
            .unwrap();

        let result = enricher
            .enrich(&EnrichmentRequest::from_json("a1", json!({})))
            .await;
        assert!(result.success);
        assert!(result.enriched_context[ENVIRONMENT_CONTEXT_KEY]["agent"].is_null());
        assert!(!result.warnings.is_empty());
    }
}
