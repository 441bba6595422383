use crate::enrichment::models::{EnricherPriority, EnrichmentStage};
use crate::error::ErrorCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// Fire-and-forget pipeline notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunStarted {
        run_id: Uuid,
        agent_id: String,
        enrichers: usize,
    },
    EnricherStarted {
        run_id: Uuid,
        enricher_id: String,
        attempt: u32,
    },
    EnricherCompleted {
        run_id: Uuid,
        enricher_id: String,
        duration_ms: u64,
        cached: bool,
        confidence: f64,
    },
    EnricherFailed {
        run_id: Uuid,
        enricher_id: String,
        code: ErrorCode,
        message: String,
        attempts: u32,
    },
    EnricherSkipped {
        run_id: Uuid,
        enricher_id: String,
        reason: String,
    },
    RunCompleted {
        run_id: Uuid,
        success: bool,
        duration_ms: u64,
    },
}

impl PipelineEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            PipelineEvent::RunStarted { run_id, .. }
            | PipelineEvent::EnricherStarted { run_id, .. }
            | PipelineEvent::EnricherCompleted { run_id, .. }
            | PipelineEvent::EnricherFailed { run_id, .. }
            | PipelineEvent::EnricherSkipped { run_id, .. }
            | PipelineEvent::RunCompleted { run_id, .. } => *run_id,
        }
    }
}

/// Broadcast sender; publishing never blocks and ignores missing subscribers
#[derive(Clone)]
pub struct EventBus {
    sender: Option<broadcast::Sender<PipelineEvent>>,
}

impl EventBus {
    /// Capacity 0 disables events
    pub fn new(capacity: usize) -> Self {
        let sender = (capacity > 0).then(|| broadcast::channel(capacity).0);
        Self { sender }
    }

    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<PipelineEvent>> {
        self.sender.as_ref().map(broadcast::Sender::subscribe)
    }

    pub fn publish(&self, event: PipelineEvent) {
        if let Some(sender) = &self.sender {
            if sender.send(event).is_err() {
                trace!("No pipeline event subscribers");
            }
        }
    }
}

/// Final status of one node in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Executed,
    Cached,
    Failed,
    Skipped,
}

/// One enricher in a trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceNode {
    pub enricher_id: String,
    pub stage: EnrichmentStage,
    pub priority: EnricherPriority,
    pub status: NodeStatus,
    pub dependencies: Vec<String>,
    pub attempts: u32,
    pub duration_ms: u64,
    pub cached: bool,
    pub confidence: Option<f64>,
    pub error: Option<String>,
}

/// Dependency edge, `from` must finish before `to`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEdge {
    pub from: String,
    pub to: String,
}

/// Per-context record consumed by graph visualizers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextTrace {
    pub run_id: Uuid,
    pub context_id: Uuid,
    pub agent_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub nodes: Vec<TraceNode>,
    pub edges: Vec<TraceEdge>,
}

impl ContextTrace {
    pub fn new(run_id: Uuid, context_id: Uuid, agent_id: impl Into<String>) -> Self {
        Self {
            run_id,
            context_id,
            agent_id: agent_id.into(),
            started_at: Some(Utc::now()),
            completed_at: None,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn node(&self, enricher_id: &str) -> Option<&TraceNode> {
        self.nodes.iter().find(|n| n.enricher_id == enricher_id)
    }

    pub fn node_mut(&mut self, enricher_id: &str) -> Option<&mut TraceNode> {
        self.nodes.iter_mut().find(|n| n.enricher_id == enricher_id)
    }

    pub fn finish(&mut self) {
        self.completed_at = Some(Utc::now());
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new(8);
        bus.publish(PipelineEvent::RunCompleted {
            run_id: Uuid::new_v4(),
            success: true,
            duration_ms: 1,
        });

        EventBus::disabled().publish(PipelineEvent::RunCompleted {
            run_id: Uuid::new_v4(),
            success: true,
            duration_ms: 1,
        });
        assert!(EventBus::disabled().subscribe().is_none());
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe().unwrap();
        let run_id = Uuid::new_v4();

        bus.publish(PipelineEvent::EnricherSkipped {
            run_id,
            enricher_id: "social".into(),
            reason: "context not applicable".into(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.run_id(), run_id);
    }

    #[test]
    fn test_trace_serializes() {
        let mut trace = ContextTrace::new(Uuid::new_v4(), Uuid::new_v4(), "a1");
        trace.nodes.push(TraceNode {
            enricher_id: "temporal".into(),
            stage: EnrichmentStage::PreProcessing,
            priority: EnricherPriority::High,
            status: NodeStatus::Executed,
            dependencies: vec![],
            attempts: 1,
            duration_ms: 2,
            cached: false,
            confidence: Some(0.95),
            error: None,
        });
        trace.finish();

        let json = trace.to_json().unwrap();
        assert!(json.contains("\"status\":\"executed\""));
        assert!(json.contains("PRE_PROCESSING"));
        assert!(trace.node("temporal").is_some());
    }
}
