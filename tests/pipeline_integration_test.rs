mod common;

use common::{fast_pipeline_config, Behavior, ScriptedEnricher};
use llm_context_engine::enrichment::{
    EnricherConfig, EnricherPriority, EnrichmentPipeline, EnrichmentRequest, EnrichmentStage,
    NodeStatus, PipelineBuilder, PipelineConfig, SkipReason,
};
use llm_context_engine::error::ErrorCode;
use serde_json::json;

fn stage(stage: EnrichmentStage) -> EnricherConfig {
    EnricherConfig::new(stage, EnricherPriority::Medium)
}

/// Required enricher fails every attempt; its dependent is skipped
#[tokio::test]
async fn test_required_failure_skips_dependents() {
    let a = ScriptedEnricher::new("A", "aContext", Behavior::AlwaysFail);
    let b = ScriptedEnricher::new("B", "bContext", Behavior::Write(json!({"ok": true})));

    let pipeline = PipelineBuilder::new(fast_pipeline_config())
        .with_enricher(a.clone(), stage(EnrichmentStage::PreProcessing).with_max_retries(2))
        .with_enricher(
            b.clone(),
            stage(EnrichmentStage::CoreEnrichment).with_dependencies(["A"]),
        )
        .build()
        .await
        .unwrap();

    let result = pipeline
        .execute(EnrichmentRequest::from_json("a1", json!({"userId": "u1"})).require(["A"]))
        .await;

    assert!(!result.success);
    assert_eq!(result.enrichers_failed, vec!["A"]);
    assert_eq!(result.enrichers_skipped, vec!["B"]);
    assert!(result.enrichers_executed.is_empty());
    assert_eq!(
        result.skip_reasons["B"],
        SkipReason::DependencyFailed {
            dependency: "A".to_string()
        }
    );

    // One attempt plus two retries, B never called
    assert_eq!(a.calls(), 3);
    assert_eq!(b.calls(), 0);
    assert_eq!(result.errors[0].enricher_id.as_deref(), Some("A"));
    assert_eq!(result.errors[0].attempts, 3);
    assert_eq!(result.metrics.total_retries, 2);

    assert_eq!(result.trace.node("A").unwrap().status, NodeStatus::Failed);
    assert_eq!(result.trace.node("B").unwrap().status, NodeStatus::Skipped);
    assert!(!result.enriched_context.contains("bContext"));
}

/// An optional failure leaves the run successful but partial
#[tokio::test]
async fn test_optional_failure_is_partial_success() {
    let pipeline = PipelineBuilder::new(fast_pipeline_config())
        .with_enricher(
            ScriptedEnricher::new("flaky", "flakyContext", Behavior::AlwaysFail),
            EnricherConfig::default().with_max_retries(0),
        )
        .with_enricher(
            ScriptedEnricher::new("steady", "steadyContext", Behavior::Write(json!(1))),
            EnricherConfig::default(),
        )
        .build()
        .await
        .unwrap();

    let result = pipeline
        .execute(EnrichmentRequest::from_json("a1", json!({})))
        .await;

    assert!(result.success);
    assert!(result.is_partial());
    assert_eq!(result.enrichers_executed, vec!["steady"]);
    assert_eq!(result.enrichers_failed, vec!["flaky"]);
    assert_eq!(result.enriched_context.get("steadyContext"), Some(&json!(1)));
    assert!((result.success_rate() - 0.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_cycle_rejected_at_build() {
    let err = PipelineBuilder::new(PipelineConfig::default())
        .with_enricher(
            ScriptedEnricher::new("a", "aContext", Behavior::Write(json!(1))),
            EnricherConfig::default().with_dependencies(["b"]),
        )
        .with_enricher(
            ScriptedEnricher::new("b", "bContext", Behavior::Write(json!(2))),
            EnricherConfig::default().with_dependencies(["a"]),
        )
        .build()
        .await
        .err()
        .unwrap();

    assert_eq!(err.code(), ErrorCode::CircularDependency);
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_unknown_dependency_rejected_at_build() {
    let err = PipelineBuilder::new(PipelineConfig::default())
        .with_enricher(
            ScriptedEnricher::new("a", "aContext", Behavior::Write(json!(1))),
            EnricherConfig::default().with_dependencies(["ghost"]),
        )
        .build()
        .await
        .err()
        .unwrap();

    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_required_key_without_dependency_rejected() {
    let err = PipelineBuilder::new(PipelineConfig::default())
        .with_enricher(
            ScriptedEnricher::new("profile", "userProfile", Behavior::Write(json!({"tier": "gold"}))),
            EnricherConfig::default(),
        )
        .with_enricher(
            ScriptedEnricher::with_required(
                "consumer",
                "consumerContext",
                &["userProfile"],
                Behavior::Write(json!(true)),
            ),
            EnricherConfig::default(),
        )
        .build()
        .await
        .err()
        .unwrap();

    assert_eq!(err.code(), ErrorCode::ConfigurationError);
}

/// A same-stage dependent sees its dependency's output
#[tokio::test]
async fn test_same_stage_dependency_output_visible() {
    let pipeline = PipelineBuilder::new(fast_pipeline_config())
        .with_enricher(
            ScriptedEnricher::new("profile", "userProfile", Behavior::Write(json!({"tier": "gold"}))),
            EnricherConfig::default(),
        )
        .with_enricher(
            ScriptedEnricher::with_required(
                "consumer",
                "consumerContext",
                &["userProfile"],
                Behavior::Write(json!(true)),
            ),
            EnricherConfig::new(EnrichmentStage::CoreEnrichment, EnricherPriority::Critical)
                .with_dependencies(["profile"]),
        )
        .build()
        .await
        .unwrap();

    // Dependency order beats priority
    assert_eq!(pipeline.enricher_ids(), vec!["profile", "consumer"]);

    let result = pipeline
        .execute(EnrichmentRequest::from_json("a1", json!({})))
        .await;

    assert_eq!(result.enrichers_executed, vec!["profile", "consumer"]);
    let consumer = result.enriched_context.get("consumerContext").unwrap();
    assert_eq!(consumer["seen"]["userProfile"]["tier"], json!("gold"));
}

/// Overlapping keys: the enricher later in execution order wins
#[tokio::test]
async fn test_overlapping_keys_last_writer_wins() {
    let pipeline = PipelineBuilder::new(fast_pipeline_config())
        .with_enricher(
            ScriptedEnricher::new("late", "shared", Behavior::Write(json!("finalization"))),
            stage(EnrichmentStage::Finalization),
        )
        .with_enricher(
            ScriptedEnricher::new("low", "shared", Behavior::Write(json!("core-low"))),
            EnricherConfig::new(EnrichmentStage::CoreEnrichment, EnricherPriority::Low),
        )
        .with_enricher(
            ScriptedEnricher::new("high", "shared", Behavior::Write(json!("core-high"))),
            EnricherConfig::new(EnrichmentStage::CoreEnrichment, EnricherPriority::High),
        )
        .build()
        .await
        .unwrap();

    assert_eq!(pipeline.enricher_ids(), vec!["high", "low", "late"]);

    let result = pipeline
        .execute(EnrichmentRequest::from_json("a1", json!({})))
        .await;

    assert_eq!(result.enriched_context.get("shared"), Some(&json!("finalization")));
    assert_eq!(result.enriched_context.writer_of("shared"), Some("late"));
    assert_eq!(
        result
            .warnings
            .iter()
            .filter(|w| w.contains("overwritten"))
            .count(),
        2
    );

    // Without the finalization writer, low priority runs after high and wins
    let without_late = pipeline
        .execute(EnrichmentRequest::from_json("a1", json!({})).exclude(["late"]))
        .await;
    assert_eq!(without_late.enriched_context.get("shared"), Some(&json!("core-low")));
}

#[tokio::test]
async fn test_deadline_returns_partial_context() {
    let pipeline = PipelineBuilder::new(fast_pipeline_config())
        .with_enricher(
            ScriptedEnricher::new("fast", "fastContext", Behavior::Write(json!(1))),
            stage(EnrichmentStage::PreProcessing),
        )
        .with_enricher(
            ScriptedEnricher::new("slow", "slowContext", Behavior::Sleep(2_000)),
            stage(EnrichmentStage::CoreEnrichment),
        )
        .with_enricher(
            ScriptedEnricher::new("after", "afterContext", Behavior::Write(json!(3))),
            stage(EnrichmentStage::PostProcessing),
        )
        .build()
        .await
        .unwrap();

    let result = pipeline
        .execute(EnrichmentRequest::from_json("a1", json!({})).with_timeout_ms(100))
        .await;

    assert!(result.success);
    assert_eq!(result.enrichers_executed, vec!["fast"]);
    assert_eq!(result.skip_reasons["slow"], SkipReason::DeadlineExceeded);
    assert_eq!(result.skip_reasons["after"], SkipReason::DeadlineExceeded);
    assert!(result.is_partial());
    assert!(result
        .errors
        .iter()
        .any(|e| e.code == ErrorCode::Timeout && e.enricher_id.is_none()));
    assert_eq!(result.enriched_context.get("fastContext"), Some(&json!(1)));
    assert!(result.metrics.total_duration_ms < 2_000);
}

#[tokio::test]
async fn test_per_attempt_timeout_fails_enricher() {
    let pipeline = PipelineBuilder::new(fast_pipeline_config())
        .with_enricher(
            ScriptedEnricher::new("slow", "slowContext", Behavior::Sleep(1_000)),
            EnricherConfig::default()
                .with_timeout_ms(20)
                .with_max_retries(0),
        )
        .build()
        .await
        .unwrap();

    let result = pipeline
        .execute(EnrichmentRequest::from_json("a1", json!({})))
        .await;

    assert_eq!(result.enrichers_failed, vec!["slow"]);
    assert_eq!(result.errors[0].code, ErrorCode::Timeout);
}

#[tokio::test]
async fn test_concurrency_bounded_within_stage() {
    let mut builder = PipelineBuilder::new(PipelineConfig {
        max_concurrency: 2,
        ..fast_pipeline_config()
    });
    for i in 0..6 {
        builder = builder.with_enricher(
            ScriptedEnricher::new(&format!("e{}", i), &format!("e{}Context", i), Behavior::Sleep(20)),
            EnricherConfig::default(),
        );
    }
    let pipeline: EnrichmentPipeline = builder.build().await.unwrap();

    let result = pipeline
        .execute(EnrichmentRequest::from_json("a1", json!({})))
        .await;

    assert_eq!(result.enrichers_executed.len(), 6);
    assert!(result.metrics.peak_concurrency <= 2);
    assert!(result.metrics.peak_concurrency >= 1);
}

#[tokio::test]
async fn test_trace_records_every_node() {
    let pipeline = PipelineBuilder::new(fast_pipeline_config())
        .with_enricher(
            ScriptedEnricher::new("a", "aContext", Behavior::Write(json!(1))),
            stage(EnrichmentStage::PreProcessing),
        )
        .with_enricher(
            ScriptedEnricher::new("b", "bContext", Behavior::Write(json!(2))),
            stage(EnrichmentStage::CoreEnrichment).with_dependencies(["a"]),
        )
        .with_enricher(
            ScriptedEnricher::new("c", "cContext", Behavior::Write(json!(3))),
            EnricherConfig::default().disabled(),
        )
        .build()
        .await
        .unwrap();

    let result = pipeline
        .execute(EnrichmentRequest::from_json("a1", json!({})))
        .await;

    let trace = &result.trace;
    assert_eq!(trace.nodes.len(), 3);
    assert_eq!(trace.node("a").unwrap().status, NodeStatus::Executed);
    assert_eq!(trace.node("b").unwrap().status, NodeStatus::Executed);
    assert_eq!(trace.node("c").unwrap().status, NodeStatus::Skipped);
    assert_eq!(trace.node("b").unwrap().dependencies, vec!["a"]);
    assert_eq!(result.confidence_of("a"), Some(0.9));

    let json = trace.to_json().unwrap();
    assert!(json.contains("\"enricher_id\""));
}
