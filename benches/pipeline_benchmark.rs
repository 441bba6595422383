// Enrichment pipeline and transformer benchmarks
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use llm_context_engine::enrichment::enrichers::{default_registry, EnricherSettings};
use llm_context_engine::enrichment::{
    EnrichmentRequest, InMemoryEmotionModule, InMemoryMemoryStore, MemoryRecord, PipelineBuilder,
    PipelineConfig, Providers, UnifiedContext,
};
use llm_context_engine::transform::{
    CognitionTransformer, TransformEngine, TransformSettings, TransformationConfig,
    TransformationStrategy,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn providers() -> Providers {
    let store = Arc::new(InMemoryMemoryStore::new());
    let now = chrono::Utc::now();
    for i in 0..200 {
        store.add(
            MemoryRecord::new("bench", format!("release note {} about deploys", i), now)
                .with_relevance((i % 10) as f64 / 10.0)
                .with_entities(["bob"]),
        );
    }
    Providers::new()
        .with_memory(store)
        .with_emotion(Arc::new(InMemoryEmotionModule::new()))
}

fn pipeline_execute(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("pipeline_execute");

    for cache_enabled in [false, true] {
        let pipeline = rt.block_on(async {
            let registry = default_registry(&providers(), &EnricherSettings::default()).unwrap();
            let config = PipelineConfig {
                cache_enabled,
                ..Default::default()
            };
            PipelineBuilder::from_registry(&registry, &HashMap::new(), config)
                .unwrap()
                .build()
                .await
                .unwrap()
        });
        let request = EnrichmentRequest::from_json(
            "bench",
            json!({"userId": "bob", "sessionId": "s1", "message": "how did the deploy go?"}),
        );

        group.bench_with_input(
            BenchmarkId::new("builtin_enrichers", if cache_enabled { "cached" } else { "uncached" }),
            &request,
            |b, request| {
                b.to_async(&rt)
                    .iter(|| async { black_box(pipeline.execute(request.clone()).await) });
            },
        );
    }
    group.finish();
}

fn cognition_transform(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let engine = TransformEngine::new(CognitionTransformer::new(), &TransformSettings::default());
    let thoughts: Vec<Value> = (0..100)
        .map(|i| json!({"content": format!("thought {}", i), "relevance": (i % 10) as f64 / 10.0}))
        .collect();
    let base = json!({"message": "plan the migration", "thoughts": thoughts});
    let context = UnifiedContext::new("bench", base.as_object().cloned().unwrap_or_default());

    let mut group = c.benchmark_group("cognition_transform");
    for strategy in [
        TransformationStrategy::Full,
        TransformationStrategy::Selective,
        TransformationStrategy::Optimized,
        TransformationStrategy::Minimal,
    ] {
        let config = TransformationConfig::with_strategy(strategy);
        group.bench_with_input(BenchmarkId::from_parameter(strategy), &config, |b, config| {
            b.to_async(&rt)
                .iter(|| async { black_box(engine.transform(&context, Some(config)).await) });
        });
    }
    group.finish();
}

criterion_group!(benches, pipeline_execute, cognition_transform);
criterion_main!(benches);
