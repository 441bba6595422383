//! Cognition transformer
//!
//! Shapes the unified context into the view a reasoning module consumes:
//! the current thought and its history, the reasoning chain, decisions,
//! goals, plans and constraints, plus derived load/depth/focus signals and
//! the contextual factors contributed by the enrichers.

use crate::enrichment::enrichers::{
    EMOTIONAL_CONTEXT_KEY, ENVIRONMENT_CONTEXT_KEY, MEMORY_CONTEXT_KEY, SOCIAL_CONTEXT_KEY,
    TEMPORAL_CONTEXT_KEY,
};
use crate::enrichment::models::{clamp_unit, ContextBag, UnifiedContext};
use crate::enrichment::scoring::{LexiconScorer, ScoringStrategy};
use crate::error::Result;
use crate::transform::models::{
    Severity, TransformationConfig, TransformationStrategy, ValidationIssue, ValidationResult,
};
use crate::transform::transformer::{ContextTransformer, PruneOutcome};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

pub const COGNITION_TRANSFORMER_ID: &str = "cognition";
pub const MAX_REASONING_DEPTH: u32 = 10;

const FOCUS_TERM_LIMIT: usize = 10;

/// One thought, step, decision, goal, plan or constraint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CognitiveItem {
    pub content: String,
    pub confidence: f64,
    pub importance: f64,
    pub relevance: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl CognitiveItem {
    /// String entries or objects with `content`/`description`/`text`
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self {
                content: s.clone(),
                confidence: 0.5,
                importance: 0.5,
                relevance: 0.5,
                timestamp: None,
            }),
            Value::Object(obj) => {
                let content = ["content", "description", "text"]
                    .iter()
                    .find_map(|k| obj.get(*k).and_then(Value::as_str))?
                    .to_string();
                let score = |key: &str| clamp_unit(obj.get(key).and_then(Value::as_f64).unwrap_or(0.5));
                Some(Self {
                    content,
                    confidence: score("confidence"),
                    importance: obj
                        .get("importance")
                        .or_else(|| obj.get("priority"))
                        .and_then(Value::as_f64)
                        .map_or(0.5, clamp_unit),
                    relevance: score("relevance"),
                    timestamp: obj
                        .get("timestamp")
                        .and_then(Value::as_str)
                        .map(String::from),
                })
            }
            _ => None,
        }
    }

    pub fn significance(&self) -> f64 {
        (self.relevance + self.importance) / 2.0
    }

    fn to_value(&self) -> Value {
        let mut v = json!({
            "content": self.content,
            "confidence": self.confidence,
            "importance": self.importance,
            "relevance": self.relevance,
        });
        if let (Some(ts), Some(obj)) = (&self.timestamp, v.as_object_mut()) {
            obj.insert("timestamp".into(), json!(ts));
        }
        v
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryReference {
    pub id: String,
    pub content: String,
    pub relevance: f64,
}

/// Signals contributed by the enrichers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextualFactors {
    pub time_of_day: Option<String>,
    pub is_business_hours: Option<bool>,
    pub emotional_state: Option<String>,
    pub emotional_intensity: Option<f64>,
    pub social_complexity: Option<f64>,
    pub participant_count: Option<u64>,
    pub memory_usage: Option<f64>,
}

/// Output of the cognition transformer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CognitiveContext {
    pub current_thought: Option<CognitiveItem>,
    pub thought_history: Vec<CognitiveItem>,
    pub reasoning_chain: Vec<CognitiveItem>,
    pub decisions: Vec<CognitiveItem>,
    pub goals: Vec<CognitiveItem>,
    pub plans: Vec<CognitiveItem>,
    pub constraints: Vec<CognitiveItem>,
    /// [0, 1]
    pub cognitive_load: f64,
    /// [0, 10]
    pub reasoning_depth: u32,
    pub focus_terms: Vec<String>,
    pub memory_references: Vec<MemoryReference>,
    pub contextual_factors: Option<ContextualFactors>,
}

/// Load from open items, constraints and emotional intensity
pub fn cognitive_load(
    active_items: usize,
    constraints: usize,
    decisions: usize,
    emotional_intensity: f64,
) -> f64 {
    let items = (active_items as f64 / 20.0).min(1.0);
    let constraints = (constraints as f64 / 5.0).min(1.0);
    let decisions = (decisions as f64 / 5.0).min(1.0);
    clamp_unit(0.3 * items + 0.3 * constraints + 0.2 * decisions + 0.2 * clamp_unit(emotional_intensity))
}

fn items(bag: &ContextBag, keys: &[&str]) -> Vec<CognitiveItem> {
    keys.iter()
        .find_map(|k| bag.get(*k).and_then(Value::as_array))
        .map(|list| list.iter().filter_map(CognitiveItem::from_value).collect())
        .unwrap_or_default()
}

/// Keep the last `n` entries; returns how many were removed
fn keep_last<T>(list: &mut Vec<T>, n: usize) -> usize {
    let excess = list.len().saturating_sub(n);
    list.drain(..excess);
    excess
}

/// Keep the first `n` entries; returns how many were removed
fn keep_first<T>(list: &mut Vec<T>, n: usize) -> usize {
    let excess = list.len().saturating_sub(n);
    list.truncate(n);
    excess
}

/// Entries whose position differs between two orderings of the same list
fn displaced<T: PartialEq>(before: &[T], after: &[T]) -> usize {
    before.iter().zip(after).filter(|(a, b)| a != b).count()
}

/// Threshold filter then significance sort; returns (removed, moved)
fn keep_significant(list: &mut Vec<CognitiveItem>, config: &TransformationConfig) -> (usize, usize) {
    let before = list.len();
    list.retain(|item| {
        item.relevance >= config.relevance_threshold || item.importance >= config.importance_threshold
    });
    let filtered = list.clone();
    list.sort_by(|a, b| b.significance().total_cmp(&a.significance()));
    (before - list.len(), displaced(&filtered, list))
}

/// Cognitive view for reasoning modules
pub struct CognitionTransformer {
    scorer: Arc<dyn ScoringStrategy>,
}

impl CognitionTransformer {
    pub fn new() -> Self {
        Self {
            scorer: Arc::new(LexiconScorer::new()),
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn ScoringStrategy>) -> Self {
        self.scorer = scorer;
        self
    }

    fn memory_references(context: &UnifiedContext) -> Vec<MemoryReference> {
        context
            .get(MEMORY_CONTEXT_KEY)
            .and_then(|m| m.get("memories"))
            .and_then(Value::as_array)
            .map(|memories| {
                memories
                    .iter()
                    .filter_map(|m| {
                        Some(MemoryReference {
                            id: m.get("id")?.as_str()?.to_string(),
                            content: m.get("content")?.as_str()?.to_string(),
                            relevance: clamp_unit(m.get("relevance").and_then(Value::as_f64).unwrap_or(0.0)),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn contextual_factors(context: &UnifiedContext) -> ContextualFactors {
        let temporal = context.get(TEMPORAL_CONTEXT_KEY);
        let emotional = context.get(EMOTIONAL_CONTEXT_KEY);
        let social = context.get(SOCIAL_CONTEXT_KEY);
        let environment = context.get(ENVIRONMENT_CONTEXT_KEY);

        ContextualFactors {
            time_of_day: temporal
                .and_then(|t| t.get("timeOfDay"))
                .and_then(Value::as_str)
                .map(String::from),
            is_business_hours: temporal
                .and_then(|t| t.get("isBusinessHours"))
                .and_then(Value::as_bool),
            emotional_state: emotional
                .and_then(|e| e.get("dominantEmotion"))
                .and_then(Value::as_str)
                .map(String::from),
            emotional_intensity: emotional
                .and_then(|e| e.get("averageIntensity"))
                .and_then(Value::as_f64)
                .map(clamp_unit),
            social_complexity: social
                .and_then(|s| s.pointer("/socialMetrics/socialComplexity"))
                .and_then(Value::as_f64),
            participant_count: social
                .and_then(|s| s.get("participantCount"))
                .and_then(Value::as_u64),
            memory_usage: environment
                .and_then(|e| e.pointer("/system/memoryUsage"))
                .and_then(Value::as_f64),
        }
    }
}

impl Default for CognitionTransformer {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextTransformer for CognitionTransformer {
    type Output = CognitiveContext;

    fn id(&self) -> &str {
        COGNITION_TRANSFORMER_ID
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn target(&self) -> &str {
        "cognition"
    }

    fn reversible(&self) -> bool {
        true
    }

    fn extract(&self, context: &UnifiedContext) -> Result<CognitiveContext> {
        let bag = context.snapshot();

        let thought_history = items(&bag, &["thoughts", "thoughtHistory"]);
        let current_thought = bag
            .get("currentThought")
            .and_then(CognitiveItem::from_value)
            .or_else(|| thought_history.last().cloned());
        let reasoning_chain = items(&bag, &["reasoningChain", "reasoning"]);
        let decisions = items(&bag, &["decisions"]);
        let goals = items(&bag, &["goals"]);
        let plans = items(&bag, &["plans"]);
        let constraints = items(&bag, &["constraints"]);

        let factors = Self::contextual_factors(context);
        let active = goals.len() + plans.len() + decisions.len() + thought_history.len();
        let load = cognitive_load(
            active,
            constraints.len(),
            decisions.len(),
            factors.emotional_intensity.unwrap_or(0.0),
        );

        let mut focus_source: Vec<&str> = thought_history.iter().map(|t| t.content.as_str()).collect();
        if let Some(message) = ["message", "content", "text", "query"]
            .iter()
            .find_map(|k| bag.get(*k).and_then(Value::as_str))
        {
            focus_source.push(message);
        }
        let focus_terms = self.scorer.key_terms(&focus_source.join(" "), FOCUS_TERM_LIMIT);

        Ok(CognitiveContext {
            current_thought,
            reasoning_depth: (reasoning_chain.len() as u32).min(MAX_REASONING_DEPTH),
            thought_history,
            reasoning_chain,
            decisions,
            goals,
            plans,
            constraints,
            cognitive_load: load,
            focus_terms,
            memory_references: Self::memory_references(context),
            contextual_factors: Some(factors),
        })
    }

    fn prune(
        &self,
        mut view: CognitiveContext,
        strategy: TransformationStrategy,
        config: &TransformationConfig,
    ) -> PruneOutcome<CognitiveContext> {
        match strategy {
            TransformationStrategy::Full | TransformationStrategy::Cached => {
                PruneOutcome::untouched(view)
            }
            TransformationStrategy::Selective => {
                let n = config.selective_limit;
                let pruned = keep_last(&mut view.thought_history, n)
                    + keep_first(&mut view.reasoning_chain, n)
                    + keep_first(&mut view.decisions, n)
                    + keep_first(&mut view.goals, n)
                    + keep_first(&mut view.plans, n)
                    + keep_first(&mut view.constraints, n)
                    + keep_first(&mut view.focus_terms, n)
                    + keep_first(&mut view.memory_references, n);
                PruneOutcome {
                    output: view,
                    fields_dropped: Vec::new(),
                    items_pruned: pruned,
                    items_reordered: 0,
                }
            }
            TransformationStrategy::Optimized => {
                let mut emptied = Vec::new();
                let mut pruned = 0;
                let mut reordered = 0;
                for (name, list) in [
                    ("thoughtHistory", &mut view.thought_history),
                    ("reasoningChain", &mut view.reasoning_chain),
                    ("decisions", &mut view.decisions),
                    ("goals", &mut view.goals),
                    ("plans", &mut view.plans),
                    ("constraints", &mut view.constraints),
                ] {
                    let had_items = !list.is_empty();
                    let (removed, moved) = keep_significant(list, config);
                    pruned += removed;
                    reordered += moved;
                    if had_items && list.is_empty() {
                        emptied.push(name.to_string());
                    }
                }

                let before = view.memory_references.len();
                view.memory_references
                    .retain(|m| m.relevance >= config.relevance_threshold);
                let filtered = view.memory_references.clone();
                view.memory_references
                    .sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
                pruned += before - view.memory_references.len();
                reordered += displaced(&filtered, &view.memory_references);

                PruneOutcome {
                    output: view,
                    fields_dropped: emptied,
                    items_pruned: pruned,
                    items_reordered: reordered,
                }
            }
            TransformationStrategy::Minimal => {
                let caps = &config.minimal;
                let pruned = keep_last(&mut view.thought_history, caps.thought_history)
                    + keep_first(&mut view.reasoning_chain, caps.reasoning_chain)
                    + keep_first(&mut view.decisions, caps.decisions)
                    + keep_first(&mut view.goals, caps.goals)
                    + keep_first(&mut view.plans, caps.plans)
                    + keep_first(&mut view.constraints, caps.constraints)
                    + keep_first(&mut view.focus_terms, caps.focus_terms)
                    + keep_first(&mut view.memory_references, caps.memory_references);

                let mut fields_dropped = Vec::new();
                if view.contextual_factors.take().is_some() {
                    fields_dropped.push("contextualFactors".to_string());
                }

                PruneOutcome {
                    output: view,
                    fields_dropped,
                    items_pruned: pruned,
                    items_reordered: 0,
                }
            }
        }
    }

    fn validate(&self, context: &UnifiedContext) -> ValidationResult {
        let mut issues = Vec::new();

        if context.agent_id.trim().is_empty() {
            issues.push(ValidationIssue::new("agentId", "agent id is empty", Severity::Critical));
        }

        let bag = context.snapshot();
        let mut has_input = false;
        for key in ["thoughts", "reasoningChain", "decisions", "goals", "plans", "constraints"] {
            let Some(value) = bag.get(key) else {
                continue;
            };
            let Some(list) = value.as_array() else {
                issues.push(ValidationIssue::new(key, "expected an array", Severity::Error));
                continue;
            };
            has_input |= !list.is_empty();

            for (i, entry) in list.iter().enumerate() {
                match CognitiveItem::from_value(entry) {
                    None => issues.push(ValidationIssue::new(
                        format!("{}[{}]", key, i),
                        "entry has no content",
                        Severity::Error,
                    )),
                    Some(item) if item.content.trim().is_empty() => issues.push(
                        ValidationIssue::new(
                            format!("{}[{}].content", key, i),
                            "content is blank",
                            Severity::Error,
                        ),
                    ),
                    Some(_) => {}
                }

                if let Some(obj) = entry.as_object() {
                    for score in ["confidence", "importance", "relevance"] {
                        if let Some(v) = obj.get(score).and_then(Value::as_f64) {
                            if !(0.0..=1.0).contains(&v) {
                                issues.push(ValidationIssue::new(
                                    format!("{}[{}].{}", key, i, score),
                                    format!("{} out of range, clamped to [0, 1]", v),
                                    Severity::Warning,
                                ));
                            }
                        }
                    }
                }
            }
        }

        if !has_input {
            issues.push(ValidationIssue::new(
                "thoughts",
                "no cognitive input recorded",
                Severity::Warning,
            ));
        }
        if !context.contains(MEMORY_CONTEXT_KEY) {
            issues.push(ValidationIssue::new(
                MEMORY_CONTEXT_KEY,
                "memory enrichment absent",
                Severity::Info,
            ));
        }

        ValidationResult::from_issues(issues)
    }

    fn reverse(&self, output: &CognitiveContext) -> Result<ContextBag> {
        let list = |items: &[CognitiveItem]| Value::Array(items.iter().map(CognitiveItem::to_value).collect());

        let mut bag = ContextBag::new();
        bag.insert("thoughts".into(), list(&output.thought_history));
        if let Some(current) = &output.current_thought {
            bag.insert("currentThought".into(), current.to_value());
        }
        bag.insert("reasoningChain".into(), list(&output.reasoning_chain));
        bag.insert("decisions".into(), list(&output.decisions));
        bag.insert("goals".into(), list(&output.goals));
        bag.insert("plans".into(), list(&output.plans));
        bag.insert("constraints".into(), list(&output.constraints));
        bag.insert(
            "memoryReferences".into(),
            serde_json::to_value(&output.memory_references)?,
        );
        Ok(bag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::models::TransformSettings;
    use crate::transform::transformer::TransformEngine;

    fn context_with_thoughts(n: usize) -> UnifiedContext {
        let thoughts: Vec<Value> = (0..n)
            .map(|i| json!({"content": format!("thought {}", i), "relevance": 0.1 * (i % 10) as f64}))
            .collect();
        let steps: Vec<Value> = (0..8).map(|i| json!(format!("step {}", i))).collect();
        let base = json!({
            "message": "plan the deployment rollout",
            "thoughts": thoughts,
            "reasoningChain": steps,
            "goals": [{"description": "ship release", "priority": 0.9}],
        });
        UnifiedContext::new("a1", base.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn test_item_parsing() {
        let item = CognitiveItem::from_value(&json!({"description": "d", "priority": 2.0})).unwrap();
        assert_eq!(item.content, "d");
        assert_eq!(item.importance, 1.0);
        assert!(CognitiveItem::from_value(&json!(42)).is_none());
        assert!(CognitiveItem::from_value(&json!({"other": 1})).is_none());
    }

    #[test]
    fn test_extract_full_view() {
        let transformer = CognitionTransformer::new();
        let view = transformer.extract(&context_with_thoughts(20)).unwrap();

        assert_eq!(view.thought_history.len(), 20);
        assert_eq!(view.current_thought.unwrap().content, "thought 19");
        assert_eq!(view.reasoning_depth, 8);
        assert!((0.0..=1.0).contains(&view.cognitive_load));
        assert!(view.focus_terms.contains(&"deployment".to_string()));
    }

    #[test]
    fn test_reasoning_depth_capped() {
        let steps: Vec<Value> = (0..25).map(|i| json!(format!("s{}", i))).collect();
        let base = json!({"reasoningChain": steps});
        let ctx = UnifiedContext::new("a1", base.as_object().cloned().unwrap_or_default());
        let view = CognitionTransformer::new().extract(&ctx).unwrap();
        assert_eq!(view.reasoning_depth, MAX_REASONING_DEPTH);
    }

    #[tokio::test]
    async fn test_minimal_caps_lists() {
        let engine = TransformEngine::new(CognitionTransformer::new(), &TransformSettings::default());
        let config = TransformationConfig::with_strategy(TransformationStrategy::Minimal);
        let result = engine
            .transform(&context_with_thoughts(20), Some(&config))
            .await;

        let out = result.transformed_context.clone().unwrap();
        assert_eq!(out.thought_history.len(), 3);
        assert_eq!(out.thought_history[2].content, "thought 19");
        assert!(out.reasoning_chain.len() <= 5);
        assert!(out.contextual_factors.is_none());

        let metadata = result.metadata.unwrap();
        assert_eq!(metadata.fields_dropped, vec!["contextualFactors"]);
        assert_eq!(metadata.items_pruned, 17 + 3);
    }

    #[test]
    fn test_optimized_filters_by_threshold() {
        let transformer = CognitionTransformer::new();
        let view = transformer.extract(&context_with_thoughts(10)).unwrap();
        let config = TransformationConfig {
            relevance_threshold: 0.75,
            importance_threshold: 0.9,
            ..TransformationConfig::with_strategy(TransformationStrategy::Optimized)
        };
        let outcome = transformer.prune(view, TransformationStrategy::Optimized, &config);

        let kept: Vec<&str> = outcome
            .output
            .thought_history
            .iter()
            .map(|t| t.content.as_str())
            .collect();
        assert_eq!(kept, vec!["thought 9", "thought 8"]);
        assert!(outcome.items_pruned >= 8);
    }

    #[test]
    fn test_validate_reports_field_issues() {
        let base = json!({
            "thoughts": [{"content": "  "}, {"content": "ok", "confidence": 1.4}],
            "goals": "not a list",
        });
        let ctx = UnifiedContext::new("a1", base.as_object().cloned().unwrap_or_default());
        let report = CognitionTransformer::new().validate(&ctx);

        assert!(!report.valid);
        let fields: Vec<&str> = report.errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"thoughts[0].content"));
        assert!(fields.contains(&"goals"));
        assert!(report
            .warnings
            .iter()
            .any(|w| w.field == "thoughts[1].confidence"));
        assert!(report.score < 1.0);
    }
}
