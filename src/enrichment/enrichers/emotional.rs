use crate::enrichment::enricher::{ContextEnricher, EnricherBase, EnrichmentOutput};
use crate::enrichment::enrichers::{message_text, TEXT_KEYS};
use crate::enrichment::models::{
    clamp_unit, EnricherConfig, EnricherPriority, EnrichmentRequest, EnrichmentStage,
};
use crate::enrichment::providers::{EmotionProvider, EmotionState};
use crate::enrichment::scoring::{LexiconScorer, ScoringStrategy};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::warn;

pub const EMOTIONAL_ENRICHER_ID: &str = "emotional";
pub const EMOTIONAL_CONTEXT_KEY: &str = "emotionalContext";

/// Sliding-window emotion analysis policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmotionalSettings {
    /// Readings considered, current state included
    pub history_window: usize,
    /// Added to volatility for each change of emotion between readings
    pub change_penalty: f64,
    /// Added to a contextual emotion already present in recent history
    pub history_boost: f64,
}

impl Default for EmotionalSettings {
    fn default() -> Self {
        Self {
            history_window: 10,
            change_penalty: 0.5,
            history_boost: 0.1,
        }
    }
}

/// Volatility over consecutive readings in [0, 1]
///
/// Sum of absolute intensity deltas plus `change_penalty` per emotion
/// change, normalized by the number of transitions and capped.
pub fn volatility(readings: &[EmotionState], change_penalty: f64) -> f64 {
    if readings.len() < 2 {
        return 0.0;
    }

    let total: f64 = readings
        .windows(2)
        .map(|pair| {
            let delta = (clamp_unit(pair[1].intensity) - clamp_unit(pair[0].intensity)).abs();
            let change = if pair[0].emotion != pair[1].emotion {
                change_penalty
            } else {
                0.0
            };
            delta + change
        })
        .sum();

    clamp_unit(total / (readings.len() - 1) as f64)
}

/// Emotion with the largest summed intensity; ties go to the most recent
pub fn dominant_emotion(readings: &[EmotionState]) -> Option<String> {
    let mut weight: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
    for (idx, reading) in readings.iter().enumerate() {
        let entry = weight.entry(reading.emotion.as_str()).or_insert((0.0, 0));
        entry.0 += clamp_unit(reading.intensity);
        entry.1 = idx;
    }

    weight
        .into_iter()
        .max_by(|a, b| a.1 .0.total_cmp(&b.1 .0).then_with(|| a.1 .1.cmp(&b.1 .1)))
        .map(|(emotion, _)| emotion.to_string())
}

/// Emotional state from the emotion module plus keyword cues in the message
pub struct EmotionalEnricher {
    base: EnricherBase,
    provider: Option<Arc<dyn EmotionProvider>>,
    settings: EmotionalSettings,
    scorer: Arc<dyn ScoringStrategy>,
}

impl EmotionalEnricher {
    pub fn new(provider: Option<Arc<dyn EmotionProvider>>, settings: EmotionalSettings) -> Self {
        Self {
            base: EnricherBase::new(
                EMOTIONAL_ENRICHER_ID,
                "Emotional Enricher",
                Self::default_config(),
            ),
            provider,
            settings,
            scorer: Arc::new(LexiconScorer::new()),
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn ScoringStrategy>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn default_config() -> EnricherConfig {
        EnricherConfig::new(EnrichmentStage::CoreEnrichment, EnricherPriority::Medium)
    }

    fn contextual_emotions(&self, text: &str, recent: &HashSet<&str>) -> BTreeMap<String, f64> {
        self.scorer
            .emotion_scores(text)
            .into_iter()
            .map(|(emotion, score)| {
                let boost = if recent.contains(emotion.as_str()) {
                    self.settings.history_boost
                } else {
                    0.0
                };
                let boosted = clamp_unit(score + boost);
                (emotion, boosted)
            })
            .collect()
    }

    async fn readings(&self, provider: &dyn EmotionProvider, warnings: &mut Vec<String>) -> (Option<EmotionState>, Vec<EmotionState>) {
        let current = match provider.current_state().await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Emotion module current state unavailable");
                warnings.push(format!("current emotion unavailable: {}", e));
                None
            }
        };

        let window = self.settings.history_window.max(1);
        let history_limit = if current.is_some() { window - 1 } else { window };
        let mut readings = match provider.history(history_limit).await {
            Ok(history) => history,
            Err(e) => {
                warn!(error = %e, "Emotion module history unavailable");
                warnings.push(format!("emotion history unavailable: {}", e));
                Vec::new()
            }
        };
        if let Some(state) = &current {
            readings.push(state.clone());
        }

        (current, readings)
    }
}

#[async_trait]
impl ContextEnricher for EmotionalEnricher {
    fn base(&self) -> &EnricherBase {
        &self.base
    }

    fn provided_keys(&self) -> Vec<String> {
        vec![EMOTIONAL_CONTEXT_KEY.to_string()]
    }

    fn cache_inputs(&self) -> Vec<String> {
        TEXT_KEYS.iter().map(|k| k.to_string()).collect()
    }

    async fn do_enrich(&self, request: &EnrichmentRequest) -> Result<EnrichmentOutput> {
        let text = message_text(&request.context).unwrap_or_default();

        let Some(provider) = &self.provider else {
            let contextual = self.contextual_emotions(text, &HashSet::new());
            return Ok(EnrichmentOutput::slice(
                EMOTIONAL_CONTEXT_KEY,
                json!({
                    "available": false,
                    "reason": "emotion module not configured",
                    "contextualEmotions": contextual,
                }),
            )
            .with_confidence(0.0)
            .with_description("emotion enrichment unavailable"));
        };

        let mut warnings = Vec::new();
        let (current, readings) = self.readings(provider.as_ref(), &mut warnings).await;

        let recent: HashSet<&str> = readings.iter().map(|r| r.emotion.as_str()).collect();
        let contextual = self.contextual_emotions(text, &recent);

        let average_intensity = if readings.is_empty() {
            0.0
        } else {
            readings.iter().map(|r| clamp_unit(r.intensity)).sum::<f64>() / readings.len() as f64
        };

        let trend = match (readings.first(), readings.last()) {
            (Some(first), Some(last)) if readings.len() > 1 => {
                let delta = last.intensity - first.intensity;
                if delta > 0.1 {
                    "rising"
                } else if delta < -0.1 {
                    "falling"
                } else {
                    "stable"
                }
            }
            _ => "stable",
        };

        let dominant = dominant_emotion(&readings)
            .or_else(|| {
                contextual
                    .iter()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(emotion, _)| emotion.clone())
            })
            .unwrap_or_else(|| "neutral".to_string());

        let window = self.settings.history_window.max(1) as f64;
        let coverage = (readings.len() as f64 / window).min(1.0);
        let confidence = 0.3 + 0.4 * coverage + if current.is_some() { 0.3 } else { 0.0 };

        let mut output = EnrichmentOutput::slice(
            EMOTIONAL_CONTEXT_KEY,
            json!({
                "available": true,
                "currentEmotion": current.as_ref().map(|c| c.emotion.clone()),
                "currentIntensity": current.as_ref().map(|c| clamp_unit(c.intensity)),
                "dominantEmotion": dominant,
                "averageIntensity": average_intensity,
                "volatility": volatility(&readings, self.settings.change_penalty),
                "trend": trend,
                "historySize": readings.len(),
                "recentEmotions": recent.iter().copied().collect::<std::collections::BTreeSet<_>>(),
                "contextualEmotions": contextual,
                "triggers": current.as_ref().map_or(Value::Null, |c| json!(c.triggers)),
            }),
        )
        .with_confidence(confidence);
        output.warnings = warnings;
        Ok(output)
    }
}
