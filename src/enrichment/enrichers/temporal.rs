use crate::enrichment::enricher::{ContextEnricher, EnricherBase, EnrichmentOutput};
use crate::enrichment::models::{
    ContextBag, EnricherConfig, EnricherPriority, EnrichmentRequest, EnrichmentStage,
};
use crate::enrichment::providers::{system_clock, Clock};
use crate::error::{ContextError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

pub const TEMPORAL_ENRICHER_ID: &str = "temporal";
pub const TEMPORAL_CONTEXT_KEY: &str = "temporalContext";

/// Clock and session policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemporalSettings {
    /// IANA timezone name
    pub timezone: String,
    pub business_hours_start: u32,
    pub business_hours_end: u32,
    pub idle_threshold_minutes: i64,
    /// Sessions idle longer than this are reset and swept
    pub session_timeout_minutes: i64,
    pub baseline_confidence: f64,
}

impl Default for TemporalSettings {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            business_hours_start: 9,
            business_hours_end: 17,
            idle_threshold_minutes: 30,
            session_timeout_minutes: 60,
            baseline_confidence: 0.95,
        }
    }
}

#[derive(Debug, Clone)]
struct SessionState {
    started_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    interactions: u64,
}

/// Result of touching the session tracker
#[derive(Debug, Clone, PartialEq)]
struct SessionTouch {
    started_at: DateTime<Utc>,
    interactions: u64,
    idle_minutes: i64,
    first_interaction: bool,
    returning_after_idle: bool,
}

/// Wall-clock context plus a lightweight session tracker
pub struct TemporalEnricher {
    base: EnricherBase,
    settings: TemporalSettings,
    sessions: DashMap<String, SessionState>,
    clock: Clock,
}

impl TemporalEnricher {
    pub fn new(settings: TemporalSettings) -> Self {
        Self {
            base: EnricherBase::new(
                TEMPORAL_ENRICHER_ID,
                "Temporal Enricher",
                Self::default_config(),
            ),
            settings,
            sessions: DashMap::new(),
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn default_config() -> EnricherConfig {
        EnricherConfig::new(EnrichmentStage::PreProcessing, EnricherPriority::High)
            .with_timeout_ms(1_000)
    }

    fn timezone(&self) -> Result<Tz> {
        self.settings.timezone.parse::<Tz>().map_err(|e| {
            ContextError::Configuration(format!(
                "invalid timezone '{}': {}",
                self.settings.timezone, e
            ))
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Explicit session id, else a stable hash of user and hour
    pub fn session_id(context: &ContextBag, now: DateTime<Utc>) -> String {
        if let Some(id) = context.get("sessionId").and_then(Value::as_str) {
            if !id.is_empty() {
                return id.to_string();
            }
        }

        let user = context
            .get("userId")
            .and_then(Value::as_str)
            .unwrap_or("anonymous");
        let mut hasher = Sha256::new();
        hasher.update(user.as_bytes());
        hasher.update(now.format("%Y-%m-%dT%H").to_string().as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
        format!("session-{}", hex)
    }

    pub fn time_of_day(hour: u32) -> &'static str {
        match hour {
            5..=11 => "morning",
            12..=16 => "afternoon",
            17..=20 => "evening",
            _ => "night",
        }
    }

    fn touch_session(&self, session_id: &str, now: DateTime<Utc>) -> SessionTouch {
        let timeout = Duration::minutes(self.settings.session_timeout_minutes);
        let idle_threshold = Duration::minutes(self.settings.idle_threshold_minutes);

        let mut first_interaction = false;
        let mut entry = self.sessions.entry(session_id.to_string()).or_insert_with(|| {
            first_interaction = true;
            SessionState {
                started_at: now,
                last_seen: now,
                interactions: 0,
            }
        });

        let idle = now - entry.last_seen;
        if idle > timeout {
            entry.started_at = now;
            entry.interactions = 0;
        }
        entry.last_seen = now;
        entry.interactions += 1;

        SessionTouch {
            started_at: entry.started_at,
            interactions: entry.interactions,
            idle_minutes: idle.num_minutes().max(0),
            first_interaction,
            returning_after_idle: !first_interaction && idle >= idle_threshold,
        }
    }
}

#[async_trait]
impl ContextEnricher for TemporalEnricher {
    fn base(&self) -> &EnricherBase {
        &self.base
    }

    fn provided_keys(&self) -> Vec<String> {
        vec![TEMPORAL_CONTEXT_KEY.to_string()]
    }

    fn cache_inputs(&self) -> Vec<String> {
        vec!["sessionId".to_string(), "userId".to_string()]
    }

    async fn setup(&self) -> Result<()> {
        self.timezone()?;
        if self.settings.business_hours_start >= self.settings.business_hours_end
            || self.settings.business_hours_end > 24
        {
            return Err(ContextError::Configuration(format!(
                "invalid business hours {}-{}",
                self.settings.business_hours_start, self.settings.business_hours_end
            )));
        }
        Ok(())
    }

    async fn do_enrich(&self, request: &EnrichmentRequest) -> Result<EnrichmentOutput> {
        let tz = self.timezone()?;
        let now = (self.clock)();
        let local = now.with_timezone(&tz);
        let hour = local.hour();
        let weekday = local.weekday();

        let is_weekend = matches!(weekday, Weekday::Sat | Weekday::Sun);
        let is_business_hours = !is_weekend
            && hour >= self.settings.business_hours_start
            && hour < self.settings.business_hours_end;
        let time_of_day = Self::time_of_day(hour);

        let session_id = Self::session_id(&request.context, now);
        let session = self.touch_session(&session_id, now);
        let session_minutes = (now - session.started_at).num_minutes().max(0);

        let conversation_age_minutes = request
            .context
            .get("conversationStartedAt")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|started| (now - started.with_timezone(&Utc)).num_minutes().max(0))
            .unwrap_or(session_minutes);

        let mut recommendations = Vec::new();
        if session.first_interaction {
            recommendations.push(json!({
                "type": "welcome",
                "message": "First interaction in this session; greet the user",
            }));
        }
        if session.returning_after_idle {
            recommendations.push(json!({
                "type": "re_engage",
                "message": format!("User returned after {} idle minutes; offer a recap", session.idle_minutes),
            }));
        }
        if time_of_day == "night" {
            recommendations.push(json!({
                "type": "tone",
                "message": "Late hour; keep responses brief",
            }));
        }

        debug!(session_id = %session_id, interactions = session.interactions, "Session tracked");

        Ok(EnrichmentOutput::slice(
            TEMPORAL_CONTEXT_KEY,
            json!({
                "timestamp": now.to_rfc3339(),
                "localTime": local.to_rfc3339(),
                "timezone": tz.name(),
                "timeOfDay": time_of_day,
                "dayOfWeek": weekday.to_string(),
                "isWeekend": is_weekend,
                "isBusinessHours": is_business_hours,
                "session": {
                    "sessionId": session_id,
                    "startedAt": session.started_at.to_rfc3339(),
                    "durationMinutes": session_minutes,
                    "interactionCount": session.interactions,
                    "idleMinutes": session.idle_minutes,
                },
                "conversationAgeMinutes": conversation_age_minutes,
                "chronologicalMarkers": {
                    "isFirstInteraction": session.first_interaction,
                    "isReturningAfterIdle": session.returning_after_idle,
                    "isLongSession": session_minutes >= self.settings.session_timeout_minutes,
                },
                "recommendations": recommendations,
            }),
        )
        .with_confidence(self.settings.baseline_confidence))
    }

    /// Drop sessions idle past the session timeout
    fn sweep_expired(&self) -> usize {
        let now = (self.clock)();
        let timeout = Duration::minutes(self.settings.session_timeout_minutes);
        let before = self.sessions.len();
        self.sessions.retain(|_, s| now - s.last_seen <= timeout);
        before - self.sessions.len()
    }
}
