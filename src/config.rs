use crate::enrichment::enrichers::EnricherSettings;
use crate::enrichment::pipeline::PipelineConfig;
use crate::error::{ContextError, Result};
use crate::runtime::RuntimeConfig;
use crate::transform::models::TransformSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;
use validator::Validate;

/// Environment variable naming an override file
pub const CONFIG_PATH_ENV: &str = "CONTEXT_ENGINE_CONFIG";

/// Environment prefix for individual keys (`CTX_ENGINE__PIPELINE__MAX_CONCURRENCY`)
pub const ENV_PREFIX: &str = "CTX_ENGINE";

const DEFAULT_CONFIG_PATH: &str = "config/context-engine.toml";
const EMBEDDED_DEFAULTS: &str = include_str!("../config/default.toml");

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Pipeline execution policy
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Enricher settings and per-enricher policy overrides
    #[serde(default)]
    pub enrichers: EnricherSettings,

    /// Transformer defaults and cache sizing
    #[serde(default)]
    pub transform: TransformSettings,

    /// Background tasks and agent context retention
    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from embedded defaults, file and environment
    pub fn load() -> Result<Self> {
        let config_path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&config_path)
    }

    /// Same layering with an explicit override file, which may be absent
    pub fn load_from(config_path: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            // Start with default values
            .add_source(config::File::from_str(
                EMBEDDED_DEFAULTS,
                config::FileFormat::Toml,
            ))
            // Override with config file if it exists
            .add_source(config::File::with_name(config_path).required(false))
            // Override with environment variables (prefix: CTX_ENGINE__)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Embedded defaults overlaid with one required file; environment ignored
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path.to_str().ok_or_else(|| {
            ContextError::Configuration(format!("non UTF-8 config path: {}", path.display()))
        })?;

        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(
                EMBEDDED_DEFAULTS,
                config::FileFormat::Toml,
            ))
            .add_source(config::File::with_name(path_str).required(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Cross-section checks on top of the derive rules
    pub fn validate(&self) -> Result<()> {
        self.pipeline
            .validate()
            .map_err(|e| ContextError::Configuration(format!("pipeline: {}", e)))?;
        self.runtime
            .validate()
            .map_err(|e| ContextError::Configuration(format!("runtime: {}", e)))?;
        self.transform.defaults.check()?;

        for (id, policy) in &self.enrichers.overrides {
            if policy.timeout_ms == Some(0) {
                return Err(ContextError::Configuration(format!(
                    "enrichers.overrides.{}: timeout_ms must be positive",
                    id
                )));
            }
            if policy.cache_ttl_ms == Some(0) {
                return Err(ContextError::Configuration(format!(
                    "enrichers.overrides.{}: cache_ttl_ms must be positive",
                    id
                )));
            }
        }

        if self.pipeline.max_retry_backoff_ms < self.pipeline.retry_backoff_ms {
            return Err(ContextError::Configuration(
                "pipeline: max_retry_backoff_ms is below retry_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub json_logs: bool,

    /// Register Prometheus metrics at startup
    #[serde(default = "default_true")]
    pub prometheus_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            prometheus_enabled: true,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::models::EnricherPriority;
    use crate::transform::models::TransformationStrategy;
    use std::io::Write;

    #[test]
    fn test_embedded_defaults_match_default_impl() {
        let config = Config::load_from("does/not/exist").unwrap();
        assert_eq!(config.pipeline, PipelineConfig::default());
        assert_eq!(config.runtime, RuntimeConfig::default());
        assert_eq!(config.transform, TransformSettings::default());
        assert_eq!(config.enrichers.memory, Default::default());
        assert_eq!(config.observability, ObservabilityConfig::default());
    }

    #[test]
    fn test_file_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[pipeline]
max_concurrency = 8

[transform.defaults]
strategy = "MINIMAL"

[enrichers.temporal]
timezone = "Europe/Berlin"

[enrichers.overrides.social]
enabled = false
priority = "CRITICAL"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.pipeline.max_concurrency, 8);
        assert_eq!(config.pipeline.default_timeout_ms, 30_000);
        assert_eq!(config.transform.defaults.strategy, TransformationStrategy::Minimal);
        assert_eq!(config.enrichers.temporal.timezone, "Europe/Berlin");
        let social = &config.enrichers.overrides["social"];
        assert_eq!(social.enabled, Some(false));
        assert_eq!(social.priority, Some(EnricherPriority::Critical));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[pipeline]\nmax_concurrency = 0").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ContextError::Configuration(_))
        ));

        let mut config = Config::default();
        config.enrichers.overrides.insert(
            "memory".to_string(),
            crate::enrichment::models::EnricherConfigOverride {
                timeout_ms: Some(0),
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_required_file() {
        assert!(Config::from_file("/definitely/not/here.toml").is_err());
    }
}
