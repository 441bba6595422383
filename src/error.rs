use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy shared by the pipeline, enrichers and transformers
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Timeout,
    DependencyFailed,
    ConfigurationError,
    ResourceUnavailable,
    ValidationFailed,
    CircularDependency,
    EnricherNotFound,
    SerializationError,
    TransformationError,
    InternalError,
}

/// Engine error types
#[derive(Error, Debug)]
pub enum ContextError {
    /// Enricher or request deadline elapsed
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// An upstream enricher did not complete
    #[error("Dependency failed: {enricher} depends on {dependency}")]
    DependencyFailed { enricher: String, dependency: String },

    /// Invalid configuration, fatal at construction time
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// External collaborator missing or unreachable
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Input failed validation
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Dependency graph contains a cycle
    #[error("Circular dependency detected: {}", .cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    /// Enricher id is not registered
    #[error("Enricher not found: {0}")]
    EnricherNotFound(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Transformation or reversal could not be performed
    #[error("Transformation error: {0}")]
    Transformation(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ContextError {
    /// Get the taxonomy code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            ContextError::Timeout(_) => ErrorCode::Timeout,
            ContextError::DependencyFailed { .. } => ErrorCode::DependencyFailed,
            ContextError::Configuration(_) => ErrorCode::ConfigurationError,
            ContextError::ResourceUnavailable(_) => ErrorCode::ResourceUnavailable,
            ContextError::ValidationFailed(_) => ErrorCode::ValidationFailed,
            ContextError::CircularDependency { .. } => ErrorCode::CircularDependency,
            ContextError::EnricherNotFound(_) => ErrorCode::EnricherNotFound,
            ContextError::Serialization(_) => ErrorCode::SerializationError,
            ContextError::Transformation(_) => ErrorCode::TransformationError,
            ContextError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Get error code string
    pub fn error_code(&self) -> &'static str {
        match self.code() {
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::DependencyFailed => "DEPENDENCY_FAILED",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::ResourceUnavailable => "RESOURCE_UNAVAILABLE",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::CircularDependency => "CIRCULAR_DEPENDENCY",
            ErrorCode::EnricherNotFound => "ENRICHER_NOT_FOUND",
            ErrorCode::SerializationError => "SERIALIZATION_ERROR",
            ErrorCode::TransformationError => "TRANSFORMATION_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Whether this error must abort pipeline construction
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ContextError::Configuration(_)
                | ContextError::CircularDependency { .. }
                | ContextError::EnricherNotFound(_)
        )
    }
}

/// Conversion from serde_json::Error
impl From<serde_json::Error> for ContextError {
    fn from(err: serde_json::Error) -> Self {
        ContextError::Serialization(err.to_string())
    }
}

/// Conversion from validator::ValidationErrors
impl From<validator::ValidationErrors> for ContextError {
    fn from(err: validator::ValidationErrors) -> Self {
        ContextError::Configuration(err.to_string())
    }
}

/// Conversion from config::ConfigError
impl From<config::ConfigError> for ContextError {
    fn from(err: config::ConfigError) -> Self {
        ContextError::Configuration(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ContextError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ContextError::Timeout("memory".to_string()).error_code(),
            "TIMEOUT"
        );
        assert_eq!(
            ContextError::EnricherNotFound("x".to_string()).error_code(),
            "ENRICHER_NOT_FOUND"
        );
        assert_eq!(
            ContextError::CircularDependency {
                cycle: vec!["a".into(), "b".into(), "a".into()]
            }
            .error_code(),
            "CIRCULAR_DEPENDENCY"
        );
    }

    #[test]
    fn test_code_string_matches_display() {
        let err = ContextError::DependencyFailed {
            enricher: "b".to_string(),
            dependency: "a".to_string(),
        };
        assert_eq!(err.code().to_string(), err.error_code());
        assert_eq!(
            ErrorCode::from_str("RESOURCE_UNAVAILABLE").unwrap(),
            ErrorCode::ResourceUnavailable
        );
    }

    #[test]
    fn test_cycle_message_names_path() {
        let err = ContextError::CircularDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert!(err.to_string().contains("a -> b -> a"));
        assert!(err.is_fatal());
        assert!(!ContextError::Timeout("t".into()).is_fatal());
    }

    #[test]
    fn test_serde_code() {
        let json = serde_json::to_string(&ErrorCode::ValidationFailed).unwrap();
        assert_eq!(json, r#""VALIDATION_FAILED""#);
    }
}
