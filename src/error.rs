//! Unified error hierarchy for VitalScore
//!
//! Provides structured error information for the scoring pipeline and its
//! collaborators, plus severity mapping onto the tracing levels.
//!
//! Only two conditions are fatal for a scoring call: the raw-data collaborator
//! refusing access ([`ScoreError::DataUnavailable`]) and the absence of any
//! qualifying sleep session for the sleep calculator ([`ScoreError::NoSleepData`]).
//! Everything else degrades to a documented neutral value inside the calculators.

use chrono::NaiveDate;
use thiserror::Error;

use crate::models::MetricKind;

/// Top-level error type for all VitalScore operations
#[derive(Debug, Error)]
pub enum ScoreError {
    /// Collaborator unauthorized or absent
    #[error("Health data unavailable: {0}")]
    DataUnavailable(String),

    /// No qualifying sleep session for the wake date
    #[error("No sleep data for {date}")]
    NoSleepData { date: NaiveDate },

    /// A single enrichment metric could not be obtained
    #[error("Missing metric: {metric}")]
    MissingMetric { metric: MetricKind },

    /// Raw-data collaborator errors
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Persistence errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Errors reported by a [`crate::provider::RawMetricsProvider`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The user has not granted access to health data
    #[error("Access to health data was not authorized")]
    Unauthorized,

    /// The store could not answer the query
    #[error("Health store unavailable: {reason}")]
    Unavailable { reason: String },

    /// The fetch did not complete within the configured bound
    #[error("Fetch of {metric} timed out after {millis}ms")]
    Timeout { metric: MetricKind, millis: u64 },

    /// The metric cannot be fetched as a quantity series
    #[error("Unsupported metric for quantity query: {metric}")]
    UnsupportedMetric { metric: MetricKind },
}

/// Database operation errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Stored value is malformed: {0}")]
    Malformed(String),

    #[error("Database lock poisoned")]
    LockPoisoned,
}

/// Result type alias for VitalScore operations
pub type Result<T> = std::result::Result<T, ScoreError>;

impl ScoreError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ScoreError::Provider(ProviderError::Timeout { .. })
                | ScoreError::Provider(ProviderError::Unavailable { .. })
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ScoreError::NoSleepData { .. } => ErrorSeverity::Info,
            ScoreError::MissingMetric { .. } => ErrorSeverity::Info,
            ScoreError::Provider(ProviderError::Timeout { .. }) => ErrorSeverity::Warning,
            ScoreError::DataUnavailable(_) => ErrorSeverity::Error,
            ScoreError::Provider(_) => ErrorSeverity::Error,
            ScoreError::Database(DatabaseError::LockPoisoned) => ErrorSeverity::Critical,
            ScoreError::Database(_) => ErrorSeverity::Error,
            ScoreError::Configuration(_) => ErrorSeverity::Error,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            ScoreError::DataUnavailable(_)
            | ScoreError::Provider(ProviderError::Unauthorized) => {
                "Health data access is not authorized. Please grant access and try again."
                    .to_string()
            }
            ScoreError::NoSleepData { date } => {
                format!(
                    "Sleep data not yet available for {}. Scores appear once your wearable syncs.",
                    date
                )
            }
            ScoreError::MissingMetric { metric } => {
                format!("No recent {} readings were found.", metric)
            }
            _ => self.to_string(),
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical system error requiring immediate attention
    Critical,
    /// Error that prevents operation but system can continue
    Error,
    /// Warning that doesn't prevent operation
    Warning,
    /// Informational message
    Info,
}

impl ErrorSeverity {
    /// Convert to tracing level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            ErrorSeverity::Critical => tracing::Level::ERROR,
            ErrorSeverity::Error => tracing::Level::ERROR,
            ErrorSeverity::Warning => tracing::Level::WARN,
            ErrorSeverity::Info => tracing::Level::INFO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_severity() {
        let err = ScoreError::NoSleepData {
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        };
        assert_eq!(err.severity(), ErrorSeverity::Info);

        let err = ScoreError::MissingMetric {
            metric: MetricKind::OxygenSaturation,
        };
        assert_eq!(err.severity(), ErrorSeverity::Info);

        let err = ScoreError::Database(DatabaseError::LockPoisoned);
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert_eq!(err.severity().to_tracing_level(), tracing::Level::ERROR);
    }

    #[test]
    fn test_error_retryable() {
        let err = ScoreError::Provider(ProviderError::Timeout {
            metric: MetricKind::HeartRateVariability,
            millis: 5000,
        });
        assert!(err.is_retryable());

        let err = ScoreError::DataUnavailable("denied".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_user_messages() {
        let err = ScoreError::NoSleepData {
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        };
        assert!(err.user_message().contains("not yet available"));

        let err = ScoreError::Provider(ProviderError::Unauthorized);
        assert!(err.user_message().contains("not authorized"));
    }
}
