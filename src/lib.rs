// Library interface for VitalScore modules
// Integration tests and the CLI drive the pipeline through these exports

pub mod baseline;
pub mod cache;
pub mod clock;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod provider;
pub mod reactive;
pub mod recovery;
pub mod sleep;

// Re-export commonly used types for convenience
pub use models::*;
pub use baseline::{BaselineEngine, BaselineSnapshot, BaselineWindow};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{AppConfig, ScoringSettings};
pub use database::{Database, StoredScore};
pub use error::{ProviderError, Result, ScoreError};
pub use logging::{LogConfig, LogFormat, LogLevel};
pub use orchestrator::{DailyScoreBundle, ScoreOrchestrator, ScoreState, TrendMetric};
pub use pipeline::ScoringPipeline;
pub use provider::{DailyMetricsFetcher, InMemoryProvider, RawMetricsProvider};
pub use reactive::{ReactiveRecalculationManager, RecalcOutcome, ScoreChanged};
pub use recovery::{RecoveryCategory, RecoveryScoreCalculator, RecoveryScoreResult};
pub use sleep::{SleepScoreCalculator, SleepScoreResult, SleepSession};
