//! Wiring of the scoring components around one collaborator and database

use std::sync::Arc;
use tracing::info;

use crate::baseline::BaselineEngine;
use crate::clock::Clock;
use crate::config::ScoringSettings;
use crate::database::Database;
use crate::error::Result;
use crate::orchestrator::{OrchestratorSettings, ScoreOrchestrator};
use crate::provider::{DailyMetricsFetcher, RawMetricsProvider};
use crate::reactive::{ReactiveHandle, ReactiveRecalculationManager};
use crate::recovery::RecoveryScoreCalculator;
use crate::sleep::SleepScoreCalculator;

/// Every scoring component, sharing one fetcher, clock, and database
pub struct ScoringPipeline {
    pub provider: Arc<dyn RawMetricsProvider>,
    pub db: Arc<Database>,
    pub clock: Arc<dyn Clock>,
    pub baselines: Arc<BaselineEngine>,
    pub sleep: Arc<SleepScoreCalculator>,
    pub recovery: Arc<RecoveryScoreCalculator>,
    pub orchestrator: Arc<ScoreOrchestrator>,
    pub reactive: Arc<ReactiveRecalculationManager>,
}

impl ScoringPipeline {
    pub fn new(
        provider: Arc<dyn RawMetricsProvider>,
        db: Arc<Database>,
        clock: Arc<dyn Clock>,
        settings: &ScoringSettings,
    ) -> Self {
        let fetcher = DailyMetricsFetcher::new(
            provider.clone(),
            settings.fetch_timeout(),
            settings.session_rules(),
        );

        let baselines = Arc::new(BaselineEngine::new(
            fetcher.clone(),
            db.clone(),
            clock.clone(),
            settings.min_baseline_days,
        ));
        let sleep = Arc::new(SleepScoreCalculator::new(fetcher.clone(), baselines.clone()));
        let recovery = Arc::new(RecoveryScoreCalculator::new(
            fetcher.clone(),
            baselines.clone(),
            sleep.clone(),
            settings.fallbacks(),
        ));
        let orchestrator = Arc::new(ScoreOrchestrator::new(
            fetcher,
            clock.clone(),
            db.clone(),
            baselines.clone(),
            sleep.clone(),
            recovery.clone(),
            OrchestratorSettings::from(settings),
        ));
        let reactive = Arc::new(ReactiveRecalculationManager::new(
            clock.clone(),
            db.clone(),
            baselines.clone(),
            orchestrator.clone(),
            recovery.clone(),
        ));

        Self {
            provider,
            db,
            clock,
            baselines,
            sleep,
            recovery,
            orchestrator,
            reactive,
        }
    }

    /// Load persisted baselines and upgrade them if the algorithm changed
    pub async fn start(&self) -> Result<()> {
        self.baselines.load_baselines().await?;
        if self.baselines.ensure_latest_algorithm().await? {
            info!("Baselines recalculated with the latest algorithm");
        }
        Ok(())
    }

    /// Begin reacting to new-sample notifications
    pub fn watch_arrivals(&self) -> ReactiveHandle {
        self.reactive.spawn(self.provider.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::provider::InMemoryProvider;
    use chrono::NaiveDate;

    #[tokio::test]
    async fn test_start_runs_algorithm_upgrade_once() {
        let now = NaiveDate::from_ymd_opt(2024, 3, 10)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let pipeline = ScoringPipeline::new(
            Arc::new(InMemoryProvider::new()),
            db.clone(),
            Arc::new(FixedClock::new(now)),
            &ScoringSettings::default(),
        );

        pipeline.start().await.unwrap();
        assert!(db.get_flag(crate::baseline::LATEST_ALGORITHM_FLAG).unwrap());
        assert!(!pipeline.baselines.ensure_latest_algorithm().await.unwrap());
    }
}
