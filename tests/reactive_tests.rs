use chrono::{Duration, NaiveDate, NaiveDateTime};
use std::sync::Arc;
use vitalscore::clock::FixedClock;
use vitalscore::config::ScoringSettings;
use vitalscore::database::Database;
use vitalscore::models::{MetricKind, QuantitySample, SampleArrival};
use vitalscore::pipeline::ScoringPipeline;
use vitalscore::provider::InMemoryProvider;
use vitalscore::reactive::RecalcOutcome;

/// Late-arriving samples replacing persisted scores

#[cfg(test)]
mod reactive_tests {
    use super::*;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 10)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    fn pipeline(provider: Arc<InMemoryProvider>) -> ScoringPipeline {
        ScoringPipeline::new(
            provider,
            Arc::new(Database::open_in_memory().unwrap()),
            Arc::new(FixedClock::new(now())),
            &ScoringSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_late_hrv_replaces_persisted_score() {
        let provider = Arc::new(InMemoryProvider::new());
        let pipeline = pipeline(provider.clone());
        let today = now().date();

        // Without HRV the component sits at neutral
        let before = pipeline.recovery.calculate_recovery_score(today).await.unwrap();
        assert_eq!(before.component("HRV").unwrap().score, 50.0);

        provider.add_samples(
            MetricKind::HeartRateVariability,
            [QuantitySample::new(now() - Duration::hours(3), 80.0)],
        );
        let outcomes = pipeline
            .reactive
            .handle_arrival(SampleArrival {
                metric: MetricKind::HeartRateVariability,
                received_at: now(),
            })
            .await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].date(), today);
        assert_eq!(outcomes[1].date(), today - Duration::days(1));

        let stored = pipeline.db.load_score(today).unwrap().unwrap();
        let after = pipeline.recovery.calculate_recovery_score(today).await.unwrap();
        assert_eq!(stored.recovery_score, after.final_score);
        assert!(after.component("HRV").unwrap().score > 50.0);
        assert!(after.final_score > before.final_score);
    }

    #[tokio::test]
    async fn test_change_notification_carries_new_score() {
        let provider = Arc::new(InMemoryProvider::new());
        let pipeline = pipeline(provider.clone());
        let mut changes = pipeline.reactive.subscribe();

        provider.add_samples(
            MetricKind::RestingHeartRate,
            [QuantitySample::new(now() - Duration::hours(1), 52.0)],
        );
        let outcomes = pipeline
            .reactive
            .handle_arrival(SampleArrival {
                metric: MetricKind::RestingHeartRate,
                received_at: now(),
            })
            .await;

        let mut received = Vec::new();
        while let Ok(change) = changes.try_recv() {
            received.push(change);
        }
        assert_eq!(received.len(), 2);
        for outcome in outcomes {
            let RecalcOutcome::Recomputed { date, recovery_score } = outcome else {
                panic!("expected a recomputed score, got {:?}", outcome);
            };
            let change = received.iter().find(|c| c.date == date).unwrap();
            assert_eq!(change.recovery_score, recovery_score);
            assert_eq!(change.trigger, MetricKind::RestingHeartRate);
        }
    }

    #[tokio::test]
    async fn test_failed_recalculation_keeps_nothing_pending() {
        let provider = Arc::new(InMemoryProvider::new());
        provider.set_authorized(false);
        let pipeline = pipeline(provider);

        let outcomes = pipeline
            .reactive
            .handle_arrival(SampleArrival {
                metric: MetricKind::SleepAnalysis,
                received_at: now(),
            })
            .await;

        assert!(outcomes
            .iter()
            .all(|outcome| matches!(outcome, RecalcOutcome::Failed { .. })));
        for date in pipeline.reactive.affected_dates() {
            assert!(!pipeline.reactive.is_pending(date));
        }
    }
}
