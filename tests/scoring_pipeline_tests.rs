use chrono::{Duration, NaiveDate, NaiveDateTime};
use std::sync::Arc;
use vitalscore::clock::FixedClock;
use vitalscore::config::ScoringSettings;
use vitalscore::database::Database;
use vitalscore::models::{MetricKind, QuantitySample, StageInterval, StageKind};
use vitalscore::orchestrator::{ScoreState, TrendMetric};
use vitalscore::pipeline::ScoringPipeline;
use vitalscore::provider::InMemoryProvider;
use vitalscore::ScoreError;

/// End-to-end tests driving the full scoring pipeline against an in-memory store

#[cfg(test)]
mod scoring_pipeline_tests {
    use super::*;

    fn wake_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 10).unwrap()
    }

    fn at(date: NaiveDate, h: u32, m: u32) -> NaiveDateTime {
        date.and_hms_opt(h, m, 0).unwrap()
    }

    fn stage(kind: StageKind, start: NaiveDateTime, minutes: i64) -> StageInterval {
        StageInterval::new(kind, start, start + Duration::minutes(minutes))
    }

    /// 8h in bed from 23:45 with 105m deep, 120m REM, 225m core, 30m awake
    fn reference_night(provider: &InMemoryProvider) {
        let start = at(wake_date() - Duration::days(1), 23, 45);
        let layout = [
            (StageKind::Core, 60),
            (StageKind::Deep, 105),
            (StageKind::Core, 60),
            (StageKind::Rem, 120),
            (StageKind::Awake, 30),
            (StageKind::Core, 105),
        ];

        let mut cursor = start;
        let mut intervals = Vec::new();
        for (kind, minutes) in layout {
            intervals.push(stage(kind, cursor, minutes));
            cursor += Duration::minutes(minutes);
        }
        provider.add_stages(intervals);
    }

    /// Nine days of steady history, then today's HRV 44 ms and RHR 57 bpm, no night
    fn history_provider() -> Arc<InMemoryProvider> {
        let provider = Arc::new(InMemoryProvider::new());
        for days_back in 1..=9 {
            let day = wake_date() - Duration::days(days_back);
            provider.add_samples(
                MetricKind::HeartRateVariability,
                [QuantitySample::new(at(day, 6, 30), 40.0)],
            );
            provider.add_samples(
                MetricKind::RestingHeartRate,
                [QuantitySample::new(at(day, 6, 30), 60.0)],
            );
        }
        provider.add_samples(
            MetricKind::HeartRateVariability,
            [QuantitySample::new(at(wake_date(), 6, 30), 44.0)],
        );
        provider.add_samples(
            MetricKind::RestingHeartRate,
            [QuantitySample::new(at(wake_date(), 6, 30), 57.0)],
        );
        provider
    }

    fn seeded_provider() -> Arc<InMemoryProvider> {
        let provider = history_provider();
        reference_night(&provider);
        provider
    }

    fn pipeline_at(provider: Arc<InMemoryProvider>, now: NaiveDateTime) -> (ScoringPipeline, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(now));
        let pipeline = ScoringPipeline::new(
            provider,
            Arc::new(Database::open_in_memory().unwrap()),
            clock.clone(),
            &ScoringSettings::default(),
        );
        (pipeline, clock)
    }

    #[tokio::test]
    async fn test_sleep_score_from_fetched_samples() {
        let provider = seeded_provider();
        let (pipeline, _) = pipeline_at(provider.clone(), at(wake_date(), 9, 0));

        let result = pipeline.sleep.calculate_sleep_score(wake_date()).await.unwrap();
        assert_eq!(result.final_score, 94);
        assert_eq!(result.details.session.time_asleep_minutes(), 450.0);
        assert_eq!(result.details.resting_hr, Some(57.0));
    }

    #[tokio::test]
    async fn test_cached_sleep_score_makes_no_fetches() {
        let provider = seeded_provider();
        let (pipeline, _) = pipeline_at(provider.clone(), at(wake_date(), 9, 0));

        let first = pipeline.sleep.calculate_sleep_score(wake_date()).await.unwrap();
        provider.reset_counters();

        let second = pipeline.sleep.calculate_sleep_score(wake_date()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.total_fetches(), 0);
        assert_eq!(provider.authorization_calls(), 0);
    }

    #[tokio::test]
    async fn test_unauthorized_is_data_unavailable() {
        let provider = seeded_provider();
        provider.set_authorized(false);
        let (pipeline, _) = pipeline_at(provider.clone(), at(wake_date(), 9, 0));

        let sleep = pipeline.sleep.calculate_sleep_score(wake_date()).await;
        assert!(matches!(sleep, Err(ScoreError::DataUnavailable(_))));

        let recovery = pipeline.recovery.calculate_recovery_score(wake_date()).await;
        assert!(matches!(recovery, Err(ScoreError::DataUnavailable(_))));

        let loaded = pipeline.orchestrator.load_data(wake_date()).await;
        assert!(matches!(loaded, Err(ScoreError::DataUnavailable(_))));
        assert!(matches!(
            pipeline.orchestrator.current_state(),
            ScoreState::Failed { .. }
        ));
        assert_eq!(provider.total_fetches(), 0);
    }

    #[tokio::test]
    async fn test_before_morning_cutoff_not_yet_available() {
        let provider = seeded_provider();
        let (pipeline, clock) = pipeline_at(provider.clone(), at(wake_date(), 7, 30));

        let state = pipeline.orchestrator.load_data(wake_date()).await.unwrap();
        assert!(matches!(state, ScoreState::NotYetAvailable { .. }));
        assert_eq!(provider.total_fetches(), 0);

        // Earlier dates are not held back; the night before has no stages
        let yesterday = wake_date() - Duration::days(1);
        let state = pipeline.orchestrator.load_data(yesterday).await.unwrap();
        assert!(matches!(state, ScoreState::NotYetAvailable { .. }));
        assert!(provider.total_fetches() > 0);

        clock.set(at(wake_date(), 8, 0));
        let state = pipeline.orchestrator.load_data(wake_date()).await.unwrap();
        assert!(state.bundle().is_some());
    }

    #[tokio::test]
    async fn test_missing_sleep_is_not_yet_available() {
        let provider = Arc::new(InMemoryProvider::new());
        provider.add_samples(
            MetricKind::HeartRateVariability,
            [QuantitySample::new(at(wake_date(), 6, 30), 44.0)],
        );
        let (pipeline, _) = pipeline_at(provider, at(wake_date(), 9, 0));

        let state = pipeline.orchestrator.load_data(wake_date()).await.unwrap();
        assert!(matches!(state, ScoreState::NotYetAvailable { .. }));

        // Recovery alone degrades to a neutral sleep component
        let recovery = pipeline.recovery.calculate_recovery_score(wake_date()).await.unwrap();
        assert_eq!(recovery.details.sleep_score, None);
        assert_eq!(recovery.component("Sleep").unwrap().score, 50.0);
    }

    #[tokio::test]
    async fn test_late_night_feeds_recovery_sleep_component() {
        let provider = history_provider();
        let (pipeline, _) = pipeline_at(provider.clone(), at(wake_date(), 9, 0));

        let state = pipeline.orchestrator.load_data(wake_date()).await.unwrap();
        assert!(matches!(state, ScoreState::NotYetAvailable { .. }));
        assert!(pipeline.db.load_score(wake_date()).unwrap().is_none());

        reference_night(&provider);
        let state = pipeline.orchestrator.load_data(wake_date()).await.unwrap();
        let bundle = state.bundle().unwrap();

        assert_eq!(bundle.sleep.final_score, 94);
        assert_eq!(bundle.recovery.details.sleep_score, Some(94));
        assert_eq!(bundle.recovery.component("Sleep").unwrap().score, 94.0);

        let stored = pipeline.db.load_score(wake_date()).unwrap().unwrap();
        assert_eq!(stored.sleep_score, Some(94));
        assert_eq!(stored.recovery_score, bundle.recovery.final_score);
    }

    #[tokio::test]
    async fn test_bundle_contents_and_persistence() {
        let provider = seeded_provider();
        let (pipeline, _) = pipeline_at(provider, at(wake_date(), 9, 0));

        let state = pipeline.orchestrator.load_data(wake_date()).await.unwrap();
        let bundle = state.bundle().unwrap();

        assert_eq!(bundle.sleep.final_score, 94);
        assert_eq!(bundle.recovery.details.sleep_score, Some(94));
        assert_eq!(bundle.recovery.component("Sleep").unwrap().score, 94.0);
        assert!(bundle.recovery.component("HRV").unwrap().score > 75.0);
        assert!(bundle.recovery.component("Resting HR").unwrap().score > 75.0);

        assert_eq!(bundle.sleep_breakdown.len(), 5);
        assert_eq!(bundle.recovery_breakdown.len(), 4);
        let sleep_points: f64 = bundle.sleep_breakdown.iter().map(|row| row.score).sum();
        assert_eq!(sleep_points, 94.0);

        let stored = pipeline.db.load_score(wake_date()).unwrap().unwrap();
        assert_eq!(stored.recovery_score, bundle.recovery.final_score);
        assert_eq!(stored.sleep_score, Some(94));

        assert!(matches!(pipeline.orchestrator.current_state(), ScoreState::Ready(_)));
    }

    #[tokio::test]
    async fn test_trend_arrays() {
        let provider = seeded_provider();
        let (pipeline, _) = pipeline_at(provider, at(wake_date(), 9, 0));

        let state = pipeline.orchestrator.load_data(wake_date()).await.unwrap();
        let bundle = state.bundle().unwrap();

        let hrv = bundle.trend(TrendMetric::Hrv).unwrap();
        assert_eq!(hrv.points.len(), 7);
        assert_eq!(hrv.points.last().unwrap().date, wake_date());
        assert_eq!(hrv.points.last().unwrap().value, Some(44.0));
        assert_eq!(hrv.points[0].value, Some(40.0));
        assert!((hrv.percent_change.unwrap() - 10.0).abs() < 1e-9);

        let rhr = bundle.trend(TrendMetric::RestingHr).unwrap();
        assert!((rhr.percent_change.unwrap() + 5.0).abs() < 1e-9);

        // No earlier scores persisted yet
        let recovery = bundle.trend(TrendMetric::RecoveryScore).unwrap();
        assert_eq!(recovery.percent_change, None);
        assert_eq!(
            recovery.points.last().unwrap().value,
            Some(bundle.recovery.final_score as f64)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bundle_cache_ttl() {
        let provider = seeded_provider();
        let (pipeline, _) = pipeline_at(provider.clone(), at(wake_date(), 9, 0));

        let first = pipeline.orchestrator.load_data(wake_date()).await.unwrap();
        provider.reset_counters();

        let second = pipeline.orchestrator.load_data(wake_date()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.total_fetches(), 0);
        assert_eq!(provider.authorization_calls(), 0);

        // A sample synced after the first load shows up once the bundle expires
        provider.add_samples(
            MetricKind::HeartRateVariability,
            [QuantitySample::new(at(wake_date(), 7, 0), 10.0)],
        );
        tokio::time::advance(std::time::Duration::from_secs(301)).await;
        let third = pipeline.orchestrator.load_data(wake_date()).await.unwrap();
        assert!(provider.total_fetches() > 0);

        let bundle = third.bundle().unwrap();
        assert_eq!(bundle.raw.hrv, Some(27.0));
        assert_eq!(bundle.recovery.details.hrv, bundle.raw.hrv);
        assert!(bundle.recovery.final_score < first.bundle().unwrap().recovery.final_score);
    }

    #[tokio::test]
    async fn test_clear_cache_forces_recompute() {
        let provider = seeded_provider();
        let (pipeline, _) = pipeline_at(provider.clone(), at(wake_date(), 9, 0));

        pipeline.orchestrator.load_data(wake_date()).await.unwrap();
        pipeline.orchestrator.clear_cache();
        provider.reset_counters();

        pipeline.orchestrator.load_data(wake_date()).await.unwrap();
        assert!(provider.total_fetches() > 0);
        assert!(provider.sleep_calls() > 0);

        let report = pipeline.orchestrator.cache_report();
        assert!(report.bundles.cache_misses >= 2);
    }

    #[tokio::test]
    async fn test_state_is_published_to_subscribers() {
        let provider = seeded_provider();
        let (pipeline, _) = pipeline_at(provider, at(wake_date(), 9, 0));
        let mut states = pipeline.orchestrator.subscribe();

        pipeline.orchestrator.load_data(wake_date()).await.unwrap();
        assert!(states.has_changed().unwrap());
        assert!(states.borrow_and_update().bundle().is_some());
    }
}
