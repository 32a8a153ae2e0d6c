//! Daily score orchestration
//!
//! [`ScoreOrchestrator::load_data`] is the entry point for presentation code.
//! It owns the bundle cache (five-minute TTL by default), runs the Sleep and
//! Recovery calculators concurrently, derives component breakdowns and trend
//! arrays, persists the day's score, and publishes the resulting
//! [`ScoreState`] on a watch channel.
//!
//! Today's scores are not computed before the morning cutoff (08:00 local by
//! default); overnight data has usually not synced yet.

use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::baseline::{BaselineEngine, BaselineSnapshot};
use crate::cache::{CacheMetrics, DateCache};
use crate::clock::Clock;
use crate::config::ScoringSettings;
use crate::database::{Database, StoredScore};
use crate::error::{Result, ScoreError};
use crate::models::{MetricKind, RawDailyMetrics};
use crate::provider::DailyMetricsFetcher;
use crate::recovery::{RecoveryScoreCalculator, RecoveryScoreResult};
use crate::sleep::{
    SleepScoreCalculator, SleepScoreResult, CONSISTENCY_MAX_POINTS, DEEP_MAX_POINTS, DURATION_MAX_POINTS,
    EFFICIENCY_MAX_POINTS, REM_MAX_POINTS,
};

/// One row of a score breakdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentBreakdown {
    pub name: String,
    pub score: f64,
    pub max_score: f64,
    pub description: String,
}

/// Metrics tracked in the trend arrays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendMetric {
    Hrv,
    RestingHr,
    SleepScore,
    RecoveryScore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub value: Option<f64>,
}

/// Daily values ending on the bundle's date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSeries {
    pub metric: TrendMetric,
    pub points: Vec<TrendPoint>,

    /// Latest value against the mean of the earlier ones, in percent
    pub percent_change: Option<f64>,
}

impl TrendSeries {
    pub fn new(metric: TrendMetric, points: Vec<TrendPoint>) -> Self {
        let percent_change = percent_change(&points);
        Self {
            metric,
            points,
            percent_change,
        }
    }
}

/// Change of the latest available value against the mean of the earlier ones
///
/// Absent with fewer than two values or a zero mean.
pub fn percent_change(points: &[TrendPoint]) -> Option<f64> {
    let values: Vec<f64> = points.iter().filter_map(|p| p.value).collect();
    let (latest, earlier) = values.split_last()?;
    if earlier.is_empty() {
        return None;
    }

    let mean = earlier.iter().sum::<f64>() / earlier.len() as f64;
    if mean == 0.0 {
        return None;
    }
    Some((latest - mean) / mean * 100.0)
}

/// Points for `dates` from a daily series; the last date takes `today`
fn daily_points(dates: &[NaiveDate], series: &BTreeMap<NaiveDate, f64>, today: Option<f64>) -> Vec<TrendPoint> {
    let last = dates.last().copied();
    dates
        .iter()
        .map(|d| TrendPoint {
            date: *d,
            value: if Some(*d) == last { today } else { series.get(d).copied() },
        })
        .collect()
}

/// Everything presentation code needs for one day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyScoreBundle {
    pub date: NaiveDate,
    pub recovery: RecoveryScoreResult,
    pub sleep: SleepScoreResult,
    pub recovery_breakdown: Vec<ComponentBreakdown>,
    pub sleep_breakdown: Vec<ComponentBreakdown>,
    pub trends: Vec<TrendSeries>,
    pub raw: RawDailyMetrics,
    pub computed_at: NaiveDateTime,
}

impl DailyScoreBundle {
    pub fn trend(&self, metric: TrendMetric) -> Option<&TrendSeries> {
        self.trends.iter().find(|t| t.metric == metric)
    }
}

/// Latest published outcome of [`ScoreOrchestrator::load_data`]
#[derive(Debug, Clone, PartialEq)]
pub enum ScoreState {
    /// Nothing requested yet
    Idle,
    /// Scores for the date cannot be computed yet
    NotYetAvailable { date: NaiveDate, reason: String },
    Ready(Arc<DailyScoreBundle>),
    Failed { date: NaiveDate, message: String },
}

impl ScoreState {
    pub fn bundle(&self) -> Option<&Arc<DailyScoreBundle>> {
        match self {
            ScoreState::Ready(bundle) => Some(bundle),
            _ => None,
        }
    }
}

/// Hit/miss counters of every cache layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheReport {
    pub bundles: CacheMetrics,
    pub sleep: CacheMetrics,
    pub recovery: CacheMetrics,
}

/// Sleep breakdown in points against each component's maximum
pub fn sleep_breakdown(sleep: &SleepScoreResult) -> Vec<ComponentBreakdown> {
    let points = &sleep.details.points;
    let rows = [
        (points.duration, DURATION_MAX_POINTS),
        (points.deep, DEEP_MAX_POINTS),
        (points.rem, REM_MAX_POINTS),
        (points.efficiency, EFFICIENCY_MAX_POINTS),
        (points.consistency, CONSISTENCY_MAX_POINTS),
    ];

    sleep
        .components
        .iter()
        .zip(rows)
        .map(|(component, (score, max_score))| ComponentBreakdown {
            name: component.name.clone(),
            score,
            max_score,
            description: component.description.clone(),
        })
        .collect()
}

/// Recovery breakdown on the 0-100 component scale
pub fn recovery_breakdown(recovery: &RecoveryScoreResult) -> Vec<ComponentBreakdown> {
    recovery
        .components
        .iter()
        .map(|component| ComponentBreakdown {
            name: component.name.clone(),
            score: component.score,
            max_score: 100.0,
            description: component.description.clone(),
        })
        .collect()
}

/// Orchestrator tuning taken from [`ScoringSettings`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrchestratorSettings {
    pub morning_cutoff_hour: u32,
    pub bundle_ttl: std::time::Duration,
    pub trend_days: u32,
}

impl From<&ScoringSettings> for OrchestratorSettings {
    fn from(settings: &ScoringSettings) -> Self {
        Self {
            morning_cutoff_hour: settings.morning_cutoff_hour,
            bundle_ttl: settings.bundle_ttl(),
            trend_days: settings.trend_days,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&ScoringSettings::default())
    }
}

pub struct ScoreOrchestrator {
    fetcher: DailyMetricsFetcher,
    clock: Arc<dyn Clock>,
    db: Arc<Database>,
    baselines: Arc<BaselineEngine>,
    sleep: Arc<SleepScoreCalculator>,
    recovery: Arc<RecoveryScoreCalculator>,
    settings: OrchestratorSettings,
    bundles: DateCache<Arc<DailyScoreBundle>>,
    state: watch::Sender<ScoreState>,
}

impl ScoreOrchestrator {
    pub fn new(
        fetcher: DailyMetricsFetcher,
        clock: Arc<dyn Clock>,
        db: Arc<Database>,
        baselines: Arc<BaselineEngine>,
        sleep: Arc<SleepScoreCalculator>,
        recovery: Arc<RecoveryScoreCalculator>,
        settings: OrchestratorSettings,
    ) -> Self {
        let (state, _) = watch::channel(ScoreState::Idle);
        Self {
            fetcher,
            clock,
            db,
            baselines,
            sleep,
            recovery,
            bundles: DateCache::new("score_bundle", Some(settings.bundle_ttl)),
            settings,
            state,
        }
    }

    /// Receiver of every published [`ScoreState`]
    pub fn subscribe(&self) -> watch::Receiver<ScoreState> {
        self.state.subscribe()
    }

    /// Most recently published state
    pub fn current_state(&self) -> ScoreState {
        self.state.borrow().clone()
    }

    fn publish(&self, state: ScoreState) -> ScoreState {
        self.state.send_replace(state.clone());
        state
    }

    /// Whether `date` is today and the morning cutoff has not passed
    pub fn is_before_cutoff(&self, date: NaiveDate) -> bool {
        let now = self.clock.now();
        date == now.date() && now.hour() < self.settings.morning_cutoff_hour
    }

    /// Scores for a date, from the bundle cache when fresh
    ///
    /// Missing sleep data yields [`ScoreState::NotYetAvailable`]; an
    /// unauthorized collaborator is an error.
    pub async fn load_data(&self, date: NaiveDate) -> Result<ScoreState> {
        if self.is_before_cutoff(date) {
            debug!(date = %date, cutoff = self.settings.morning_cutoff_hour, "Before morning cutoff");
            return Ok(self.publish(ScoreState::NotYetAvailable {
                date,
                reason: format!(
                    "Today's scores are available after {:02}:00",
                    self.settings.morning_cutoff_hour
                ),
            }));
        }

        let loaded = self
            .bundles
            .get_or_try_insert_with(date, || self.compute_bundle(date))
            .await;

        match loaded {
            Ok(bundle) => Ok(self.publish(ScoreState::Ready(bundle))),
            Err(err @ ScoreError::NoSleepData { .. }) => {
                info!(date = %date, "Sleep data not yet available");
                Ok(self.publish(ScoreState::NotYetAvailable {
                    date,
                    reason: err.user_message(),
                }))
            }
            Err(err) => {
                self.publish(ScoreState::Failed {
                    date,
                    message: err.user_message(),
                });
                Err(err)
            }
        }
    }

    /// Drop every cached layer for one date and reload it
    pub async fn refresh(&self, date: NaiveDate) -> Result<ScoreState> {
        self.invalidate(date);
        self.load_data(date).await
    }

    /// Drop the bundle and calculator entries for one date
    pub fn invalidate(&self, date: NaiveDate) {
        self.bundles.invalidate(date);
        self.sleep.invalidate(date);
        self.recovery.invalidate(date);
    }

    /// Clear the bundle cache together with both calculator caches
    pub fn clear_cache(&self) {
        self.bundles.clear();
        self.sleep.clear_cache();
        self.recovery.clear_cache();
        info!("Score caches cleared");
    }

    pub fn cache_report(&self) -> CacheReport {
        CacheReport {
            bundles: self.bundles.metrics(),
            sleep: self.sleep.cache_metrics(),
            recovery: self.recovery.cache_metrics(),
        }
    }

    async fn compute_bundle(&self, date: NaiveDate) -> Result<Arc<DailyScoreBundle>> {
        if !self.fetcher.is_authorized().await {
            return Err(ScoreError::DataUnavailable(
                "health data access not authorized".to_string(),
            ));
        }

        // A missing or expired bundle recomputes both scores from the new snapshot
        self.sleep.invalidate(date);
        self.recovery.invalidate(date);

        let raw = self.fetcher.fetch_daily(date).await;
        let baselines = match self.baselines.resolve(date).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(date = %date, error = %err, "Baselines unavailable, using fallbacks");
                Arc::new(BaselineSnapshot::empty(date))
            }
        };

        let (sleep, recovery) = tokio::join!(
            self.sleep.score_authorized(date, Some(&raw)),
            self.recovery.score_prefetched(date, &raw, &baselines),
        );
        let sleep = match sleep {
            Ok(sleep) => sleep,
            Err(err) => {
                // Recovery composed without the night must not outlive it
                self.recovery.invalidate(date);
                return Err(err);
            }
        };
        let computed_at = self.clock.now();
        self.persist(&recovery, computed_at);

        let trends = self.trends(date, &raw, &sleep, &recovery).await;

        info!(
            date = %date,
            recovery = recovery.final_score,
            sleep = sleep.final_score,
            "Score bundle ready"
        );

        Ok(Arc::new(DailyScoreBundle {
            date,
            recovery_breakdown: recovery_breakdown(&recovery),
            sleep_breakdown: sleep_breakdown(&sleep),
            trends,
            recovery,
            sleep,
            raw,
            computed_at,
        }))
    }

    fn persist(&self, recovery: &RecoveryScoreResult, computed_at: NaiveDateTime) {
        let stored = StoredScore::from_recovery(recovery, computed_at).and_then(|row| self.db.store_score(&row));
        if let Err(err) = stored {
            warn!(date = %recovery.date, error = %err, "Failed to persist daily score");
        }
    }

    async fn trends(
        &self,
        date: NaiveDate,
        raw: &RawDailyMetrics,
        sleep: &SleepScoreResult,
        recovery: &RecoveryScoreResult,
    ) -> Vec<TrendSeries> {
        let days = self.settings.trend_days.max(1) as i64;
        let first = date - Duration::days(days - 1);
        let dates: Vec<NaiveDate> = (0..days).map(|i| first + Duration::days(i)).collect();

        let (hrv, rhr) = tokio::join!(
            self.fetcher.daily_series(MetricKind::HeartRateVariability, first, date),
            self.fetcher.daily_series(MetricKind::RestingHeartRate, first, date),
        );

        let history: BTreeMap<NaiveDate, StoredScore> = match self
            .db
            .load_scores_between(first, date - Duration::days(1))
        {
            Ok(rows) => rows.into_iter().map(|row| (row.date, row)).collect(),
            Err(err) => {
                warn!(date = %date, error = %err, "Score history unavailable for trends");
                BTreeMap::new()
            }
        };

        let hrv = hrv.unwrap_or_else(|err| {
            debug!(date = %date, error = %err, "HRV trend series unavailable");
            BTreeMap::new()
        });
        let rhr = rhr.unwrap_or_else(|err| {
            debug!(date = %date, error = %err, "RHR trend series unavailable");
            BTreeMap::new()
        });

        let score_points = |today: f64, pick: fn(&StoredScore) -> Option<f64>| {
            dates
                .iter()
                .map(|d| TrendPoint {
                    date: *d,
                    value: if *d == date {
                        Some(today)
                    } else {
                        history.get(d).and_then(pick)
                    },
                })
                .collect::<Vec<_>>()
        };

        vec![
            TrendSeries::new(TrendMetric::Hrv, daily_points(&dates, &hrv, raw.hrv)),
            TrendSeries::new(TrendMetric::RestingHr, daily_points(&dates, &rhr, raw.resting_hr)),
            TrendSeries::new(
                TrendMetric::SleepScore,
                score_points(sleep.final_score as f64, |row| row.sleep_score.map(f64::from)),
            ),
            TrendSeries::new(
                TrendMetric::RecoveryScore,
                score_points(recovery.final_score as f64, |row| Some(row.recovery_score as f64)),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(day: u32, value: Option<f64>) -> TrendPoint {
        TrendPoint {
            date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            value,
        }
    }

    #[test]
    fn test_percent_change_against_earlier_mean() {
        let points = vec![point(1, Some(40.0)), point(2, None), point(3, Some(60.0)), point(4, Some(55.0))];
        assert!((percent_change(&points).unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_percent_change_needs_two_points() {
        assert_eq!(percent_change(&[point(1, Some(40.0)), point(2, None)]), None);
        assert_eq!(percent_change(&[]), None);
        assert_eq!(percent_change(&[point(1, Some(0.0)), point(2, Some(5.0))]), None);
    }
}
