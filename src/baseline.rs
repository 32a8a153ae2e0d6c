//! Rolling baselines
//!
//! A baseline is the mean of a metric's daily means over the trailing window
//! `[date - window, date)`; the target date itself is excluded. HRV and RHR are
//! scored against their 60-day baselines, the stress proxies against 14-day
//! ones. Windows with fewer than the configured minimum of days yield no
//! baseline and callers substitute fallback constants.
//!
//! Bedtime and wake baselines are clock times, averaged on the circle:
//! 23:50 and 00:10 average to midnight, not noon.

use chrono::{Duration, NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::TAU;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::cache::DateCache;
use crate::clock::Clock;
use crate::database::Database;
use crate::error::{ProviderError, Result, ScoreError};
use crate::models::{sleep_window, wake_date_for, MetricKind};
use crate::provider::{mean, DailyMetricsFetcher};
use crate::sleep::group_sessions;

/// Persisted flag marking that baselines were rebuilt with the current averaging
pub const LATEST_ALGORITHM_FLAG: &str = "baselines_recalculated_with_latest_algorithm";

const MINUTES_PER_DAY: f64 = 1440.0;

/// Trailing window lengths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BaselineWindow {
    Week,
    Fortnight,
    TwoMonths,
    Quarter,
}

impl BaselineWindow {
    pub const ALL: [BaselineWindow; 4] = [
        BaselineWindow::Week,
        BaselineWindow::Fortnight,
        BaselineWindow::TwoMonths,
        BaselineWindow::Quarter,
    ];

    pub fn days(&self) -> u32 {
        match self {
            BaselineWindow::Week => 7,
            BaselineWindow::Fortnight => 14,
            BaselineWindow::TwoMonths => 60,
            BaselineWindow::Quarter => 90,
        }
    }

    /// Longest window; one fetch of this length covers every other window
    pub fn longest() -> Self {
        BaselineWindow::Quarter
    }
}

/// One metric's baseline over one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineValue {
    pub metric: MetricKind,
    pub window_days: u32,
    pub value: f64,
}

/// Every baseline resolved for one reference date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineSnapshot {
    pub reference_date: NaiveDate,
    pub values: Vec<BaselineValue>,

    /// 7-night circular mean bedtime, minutes after midnight
    pub bedtime_minutes: Option<f64>,

    /// 7-night circular mean wake time, minutes after midnight
    pub wake_minutes: Option<f64>,
}

impl BaselineSnapshot {
    pub fn empty(reference_date: NaiveDate) -> Self {
        Self {
            reference_date,
            values: Vec::new(),
            bedtime_minutes: None,
            wake_minutes: None,
        }
    }

    pub fn get(&self, metric: MetricKind, window: BaselineWindow) -> Option<f64> {
        self.values
            .iter()
            .find(|v| v.metric == metric && v.window_days == window.days())
            .map(|v| v.value)
    }

    pub fn bedtime(&self) -> Option<NaiveTime> {
        self.bedtime_minutes.and_then(clock_time)
    }

    pub fn wake_time(&self) -> Option<NaiveTime> {
        self.wake_minutes.and_then(clock_time)
    }
}

fn clock_time(minutes: f64) -> Option<NaiveTime> {
    let total = minutes.round().rem_euclid(MINUTES_PER_DAY) as u32;
    NaiveTime::from_hms_opt(total / 60, total % 60, 0)
}

/// Circular mean of clock times given as minutes after midnight
///
/// Returns `None` for an empty input or when the times cancel out (e.g.
/// exactly 12 hours apart), where no meaningful mean exists.
pub fn circular_mean_minutes(minutes: &[f64]) -> Option<f64> {
    if minutes.is_empty() {
        return None;
    }

    let (sin_sum, cos_sum) = minutes.iter().fold((0.0, 0.0), |(s, c), m| {
        let angle = m / MINUTES_PER_DAY * TAU;
        (s + angle.sin(), c + angle.cos())
    });

    let n = minutes.len() as f64;
    let resultant = ((sin_sum / n).powi(2) + (cos_sum / n).powi(2)).sqrt();
    if resultant < 1e-6 {
        return None;
    }

    let angle = sin_sum.atan2(cos_sum).rem_euclid(TAU);
    Some((angle / TAU * MINUTES_PER_DAY).rem_euclid(MINUTES_PER_DAY))
}

/// Mean of the daily values in `[date - window_days, date)`
///
/// Absent unless at least `min_days` days carry a value.
pub fn windowed_mean(
    daily: &BTreeMap<NaiveDate, f64>,
    date: NaiveDate,
    window_days: u32,
    min_days: usize,
) -> Option<f64> {
    let first = date - Duration::days(window_days as i64);
    let values: Vec<f64> = daily.range(first..date).map(|(_, v)| *v).collect();
    if values.len() < min_days.max(1) {
        return None;
    }
    mean(&values)
}

/// Computes, persists, and serves rolling baselines
pub struct BaselineEngine {
    fetcher: DailyMetricsFetcher,
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    min_days: usize,
    loaded: OnceCell<()>,
    latest: RwLock<Option<Arc<BaselineSnapshot>>>,
    resolved: DateCache<Arc<BaselineSnapshot>>,
}

impl BaselineEngine {
    pub fn new(fetcher: DailyMetricsFetcher, db: Arc<Database>, clock: Arc<dyn Clock>, min_days: usize) -> Self {
        Self {
            fetcher,
            db,
            clock,
            min_days,
            loaded: OnceCell::new(),
            latest: RwLock::new(None),
            resolved: DateCache::new("baselines", None),
        }
    }

    /// Populate in-memory state from storage; later calls are no-ops
    pub async fn load_baselines(&self) -> Result<()> {
        self.loaded
            .get_or_try_init(|| async {
                match self.db.load_baselines()? {
                    Some(snapshot) => {
                        info!(
                            reference_date = %snapshot.reference_date,
                            values = snapshot.values.len(),
                            "Loaded persisted baselines"
                        );
                        let snapshot = Arc::new(snapshot);
                        self.resolved.insert(snapshot.reference_date, snapshot.clone()).await;
                        self.set_latest(snapshot);
                    }
                    None => debug!("No persisted baselines"),
                }
                Ok::<(), ScoreError>(())
            })
            .await
            .map(|_| ())
    }

    /// Most recent snapshot loaded or computed
    pub fn latest(&self) -> Option<Arc<BaselineSnapshot>> {
        self.latest.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_latest(&self, snapshot: Arc<BaselineSnapshot>) {
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
    }

    /// Baseline for one metric and window, computed from the collaborator
    pub async fn calculate_baseline(
        &self,
        metric: MetricKind,
        date: NaiveDate,
        window: BaselineWindow,
    ) -> std::result::Result<Option<f64>, ProviderError> {
        let first = date - Duration::days(window.days() as i64);
        let daily = self.fetcher.daily_series(metric, first, date).await?;
        Ok(windowed_mean(&daily, date, window.days(), self.min_days))
    }

    /// Snapshot for a reference date, memoized per date
    ///
    /// Snapshots at or after the latest known reference date replace the
    /// persisted baselines.
    pub async fn resolve(&self, date: NaiveDate) -> Result<Arc<BaselineSnapshot>> {
        self.load_baselines().await?;

        self.resolved
            .get_or_try_insert_with(date, || async {
                let snapshot = Arc::new(self.compute_snapshot(date).await);
                let is_newest = self
                    .latest()
                    .map_or(true, |latest| snapshot.reference_date >= latest.reference_date);
                if is_newest {
                    self.db.save_baselines(&snapshot)?;
                    self.set_latest(snapshot.clone());
                }
                Ok::<_, ScoreError>(snapshot)
            })
            .await
    }

    /// Recompute every window for today and replace the persisted baselines
    pub async fn force_recalculate_baselines(&self) -> Result<Arc<BaselineSnapshot>> {
        self.load_baselines().await?;
        self.resolved.clear();

        let today = self.clock.today();
        let snapshot = Arc::new(self.compute_snapshot(today).await);
        self.db.save_baselines(&snapshot)?;
        self.set_latest(snapshot.clone());
        self.resolved.insert(today, snapshot.clone()).await;

        info!(
            reference_date = %today,
            values = snapshot.values.len(),
            "Baselines force-recalculated"
        );
        Ok(snapshot)
    }

    /// Run the forced recompute once, keyed by the persisted flag
    ///
    /// Returns whether a recompute happened.
    pub async fn ensure_latest_algorithm(&self) -> Result<bool> {
        if self.db.get_flag(LATEST_ALGORITHM_FLAG)? {
            debug!("Baselines already use the latest algorithm");
            return Ok(false);
        }

        self.force_recalculate_baselines().await?;
        self.db.set_flag(LATEST_ALGORITHM_FLAG, true)?;
        Ok(true)
    }

    /// Drop memoized snapshots for one date
    pub fn invalidate(&self, date: NaiveDate) {
        self.resolved.invalidate(date);
    }

    /// Drop memoized snapshots for dates after `date`, whose windows include it
    pub fn invalidate_after(&self, date: NaiveDate) {
        self.resolved.invalidate_after(date);
    }

    async fn compute_snapshot(&self, date: NaiveDate) -> BaselineSnapshot {
        let longest = BaselineWindow::longest().days() as i64;
        let first = date - Duration::days(longest);

        let (hrv, rhr, resp, walking, spo2, clocks) = tokio::join!(
            self.fetcher.daily_series(MetricKind::HeartRateVariability, first, date),
            self.fetcher.daily_series(MetricKind::RestingHeartRate, first, date),
            self.fetcher.daily_series(MetricKind::RespiratoryRate, first, date),
            self.fetcher.daily_series(MetricKind::WalkingHeartRate, first, date),
            self.fetcher.daily_series(MetricKind::OxygenSaturation, first, date),
            self.clock_baselines(date),
        );

        let mut snapshot = BaselineSnapshot::empty(date);
        for (metric, series) in [
            (MetricKind::HeartRateVariability, hrv),
            (MetricKind::RestingHeartRate, rhr),
            (MetricKind::RespiratoryRate, resp),
            (MetricKind::WalkingHeartRate, walking),
            (MetricKind::OxygenSaturation, spo2),
        ] {
            let daily = match series {
                Ok(daily) => daily,
                Err(err) => {
                    warn!(metric = ?metric, date = %date, error = %err, "Baseline series unavailable");
                    continue;
                }
            };

            for window in BaselineWindow::ALL {
                if let Some(value) = windowed_mean(&daily, date, window.days(), self.min_days) {
                    snapshot.values.push(BaselineValue {
                        metric,
                        window_days: window.days(),
                        value,
                    });
                }
            }
        }

        (snapshot.bedtime_minutes, snapshot.wake_minutes) = clocks;

        debug!(
            date = %date,
            values = snapshot.values.len(),
            bedtime = ?snapshot.bedtime(),
            "Baseline snapshot computed"
        );
        snapshot
    }

    /// Circular bedtime and wake baselines over the 7 nights before `date`
    async fn clock_baselines(&self, date: NaiveDate) -> (Option<f64>, Option<f64>) {
        let nights = BaselineWindow::Week.days() as i64;
        let (start, _) = sleep_window(date - Duration::days(nights));
        let (_, end) = sleep_window(date - Duration::days(1));

        let intervals = match self.fetcher.stage_intervals(start, end).await {
            Ok(Some(intervals)) => intervals,
            Ok(None) => return (None, None),
            Err(err) => {
                warn!(date = %date, error = %err, "Sleep history unavailable for clock baselines");
                return (None, None);
            }
        };

        // Longest session per wake date
        let mut mains: BTreeMap<NaiveDate, (i64, f64, f64)> = BTreeMap::new();
        for session in group_sessions(&intervals, self.fetcher.rules()) {
            if session.time_asleep_secs <= 0 {
                continue;
            }
            let wake_date = wake_date_for(session.start);
            let bed = (session.start.hour() * 60 + session.start.minute()) as f64;
            let wake = (session.end.hour() * 60 + session.end.minute()) as f64;
            let entry = mains.entry(wake_date).or_insert((0, bed, wake));
            if session.total_duration_secs >= entry.0 {
                *entry = (session.total_duration_secs, bed, wake);
            }
        }

        if mains.len() < self.min_days.max(1) {
            return (None, None);
        }

        let bedtimes: Vec<f64> = mains.values().map(|(_, bed, _)| *bed).collect();
        let wakes: Vec<f64> = mains.values().map(|(_, _, wake)| *wake).collect();
        (circular_mean_minutes(&bedtimes), circular_mean_minutes(&wakes))
    }
}
