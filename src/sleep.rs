//! Sleep sessions and the Sleep Score
//!
//! # Session assembly
//!
//! Wearables report sleep as a stream of stage samples (deep, REM, core,
//! unspecified, in-bed, awake). Samples are sorted by start time and grouped
//! into sessions: a sample starting within the gap tolerance (30 minutes) of
//! the running session end joins that session. In-bed samples longer than
//! 12 hours are device artifacts and are dropped before grouping. The session
//! with the greatest total duration is the night's "main" session; every
//! duration used for scoring derives from it alone.
//!
//! # Score composition
//!
//! | Component   | Points | Weight |
//! |-------------|--------|--------|
//! | Duration    | 0-30   | 30%    |
//! | Deep sleep  | 0-25   | 25%    |
//! | REM         | 0-20   | 20%    |
//! | Efficiency  | 0-15   | 15%    |
//! | Consistency | 0-10   | 10%    |
//!
//! Each component's points are expressed as a percentage of its maximum, then
//! weighted and summed. The final score is rounded and clamped to 0-100.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::baseline::BaselineEngine;
use crate::cache::{CacheMetrics, DateCache};
use crate::error::{ProviderError, Result, ScoreError};
use crate::models::{composite_score, RawDailyMetrics, ScoreComponent, StageInterval, StageKind};
use crate::provider::DailyMetricsFetcher;

pub const DURATION_MAX_POINTS: f64 = 30.0;
pub const DEEP_MAX_POINTS: f64 = 25.0;
pub const REM_MAX_POINTS: f64 = 20.0;
pub const EFFICIENCY_MAX_POINTS: f64 = 15.0;
pub const CONSISTENCY_MAX_POINTS: f64 = 10.0;

pub const DURATION_WEIGHT: f64 = 0.30;
pub const DEEP_WEIGHT: f64 = 0.25;
pub const REM_WEIGHT: f64 = 0.20;
pub const EFFICIENCY_WEIGHT: f64 = 0.15;
pub const CONSISTENCY_WEIGHT: f64 = 0.10;

/// Fallback bedtime target, 23:45 as minute of day
pub const DEFAULT_TARGET_BEDTIME_MINUTES: u32 = 23 * 60 + 45;

const MINUTES_PER_DAY: u32 = 24 * 60;
const NOON_MINUTES: u32 = 12 * 60;
const SANE_BEDTIME_START: u32 = 20 * 60;
const SMART_DEFAULT_LATEST: u32 = 23 * 60;

/// Grouping rules for assembling sessions from stage samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRules {
    /// Largest gap between samples that still joins them into one session
    pub gap_tolerance: Duration,

    /// In-bed samples longer than this are discarded as artifacts
    pub max_in_bed: Duration,
}

impl Default for SessionRules {
    fn default() -> Self {
        Self {
            gap_tolerance: Duration::minutes(30),
            max_in_bed: Duration::hours(12),
        }
    }
}

/// Contiguous sleep period assembled from stage samples
///
/// Derived on demand and never persisted. Durations are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepSession {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,

    /// Span from first sample start to last sample end (time in bed)
    pub total_duration_secs: i64,

    /// Sum of asleep stages, capped at the total duration
    pub time_asleep_secs: i64,

    pub deep_secs: i64,
    pub rem_secs: i64,
    pub core_secs: i64,
    pub unspecified_secs: i64,
    pub awake_secs: i64,
    pub in_bed_secs: i64,

    /// Number of stage samples in the session
    pub sample_count: usize,
}

impl SleepSession {
    fn from_samples(samples: &[&StageInterval]) -> Option<Self> {
        let start = samples.iter().map(|s| s.start).min()?;
        let end = samples.iter().map(|s| s.end).max()?;

        let mut session = SleepSession {
            start,
            end,
            total_duration_secs: (end - start).num_seconds(),
            time_asleep_secs: 0,
            deep_secs: 0,
            rem_secs: 0,
            core_secs: 0,
            unspecified_secs: 0,
            awake_secs: 0,
            in_bed_secs: 0,
            sample_count: samples.len(),
        };

        for sample in samples {
            let secs = sample.duration().num_seconds();
            match sample.stage {
                StageKind::Deep => session.deep_secs += secs,
                StageKind::Rem => session.rem_secs += secs,
                StageKind::Core => session.core_secs += secs,
                StageKind::Unspecified => session.unspecified_secs += secs,
                StageKind::Awake => session.awake_secs += secs,
                StageKind::InBed => session.in_bed_secs += secs,
            }
        }

        let asleep = session.deep_secs + session.rem_secs + session.core_secs + session.unspecified_secs;
        session.time_asleep_secs = asleep.min(session.total_duration_secs);
        Some(session)
    }

    pub fn time_in_bed_minutes(&self) -> f64 {
        self.total_duration_secs as f64 / 60.0
    }

    pub fn time_asleep_minutes(&self) -> f64 {
        self.time_asleep_secs as f64 / 60.0
    }

    pub fn deep_minutes(&self) -> f64 {
        self.deep_secs as f64 / 60.0
    }

    pub fn rem_minutes(&self) -> f64 {
        self.rem_secs as f64 / 60.0
    }

    /// Time asleep as a percentage of time in bed
    pub fn efficiency_pct(&self) -> f64 {
        if self.total_duration_secs <= 0 {
            return 0.0;
        }
        self.time_asleep_secs as f64 / self.total_duration_secs as f64 * 100.0
    }
}

/// Group stage samples into sessions using the gap tolerance
pub fn group_sessions(intervals: &[StageInterval], rules: &SessionRules) -> Vec<SleepSession> {
    let mut samples: Vec<&StageInterval> = intervals
        .iter()
        .filter(|s| s.end > s.start)
        .filter(|s| !(s.stage == StageKind::InBed && s.duration() > rules.max_in_bed))
        .collect();
    samples.sort_by_key(|s| s.start);

    let mut groups: Vec<Vec<&StageInterval>> = Vec::new();
    let mut running_end: Option<NaiveDateTime> = None;

    for sample in samples {
        match (groups.last_mut(), running_end) {
            (Some(group), Some(end)) if sample.start - end <= rules.gap_tolerance => {
                group.push(sample);
                running_end = Some(end.max(sample.end));
            }
            _ => {
                groups.push(vec![sample]);
                running_end = Some(sample.end);
            }
        }
    }

    groups
        .iter()
        .filter_map(|group| SleepSession::from_samples(group))
        .collect()
}

/// Session with the greatest total duration
pub fn main_session(intervals: &[StageInterval], rules: &SessionRules) -> Option<SleepSession> {
    group_sessions(intervals, rules)
        .into_iter()
        .max_by_key(|session| session.total_duration_secs)
}

// ============================================================================
// POINT TABLES
// ============================================================================

/// Duration points (0-30) from minutes asleep
pub fn duration_points(minutes: f64) -> f64 {
    match minutes {
        m if m >= 481.0 => 30.0,
        m if m >= 470.0 => 29.0,
        m if m >= 460.0 => 28.0,
        m if m >= 450.0 => 27.0,
        m if m >= 440.0 => 26.0,
        m if m >= 420.0 => 25.0,
        m if m >= 410.0 => 24.0,
        m if m >= 400.0 => 22.0,
        m if m >= 390.0 => 20.0,
        m if m >= 380.0 => 18.0,
        m if m >= 370.0 => 16.0,
        m if m >= 360.0 => 15.0,
        m if m >= 330.0 => 10.0,
        m if m >= 300.0 => 5.0,
        _ => 0.0,
    }
}

/// Deep-sleep points (0-25) from minutes of deep sleep
pub fn deep_sleep_points(minutes: f64) -> f64 {
    match minutes {
        m if m >= 105.0 => 25.0,
        m if m >= 90.0 => 22.0,
        m if m >= 75.0 => 18.0,
        m if m >= 60.0 => 14.0,
        m if m >= 45.0 => 8.0,
        _ => 0.0,
    }
}

/// REM points (0-20) from minutes of REM; proportional below one hour
pub fn rem_points(minutes: f64) -> f64 {
    match minutes {
        m if m >= 120.0 => 20.0,
        m if m >= 105.0 => 18.0,
        m if m >= 90.0 => 16.0,
        m if m >= 75.0 => 13.0,
        m if m >= 60.0 => 10.0,
        m if m > 0.0 => m / 60.0 * 5.0,
        _ => 0.0,
    }
}

/// Efficiency points (0-15) from the asleep/in-bed percentage
pub fn efficiency_points(efficiency_pct: f64) -> f64 {
    match efficiency_pct {
        e if e >= 95.0 => 15.0,
        e if e >= 92.5 => 12.0,
        e if e >= 90.0 => 10.0,
        e if e >= 85.0 => 5.0,
        _ => 0.0,
    }
}

/// Bedtime target as minute of day
///
/// The 7-day circular baseline is used when it falls in 20:00-23:59.
/// Otherwise the target is the top of the actual bedtime's hour when that
/// bedtime falls in 20:00-23:00, else 23:45.
pub fn target_bedtime_minutes(baseline_minutes: Option<f64>, actual_minutes: u32) -> u32 {
    if let Some(baseline) = baseline_minutes {
        let baseline = baseline.round() as u32 % MINUTES_PER_DAY;
        if (SANE_BEDTIME_START..MINUTES_PER_DAY).contains(&baseline) {
            return baseline;
        }
    }

    if (SANE_BEDTIME_START..=SMART_DEFAULT_LATEST).contains(&actual_minutes) {
        (actual_minutes / 60) * 60
    } else {
        DEFAULT_TARGET_BEDTIME_MINUTES
    }
}

/// Minutes the actual bedtime falls after the target, 0 if on time or early
///
/// A bedtime before noon is taken to be after midnight and therefore later
/// than any evening target.
pub fn bedtime_deviation_minutes(actual_minutes: u32, target_minutes: u32) -> u32 {
    let after_midnight = actual_minutes < NOON_MINUTES && target_minutes >= NOON_MINUTES;
    if after_midnight {
        (MINUTES_PER_DAY - target_minutes) + actual_minutes
    } else if actual_minutes <= target_minutes {
        0
    } else {
        actual_minutes - target_minutes
    }
}

/// Consistency points (0-10): full marks on time, one point per 10 minutes late
pub fn consistency_points(actual_minutes: u32, target_minutes: u32) -> f64 {
    let deviation = bedtime_deviation_minutes(actual_minutes, target_minutes);
    (CONSISTENCY_MAX_POINTS - deviation as f64 / 10.0).max(0.0)
}

fn minute_of_day(timestamp: NaiveDateTime) -> u32 {
    timestamp.hour() * 60 + timestamp.minute()
}

fn clock_time(minutes: u32) -> NaiveTime {
    NaiveTime::from_hms_opt((minutes / 60) % 24, minutes % 60, 0).unwrap_or(NaiveTime::MIN)
}

fn format_minutes(minutes: f64) -> String {
    let total = minutes.round().max(0.0) as i64;
    format!("{}h {:02}m", total / 60, total % 60)
}

// ============================================================================
// RESULT TYPES
// ============================================================================

/// Raw points per component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepPoints {
    pub duration: f64,
    pub deep: f64,
    pub rem: f64,
    pub efficiency: f64,
    pub consistency: f64,
}

/// Inputs and intermediate values behind a Sleep Score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepDetails {
    pub session: SleepSession,
    pub efficiency_pct: f64,
    pub bedtime: NaiveTime,
    pub wake_time: NaiveTime,
    pub target_bedtime: NaiveTime,
    pub points: SleepPoints,

    /// Resting heart rate for the wake date, descriptive only
    pub resting_hr: Option<f64>,
}

/// Sleep Score for one wake date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepScoreResult {
    pub date: NaiveDate,
    pub final_score: u8,

    /// Duration, Deep Sleep, REM, Efficiency, Consistency, in that order
    pub components: Vec<ScoreComponent>,

    pub details: SleepDetails,
}

impl SleepScoreResult {
    pub fn component(&self, name: &str) -> Option<&ScoreComponent> {
        self.components.iter().find(|c| c.name == name)
    }
}

/// Score a main session
///
/// Fails with [`ScoreError::NoSleepData`] unless both time in bed and time
/// asleep are positive. `resting_hr` only enriches the descriptions.
pub fn score_session(
    date: NaiveDate,
    session: &SleepSession,
    bedtime_baseline_minutes: Option<f64>,
    resting_hr: Option<f64>,
) -> Result<SleepScoreResult> {
    if session.total_duration_secs <= 0 || session.time_asleep_secs <= 0 {
        return Err(ScoreError::NoSleepData { date });
    }

    let asleep = session.time_asleep_minutes();
    let deep = session.deep_minutes();
    let rem = session.rem_minutes();
    let efficiency = session.efficiency_pct();

    let bedtime_minutes = minute_of_day(session.start);
    let target_minutes = target_bedtime_minutes(bedtime_baseline_minutes, bedtime_minutes);

    let points = SleepPoints {
        duration: duration_points(asleep),
        deep: deep_sleep_points(deep),
        rem: rem_points(rem),
        efficiency: efficiency_points(efficiency),
        consistency: consistency_points(bedtime_minutes, target_minutes),
    };

    let mut duration_text = format!("{} asleep", format_minutes(asleep));
    if let Some(rhr) = resting_hr {
        duration_text.push_str(&format!(", resting HR {:.0} bpm", rhr));
    }

    let deviation = bedtime_deviation_minutes(bedtime_minutes, target_minutes);
    let consistency_text = if deviation == 0 {
        format!("In bed by {} target", clock_time(target_minutes).format("%H:%M"))
    } else {
        format!(
            "{} min past {} target",
            deviation,
            clock_time(target_minutes).format("%H:%M")
        )
    };

    let components = vec![
        ScoreComponent::new(
            "Duration",
            points.duration / DURATION_MAX_POINTS * 100.0,
            DURATION_WEIGHT,
            duration_text,
        ),
        ScoreComponent::new(
            "Deep Sleep",
            points.deep / DEEP_MAX_POINTS * 100.0,
            DEEP_WEIGHT,
            format!("{} deep sleep", format_minutes(deep)),
        ),
        ScoreComponent::new(
            "REM",
            points.rem / REM_MAX_POINTS * 100.0,
            REM_WEIGHT,
            format!("{} REM sleep", format_minutes(rem)),
        ),
        ScoreComponent::new(
            "Efficiency",
            points.efficiency / EFFICIENCY_MAX_POINTS * 100.0,
            EFFICIENCY_WEIGHT,
            format!("{:.1}% of time in bed asleep", efficiency),
        ),
        ScoreComponent::new(
            "Consistency",
            points.consistency / CONSISTENCY_MAX_POINTS * 100.0,
            CONSISTENCY_WEIGHT,
            consistency_text,
        ),
    ];

    let final_score = composite_score(&components);

    Ok(SleepScoreResult {
        date,
        final_score,
        components,
        details: SleepDetails {
            session: session.clone(),
            efficiency_pct: efficiency,
            bedtime: session.start.time(),
            wake_time: session.end.time(),
            target_bedtime: clock_time(target_minutes),
            points,
            resting_hr,
        },
    })
}

// ============================================================================
// CALCULATOR
// ============================================================================

/// Computes and caches Sleep Scores per wake date
pub struct SleepScoreCalculator {
    fetcher: DailyMetricsFetcher,
    baselines: Arc<BaselineEngine>,
    cache: DateCache<SleepScoreResult>,
}

impl SleepScoreCalculator {
    pub fn new(fetcher: DailyMetricsFetcher, baselines: Arc<BaselineEngine>) -> Self {
        Self {
            fetcher,
            baselines,
            cache: DateCache::new("sleep_score", None),
        }
    }

    /// Sleep Score for a wake date
    ///
    /// Cached results are returned without touching the collaborator. On a
    /// miss, authorization is checked once before any fetch.
    pub async fn calculate_sleep_score(&self, date: NaiveDate) -> Result<SleepScoreResult> {
        self.cache
            .get_or_try_insert_with(date, || async {
                if !self.fetcher.is_authorized().await {
                    return Err(ScoreError::DataUnavailable(
                        "health data access not authorized".to_string(),
                    ));
                }
                self.compute(date, None).await
            })
            .await
    }

    /// Sleep Score for callers that already passed the authorization check
    ///
    /// Reuses the fetched snapshot when given, and shares the cache with
    /// [`Self::calculate_sleep_score`].
    pub(crate) async fn score_authorized(
        &self,
        date: NaiveDate,
        raw: Option<&RawDailyMetrics>,
    ) -> Result<SleepScoreResult> {
        self.cache
            .get_or_try_insert_with(date, || self.compute(date, raw))
            .await
    }

    async fn compute(&self, date: NaiveDate, raw: Option<&RawDailyMetrics>) -> Result<SleepScoreResult> {
        let (session, resting_hr) = match raw {
            Some(raw) => (raw.sleep.clone(), raw.resting_hr),
            None => self.fetch_session_and_rhr(date).await?,
        };

        let session = session.ok_or(ScoreError::NoSleepData { date })?;

        let bedtime_baseline = match self.baselines.resolve(date).await {
            Ok(snapshot) => snapshot.bedtime_minutes,
            Err(err) => {
                warn!(date = %date, error = %err, "Baseline unavailable, using default bedtime target");
                None
            }
        };

        let result = score_session(date, &session, bedtime_baseline, resting_hr)?;
        info!(date = %date, score = result.final_score, "Sleep score calculated");
        Ok(result)
    }

    async fn fetch_session_and_rhr(
        &self,
        date: NaiveDate,
    ) -> Result<(Option<SleepSession>, Option<f64>)> {
        let (start, end) = crate::models::day_bounds(date);
        let (session, rhr) = tokio::join!(
            self.fetcher.main_sleep_session(date),
            self.fetcher
                .quantity_series(crate::models::MetricKind::RestingHeartRate, start, end),
        );

        let session = match session {
            Ok(session) => session,
            Err(ProviderError::Unauthorized) => {
                return Err(ScoreError::DataUnavailable(
                    "sleep data access not authorized".to_string(),
                ))
            }
            Err(err) => {
                warn!(date = %date, error = %err, "Sleep fetch failed");
                None
            }
        };

        let resting_hr = match rhr {
            Ok(Some(samples)) => {
                let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
                crate::provider::mean(&values)
            }
            Ok(None) => None,
            Err(err) => {
                debug!(date = %date, error = %err, "Resting HR enrichment unavailable");
                None
            }
        };

        Ok((session, resting_hr))
    }

    pub fn invalidate(&self, date: NaiveDate) {
        self.cache.invalidate(date);
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_metrics(&self) -> CacheMetrics {
        self.cache.metrics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn stage(kind: StageKind, start: NaiveDateTime, minutes: i64) -> StageInterval {
        StageInterval::new(kind, start, start + Duration::minutes(minutes))
    }

    #[test]
    fn test_duration_table_boundaries() {
        assert_eq!(duration_points(481.0), 30.0);
        assert_eq!(duration_points(480.0), 29.0);
        assert_eq!(duration_points(479.0), 29.0);
        assert_eq!(duration_points(450.0), 27.0);
        assert_eq!(duration_points(420.0), 25.0);
        assert_eq!(duration_points(400.0), 22.0);
        assert_eq!(duration_points(360.0), 15.0);
        assert_eq!(duration_points(330.0), 10.0);
        assert_eq!(duration_points(300.0), 5.0);
        assert_eq!(duration_points(299.0), 0.0);
    }

    #[test]
    fn test_deep_and_rem_tables() {
        assert_eq!(deep_sleep_points(105.0), 25.0);
        assert_eq!(deep_sleep_points(104.0), 22.0);
        assert_eq!(deep_sleep_points(60.0), 14.0);
        assert_eq!(deep_sleep_points(44.0), 0.0);

        assert_eq!(rem_points(180.0), 20.0);
        assert_eq!(rem_points(120.0), 20.0);
        assert_eq!(rem_points(75.0), 13.0);
        assert_eq!(rem_points(30.0), 2.5);
        assert_eq!(rem_points(0.0), 0.0);
    }

    #[test]
    fn test_efficiency_table() {
        assert_eq!(efficiency_points(96.0), 15.0);
        assert_eq!(efficiency_points(93.75), 12.0);
        assert_eq!(efficiency_points(90.0), 10.0);
        assert_eq!(efficiency_points(86.0), 5.0);
        assert_eq!(efficiency_points(70.0), 0.0);
    }

    #[test]
    fn test_consistency_on_target() {
        assert_eq!(consistency_points(23 * 60 + 45, 23 * 60 + 45), 10.0);
        assert_eq!(consistency_points(23 * 60 + 30, 23 * 60 + 45), 10.0);
    }

    #[test]
    fn test_consistency_across_midnight() {
        // 00:15 against a 23:45 target is 30 minutes late
        assert_eq!(bedtime_deviation_minutes(15, 23 * 60 + 45), 30);
        assert_eq!(consistency_points(15, 23 * 60 + 45), 7.0);
    }

    #[test]
    fn test_consistency_floor() {
        assert_eq!(consistency_points(3 * 60, 23 * 60), 0.0);
        assert_eq!(consistency_points(23 * 60 + 55, 23 * 60 + 45), 9.0);
    }

    #[test]
    fn test_target_bedtime_selection() {
        // Sane baseline wins
        assert_eq!(target_bedtime_minutes(Some(22.0 * 60.0 + 30.0), 15), 22 * 60 + 30);
        // Baseline outside 20:00-23:59 falls back
        assert_eq!(target_bedtime_minutes(Some(60.0), 15), DEFAULT_TARGET_BEDTIME_MINUTES);
        // Smart default: the actual bedtime's hour
        assert_eq!(target_bedtime_minutes(None, 22 * 60 + 20), 22 * 60);
        assert_eq!(target_bedtime_minutes(None, 23 * 60 + 30), DEFAULT_TARGET_BEDTIME_MINUTES);
        assert_eq!(target_bedtime_minutes(None, 19 * 60), DEFAULT_TARGET_BEDTIME_MINUTES);
    }

    #[test]
    fn test_grouping_merges_within_tolerance() {
        let rules = SessionRules::default();
        let intervals = vec![
            stage(StageKind::Core, at(9, 23, 0), 60),
            // 20 minutes after the previous end
            stage(StageKind::Deep, at(10, 0, 20), 60),
        ];
        let sessions = group_sessions(&intervals, &rules);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].sample_count, 2);
        assert_eq!(sessions[0].start, at(9, 23, 0));
        assert_eq!(sessions[0].end, at(10, 1, 20));
    }

    #[test]
    fn test_grouping_splits_beyond_tolerance() {
        let rules = SessionRules::default();
        let intervals = vec![
            stage(StageKind::Core, at(9, 23, 0), 60),
            // 45 minutes after the previous end
            stage(StageKind::Deep, at(10, 0, 45), 60),
        ];
        assert_eq!(group_sessions(&intervals, &rules).len(), 2);
    }

    #[test]
    fn test_main_session_is_longest() {
        let rules = SessionRules::default();
        let intervals = vec![
            stage(StageKind::Core, at(9, 14, 0), 40),
            stage(StageKind::Core, at(9, 23, 0), 300),
            stage(StageKind::Rem, at(10, 4, 0), 90),
        ];
        let main = main_session(&intervals, &rules).unwrap();
        assert_eq!(main.start, at(9, 23, 0));
        assert_eq!(main.time_asleep_secs, 390 * 60);
    }

    #[test]
    fn test_long_in_bed_artifact_discarded() {
        let rules = SessionRules::default();
        let intervals = vec![
            stage(StageKind::InBed, at(9, 12, 0), 13 * 60),
            stage(StageKind::Core, at(9, 23, 0), 420),
        ];
        let main = main_session(&intervals, &rules).unwrap();
        assert_eq!(main.start, at(9, 23, 0));
        assert_eq!(main.in_bed_secs, 0);
    }

    #[test]
    fn test_unsorted_samples_are_sorted() {
        let rules = SessionRules::default();
        let intervals = vec![
            stage(StageKind::Rem, at(10, 1, 0), 60),
            stage(StageKind::Core, at(9, 23, 30), 90),
        ];
        let sessions = group_sessions(&intervals, &rules);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].start, at(9, 23, 30));
    }

    #[test]
    fn test_end_to_end_example() {
        // 8h in bed from 23:45, 7.5h asleep: 105m deep, 120m REM, 225m core
        let start = at(9, 23, 45);
        let session = SleepSession {
            start,
            end: start + Duration::seconds(28_800),
            total_duration_secs: 28_800,
            time_asleep_secs: 27_000,
            deep_secs: 6_300,
            rem_secs: 7_200,
            core_secs: 13_500,
            unspecified_secs: 0,
            awake_secs: 1_800,
            in_bed_secs: 0,
            sample_count: 4,
        };

        let result = score_session(at(10, 0, 0).date(), &session, None, Some(57.0)).unwrap();
        assert_eq!(result.details.points.duration, 27.0);
        assert_eq!(result.details.points.deep, 25.0);
        assert_eq!(result.details.points.rem, 20.0);
        assert_eq!(result.details.points.efficiency, 12.0);
        assert_eq!(result.details.points.consistency, 10.0);
        assert_eq!(result.final_score, 94);

        let duration = result.component("Duration").unwrap();
        assert!((duration.score - 90.0).abs() < 1e-9);
        assert!(duration.description.contains("57 bpm"));

        let weights: f64 = result.components.iter().map(|c| c.weight).sum();
        assert!((weights - 1.0).abs() < 1e-9);
        for component in &result.components {
            assert!((component.contribution - component.score * component.weight).abs() < 1e-9);
        }
    }

    #[test]
    fn test_no_asleep_time_is_no_sleep_data() {
        let rules = SessionRules::default();
        let intervals = vec![stage(StageKind::InBed, at(9, 23, 0), 480)];
        let session = main_session(&intervals, &rules).unwrap();
        let result = score_session(at(10, 0, 0).date(), &session, None, None);
        assert!(matches!(result, Err(ScoreError::NoSleepData { .. })));
    }
}
