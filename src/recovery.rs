//! Recovery Score
//!
//! # Background
//!
//! Recovery blends four signals, each scored 0-100 and weighted:
//!
//! - **HRV (50%)**: today's HRV (SDNN) against the 60-day baseline. Higher
//!   variability means parasympathetic dominance and better recovery.
//! - **Resting heart rate (25%)**: the 60-day baseline against today's value;
//!   a lower RHR than usual is better.
//! - **Sleep (15%)**: the night's Sleep Score, taken verbatim.
//! - **Stress (10%)**: how far walking HR, respiratory rate, and SpO2 deviate
//!   from their 14-day baselines.
//!
//! A component whose input is absent scores a neutral 50, so a day with no
//! data at all lands exactly at 50.
//!
//! # HRV Status
//!
//! Today's HRV relative to baseline:
//! - **Balanced**: no more than 15% below baseline
//! - **Unbalanced**: 15-30% below baseline
//! - **Poor**: more than 30% below baseline
//! - **No Reading**: no HRV today

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::baseline::{BaselineEngine, BaselineSnapshot, BaselineWindow};
use crate::cache::{CacheMetrics, DateCache};
use crate::error::{Result, ScoreError};
use crate::models::{composite_score, MetricKind, RawDailyMetrics, ScoreComponent};
use crate::provider::DailyMetricsFetcher;
use crate::sleep::SleepScoreCalculator;

pub const HRV_WEIGHT: f64 = 0.50;
pub const RHR_WEIGHT: f64 = 0.25;
pub const SLEEP_WEIGHT: f64 = 0.15;
pub const STRESS_WEIGHT: f64 = 0.10;

/// Score substituted for a component whose input is absent
pub const NEUTRAL_SCORE: f64 = 50.0;

/// HRV baseline used when the 60-day window has too little data
pub const FALLBACK_HRV_MS: f64 = 35.0;

/// RHR baseline used when the 60-day window has too little data
pub const FALLBACK_RHR_BPM: f64 = 65.0;

/// Stress proxies and their sensitivity multipliers
pub const STRESS_PROXIES: [(MetricKind, f64); 3] = [
    (MetricKind::WalkingHeartRate, 1.2),
    (MetricKind::RespiratoryRate, 1.5),
    (MetricKind::OxygenSaturation, 2.0),
];

/// HRV component score from `today / baseline`
///
/// Logarithmic above baseline, cubic below; exactly 75 at baseline.
pub fn hrv_score(ratio: f64) -> f64 {
    let score = if ratio >= 1.0 {
        75.0 + 35.0 * (1.0 + (ratio - 1.0) / 1.35).log10()
    } else {
        75.0 * ratio.max(0.0).powi(3)
    };
    score.clamp(0.0, 100.0)
}

/// RHR component score from `baseline / today`
///
/// Logarithmic above baseline, quartic below; exactly 75 at baseline.
pub fn rhr_score(ratio: f64) -> f64 {
    let score = if ratio >= 1.0 {
        75.0 + 45.0 * (1.0 + (ratio - 1.0) / 1.25).log10()
    } else {
        75.0 * ratio.max(0.0).powi(4)
    };
    score.clamp(0.0, 100.0)
}

/// Stress component score from the averaged weighted deviation percentage
pub fn stress_score(deviation_pct: f64) -> f64 {
    let dev = deviation_pct.abs();
    let score = if dev <= 5.0 {
        100.0 - 2.0 * dev
    } else if dev <= 15.0 {
        90.0 - 3.0 * (dev - 5.0)
    } else {
        75.0 - 0.5 * (dev - 15.0).powi(2)
    };
    score.clamp(0.0, 100.0)
}

/// Average weighted deviation of the available stress proxies
///
/// Returns the deviation and the number of proxies used; `None` when no
/// proxy has both a reading and a 14-day baseline.
pub fn stress_deviation(raw: &RawDailyMetrics, baselines: &BaselineSnapshot) -> Option<(f64, usize)> {
    let deviations: Vec<f64> = STRESS_PROXIES
        .iter()
        .filter_map(|(metric, multiplier)| {
            let today = raw.value(*metric).filter(|v| v.is_finite())?;
            let baseline = baselines
                .get(*metric, BaselineWindow::Fortnight)
                .filter(|b| *b > 0.0)?;
            Some(((today - baseline) / baseline * 100.0).abs() * multiplier)
        })
        .collect();

    if deviations.is_empty() {
        return None;
    }
    let avg = deviations.iter().sum::<f64>() / deviations.len() as f64;
    Some((avg, deviations.len()))
}

/// HRV status categories based on comparison to personal baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HrvStatus {
    /// HRV well below baseline, indicates poor recovery
    Poor,
    /// HRV moderately below baseline, indicates partial recovery
    Unbalanced,
    /// HRV within normal range of baseline, indicates good recovery
    Balanced,
    /// No valid HRV reading available
    NoReading,
}

impl fmt::Display for HrvStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HrvStatus::Poor => write!(f, "Poor"),
            HrvStatus::Unbalanced => write!(f, "Unbalanced"),
            HrvStatus::Balanced => write!(f, "Balanced"),
            HrvStatus::NoReading => write!(f, "No Reading"),
        }
    }
}

impl HrvStatus {
    /// Classify today's HRV against a baseline
    pub fn classify(hrv: Option<f64>, baseline: f64) -> Self {
        let Some(hrv) = hrv else {
            return HrvStatus::NoReading;
        };
        if baseline <= 0.0 || !hrv.is_finite() {
            return HrvStatus::NoReading;
        }

        let deviation_pct = (hrv - baseline) / baseline * 100.0;
        if deviation_pct >= -15.0 {
            HrvStatus::Balanced
        } else if deviation_pct >= -30.0 {
            HrvStatus::Unbalanced
        } else {
            HrvStatus::Poor
        }
    }
}

/// Readiness band of a Recovery Score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryCategory {
    /// 80 and above
    Optimal,
    /// 60-79
    Moderate,
    /// 40-59
    Low,
    /// Below 40
    Poor,
}

impl RecoveryCategory {
    pub fn from_score(score: u8) -> Self {
        match score {
            80..=u8::MAX => RecoveryCategory::Optimal,
            60..=79 => RecoveryCategory::Moderate,
            40..=59 => RecoveryCategory::Low,
            _ => RecoveryCategory::Poor,
        }
    }
}

impl fmt::Display for RecoveryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryCategory::Optimal => write!(f, "Optimal"),
            RecoveryCategory::Moderate => write!(f, "Moderate"),
            RecoveryCategory::Low => write!(f, "Low"),
            RecoveryCategory::Poor => write!(f, "Poor"),
        }
    }
}

/// Component with the lowest score; ties keep the first
pub fn weakest_component(components: &[ScoreComponent]) -> Option<&ScoreComponent> {
    components.iter().fold(None, |weakest: Option<&ScoreComponent>, c| match weakest {
        Some(w) if w.score <= c.score => Some(w),
        _ => Some(c),
    })
}

/// Guidance text for a score; below 60 it names the weakest component
pub fn directive(score: u8, components: &[ScoreComponent]) -> String {
    let weakest = weakest_component(components)
        .map(|c| c.name.to_lowercase())
        .unwrap_or_else(|| "overall strain".to_string());

    match RecoveryCategory::from_score(score) {
        RecoveryCategory::Optimal => {
            "Well recovered. A good day for high-intensity training.".to_string()
        }
        RecoveryCategory::Moderate => {
            "Moderately recovered. Train as planned but keep intensity in check.".to_string()
        }
        RecoveryCategory::Low => format!(
            "Recovery is low, held back by {}. Favor light activity today.",
            weakest
        ),
        RecoveryCategory::Poor => format!(
            "Recovery is poor, driven by {}. Prioritize rest and sleep.",
            weakest
        ),
    }
}

/// Baseline constants substituted when a window has too little data
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fallbacks {
    pub hrv_ms: f64,
    pub rhr_bpm: f64,
}

impl Default for Fallbacks {
    fn default() -> Self {
        Self {
            hrv_ms: FALLBACK_HRV_MS,
            rhr_bpm: FALLBACK_RHR_BPM,
        }
    }
}

/// Inputs behind a Recovery Score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryDetails {
    pub hrv: Option<f64>,
    pub hrv_baseline: f64,
    pub hrv_baseline_is_fallback: bool,
    pub hrv_status: HrvStatus,
    pub resting_hr: Option<f64>,
    pub rhr_baseline: f64,
    pub rhr_baseline_is_fallback: bool,
    pub sleep_score: Option<u8>,
    pub stress_deviation_pct: Option<f64>,
    pub stress_proxies_used: usize,
}

/// Recovery Score for one date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryScoreResult {
    pub date: NaiveDate,
    pub final_score: u8,
    pub category: RecoveryCategory,
    pub directive: String,

    /// HRV, Resting HR, Sleep, Stress, in that order
    pub components: Vec<ScoreComponent>,

    pub details: RecoveryDetails,
}

impl RecoveryScoreResult {
    pub fn component(&self, name: &str) -> Option<&ScoreComponent> {
        self.components.iter().find(|c| c.name == name)
    }
}

/// Compose a Recovery Score from already fetched inputs
pub fn compose_recovery(
    date: NaiveDate,
    raw: &RawDailyMetrics,
    baselines: &BaselineSnapshot,
    sleep_score: Option<u8>,
    fallbacks: Fallbacks,
) -> RecoveryScoreResult {
    let hrv = raw.hrv.filter(|v| v.is_finite() && *v > 0.0);
    let resting_hr = raw.resting_hr.filter(|v| v.is_finite() && *v > 0.0);

    let hrv_baseline_value = baselines.get(MetricKind::HeartRateVariability, BaselineWindow::TwoMonths);
    let hrv_baseline = hrv_baseline_value.unwrap_or(fallbacks.hrv_ms);
    let rhr_baseline_value = baselines.get(MetricKind::RestingHeartRate, BaselineWindow::TwoMonths);
    let rhr_baseline = rhr_baseline_value.unwrap_or(fallbacks.rhr_bpm);

    let hrv_status = HrvStatus::classify(hrv, hrv_baseline);

    let hrv_component = match hrv {
        Some(today) => ScoreComponent::new(
            "HRV",
            hrv_score(today / hrv_baseline),
            HRV_WEIGHT,
            format!("{:.0} ms vs {:.0} ms baseline ({})", today, hrv_baseline, hrv_status),
        ),
        None => ScoreComponent::new("HRV", NEUTRAL_SCORE, HRV_WEIGHT, "No HRV reading today"),
    };

    let rhr_component = match resting_hr {
        Some(today) => ScoreComponent::new(
            "Resting HR",
            rhr_score(rhr_baseline / today),
            RHR_WEIGHT,
            format!("{:.0} bpm vs {:.0} bpm baseline", today, rhr_baseline),
        ),
        None => ScoreComponent::new(
            "Resting HR",
            NEUTRAL_SCORE,
            RHR_WEIGHT,
            "No resting heart rate today",
        ),
    };

    let sleep_component = match sleep_score {
        Some(score) => ScoreComponent::new(
            "Sleep",
            score as f64,
            SLEEP_WEIGHT,
            format!("Sleep Score {}", score),
        ),
        None => ScoreComponent::new("Sleep", NEUTRAL_SCORE, SLEEP_WEIGHT, "No sleep data for last night"),
    };

    let stress = stress_deviation(raw, baselines);
    let stress_component = match stress {
        Some((deviation, count)) => ScoreComponent::new(
            "Stress",
            stress_score(deviation),
            STRESS_WEIGHT,
            format!("{:.1}% weighted deviation across {} signal(s)", deviation, count),
        ),
        None => ScoreComponent::new("Stress", NEUTRAL_SCORE, STRESS_WEIGHT, "No stress signals available"),
    };

    let components = vec![hrv_component, rhr_component, sleep_component, stress_component];
    let final_score = composite_score(&components);

    RecoveryScoreResult {
        date,
        final_score,
        category: RecoveryCategory::from_score(final_score),
        directive: directive(final_score, &components),
        details: RecoveryDetails {
            hrv,
            hrv_baseline,
            hrv_baseline_is_fallback: hrv_baseline_value.is_none(),
            hrv_status,
            resting_hr,
            rhr_baseline,
            rhr_baseline_is_fallback: rhr_baseline_value.is_none(),
            sleep_score,
            stress_deviation_pct: stress.map(|(d, _)| d),
            stress_proxies_used: stress.map_or(0, |(_, n)| n),
        },
        components,
    }
}

/// Computes and caches Recovery Scores per date
pub struct RecoveryScoreCalculator {
    fetcher: DailyMetricsFetcher,
    baselines: Arc<BaselineEngine>,
    sleep: Arc<SleepScoreCalculator>,
    fallbacks: Fallbacks,
    cache: DateCache<RecoveryScoreResult>,
}

impl RecoveryScoreCalculator {
    pub fn new(
        fetcher: DailyMetricsFetcher,
        baselines: Arc<BaselineEngine>,
        sleep: Arc<SleepScoreCalculator>,
        fallbacks: Fallbacks,
    ) -> Self {
        Self {
            fetcher,
            baselines,
            sleep,
            fallbacks,
            cache: DateCache::new("recovery_score", None),
        }
    }

    /// Recovery Score for a date
    ///
    /// Authorization is checked once up front; every other failure degrades
    /// the affected component to neutral.
    pub async fn calculate_recovery_score(&self, date: NaiveDate) -> Result<RecoveryScoreResult> {
        self.cache
            .get_or_try_insert_with(date, || async {
                if !self.fetcher.is_authorized().await {
                    return Err(ScoreError::DataUnavailable(
                        "health data access not authorized".to_string(),
                    ));
                }

                let raw = self.fetcher.fetch_daily(date).await;
                let baselines = self.resolve_baselines(date).await;
                Ok(self.compose(date, &raw, &baselines).await)
            })
            .await
    }

    /// Recovery Score from a snapshot and baselines the caller already fetched
    ///
    /// Shares the per-date cache with [`Self::calculate_recovery_score`].
    pub(crate) async fn score_prefetched(
        &self,
        date: NaiveDate,
        raw: &RawDailyMetrics,
        baselines: &BaselineSnapshot,
    ) -> RecoveryScoreResult {
        self.cache
            .get_or_insert_with(date, || self.compose(date, raw, baselines))
            .await
    }

    async fn compose(
        &self,
        date: NaiveDate,
        raw: &RawDailyMetrics,
        baselines: &BaselineSnapshot,
    ) -> RecoveryScoreResult {
        let sleep_score = self.sleep_score(date, raw).await;
        let result = compose_recovery(date, raw, baselines, sleep_score, self.fallbacks);
        info!(
            date = %date,
            score = result.final_score,
            category = %result.category,
            "Recovery score calculated"
        );
        result
    }

    async fn resolve_baselines(&self, date: NaiveDate) -> Arc<BaselineSnapshot> {
        match self.baselines.resolve(date).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(date = %date, error = %err, "Baselines unavailable, using fallbacks");
                Arc::new(BaselineSnapshot::empty(date))
            }
        }
    }

    async fn sleep_score(&self, date: NaiveDate, raw: &RawDailyMetrics) -> Option<u8> {
        match self.sleep.score_authorized(date, Some(raw)).await {
            Ok(result) => Some(result.final_score),
            Err(err) => {
                debug!(date = %date, error = %err, "Sleep component neutral");
                None
            }
        }
    }

    pub fn fallbacks(&self) -> Fallbacks {
        self.fallbacks
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
