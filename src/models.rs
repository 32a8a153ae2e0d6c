use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::sleep::SleepSession;

/// Physiological metrics consumed from the raw-data collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Heart-rate variability (SDNN), milliseconds
    HeartRateVariability,
    /// Resting heart rate, beats per minute
    RestingHeartRate,
    /// Respiratory rate, breaths per minute
    RespiratoryRate,
    /// Walking heart-rate average, beats per minute
    WalkingHeartRate,
    /// Blood oxygen saturation, percent
    OxygenSaturation,
    /// Sleep-stage category samples (not a quantity series)
    SleepAnalysis,
}

impl MetricKind {
    /// Metrics that can be queried as `(timestamp, value)` series
    pub const QUANTITIES: [MetricKind; 5] = [
        MetricKind::HeartRateVariability,
        MetricKind::RestingHeartRate,
        MetricKind::RespiratoryRate,
        MetricKind::WalkingHeartRate,
        MetricKind::OxygenSaturation,
    ];

    /// Metrics whose late arrival invalidates already computed scores
    pub const CRITICAL: [MetricKind; 3] = [
        MetricKind::HeartRateVariability,
        MetricKind::RestingHeartRate,
        MetricKind::SleepAnalysis,
    ];

    pub fn is_quantity(&self) -> bool {
        !matches!(self, MetricKind::SleepAnalysis)
    }

    /// Stable identifier used for storage
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::HeartRateVariability => "hrv",
            MetricKind::RestingHeartRate => "rhr",
            MetricKind::RespiratoryRate => "respiratory_rate",
            MetricKind::WalkingHeartRate => "walking_hr",
            MetricKind::OxygenSaturation => "spo2",
            MetricKind::SleepAnalysis => "sleep_analysis",
        }
    }

    /// Unit label for display
    pub fn unit(&self) -> &'static str {
        match self {
            MetricKind::HeartRateVariability => "ms",
            MetricKind::RestingHeartRate | MetricKind::WalkingHeartRate => "bpm",
            MetricKind::RespiratoryRate => "br/min",
            MetricKind::OxygenSaturation => "%",
            MetricKind::SleepAnalysis => "",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::HeartRateVariability => write!(f, "HRV"),
            MetricKind::RestingHeartRate => write!(f, "Resting Heart Rate"),
            MetricKind::RespiratoryRate => write!(f, "Respiratory Rate"),
            MetricKind::WalkingHeartRate => write!(f, "Walking Heart Rate"),
            MetricKind::OxygenSaturation => write!(f, "Blood Oxygen"),
            MetricKind::SleepAnalysis => write!(f, "Sleep Analysis"),
        }
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hrv" => Ok(MetricKind::HeartRateVariability),
            "rhr" => Ok(MetricKind::RestingHeartRate),
            "respiratory_rate" => Ok(MetricKind::RespiratoryRate),
            "walking_hr" => Ok(MetricKind::WalkingHeartRate),
            "spo2" => Ok(MetricKind::OxygenSaturation),
            "sleep_analysis" => Ok(MetricKind::SleepAnalysis),
            _ => Err(format!("Unknown metric: {}", s)),
        }
    }
}

/// Sleep-stage categories reported by wearables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Deep,
    Rem,
    Core,
    /// Asleep, but the device did not classify the stage
    Unspecified,
    InBed,
    Awake,
}

impl StageKind {
    /// True for the stages that count toward time asleep
    pub fn is_asleep(&self) -> bool {
        matches!(
            self,
            StageKind::Deep | StageKind::Rem | StageKind::Core | StageKind::Unspecified
        )
    }
}

/// One stage sample from the health store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInterval {
    pub stage: StageKind,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl StageInterval {
    pub fn new(stage: StageKind, start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self { stage, start, end }
    }

    /// Duration of the sample; zero for inverted intervals
    pub fn duration(&self) -> Duration {
        if self.end > self.start {
            self.end - self.start
        } else {
            Duration::zero()
        }
    }
}

/// A single `(timestamp, value)` reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantitySample {
    pub timestamp: NaiveDateTime,
    pub value: f64,
}

impl QuantitySample {
    pub fn new(timestamp: NaiveDateTime, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Notification that new samples of a metric reached the health store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleArrival {
    pub metric: MetricKind,
    pub received_at: NaiveDateTime,
}

/// Immutable per-date snapshot of the raw physiological inputs
///
/// Each quantity is the mean of that calendar day's samples; `None` means the
/// metric was absent, the fetch failed, or it timed out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDailyMetrics {
    pub date: NaiveDate,

    /// HRV (SDNN) in milliseconds
    pub hrv: Option<f64>,

    /// Resting heart rate in bpm
    pub resting_hr: Option<f64>,

    /// Respiratory rate in breaths per minute
    pub respiratory_rate: Option<f64>,

    /// Walking heart-rate average in bpm
    pub walking_hr: Option<f64>,

    /// Blood oxygen saturation in percent
    pub spo2: Option<f64>,

    /// Main sleep session ending on this wake date
    pub sleep: Option<SleepSession>,
}

impl RawDailyMetrics {
    /// Snapshot with every input absent
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            hrv: None,
            resting_hr: None,
            respiratory_rate: None,
            walking_hr: None,
            spo2: None,
            sleep: None,
        }
    }

    /// Value of a quantity metric in this snapshot
    pub fn value(&self, metric: MetricKind) -> Option<f64> {
        match metric {
            MetricKind::HeartRateVariability => self.hrv,
            MetricKind::RestingHeartRate => self.resting_hr,
            MetricKind::RespiratoryRate => self.respiratory_rate,
            MetricKind::WalkingHeartRate => self.walking_hr,
            MetricKind::OxygenSaturation => self.spo2,
            MetricKind::SleepAnalysis => None,
        }
    }
}

/// One weighted part of a composite score
///
/// Invariant: `contribution == score * weight`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreComponent {
    pub name: String,

    /// Component score on a 0-100 scale
    pub score: f64,

    /// Weight within the composite; the weights of one composite sum to 1.0
    pub weight: f64,

    pub contribution: f64,

    pub description: String,
}

impl ScoreComponent {
    pub fn new(name: impl Into<String>, score: f64, weight: f64, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            score,
            weight,
            contribution: score * weight,
            description: description.into(),
        }
    }
}

/// Sum the contributions, round, and clamp into `[0, 100]`
pub fn composite_score(components: &[ScoreComponent]) -> u8 {
    let total: f64 = components.iter().map(|c| c.contribution).sum();
    if !total.is_finite() {
        return 0;
    }
    total.round().clamp(0.0, 100.0) as u8
}

/// Calendar-day boundaries `[date 00:00, date+1 00:00)`
pub fn day_bounds(date: NaiveDate) -> (NaiveDateTime, NaiveDateTime) {
    let start = date.and_time(NaiveTime::MIN);
    (start, start + Duration::days(1))
}

/// Sleep window for a wake date: `[date-1 12:00, date 12:00)`
pub fn sleep_window(date: NaiveDate) -> (NaiveDateTime, NaiveDateTime) {
    let noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap_or(NaiveTime::MIN);
    let end = date.and_time(noon);
    (end - Duration::days(1), end)
}

/// Wake date a timestamp belongs to under the noon-to-noon sleep window
pub fn wake_date_for(timestamp: NaiveDateTime) -> NaiveDate {
    let noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap_or(NaiveTime::MIN);
    if timestamp.time() >= noon {
        timestamp.date() + Duration::days(1)
    } else {
        timestamp.date()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(date: NaiveDate, h: u32, m: u32) -> NaiveDateTime {
        date.and_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_metric_kind_round_trip() {
        for kind in MetricKind::QUANTITIES {
            assert_eq!(kind.as_str().parse::<MetricKind>().unwrap(), kind);
        }
        assert!("weight".parse::<MetricKind>().is_err());
        assert!(!MetricKind::SleepAnalysis.is_quantity());
    }

    #[test]
    fn test_stage_asleep_classification() {
        assert!(StageKind::Deep.is_asleep());
        assert!(StageKind::Unspecified.is_asleep());
        assert!(!StageKind::InBed.is_asleep());
        assert!(!StageKind::Awake.is_asleep());
    }

    #[test]
    fn test_component_contribution() {
        let component = ScoreComponent::new("HRV", 50.0, 0.5, "neutral");
        assert_eq!(component.contribution, 25.0);
    }

    #[test]
    fn test_composite_clamps() {
        let components = vec![
            ScoreComponent::new("a", 150.0, 0.5, ""),
            ScoreComponent::new("b", 150.0, 0.5, ""),
        ];
        assert_eq!(composite_score(&components), 100);

        let components = vec![ScoreComponent::new("a", f64::NAN, 1.0, "")];
        assert_eq!(composite_score(&components), 0);
    }

    #[test]
    fn test_sleep_window_and_wake_date() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let (start, end) = sleep_window(date);
        assert_eq!(start, at(NaiveDate::from_ymd_opt(2024, 3, 9).unwrap(), 12, 0));
        assert_eq!(end, at(date, 12, 0));

        assert_eq!(wake_date_for(at(NaiveDate::from_ymd_opt(2024, 3, 9).unwrap(), 23, 30)), date);
        assert_eq!(wake_date_for(at(date, 7, 0)), date);
        assert_eq!(wake_date_for(at(date, 12, 0)), date + Duration::days(1));
    }

    #[test]
    fn test_stage_interval_duration() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let interval = StageInterval::new(StageKind::Core, at(date, 1, 0), at(date, 2, 30));
        assert_eq!(interval.duration(), Duration::minutes(90));

        let inverted = StageInterval::new(StageKind::Core, at(date, 2, 0), at(date, 1, 0));
        assert_eq!(inverted.duration(), Duration::zero());
    }
}
