//! Raw physiological data access
//!
//! The platform health store is an external collaborator reached through the
//! [`RawMetricsProvider`] trait. [`DailyMetricsFetcher`] layers the pipeline's
//! fetch policy on top of it:
//!
//! - every fetch is bounded by a timeout, and a timeout counts as "metric absent"
//! - the per-date fetches are issued concurrently and joined
//! - one failing fetch never cancels the others
//!
//! [`InMemoryProvider`] is a fixture-backed implementation used by the CLI and
//! the test suite.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::broadcast;
use tokio::time::Duration;
use tracing::warn;

use crate::error::{ProviderError, ScoreError};
use crate::logging::log_score_error;
use crate::models::{
    day_bounds, sleep_window, MetricKind, QuantitySample, RawDailyMetrics, SampleArrival, StageInterval,
};
use crate::sleep::{main_session, SessionRules, SleepSession};

/// Capacity of each per-metric notification channel
const NOTIFICATION_CAPACITY: usize = 64;

/// Access to the platform health-data store
#[async_trait]
pub trait RawMetricsProvider: Send + Sync {
    /// Whether the user granted read access
    async fn fetch_authorization_status(&self) -> bool;

    /// Stage samples overlapping `[start, end)`, possibly empty
    async fn fetch_sleep_session(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<StageInterval>, ProviderError>;

    /// Quantity samples with timestamps in `[start, end)`
    async fn fetch_quantity_series(
        &self,
        metric: MetricKind,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<QuantitySample>, ProviderError>;

    /// Arrival notifications for a metric, delivered at least once
    fn notify_on_new_sample(&self, metric: MetricKind) -> broadcast::Receiver<SampleArrival>;
}

/// Arithmetic mean; `None` for an empty slice
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Group samples by calendar day and average each day
pub fn daily_means(samples: &[QuantitySample]) -> BTreeMap<NaiveDate, f64> {
    let mut grouped: BTreeMap<NaiveDate, Vec<f64>> = BTreeMap::new();
    for sample in samples.iter().filter(|s| s.value.is_finite()) {
        grouped.entry(sample.timestamp.date()).or_default().push(sample.value);
    }

    grouped
        .into_iter()
        .filter_map(|(date, values)| mean(&values).map(|m| (date, m)))
        .collect()
}

/// Fetch policy shared by the baseline engine, calculators, and orchestrator
#[derive(Clone)]
pub struct DailyMetricsFetcher {
    provider: Arc<dyn RawMetricsProvider>,
    timeout: Duration,
    rules: SessionRules,
}

impl DailyMetricsFetcher {
    pub fn new(provider: Arc<dyn RawMetricsProvider>, timeout: Duration, rules: SessionRules) -> Self {
        Self {
            provider,
            timeout,
            rules,
        }
    }

    pub fn provider(&self) -> &Arc<dyn RawMetricsProvider> {
        &self.provider
    }

    pub fn rules(&self) -> &SessionRules {
        &self.rules
    }

    /// Authorization check, bounded by the fetch timeout
    ///
    /// A timed-out check is treated as unauthorized.
    pub async fn is_authorized(&self) -> bool {
        match tokio::time::timeout(self.timeout, self.provider.fetch_authorization_status()).await {
            Ok(authorized) => authorized,
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "Authorization check timed out");
                false
            }
        }
    }

    /// Quantity series; `Ok(None)` when the store has no samples
    pub async fn quantity_series(
        &self,
        metric: MetricKind,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Option<Vec<QuantitySample>>, ProviderError> {
        let fetch = self.provider.fetch_quantity_series(metric, start, end);
        let samples = match tokio::time::timeout(self.timeout, fetch).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProviderError::Timeout {
                    metric,
                    millis: self.timeout.as_millis() as u64,
                })
            }
        };

        if samples.is_empty() {
            Ok(None)
        } else {
            Ok(Some(samples))
        }
    }

    /// Stage samples; `Ok(None)` when the store has no samples
    pub async fn stage_intervals(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Option<Vec<StageInterval>>, ProviderError> {
        let fetch = self.provider.fetch_sleep_session(start, end);
        let intervals = match tokio::time::timeout(self.timeout, fetch).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProviderError::Timeout {
                    metric: MetricKind::SleepAnalysis,
                    millis: self.timeout.as_millis() as u64,
                })
            }
        };

        if intervals.is_empty() {
            Ok(None)
        } else {
            Ok(Some(intervals))
        }
    }

    /// Daily means for `[first, end_exclusive)`
    pub async fn daily_series(
        &self,
        metric: MetricKind,
        first: NaiveDate,
        end_exclusive: NaiveDate,
    ) -> Result<BTreeMap<NaiveDate, f64>, ProviderError> {
        let (start, _) = day_bounds(first);
        let (end, _) = day_bounds(end_exclusive);
        let samples = self.quantity_series(metric, start, end).await?;
        Ok(samples.map(|s| daily_means(&s)).unwrap_or_default())
    }

    /// Mean of one calendar day's samples, collapsing failures to absent
    async fn daily_value(&self, metric: MetricKind, date: NaiveDate) -> Option<f64> {
        let (start, end) = day_bounds(date);
        match self.quantity_series(metric, start, end).await {
            Ok(Some(samples)) => {
                let values: Vec<f64> = samples.iter().map(|s| s.value).filter(|v| v.is_finite()).collect();
                mean(&values)
            }
            Ok(None) => {
                log_score_error("daily fetch", &ScoreError::MissingMetric { metric });
                None
            }
            Err(err) => {
                warn!(metric = ?metric, date = %date, error = %err, "Metric fetch failed, treating as absent");
                None
            }
        }
    }

    /// Main sleep session for a wake date; `Ok(None)` when no session qualifies
    pub async fn main_sleep_session(&self, date: NaiveDate) -> Result<Option<SleepSession>, ProviderError> {
        let (start, end) = sleep_window(date);
        let intervals = self.stage_intervals(start, end).await?;
        Ok(intervals.and_then(|intervals| main_session(&intervals, &self.rules)))
    }

    /// Fan out every per-date fetch and assemble the snapshot
    pub async fn fetch_daily(&self, date: NaiveDate) -> RawDailyMetrics {
        let (hrv, resting_hr, respiratory_rate, walking_hr, spo2, sleep) = tokio::join!(
            self.daily_value(MetricKind::HeartRateVariability, date),
            self.daily_value(MetricKind::RestingHeartRate, date),
            self.daily_value(MetricKind::RespiratoryRate, date),
            self.daily_value(MetricKind::WalkingHeartRate, date),
            self.daily_value(MetricKind::OxygenSaturation, date),
            self.main_sleep_session(date),
        );

        let sleep = match sleep {
            Ok(session) => session,
            Err(err) => {
                warn!(date = %date, error = %err, "Sleep fetch failed, treating as absent");
                None
            }
        };

        RawDailyMetrics {
            date,
            hrv,
            resting_hr,
            respiratory_rate,
            walking_hr,
            spo2,
            sleep,
        }
    }
}

/// Serializable contents of an [`InMemoryProvider`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderFixture {
    #[serde(default = "default_authorized")]
    pub authorized: bool,

    #[serde(default)]
    pub quantities: BTreeMap<MetricKind, Vec<QuantitySample>>,

    #[serde(default)]
    pub sleep: Vec<StageInterval>,
}

fn default_authorized() -> bool {
    true
}

impl Default for ProviderFixture {
    fn default() -> Self {
        Self {
            authorized: true,
            quantities: BTreeMap::new(),
            sleep: Vec::new(),
        }
    }
}

/// Per-call counters for an [`InMemoryProvider`]
#[derive(Debug, Default)]
struct CallCounters {
    authorization: AtomicUsize,
    sleep: AtomicUsize,
    quantity: Mutex<HashMap<MetricKind, usize>>,
}

/// Health store held in memory
pub struct InMemoryProvider {
    data: RwLock<ProviderFixture>,
    latency: RwLock<Option<Duration>>,
    counters: CallCounters,
    channels: Mutex<HashMap<MetricKind, broadcast::Sender<SampleArrival>>>,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::from_fixture(ProviderFixture::default())
    }
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: ProviderFixture) -> Self {
        Self {
            data: RwLock::new(fixture),
            latency: RwLock::new(None),
            counters: CallCounters::default(),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Load a JSON fixture from disk
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            ScoreError::Configuration(format!("Failed to read fixture {}: {}", path.as_ref().display(), e))
        })?;
        let fixture: ProviderFixture = serde_json::from_str(&content)
            .map_err(|e| ScoreError::Configuration(format!("Failed to parse fixture: {}", e)))?;
        Ok(Self::from_fixture(fixture))
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> ProviderFixture {
        self.data.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_authorized(&self, authorized: bool) {
        self.data.write().unwrap_or_else(PoisonError::into_inner).authorized = authorized;
    }

    /// Delay every fetch, simulating a slow store
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Add quantity samples without notifying subscribers
    pub fn add_samples(&self, metric: MetricKind, samples: impl IntoIterator<Item = QuantitySample>) {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        data.quantities.entry(metric).or_default().extend(samples);
    }

    /// Add stage samples without notifying subscribers
    pub fn add_stages(&self, intervals: impl IntoIterator<Item = StageInterval>) {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        data.sleep.extend(intervals);
    }

    /// Add a quantity sample and notify subscribers of its arrival
    pub fn push_sample(&self, metric: MetricKind, sample: QuantitySample) {
        self.add_samples(metric, [sample]);
        self.announce(metric, sample.timestamp);
    }

    /// Add a stage sample and notify sleep-analysis subscribers
    pub fn push_stage(&self, interval: StageInterval) {
        let received_at = interval.end;
        self.add_stages([interval]);
        self.announce(MetricKind::SleepAnalysis, received_at);
    }

    /// Emit an arrival notification; returns the number of receivers reached
    pub fn announce(&self, metric: MetricKind, received_at: NaiveDateTime) -> usize {
        let sender = self.sender(metric);
        sender
            .send(SampleArrival { metric, received_at })
            .unwrap_or(0)
    }

    fn sender(&self, metric: MetricKind) -> broadcast::Sender<SampleArrival> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(metric)
            .or_insert_with(|| broadcast::channel(NOTIFICATION_CAPACITY).0)
            .clone()
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    pub fn authorization_calls(&self) -> usize {
        self.counters.authorization.load(Ordering::SeqCst)
    }

    pub fn sleep_calls(&self) -> usize {
        self.counters.sleep.load(Ordering::SeqCst)
    }

    pub fn quantity_calls(&self, metric: MetricKind) -> usize {
        let counts = self.counters.quantity.lock().unwrap_or_else(PoisonError::into_inner);
        counts.get(&metric).copied().unwrap_or(0)
    }

    /// Sleep plus quantity fetches; authorization checks are not counted
    pub fn total_fetches(&self) -> usize {
        let counts = self.counters.quantity.lock().unwrap_or_else(PoisonError::into_inner);
        self.sleep_calls() + counts.values().sum::<usize>()
    }

    pub fn reset_counters(&self) {
        self.counters.authorization.store(0, Ordering::SeqCst);
        self.counters.sleep.store(0, Ordering::SeqCst);
        self.counters
            .quantity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[async_trait]
impl RawMetricsProvider for InMemoryProvider {
    async fn fetch_authorization_status(&self) -> bool {
        self.counters.authorization.fetch_add(1, Ordering::SeqCst);
        self.data.read().unwrap_or_else(PoisonError::into_inner).authorized
    }

    async fn fetch_sleep_session(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<StageInterval>, ProviderError> {
        self.counters.sleep.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        if !data.authorized {
            return Err(ProviderError::Unauthorized);
        }
        Ok(data
            .sleep
            .iter()
            .filter(|interval| interval.end > start && interval.start < end)
            .cloned()
            .collect())
    }

    async fn fetch_quantity_series(
        &self,
        metric: MetricKind,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<QuantitySample>, ProviderError> {
        {
            let mut counts = self.counters.quantity.lock().unwrap_or_else(PoisonError::into_inner);
            *counts.entry(metric).or_insert(0) += 1;
        }
        self.simulate_latency().await;

        if !metric.is_quantity() {
            return Err(ProviderError::UnsupportedMetric { metric });
        }

        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        if !data.authorized {
            return Err(ProviderError::Unauthorized);
        }
        Ok(data
            .quantities
            .get(&metric)
            .map(|samples| {
                samples
                    .iter()
                    .filter(|s| s.timestamp >= start && s.timestamp < end)
                    .copied()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn notify_on_new_sample(&self, metric: MetricKind) -> broadcast::Receiver<SampleArrival> {
        self.sender(metric).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StageKind;

    fn ts(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn fetcher(provider: Arc<InMemoryProvider>, timeout_ms: u64) -> DailyMetricsFetcher {
        DailyMetricsFetcher::new(provider, Duration::from_millis(timeout_ms), SessionRules::default())
    }

    #[test]
    fn test_daily_means_groups_by_day() {
        let samples = vec![
            QuantitySample::new(ts(1, 3, 0), 40.0),
            QuantitySample::new(ts(1, 5, 0), 50.0),
            QuantitySample::new(ts(2, 3, 0), 60.0),
            QuantitySample::new(ts(2, 4, 0), f64::NAN),
        ];
        let means = daily_means(&samples);
        assert_eq!(means.len(), 2);
        assert_eq!(means[&ts(1, 0, 0).date()], 45.0);
        assert_eq!(means[&ts(2, 0, 0).date()], 60.0);
    }

    #[test]
    fn test_mean_empty() {
        assert_eq!(mean(&[]), None);
        assert_eq!(mean(&[1.0, 2.0, 3.0]), Some(2.0));
    }

    #[tokio::test]
    async fn test_fetch_daily_snapshot() {
        let provider = Arc::new(InMemoryProvider::new());
        provider.add_samples(
            MetricKind::HeartRateVariability,
            [QuantitySample::new(ts(10, 4, 0), 42.0), QuantitySample::new(ts(10, 6, 0), 48.0)],
        );
        provider.add_samples(MetricKind::RestingHeartRate, [QuantitySample::new(ts(10, 8, 0), 58.0)]);
        provider.add_stages([StageInterval::new(StageKind::Core, ts(9, 23, 0), ts(10, 6, 0))]);

        let raw = fetcher(provider.clone(), 1000).fetch_daily(ts(10, 0, 0).date()).await;
        assert_eq!(raw.hrv, Some(45.0));
        assert_eq!(raw.resting_hr, Some(58.0));
        assert_eq!(raw.spo2, None);
        assert!(raw.sleep.is_some());
        assert_eq!(provider.total_fetches(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_degrades_to_absent() {
        let provider = Arc::new(InMemoryProvider::new());
        provider.add_samples(MetricKind::HeartRateVariability, [QuantitySample::new(ts(10, 4, 0), 42.0)]);
        provider.set_latency(Some(Duration::from_secs(10)));

        let fetcher = fetcher(provider, 100);
        let (start, end) = day_bounds(ts(10, 0, 0).date());
        let result = fetcher
            .quantity_series(MetricKind::HeartRateVariability, start, end)
            .await;
        assert!(matches!(result, Err(ProviderError::Timeout { .. })));

        let raw = fetcher.fetch_daily(ts(10, 0, 0).date()).await;
        assert_eq!(raw.hrv, None);
    }

    #[tokio::test]
    async fn test_unauthorized_fetch_is_distinguishable() {
        let provider = Arc::new(InMemoryProvider::new());
        provider.set_authorized(false);

        let fetcher = fetcher(provider.clone(), 1000);
        assert!(!fetcher.is_authorized().await);

        let (start, end) = day_bounds(ts(10, 0, 0).date());
        let result = fetcher.quantity_series(MetricKind::RestingHeartRate, start, end).await;
        assert_eq!(result, Err(ProviderError::Unauthorized));
        assert_eq!(provider.authorization_calls(), 1);
    }

    #[tokio::test]
    async fn test_notifications_are_per_metric() {
        let provider = InMemoryProvider::new();
        let mut hrv = provider.notify_on_new_sample(MetricKind::HeartRateVariability);
        let mut rhr = provider.notify_on_new_sample(MetricKind::RestingHeartRate);

        provider.push_sample(MetricKind::HeartRateVariability, QuantitySample::new(ts(10, 4, 0), 40.0));

        let event = hrv.recv().await.unwrap();
        assert_eq!(event.metric, MetricKind::HeartRateVariability);
        assert!(rhr.try_recv().is_err());
    }

    #[test]
    fn test_fixture_json() {
        let json = r#"{
            "quantities": { "heart_rate_variability": [ { "timestamp": "2024-03-10T04:00:00", "value": 41.5 } ] },
            "sleep": [ { "stage": "deep", "start": "2024-03-10T01:00:00", "end": "2024-03-10T02:00:00" } ]
        }"#;
        let fixture: ProviderFixture = serde_json::from_str(json).unwrap();
        assert!(fixture.authorized);
        assert_eq!(fixture.quantities[&MetricKind::HeartRateVariability][0].value, 41.5);
        assert_eq!(fixture.sleep[0].stage, StageKind::Deep);
    }
}
