//! Per-date result caching
//!
//! Features:
//! - At most one live entry per (cache, date)
//! - Optional time-to-live measured from insertion
//! - Per-date single-writer slots: concurrent requests for the same date wait
//!   for the first computation instead of recomputing
//! - Hit/miss/eviction metrics

use chrono::NaiveDate;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::{Duration, Instant};
use tracing::debug;

/// Cached value with its insertion time and calendar-day key
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub inserted_at: Instant,
    pub date_key: NaiveDate,
}

impl<T> CacheEntry<T> {
    pub fn new(date_key: NaiveDate, value: T) -> Self {
        Self {
            value,
            inserted_at: Instant::now(),
            date_key,
        }
    }

    /// Expiry is time since insertion; entries without a TTL never expire
    pub fn is_expired(&self, ttl: Option<Duration>) -> bool {
        match ttl {
            Some(ttl) => self.inserted_at.elapsed() >= ttl,
            None => false,
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    pub total_lookups: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
}

impl CacheMetrics {
    /// Get hit rate as percentage
    pub fn hit_rate(&self) -> f64 {
        if self.total_lookups == 0 {
            return 0.0;
        }
        (self.cache_hits as f64 / self.total_lookups as f64) * 100.0
    }
}

type Slot<T> = Arc<tokio::sync::Mutex<Option<CacheEntry<T>>>>;

/// Date-keyed cache with per-date single-writer slots
pub struct DateCache<T> {
    name: &'static str,
    ttl: Option<Duration>,
    slots: Mutex<HashMap<NaiveDate, Slot<T>>>,
    metrics: Mutex<CacheMetrics>,
}

impl<T: Clone> DateCache<T> {
    /// Create a cache; `ttl = None` keeps entries until cleared or superseded
    pub fn new(name: &'static str, ttl: Option<Duration>) -> Self {
        Self {
            name,
            ttl,
            slots: Mutex::new(HashMap::new()),
            metrics: Mutex::new(CacheMetrics::default()),
        }
    }

    fn slot(&self, date: NaiveDate) -> Slot<T> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        self.purge_stale(&mut slots, date);
        slots.entry(date).or_default().clone()
    }

    /// Drop slots that are empty or expired and not held by any caller
    ///
    /// Holding the map lock means no new handle to an unshared slot can be
    /// taken, so a strong count of one marks it safe to remove.
    fn purge_stale(&self, slots: &mut HashMap<NaiveDate, Slot<T>>, keep: NaiveDate) {
        let ttl = self.ttl;
        let mut expired = 0;
        slots.retain(|key, slot| {
            if *key == keep || Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(entry) => match entry.as_ref() {
                    Some(existing) if existing.is_expired(ttl) => {
                        expired += 1;
                        false
                    }
                    Some(_) => true,
                    None => false,
                },
                Err(_) => true,
            }
        });

        if expired > 0 {
            debug!(cache = self.name, expired, "Expired cache entries purged");
            let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
            metrics.evictions += expired;
        }
    }

    /// Remove the slot for `date` when it holds nothing and nobody else uses it
    fn release_if_empty(&self, date: NaiveDate) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let unused = slots.get(&date).is_some_and(|slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|entry| entry.is_none())
        });
        if unused {
            slots.remove(&date);
        }
    }

    fn existing_slot(&self, date: NaiveDate) -> Option<Slot<T>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(&date).cloned()
    }

    fn record(&self, hit: bool, evicted: bool) {
        let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        metrics.total_lookups += 1;
        if hit {
            metrics.cache_hits += 1;
        } else {
            metrics.cache_misses += 1;
        }
        if evicted {
            metrics.evictions += 1;
        }
    }

    /// Take the live value out of a locked slot, dropping it if expired
    fn live_value(&self, entry: &mut Option<CacheEntry<T>>) -> (Option<T>, bool) {
        match entry {
            Some(existing) if !existing.is_expired(self.ttl) => (Some(existing.value.clone()), false),
            Some(_) => {
                *entry = None;
                (None, true)
            }
            None => (None, false),
        }
    }

    /// Look up a live entry without computing
    pub async fn get(&self, date: NaiveDate) -> Option<T> {
        let Some(slot) = self.existing_slot(date) else {
            self.record(false, false);
            return None;
        };

        let mut entry = slot.lock().await;
        let (value, evicted) = self.live_value(&mut entry);
        self.record(value.is_some(), evicted);

        if value.is_none() {
            drop(entry);
            drop(slot);
            self.release_if_empty(date);
        }
        value
    }

    /// Store a value, superseding any previous entry for the date
    pub async fn insert(&self, date: NaiveDate, value: T) {
        let slot = self.slot(date);
        let mut entry = slot.lock().await;
        *entry = Some(CacheEntry::new(date, value));
    }

    /// Return the cached value or compute, store, and return it
    ///
    /// The per-date slot stays locked while `compute` runs, so concurrent
    /// callers for the same date observe the first result. Errors are not
    /// cached.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, date: NaiveDate, compute: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let slot = self.slot(date);
        let mut entry = slot.lock().await;

        let (value, evicted) = self.live_value(&mut entry);
        self.record(value.is_some(), evicted);
        if let Some(value) = value {
            debug!(cache = self.name, date = %date, "Cache hit");
            return Ok(value);
        }

        debug!(cache = self.name, date = %date, "Cache miss");
        let value = match compute().await {
            Ok(value) => value,
            Err(err) => {
                drop(entry);
                drop(slot);
                self.release_if_empty(date);
                return Err(err);
            }
        };
        *entry = Some(CacheEntry::new(date, value.clone()));
        Ok(value)
    }

    /// Infallible form of [`Self::get_or_try_insert_with`]
    pub async fn get_or_insert_with<F, Fut>(&self, date: NaiveDate, compute: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let slot = self.slot(date);
        let mut entry = slot.lock().await;

        let (value, evicted) = self.live_value(&mut entry);
        self.record(value.is_some(), evicted);
        if let Some(value) = value {
            debug!(cache = self.name, date = %date, "Cache hit");
            return value;
        }

        debug!(cache = self.name, date = %date, "Cache miss");
        let value = compute().await;
        *entry = Some(CacheEntry::new(date, value.clone()));
        value
    }

    /// Drop the entry for one date
    ///
    /// A computation in flight for that date finishes into a detached slot
    /// and its result is not retained.
    pub fn invalidate(&self, date: NaiveDate) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.remove(&date).is_some() {
            debug!(cache = self.name, date = %date, "Cache entry invalidated");
        }
    }

    /// Drop every entry keyed strictly after `date`
    pub fn invalidate_after(&self, date: NaiveDate) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.retain(|key, _| *key <= date);
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.clear();
        debug!(cache = self.name, "Cache cleared");
    }

    /// Number of dates holding a slot (live or in flight)
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache metrics
    pub fn metrics(&self) -> CacheMetrics {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    #[tokio::test]
    async fn test_cache_put_and_get() {
        let cache: DateCache<u8> = DateCache::new("test", None);
        assert_eq!(cache.get(date(1)).await, None);

        cache.insert(date(1), 42).await;
        assert_eq!(cache.get(date(1)).await, Some(42));

        let metrics = cache.metrics();
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.cache_misses, 1);
        assert_eq!(metrics.hit_rate(), 50.0);
    }

    #[tokio::test]
    async fn test_insert_supersedes() {
        let cache: DateCache<u8> = DateCache::new("test", None);
        cache.insert(date(1), 1).await;
        cache.insert(date(1), 2).await;
        assert_eq!(cache.get(date(1)).await, Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache: DateCache<u8> = DateCache::new("test", Some(Duration::from_secs(300)));
        cache.insert(date(1), 7).await;

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.get(date(1)).await, Some(7));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get(date(1)).await, None);
        assert_eq!(cache.metrics().evictions, 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_dates_do_not_accumulate() {
        let cache: DateCache<u8> = DateCache::new("test", Some(Duration::from_secs(300)));
        for day in 1..=5 {
            cache.insert(date(day), day as u8).await;
        }
        assert_eq!(cache.len(), 5);

        tokio::time::advance(Duration::from_secs(301)).await;
        cache.insert(date(6), 6).await;

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(date(6)).await, Some(6));
        assert_eq!(cache.metrics().evictions, 5);
    }

    #[tokio::test]
    async fn test_concurrent_compute_runs_once() {
        let cache: Arc<DateCache<u32>> = Arc::new(DateCache::new("test", None));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_try_insert_with(date(2), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, String>(99)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(99));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache: DateCache<u32> = DateCache::new("test", None);
        let first = cache
            .get_or_try_insert_with(date(3), || async { Err::<u32, _>("boom") })
            .await;
        assert_eq!(first, Err("boom"));
        assert!(cache.is_empty());

        let second = cache
            .get_or_try_insert_with(date(3), || async { Ok::<_, &str>(5) })
            .await;
        assert_eq!(second, Ok(5));
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let cache: DateCache<u8> = DateCache::new("test", None);
        for day in 1..=4 {
            cache.insert(date(day), day as u8).await;
        }

        cache.invalidate(date(1));
        assert_eq!(cache.get(date(1)).await, None);

        cache.invalidate_after(date(2));
        assert_eq!(cache.get(date(2)).await, Some(2));
        assert_eq!(cache.get(date(3)).await, None);

        cache.clear();
        assert!(cache.is_empty());
    }
}
