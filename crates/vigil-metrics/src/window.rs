//! Time-bucketed rollups of raw observations.
//!
//! Each series keeps a ring of `bucket_count` slots. A slot is tagged with the
//! absolute bucket index (timestamp divided by bucket width) it currently
//! holds, so stale slots are recognised and recycled lazily instead of being
//! swept on every tick. Queries read the slots of the `n` most recent buckets
//! ending at the head.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use vigil_common::{
    task::{PeriodicTask, Schedule, StopSignal},
    time::now,
};

use crate::types::SeriesKey;

const NO_BUCKET: i64 = i64::MIN;

#[derive(Debug, Clone, Copy)]
pub struct WindowConfig {
    pub bucket_width: Duration,
    pub bucket_count: usize,
}

impl WindowConfig {
    pub fn retention(&self) -> Duration {
        u32::try_from(self.bucket_count)
            .ok()
            .and_then(|count| self.bucket_width.checked_mul(count))
            .unwrap_or(Duration::MAX)
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            bucket_width: Duration::from_secs(10),
            bucket_count: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Observation {
    CounterDelta(f64),
    /// The gauge value after the write.
    Gauge(f64),
    Histogram { value: f64, bounds: Arc<[f64]> },
}

pub struct AggregationWindow {
    config: WindowConfig,
    width_ms: i64,
    head: AtomicI64,
    series: RwLock<HashMap<SeriesKey, Arc<Mutex<SeriesWindow>>>>,
    late_dropped: AtomicU64,
}

impl AggregationWindow {
    pub fn new(config: WindowConfig) -> Self {
        let config = WindowConfig {
            bucket_width: config.bucket_width.max(Duration::from_millis(1)),
            bucket_count: config.bucket_count.max(1),
        };

        Self {
            width_ms: i64::try_from(config.bucket_width.as_millis()).unwrap_or(i64::MAX),
            config,
            head: AtomicI64::new(NO_BUCKET),
            series: RwLock::new(HashMap::new()),
            late_dropped: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> WindowConfig {
        self.config
    }

    pub fn late_dropped(&self) -> u64 {
        self.late_dropped.load(Ordering::Relaxed)
    }

    pub fn series_count(&self) -> usize {
        match self.series.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Moves the head to the bucket covering `at`. Never moves backwards.
    pub fn advance(&self, at: DateTime<Utc>) {
        let bucket = self.bucket_of(&at);
        let previous = self.head.fetch_max(bucket, Ordering::AcqRel);
        if bucket > previous {
            debug!(bucket, "aggregation window advanced");
        }
    }

    /// Attributes `observation` to the bucket covering `at`. Observations
    /// older than the oldest retained bucket are dropped and counted.
    pub fn record(&self, key: &SeriesKey, observation: Observation, at: DateTime<Utc>) {
        let bucket = self.bucket_of(&at);
        let head = self.head.fetch_max(bucket, Ordering::AcqRel).max(bucket);
        if bucket <= head.saturating_sub(self.config.bucket_count as i64) {
            self.drop_late(key, &at);
            return;
        }

        let entry = self.entry_for(key, bucket);
        let mut window = match entry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !window.apply(bucket, &at, observation) {
            drop(window);
            self.drop_late(key, &at);
        }
    }

    /// Counter increase over the buckets covering `over`, or `None` when the
    /// series is unknown or was first seen inside the requested range.
    pub fn increase(&self, key: &SeriesKey, over: Duration) -> Option<f64> {
        let (start, end) = self.covered_range(over)?;
        self.with_series(key, |window| {
            if window.first_bucket > start {
                return None;
            }
            Some(window.slots_between(start, end).map(|slot| slot.delta).sum())
        })
    }

    /// Per-second counter rate over `over`.
    pub fn rate(&self, key: &SeriesKey, over: Duration) -> Option<f64> {
        self.increase(key, over)
            .map(|increase| increase / over.as_secs_f64())
    }

    /// Estimates the `q` quantile from histogram buckets merged across the
    /// range, interpolating linearly inside the bucket holding the rank.
    pub fn quantile(&self, key: &SeriesKey, q: f64, over: Duration) -> Option<f64> {
        if !(0.0..=1.0).contains(&q) {
            return None;
        }
        let (start, end) = self.covered_range(over)?;
        self.with_series(key, |window| {
            let bounds = window.bounds.as_ref()?;
            let mut merged = vec![0_u64; bounds.len()];
            let mut count = 0_u64;
            for slot in window.slots_between(start, end) {
                for (total, bucket) in merged.iter_mut().zip(&slot.histogram_counts) {
                    *total += bucket;
                }
                count += slot.histogram_count;
            }
            histogram_quantile(q, bounds, &merged, count)
        })
    }

    /// Most recent gauge value. A gauge holds its value until the next
    /// write, so this outlives the ring.
    pub fn last(&self, key: &SeriesKey) -> Option<f64> {
        self.with_series(key, |window| window.gauge_last.map(|(_, value)| value))
    }

    /// Mean of gauge writes inside the range.
    pub fn avg_over_time(&self, key: &SeriesKey, over: Duration) -> Option<f64> {
        let (start, end) = self.covered_range(over)?;
        self.with_series(key, |window| {
            let (sum, samples) = window
                .slots_between(start, end)
                .fold((0.0, 0_u64), |(sum, samples), slot| {
                    (sum + slot.gauge_sum, samples + slot.gauge_samples)
                });
            (samples > 0).then(|| sum / samples as f64)
        })
    }

    pub fn last_seen(&self, key: &SeriesKey) -> Option<DateTime<Utc>> {
        self.with_series(key, |window| Some(window.last_seen))
    }

    /// Series currently tracked whose identity matches `metric` and `labels`.
    pub fn find(
        &self,
        metric: &str,
        labels: &std::collections::BTreeMap<String, String>,
    ) -> Option<SeriesKey> {
        let guard = match self.series.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.keys().find(|key| key.matches(metric, labels)).cloned()
    }

    /// Spawns the rollover tick, aligned to bucket boundaries.
    pub fn spawn_rollover(self: Arc<Self>, stop: &StopSignal) -> PeriodicTask {
        let schedule = Schedule::aligned(self.config.bucket_width);
        PeriodicTask::spawn("window-rollover", schedule, stop, move || {
            let window = Arc::clone(&self);
            async move { window.advance(now()) }
        })
    }

    fn bucket_of(&self, at: &DateTime<Utc>) -> i64 {
        at.timestamp_millis().div_euclid(self.width_ms)
    }

    fn covered_range(&self, over: Duration) -> Option<(i64, i64)> {
        let head = self.head.load(Ordering::Acquire);
        if head == NO_BUCKET {
            return None;
        }
        let needed = over.as_millis().div_ceil(self.width_ms as u128);
        if needed == 0 || needed > self.config.bucket_count as u128 {
            return None;
        }
        let needed = i64::try_from(needed).ok()?;
        Some((head - needed + 1, head))
    }

    fn with_series<T>(
        &self,
        key: &SeriesKey,
        read: impl FnOnce(&SeriesWindow) -> Option<T>,
    ) -> Option<T> {
        let entry = {
            let guard = match self.series.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            Arc::clone(guard.get(key)?)
        };
        let window = match entry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        read(&window)
    }

    fn entry_for(&self, key: &SeriesKey, bucket: i64) -> Arc<Mutex<SeriesWindow>> {
        if let Ok(guard) = self.series.read()
            && let Some(existing) = guard.get(key)
        {
            return Arc::clone(existing);
        }

        let mut guard = match self.series.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(guard.entry(key.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(SeriesWindow::new(
                bucket,
                self.config.bucket_count,
            )))
        }))
    }

    fn drop_late(&self, key: &SeriesKey, at: &DateTime<Utc>) {
        self.late_dropped.fetch_add(1, Ordering::Relaxed);
        warn!(
            series = %key,
            timestamp = %at,
            retention_secs = self.config.retention().as_secs(),
            "dropping observation older than the retained window"
        );
    }
}

struct SeriesWindow {
    first_bucket: i64,
    last_seen: DateTime<Utc>,
    /// Newest gauge write as (unix millis, value), kept outside the slots.
    gauge_last: Option<(i64, f64)>,
    bounds: Option<Arc<[f64]>>,
    slots: Vec<Slot>,
}

impl SeriesWindow {
    fn new(first_bucket: i64, capacity: usize) -> Self {
        Self {
            first_bucket,
            last_seen: DateTime::<Utc>::MIN_UTC,
            gauge_last: None,
            bounds: None,
            slots: vec![Slot::default(); capacity],
        }
    }

    /// Returns false when the slot already holds a newer bucket.
    fn apply(&mut self, bucket: i64, at: &DateTime<Utc>, observation: Observation) -> bool {
        if let Observation::Histogram { bounds, .. } = &observation
            && self.bounds.is_none()
        {
            self.bounds = Some(Arc::clone(bounds));
        }
        let bucket_len = self.bounds.as_ref().map_or(0, |bounds| bounds.len());

        let capacity = self.slots.len() as i64;
        let slot = &mut self.slots[bucket.rem_euclid(capacity) as usize];
        if slot.bucket > bucket {
            return false;
        }
        if slot.bucket < bucket {
            slot.reset(bucket, bucket_len);
        }

        match observation {
            Observation::CounterDelta(delta) => slot.delta += delta,
            Observation::Gauge(value) => {
                let at_ms = at.timestamp_millis();
                if self.gauge_last.is_none_or(|(last_at, _)| at_ms >= last_at) {
                    self.gauge_last = Some((at_ms, value));
                }
                slot.gauge_sum += value;
                slot.gauge_samples += 1;
            }
            Observation::Histogram { value, bounds } => {
                if slot.histogram_counts.len() != bounds.len() {
                    slot.histogram_counts.resize(bounds.len(), 0);
                }
                for (bound, count) in bounds.iter().zip(slot.histogram_counts.iter_mut()) {
                    if value <= *bound {
                        *count += 1;
                    }
                }
                slot.histogram_count += 1;
                slot.histogram_sum += value;
            }
        }

        self.first_bucket = self.first_bucket.min(bucket);
        if *at > self.last_seen {
            self.last_seen = *at;
        }
        true
    }

    fn slots_between(&self, start: i64, end: i64) -> impl Iterator<Item = &Slot> {
        self.slots
            .iter()
            .filter(move |slot| slot.bucket >= start && slot.bucket <= end)
    }
}

#[derive(Debug, Clone)]
struct Slot {
    bucket: i64,
    delta: f64,
    gauge_sum: f64,
    gauge_samples: u64,
    histogram_counts: Vec<u64>,
    histogram_count: u64,
    histogram_sum: f64,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            bucket: NO_BUCKET,
            delta: 0.0,
            gauge_sum: 0.0,
            gauge_samples: 0,
            histogram_counts: Vec::new(),
            histogram_count: 0,
            histogram_sum: 0.0,
        }
    }
}

impl Slot {
    fn reset(&mut self, bucket: i64, histogram_len: usize) {
        let mut counts = std::mem::take(&mut self.histogram_counts);
        counts.clear();
        counts.resize(histogram_len, 0);
        *self = Self {
            bucket,
            histogram_counts: counts,
            ..Self::default()
        };
    }
}

/// Quantile estimate from cumulative bucket counts.
///
/// The rank `q * count` is located in the first non-empty bucket whose
/// cumulative count reaches it; the result is interpolated between that
/// bucket's lower and upper bound, where the lowest bucket starts at zero
/// (or at its own bound when that is not positive). Ranks that only the
/// implicit `+Inf` bucket covers yield the largest finite bound.
pub fn histogram_quantile(q: f64, bounds: &[f64], cumulative: &[u64], count: u64) -> Option<f64> {
    if count == 0 || bounds.is_empty() || cumulative.len() != bounds.len() {
        return None;
    }

    let rank = q * count as f64;
    let Some(index) = cumulative
        .iter()
        .position(|bucket| *bucket > 0 && *bucket as f64 >= rank)
    else {
        return bounds.last().copied();
    };

    let upper = bounds[index];
    let (lower, below) = if index == 0 {
        if upper <= 0.0 {
            return Some(upper);
        }
        (0.0, 0)
    } else {
        (bounds[index - 1], cumulative[index - 1])
    };

    let in_bucket = (cumulative[index] - below) as f64;
    Some(lower + (upper - lower) * ((rank - below as f64) / in_bucket))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::TimeZone;

    use super::*;

    const T0: i64 = 1_700_000_000;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(T0 + secs, 0).unwrap()
    }

    fn key(name: &str) -> SeriesKey {
        SeriesKey::new(name, vec![("job".to_string(), "api".to_string())])
    }

    fn window(width_secs: u64, count: usize) -> AggregationWindow {
        AggregationWindow::new(WindowConfig {
            bucket_width: Duration::from_secs(width_secs),
            bucket_count: count,
        })
    }

    #[test]
    fn uniform_increments_give_the_expected_rate() {
        let window = window(10, 12);
        let series = key("requests_total");
        for second in 0..60 {
            window.record(&series, Observation::CounterDelta(1.0), at(second));
        }

        let rate = window.rate(&series, Duration::from_secs(60)).unwrap();
        assert!((rate - 1.0).abs() < 1e-9);
        assert_eq!(window.increase(&series, Duration::from_secs(30)), Some(30.0));
    }

    #[test]
    fn incomplete_coverage_is_no_data() {
        let window = window(10, 12);
        let series = key("requests_total");
        for second in 30..60 {
            window.record(&series, Observation::CounterDelta(1.0), at(second));
        }

        assert_eq!(window.rate(&series, Duration::from_secs(60)), None);
        assert_eq!(window.rate(&series, Duration::from_secs(30)), Some(1.0));
        assert_eq!(window.rate(&series, Duration::from_secs(600)), None);
        assert_eq!(window.rate(&key("unknown_total"), Duration::from_secs(10)), None);
    }

    #[test]
    fn quiet_buckets_still_count_toward_coverage() {
        let window = window(10, 12);
        let series = key("requests_total");
        window.record(&series, Observation::CounterDelta(6.0), at(0));
        window.advance(at(55));

        assert_eq!(window.rate(&series, Duration::from_secs(60)), Some(0.1));
        assert_eq!(window.rate(&series, Duration::from_secs(20)), Some(0.0));
    }

    #[test]
    fn late_observations_are_dropped_and_counted() {
        let window = window(10, 3);
        let series = key("requests_total");
        window.record(&series, Observation::CounterDelta(1.0), at(100));
        window.record(&series, Observation::CounterDelta(1.0), at(75));
        assert_eq!(window.late_dropped(), 1);

        window.record(&series, Observation::CounterDelta(1.0), at(85));
        assert_eq!(window.late_dropped(), 1);
        assert_eq!(window.increase(&series, Duration::from_secs(30)), Some(2.0));
    }

    #[test]
    fn ring_slots_are_recycled_as_time_moves_on() {
        let window = window(10, 3);
        let series = key("requests_total");
        window.record(&series, Observation::CounterDelta(5.0), at(0));
        window.record(&series, Observation::CounterDelta(1.0), at(30));
        window.record(&series, Observation::CounterDelta(2.0), at(40));

        assert_eq!(window.increase(&series, Duration::from_secs(30)), Some(3.0));
    }

    #[test]
    fn quantile_interpolates_inside_the_rank_bucket() {
        let window = window(10, 6);
        let series = key("latency_seconds");
        let bounds: Arc<[f64]> = Arc::from(vec![0.1, 0.5, 1.0].as_slice());
        for value in [0.05, 0.2, 0.3, 0.4, 0.7] {
            window.record(
                &series,
                Observation::Histogram {
                    value,
                    bounds: Arc::clone(&bounds),
                },
                at(5),
            );
        }

        let median = window.quantile(&series, 0.5, Duration::from_secs(10)).unwrap();
        assert!(median > 0.1 && median <= 0.5, "median {median}");
        assert!((median - 0.3).abs() < 1e-9);

        let p99 = window.quantile(&series, 0.99, Duration::from_secs(10)).unwrap();
        assert!(p99 > 0.5 && p99 <= 1.0);
        assert_eq!(window.quantile(&series, 1.5, Duration::from_secs(10)), None);
    }

    #[test]
    fn quantile_merges_buckets_across_the_range() {
        let window = window(10, 6);
        let series = key("latency_seconds");
        let bounds: Arc<[f64]> = Arc::from(vec![1.0, 2.0].as_slice());
        let sample = |value| Observation::Histogram {
            value,
            bounds: Arc::clone(&bounds),
        };
        window.record(&series, sample(0.5), at(0));
        window.record(&series, sample(1.5), at(10));
        window.record(&series, sample(1.5), at(20));

        assert_eq!(window.quantile(&series, 1.0, Duration::from_secs(10)), Some(2.0));
        let merged = window.quantile(&series, 0.25, Duration::from_secs(30)).unwrap();
        assert!(merged > 0.0 && merged <= 1.0);
    }

    #[test]
    fn quantile_without_observations_is_no_data() {
        let window = window(10, 6);
        let series = key("latency_seconds");
        assert_eq!(window.quantile(&series, 0.5, Duration::from_secs(10)), None);

        window.record(&series, Observation::CounterDelta(1.0), at(0));
        assert_eq!(window.quantile(&series, 0.5, Duration::from_secs(10)), None);
    }

    #[test]
    fn histogram_quantile_edges() {
        assert_eq!(histogram_quantile(0.5, &[1.0], &[0], 0), None);
        assert_eq!(histogram_quantile(0.9, &[1.0, 2.0], &[1, 1], 10), Some(2.0));
        assert_eq!(histogram_quantile(0.5, &[-1.0, 2.0], &[4, 4], 4), Some(-1.0));
        assert_eq!(histogram_quantile(0.0, &[1.0, 2.0], &[0, 3], 3), Some(1.0));
    }

    #[test]
    fn gauge_reads_use_the_newest_write() {
        let window = window(10, 6);
        let series = key("queue_depth");
        window.record(&series, Observation::Gauge(4.0), at(12));
        window.record(&series, Observation::Gauge(9.0), at(3));
        window.record(&series, Observation::Gauge(2.0), at(15));

        assert_eq!(window.last(&series), Some(2.0));
        assert_eq!(window.avg_over_time(&series, Duration::from_secs(20)), Some(5.0));
        assert_eq!(window.last_seen(&series), Some(at(15)));
    }

    #[test]
    fn gauge_value_outlives_retention() {
        let window = window(10, 6);
        let series = key("disk_used_ratio");
        window.record(&series, Observation::Gauge(0.95), at(0));
        window.advance(at(615));

        assert_eq!(window.last(&series), Some(0.95));
        assert_eq!(window.avg_over_time(&series, Duration::from_secs(20)), None);
    }

    #[test]
    fn oversized_ranges_are_no_data() {
        let window = window(10, 6);
        let series = key("requests_total");
        window.record(&series, Observation::CounterDelta(1.0), at(0));

        assert_eq!(window.rate(&series, Duration::from_secs(9_223_372_036_854_775)), None);
        assert_eq!(window.increase(&series, Duration::MAX), None);
        assert_eq!(window.quantile(&series, 0.5, Duration::MAX), None);
    }

    #[test]
    fn find_resolves_selector_to_series() {
        let window = window(10, 6);
        window.record(&key("queue_depth"), Observation::Gauge(1.0), at(0));

        let mut labels = BTreeMap::new();
        labels.insert("job".to_string(), "api".to_string());
        assert_eq!(window.find("queue_depth", &labels), Some(key("queue_depth")));
        assert_eq!(window.find("queue_size", &labels), None);
    }
}
