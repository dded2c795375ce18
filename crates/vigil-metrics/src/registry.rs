use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use tracing::{debug, warn};
use vigil_common::{
    error::{Result, VigilError},
    time::now,
};

use crate::{
    types::{
        AggregateSnapshot, FamilySnapshot, HistogramSnapshot, MetricDescriptor, MetricKind,
        SeriesKey, SeriesSnapshot, SeriesValue,
    },
    window::{AggregationWindow, Observation},
};

type LabelValues = Vec<String>;

/// Owns every registered metric and its lazily created series.
///
/// Locking is layered: the family map is only write-locked by `register`, each
/// family's series map is only write-locked when a new label combination shows
/// up, and values live in atomics (counters, gauges) or a per-series mutex
/// (histograms). Writers to disjoint series never contend on a shared lock.
pub struct MetricRegistry {
    families: RwLock<HashMap<String, Arc<MetricFamily>>>,
    series_count: AtomicUsize,
    max_series: Option<usize>,
    window: Option<Arc<AggregationWindow>>,
}

/// Cheap handle returned by `register`; carries the family so recording does
/// not go through the family map.
#[derive(Clone)]
pub struct RegistrationHandle {
    family: Arc<MetricFamily>,
}

impl RegistrationHandle {
    pub fn descriptor(&self) -> &MetricDescriptor {
        &self.family.descriptor
    }

    pub fn name(&self) -> &str {
        &self.family.descriptor.name
    }
}

impl std::fmt::Debug for RegistrationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationHandle")
            .field("name", &self.family.descriptor.name)
            .field("kind", &self.family.descriptor.kind)
            .finish()
    }
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self {
            families: RwLock::new(HashMap::new()),
            series_count: AtomicUsize::new(0),
            max_series: None,
            window: None,
        }
    }

    /// Caps the number of series across all metrics.
    pub fn with_max_series(mut self, limit: usize) -> Self {
        self.max_series = Some(limit);
        self
    }

    /// Feeds every accepted write into `window`.
    pub fn with_window(mut self, window: Arc<AggregationWindow>) -> Self {
        self.window = Some(window);
        self
    }

    pub fn window(&self) -> Option<&Arc<AggregationWindow>> {
        self.window.as_ref()
    }

    pub fn series_count(&self) -> usize {
        self.series_count.load(Ordering::Relaxed)
    }

    pub fn register(&self, descriptor: MetricDescriptor) -> Result<RegistrationHandle> {
        let descriptor = descriptor.normalized()?;
        let mut families = self.families.write().map_err(|_| {
            VigilError::InternalError("failed to acquire metrics registry lock".to_string())
        })?;

        if let Some(existing) = families.get(&descriptor.name) {
            if existing.descriptor == descriptor {
                return Ok(RegistrationHandle {
                    family: Arc::clone(existing),
                });
            }
            return Err(VigilError::DuplicateMetric(descriptor.name));
        }

        debug!(metric = %descriptor.name, kind = ?descriptor.kind, "metric registered");
        let family = Arc::new(MetricFamily::new(descriptor));
        families.insert(family.descriptor.name.clone(), Arc::clone(&family));
        Ok(RegistrationHandle { family })
    }

    pub fn register_counter(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> Result<RegistrationHandle> {
        self.register(MetricDescriptor::counter(name, help, label_names))
    }

    pub fn register_gauge(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> Result<RegistrationHandle> {
        self.register(MetricDescriptor::gauge(name, help, label_names))
    }

    pub fn register_histogram(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
        buckets: &[f64],
    ) -> Result<RegistrationHandle> {
        self.register(MetricDescriptor::histogram(name, help, label_names, buckets))
    }

    /// Adds `delta` to a counter or gauge series. Counters reject negative and
    /// non-finite deltas.
    pub fn increment(
        &self,
        handle: &RegistrationHandle,
        label_values: &[&str],
        delta: f64,
    ) -> Result<()> {
        let family = &handle.family;
        match family.descriptor.kind {
            MetricKind::Counter if !delta.is_finite() || delta < 0.0 => {
                return Err(invalid_operation(
                    family,
                    format!("counter delta must be finite and non-negative, got {delta}"),
                ));
            }
            MetricKind::Gauge if delta.is_nan() => {
                return Err(invalid_operation(family, "gauge delta is NaN"));
            }
            MetricKind::Histogram => {
                return Err(invalid_operation(
                    family,
                    "histograms are recorded with observe",
                ));
            }
            MetricKind::Counter | MetricKind::Gauge => {}
        }

        let series = self.series_for(family, label_values)?;
        match &series.cell {
            SeriesCell::Counter(value) => {
                value.add(delta);
                self.forward(&series.key, Observation::CounterDelta(delta));
            }
            SeriesCell::Gauge(value) => {
                let current = value.add(delta);
                self.forward(&series.key, Observation::Gauge(current));
            }
            SeriesCell::Histogram(_) => {}
        }
        Ok(())
    }

    /// Overwrites a gauge series.
    pub fn set(
        &self,
        handle: &RegistrationHandle,
        label_values: &[&str],
        value: f64,
    ) -> Result<()> {
        let family = &handle.family;
        if family.descriptor.kind != MetricKind::Gauge {
            return Err(invalid_operation(family, "set is only valid on gauges"));
        }
        if value.is_nan() {
            return Err(invalid_operation(family, "gauge value is NaN"));
        }

        let series = self.series_for(family, label_values)?;
        if let SeriesCell::Gauge(cell) = &series.cell {
            cell.store(value);
            self.forward(&series.key, Observation::Gauge(value));
        }
        Ok(())
    }

    /// Records one histogram sample: every bucket whose bound is at least
    /// `value` is incremented, together with sum and count.
    pub fn observe(
        &self,
        handle: &RegistrationHandle,
        label_values: &[&str],
        value: f64,
    ) -> Result<()> {
        let family = &handle.family;
        if family.descriptor.kind != MetricKind::Histogram {
            return Err(invalid_operation(family, "observe is only valid on histograms"));
        }
        if value.is_nan() {
            return Err(invalid_operation(family, "observed value is NaN"));
        }

        let series = self.series_for(family, label_values)?;
        if let SeriesCell::Histogram(state) = &series.cell {
            let mut state = state.lock().map_err(|_| {
                VigilError::InternalError(format!(
                    "histogram series lock poisoned: {}",
                    series.key
                ))
            })?;
            for (bound, count) in family.bounds.iter().zip(state.cumulative_counts.iter_mut()) {
                if value <= *bound {
                    *count += 1;
                }
            }
            state.count += 1;
            state.sum += value;
        }

        self.forward(
            &series.key,
            Observation::Histogram {
                value,
                bounds: Arc::clone(&family.bounds),
            },
        );
        Ok(())
    }

    /// Copies references under short read locks, then reads values without
    /// holding any map lock. Series are not read at one common instant.
    pub fn snapshot(&self) -> AggregateSnapshot {
        let families: Vec<Arc<MetricFamily>> = match self.families.read() {
            Ok(guard) => guard.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        };

        let mut snapshots = families
            .iter()
            .map(|family| family.snapshot())
            .collect::<Vec<_>>();
        snapshots.sort_by(|left, right| left.descriptor.name.cmp(&right.descriptor.name));

        AggregateSnapshot {
            taken_at: now(),
            families: snapshots,
        }
    }

    fn series_for(&self, family: &MetricFamily, label_values: &[&str]) -> Result<Arc<Series>> {
        let expected = family.descriptor.label_names.len();
        if label_values.len() != expected {
            return Err(VigilError::LabelCardinality {
                metric: family.descriptor.name.clone(),
                expected,
                actual: label_values.len(),
            });
        }

        let lookup: LabelValues = label_values.iter().map(|value| (*value).to_string()).collect();
        if let Ok(guard) = family.series.read()
            && let Some(existing) = guard.get(&lookup)
        {
            return Ok(Arc::clone(existing));
        }

        let mut guard = family.series.write().map_err(|_| {
            VigilError::InternalError(format!(
                "series map lock poisoned: {}",
                family.descriptor.name
            ))
        })?;
        if let Some(existing) = guard.get(&lookup) {
            return Ok(Arc::clone(existing));
        }

        self.reserve_series_slot(&family.descriptor.name)?;
        let series = Arc::new(Series::new(family, &lookup));
        guard.insert(lookup, Arc::clone(&series));
        Ok(series)
    }

    fn reserve_series_slot(&self, metric: &str) -> Result<()> {
        let Some(limit) = self.max_series else {
            self.series_count.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };

        self.series_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < limit).then_some(count + 1)
            })
            .map(|_| ())
            .map_err(|_| {
                warn!(metric = %metric, limit, "series limit reached, rejecting new label set");
                VigilError::CardinalityLimit {
                    metric: metric.to_string(),
                    limit,
                }
            })
    }

    fn forward(&self, key: &SeriesKey, observation: Observation) {
        if let Some(window) = &self.window {
            window.record(key, observation, now());
        }
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid_operation(family: &MetricFamily, reason: impl Into<String>) -> VigilError {
    VigilError::InvalidOperation {
        metric: family.descriptor.name.clone(),
        reason: reason.into(),
    }
}

struct MetricFamily {
    descriptor: MetricDescriptor,
    bounds: Arc<[f64]>,
    series: RwLock<HashMap<LabelValues, Arc<Series>>>,
}

impl MetricFamily {
    fn new(descriptor: MetricDescriptor) -> Self {
        Self {
            bounds: Arc::from(descriptor.buckets.as_slice()),
            descriptor,
            series: RwLock::new(HashMap::new()),
        }
    }

    fn snapshot(&self) -> FamilySnapshot {
        let entries: Vec<(LabelValues, Arc<Series>)> = match self.series.read() {
            Ok(guard) => guard
                .iter()
                .map(|(labels, series)| (labels.clone(), Arc::clone(series)))
                .collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .map(|(labels, series)| (labels.clone(), Arc::clone(series)))
                .collect(),
        };

        let mut series = entries
            .into_iter()
            .filter_map(|(label_values, series)| {
                let value = series.read_value()?;
                Some(SeriesSnapshot {
                    label_values,
                    value,
                })
            })
            .collect::<Vec<_>>();
        series.sort_by(|left, right| left.label_values.cmp(&right.label_values));

        FamilySnapshot {
            descriptor: self.descriptor.clone(),
            series,
        }
    }
}

struct Series {
    key: SeriesKey,
    cell: SeriesCell,
}

impl Series {
    fn new(family: &MetricFamily, label_values: &[String]) -> Self {
        let cell = match family.descriptor.kind {
            MetricKind::Counter => SeriesCell::Counter(AtomicF64::new(0.0)),
            MetricKind::Gauge => SeriesCell::Gauge(AtomicF64::new(0.0)),
            MetricKind::Histogram => SeriesCell::Histogram(Mutex::new(HistogramState {
                cumulative_counts: vec![0; family.bounds.len()],
                count: 0,
                sum: 0.0,
            })),
        };

        Self {
            key: SeriesKey::from_descriptor(&family.descriptor, label_values),
            cell,
        }
    }

    fn read_value(&self) -> Option<SeriesValue> {
        match &self.cell {
            SeriesCell::Counter(value) => Some(SeriesValue::Counter(value.load())),
            SeriesCell::Gauge(value) => Some(SeriesValue::Gauge(value.load())),
            SeriesCell::Histogram(state) => match state.lock() {
                Ok(state) => Some(SeriesValue::Histogram(HistogramSnapshot {
                    cumulative_counts: state.cumulative_counts.clone(),
                    count: state.count,
                    sum: state.sum,
                })),
                Err(_) => {
                    warn!(
                        series = %self.key,
                        "histogram series lock poisoned, omitting from snapshot"
                    );
                    None
                }
            },
        }
    }
}

enum SeriesCell {
    Counter(AtomicF64),
    Gauge(AtomicF64),
    Histogram(Mutex<HistogramState>),
}

struct HistogramState {
    cumulative_counts: Vec<u64>,
    count: u64,
    sum: f64,
}

struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Returns the value after the addition.
    fn add(&self, delta: f64) -> f64 {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = f64::from_bits(current) + delta;
            match self.0.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}
