use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tracing::warn;
use vigil_common::error::Result;

use crate::{
    registry::{MetricRegistry, RegistrationHandle},
    window::AggregationWindow,
};

/// Gauges and counters describing the engine itself.
pub struct EngineMetrics {
    registry: Arc<MetricRegistry>,
    window: Arc<AggregationWindow>,
    series_total: RegistrationHandle,
    late_observations_total: RegistrationHandle,
    late_reported: AtomicU64,
}

impl EngineMetrics {
    pub fn register(
        registry: &Arc<MetricRegistry>,
        window: &Arc<AggregationWindow>,
    ) -> Result<Self> {
        Ok(Self {
            registry: Arc::clone(registry),
            window: Arc::clone(window),
            series_total: registry.register_gauge(
                "vigil_series_total",
                "Number of labeled series held by the registry",
                &[],
            )?,
            late_observations_total: registry.register_counter(
                "vigil_late_observations_total",
                "Observations dropped for arriving after their bucket left the window",
                &[],
            )?,
            late_reported: AtomicU64::new(0),
        })
    }

    pub fn refresh(&self) {
        if let Err(err) = self
            .registry
            .set(&self.series_total, &[], self.registry.series_count() as f64)
        {
            warn!(error = %err, "failed to refresh series gauge");
        }

        let dropped = self.window.late_dropped();
        let previous = self.late_reported.swap(dropped, Ordering::AcqRel);
        if dropped > previous
            && let Err(err) = self.registry.increment(
                &self.late_observations_total,
                &[],
                (dropped - previous) as f64,
            )
        {
            warn!(error = %err, "failed to record late observation count");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::{
        types::{SeriesKey, SeriesValue},
        window::{Observation, WindowConfig},
    };

    #[test]
    fn late_drops_are_exported_as_a_counter() {
        let window = Arc::new(AggregationWindow::new(WindowConfig::default()));
        let registry = Arc::new(MetricRegistry::new());
        let metrics = EngineMetrics::register(&registry, &window).unwrap();

        let key = SeriesKey::new("jobs_total", Vec::new());
        let recent = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let stale = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        window.record(&key, Observation::CounterDelta(1.0), recent);
        window.record(&key, Observation::CounterDelta(1.0), stale);
        window.record(&key, Observation::CounterDelta(1.0), stale);

        metrics.refresh();
        metrics.refresh();

        let snapshot = registry.snapshot();
        assert_eq!(
            snapshot.get("vigil_late_observations_total", &[]),
            Some(&SeriesValue::Counter(2.0))
        );
        assert_eq!(
            snapshot.get("vigil_series_total", &[]),
            Some(&SeriesValue::Gauge(2.0))
        );
    }
}
