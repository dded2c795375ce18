use std::{sync::Arc, time::Duration};

use tracing::warn;
use vigil_common::error::Result;

use crate::{
    registry::{MetricRegistry, RegistrationHandle},
    types::DEFAULT_BUCKETS,
};

pub struct HttpMetrics {
    registry: Arc<MetricRegistry>,
    requests_total: RegistrationHandle,
    request_duration_seconds: RegistrationHandle,
    errors_total: RegistrationHandle,
}

impl HttpMetrics {
    pub fn register(registry: &Arc<MetricRegistry>) -> Result<Self> {
        let requests_total = registry.register_counter(
            "vigil_http_requests_total",
            "Total number of HTTP requests served by the scrape endpoint",
            &["method", "status"],
        )?;

        let request_duration_seconds = registry.register_histogram(
            "vigil_http_request_duration_seconds",
            "Duration of HTTP requests in seconds",
            &["method", "status"],
            &DEFAULT_BUCKETS,
        )?;

        let errors_total = registry.register_counter(
            "vigil_http_errors_total",
            "Total number of HTTP requests answered with a server error",
            &["method", "status"],
        )?;

        Ok(Self {
            registry: Arc::clone(registry),
            requests_total,
            request_duration_seconds,
            errors_total,
        })
    }

    pub fn record_request(&self, method: &str, status: u16, duration: Duration) {
        let status_value = status.to_string();
        let labels = [method, status_value.as_str()];

        let mut outcome = self
            .registry
            .increment(&self.requests_total, &labels, 1.0)
            .and_then(|()| {
                self.registry.observe(
                    &self.request_duration_seconds,
                    &labels,
                    duration.as_secs_f64(),
                )
            });
        if status >= 500 {
            outcome = outcome
                .and_then(|()| self.registry.increment(&self.errors_total, &labels, 1.0));
        }

        if let Err(err) = outcome {
            warn!(method, status, error = %err, "failed to record http request metrics");
        }
    }
}
