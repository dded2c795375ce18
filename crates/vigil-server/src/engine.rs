use std::sync::Arc;

use axum::body::Bytes;
use tracing::info;
use vigil_alert::{
    AlertEvaluator, AlertRule, LogSink, NotificationRouter, NotificationSink, Severity, load_rules,
    validate_ranges,
};
use vigil_common::{
    error::Result,
    task::{PeriodicTask, StopSignal},
};
use vigil_metrics::{
    AggregationWindow, EngineMetrics, Exporter, HttpMetrics, MetricRegistry, ProcessMetrics,
};

use crate::config::ServerConfig;

/// The running engine: one registry feeding one window, the evaluator on top
/// of it, and the collectors describing the engine itself.
pub struct Engine {
    registry: Arc<MetricRegistry>,
    window: Arc<AggregationWindow>,
    evaluator: Arc<AlertEvaluator>,
    exporter: Exporter,
    http_metrics: HttpMetrics,
    process_metrics: ProcessMetrics,
    engine_metrics: EngineMetrics,
}

impl Engine {
    pub async fn from_config(config: &ServerConfig) -> Result<Self> {
        let rules = match &config.rules_file {
            Some(path) => {
                let rules = load_rules(path).await?;
                info!(path = %path.display(), count = rules.len(), "alert rules loaded");
                rules
            }
            None => Vec::new(),
        };

        let mut router = NotificationRouter::new();
        router.register_target("log", Box::new(LogSink), Severity::Warning);

        Self::build(config, rules, Arc::new(router))
    }

    pub fn build(
        config: &ServerConfig,
        rules: Vec<AlertRule>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        validate_ranges(&rules, config.window.retention())?;

        let window = Arc::new(AggregationWindow::new(config.window));
        let mut registry = MetricRegistry::new().with_window(Arc::clone(&window));
        if let Some(limit) = config.max_series {
            registry = registry.with_max_series(limit);
        }
        let registry = Arc::new(registry);

        let evaluator = AlertEvaluator::new(rules, Arc::clone(&window), sink, config.evaluator)
            .with_phase_metric(&registry)?;

        Ok(Self {
            exporter: Exporter::new(Arc::clone(&registry)),
            http_metrics: HttpMetrics::register(&registry)?,
            process_metrics: ProcessMetrics::register(&registry)?,
            engine_metrics: EngineMetrics::register(&registry, &window)?,
            evaluator: Arc::new(evaluator),
            registry,
            window,
        })
    }

    pub fn registry(&self) -> &Arc<MetricRegistry> {
        &self.registry
    }

    pub fn window(&self) -> &Arc<AggregationWindow> {
        &self.window
    }

    pub fn evaluator(&self) -> &Arc<AlertEvaluator> {
        &self.evaluator
    }

    pub fn http_metrics(&self) -> &HttpMetrics {
        &self.http_metrics
    }

    /// Refreshes the self-describing gauges and renders the exposition body.
    pub fn scrape(&self) -> Bytes {
        self.process_metrics.refresh();
        self.engine_metrics.refresh();
        self.exporter.render()
    }

    /// Spawns window rollover and alert evaluation.
    pub fn start(&self, stop: &StopSignal) -> Vec<PeriodicTask> {
        let rollover = Arc::clone(&self.window).spawn_rollover(stop);
        let evaluation = Arc::clone(&self.evaluator).spawn(stop);
        info!(
            rules = self.evaluator.rule_count(),
            interval_secs = self.evaluator.config().interval.as_secs(),
            retention_secs = self.window.config().retention().as_secs(),
            "engine background tasks started"
        );
        vec![rollover, evaluation]
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use vigil_alert::{ChannelSink, parse_rules};
    use vigil_metrics::{SeriesValue, WindowConfig};

    use super::*;

    #[test]
    fn scrape_includes_self_metrics() {
        let engine =
            Engine::build(&ServerConfig::default(), Vec::new(), Arc::new(LogSink)).unwrap();
        let body = String::from_utf8(engine.scrape().to_vec()).unwrap();

        assert!(body.contains("# TYPE vigil_uptime_seconds gauge\n"));
        assert!(body.contains("vigil_series_total "));
    }

    #[test]
    fn series_ceiling_comes_from_config() {
        let config = ServerConfig {
            max_series: Some(1),
            ..ServerConfig::default()
        };
        let engine = Engine::build(&config, Vec::new(), Arc::new(LogSink)).unwrap();
        let handle = engine
            .registry()
            .register_counter("jobs_total", "", &["queue"])
            .unwrap();

        engine.registry().increment(&handle, &["a"], 1.0).unwrap();
        assert!(engine.registry().increment(&handle, &["b"], 1.0).is_err());
    }

    #[tokio::test]
    async fn recorded_writes_reach_the_evaluator() {
        let rules = parse_rules(
            r#"{"rules": [{
                "name": "DiskFull",
                "severity": "critical",
                "expr": {
                    "series": {"metric": "disk_used_ratio", "labels": {"mount": "/"}},
                    "aggregation": {"fn": "last"},
                    "comparator": ">=",
                    "threshold": 0.9
                }
            }]}"#,
        )
        .unwrap();
        let (sink, mut receiver) = ChannelSink::channel();
        let engine = Engine::build(&ServerConfig::default(), rules, Arc::new(sink)).unwrap();

        let handle = engine
            .registry()
            .register_gauge("disk_used_ratio", "Used disk fraction", &["mount"])
            .unwrap();
        engine.registry().set(&handle, &["/"], 0.95).unwrap();

        engine.evaluator().tick(vigil_common::time::now()).await;
        let notification = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notification.rule_name, "DiskFull");
        assert_eq!(
            engine
                .registry()
                .snapshot()
                .get("vigil_alert_phase", &["DiskFull", "critical"]),
            Some(&SeriesValue::Gauge(2.0))
        );
    }

    #[test]
    fn rule_ranges_must_fit_the_window() {
        let rules = parse_rules(
            r#"{"rules": [{
                "name": "HourlyErrors",
                "severity": "warning",
                "expr": {
                    "series": {"metric": "requests_total", "labels": {"status": "500"}},
                    "aggregation": {"fn": "increase", "over": 3600},
                    "comparator": ">",
                    "threshold": 100
                }
            }]}"#,
        )
        .unwrap();

        let config = ServerConfig::default();
        assert_eq!(config.window.retention(), Duration::from_secs(600));
        let err = Engine::build(&config, rules.clone(), Arc::new(LogSink))
            .err()
            .unwrap();
        assert!(err.to_string().contains("HourlyErrors"));

        let config = ServerConfig {
            window: WindowConfig {
                bucket_width: Duration::from_secs(60),
                bucket_count: 60,
            },
            ..ServerConfig::default()
        };
        assert!(Engine::build(&config, rules, Arc::new(LogSink)).is_ok());
    }

    #[tokio::test]
    async fn missing_rules_file_fails_startup() {
        let config = ServerConfig {
            rules_file: Some("/nonexistent/vigil/rules.json".into()),
            ..ServerConfig::default()
        };
        assert!(Engine::from_config(&config).await.is_err());
    }
}
