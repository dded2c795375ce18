//! Per-rule alert state machines driven by a fixed evaluation tick.
//!
//! Each rule moves `OK -> PENDING -> FIRING` while its condition holds and
//! drops straight back to `OK` from `PENDING` when it stops holding. Leaving
//! `FIRING` emits a `RESOLVED` notification and lands in `OK` within the same
//! tick. Missing data is a false condition.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_common::{
    error::Result,
    task::{PeriodicTask, Schedule, StopSignal},
    time::{elapsed_between, now},
};
use vigil_metrics::{AggregationWindow, MetricRegistry, RegistrationHandle, SeriesKey};

use crate::{
    sink::NotificationSink,
    types::{AlertPhase, AlertRule, AlertState, Notification},
};

#[derive(Debug, Clone, Copy)]
pub struct EvaluatorConfig {
    pub interval: Duration,
    /// Series quiet for longer than this are reported as stale.
    pub staleness_threshold: Duration,
    /// Re-send `FIRING` at this cadence while an alert stays active.
    pub repeat_interval: Option<Duration>,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            staleness_threshold: Duration::from_secs(300),
            repeat_interval: None,
        }
    }
}

struct RuleState {
    rule: AlertRule,
    state: AlertState,
    stale_reported: bool,
}

struct PhaseMetric {
    registry: Arc<MetricRegistry>,
    handle: RegistrationHandle,
}

pub struct AlertEvaluator {
    window: Arc<AggregationWindow>,
    sink: Arc<dyn NotificationSink>,
    config: EvaluatorConfig,
    rules: Mutex<Vec<RuleState>>,
    phase_metric: Option<PhaseMetric>,
}

impl AlertEvaluator {
    pub fn new(
        rules: Vec<AlertRule>,
        window: Arc<AggregationWindow>,
        sink: Arc<dyn NotificationSink>,
        config: EvaluatorConfig,
    ) -> Self {
        let started_at = now();
        let rules = rules
            .into_iter()
            .map(|rule| RuleState {
                rule,
                state: AlertState::new(started_at),
                stale_reported: false,
            })
            .collect();

        Self {
            window,
            sink,
            config,
            rules: Mutex::new(rules),
            phase_metric: None,
        }
    }

    /// Publishes each rule's phase as `vigil_alert_phase{rule,severity}`.
    pub fn with_phase_metric(mut self, registry: &Arc<MetricRegistry>) -> Result<Self> {
        let handle = registry.register_gauge(
            "vigil_alert_phase",
            "Alert phase per rule (0 ok, 1 pending, 2 firing)",
            &["rule", "severity"],
        )?;
        self.phase_metric = Some(PhaseMetric {
            registry: Arc::clone(registry),
            handle,
        });
        Ok(self)
    }

    pub fn config(&self) -> EvaluatorConfig {
        self.config
    }

    pub fn rule_count(&self) -> usize {
        self.lock_rules().len()
    }

    /// Copy of every rule's state, keyed by rule name.
    pub fn states(&self) -> BTreeMap<String, AlertState> {
        self.lock_rules()
            .iter()
            .map(|entry| (entry.rule.name.clone(), entry.state.clone()))
            .collect()
    }

    pub fn state(&self, rule_name: &str) -> Option<AlertState> {
        self.lock_rules()
            .iter()
            .find(|entry| entry.rule.name == rule_name)
            .map(|entry| entry.state.clone())
    }

    /// Runs one evaluation pass at `now` and returns the notifications it
    /// produced, in rule order.
    pub fn evaluate_at(&self, now: DateTime<Utc>) -> Vec<Notification> {
        self.window.advance(now);

        let mut notifications = Vec::new();
        let mut rules = self.lock_rules();
        for entry in rules.iter_mut() {
            let key = self
                .window
                .find(&entry.rule.expression.series.metric, &entry.rule.expression.series.labels);
            self.report_staleness(entry, key.as_ref(), &now);

            let value = key
                .as_ref()
                .and_then(|key| entry.rule.expression.aggregation.evaluate(&self.window, key));
            let condition = value.is_some_and(|value| {
                entry
                    .rule
                    .expression
                    .comparator
                    .holds(value, entry.rule.expression.threshold)
            });

            entry.state.last_value = value;
            entry.state.last_evaluated_at = Some(now);

            if let Some(phase) = self.transition(entry, condition, &now) {
                let mut series_values = BTreeMap::new();
                if let (Some(key), Some(value)) = (&key, value) {
                    series_values.insert(key.to_string(), value);
                }
                let repeat = phase == AlertPhase::Firing && entry.state.last_notified_at.is_some();
                entry.state.last_notified_at = (phase == AlertPhase::Firing).then_some(now);
                notifications.push(Notification {
                    id: Uuid::new_v4(),
                    rule_name: entry.rule.name.clone(),
                    severity: entry.rule.severity,
                    phase,
                    series_values,
                    annotations: entry.rule.annotations.clone(),
                    timestamp: now,
                    repeat,
                });
            }

            self.publish_phase(entry);
        }

        notifications
    }

    /// Evaluates at `now` and hands every notification to the sink. Delivery
    /// failures are logged and never abort the pass.
    pub async fn tick(&self, now: DateTime<Utc>) {
        for notification in self.evaluate_at(now) {
            if let Err(err) = self.sink.deliver(&notification).await {
                warn!(
                    rule = %notification.rule_name,
                    phase = %notification.phase,
                    error = %err,
                    "failed to deliver alert notification"
                );
            }
        }
    }

    pub fn spawn(self: Arc<Self>, stop: &StopSignal) -> PeriodicTask {
        let schedule = Schedule::every(self.config.interval);
        PeriodicTask::spawn("alert-evaluator", schedule, stop, move || {
            let evaluator = Arc::clone(&self);
            async move { evaluator.tick(now()).await }
        })
    }

    /// Applies one tick's outcome and returns the phase to notify, if any.
    fn transition(
        &self,
        entry: &mut RuleState,
        condition: bool,
        now: &DateTime<Utc>,
    ) -> Option<AlertPhase> {
        let rule = &entry.rule;
        let state = &mut entry.state;

        match (state.phase, condition) {
            (AlertPhase::Ok | AlertPhase::Resolved, true) => {
                enter(state, AlertPhase::Pending, now);
                debug!(rule = %rule.name, "alert pending");
                if rule.for_duration.is_zero() {
                    enter(state, AlertPhase::Firing, now);
                    info!(rule = %rule.name, severity = %rule.severity, "alert firing");
                    return Some(AlertPhase::Firing);
                }
                None
            }
            (AlertPhase::Pending, true) => {
                if elapsed_between(&state.phase_entered_at, now) < rule.for_duration {
                    return None;
                }
                enter(state, AlertPhase::Firing, now);
                info!(rule = %rule.name, severity = %rule.severity, "alert firing");
                Some(AlertPhase::Firing)
            }
            (AlertPhase::Pending, false) => {
                enter(state, AlertPhase::Ok, now);
                debug!(rule = %rule.name, "pending alert cleared before firing");
                None
            }
            (AlertPhase::Firing, true) => {
                let repeat_interval = self.config.repeat_interval?;
                let last = state.last_notified_at?;
                (elapsed_between(&last, now) >= repeat_interval).then_some(AlertPhase::Firing)
            }
            (AlertPhase::Firing, false) => {
                enter(state, AlertPhase::Ok, now);
                info!(rule = %rule.name, severity = %rule.severity, "alert resolved");
                Some(AlertPhase::Resolved)
            }
            (AlertPhase::Ok | AlertPhase::Resolved, false) => None,
        }
    }

    fn report_staleness(
        &self,
        entry: &mut RuleState,
        key: Option<&SeriesKey>,
        now: &DateTime<Utc>,
    ) {
        let last_seen = key.and_then(|key| self.window.last_seen(key));
        let stale = match last_seen {
            Some(seen) => elapsed_between(&seen, now) > self.config.staleness_threshold,
            None => true,
        };

        if !stale {
            entry.stale_reported = false;
            return;
        }
        if entry.stale_reported {
            return;
        }
        entry.stale_reported = true;
        warn!(
            rule = %entry.rule.name,
            series = %entry.rule.expression.series,
            last_seen = ?last_seen,
            threshold_secs = self.config.staleness_threshold.as_secs(),
            "alert series has not been written within the staleness threshold"
        );
    }

    fn publish_phase(&self, entry: &RuleState) {
        let Some(metric) = &self.phase_metric else {
            return;
        };
        if let Err(err) = metric.registry.set(
            &metric.handle,
            &[&entry.rule.name, entry.rule.severity.as_str()],
            entry.state.phase.as_gauge_value(),
        ) {
            warn!(rule = %entry.rule.name, error = %err, "failed to publish alert phase");
        }
    }

    fn lock_rules(&self) -> std::sync::MutexGuard<'_, Vec<RuleState>> {
        match self.rules.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn enter(state: &mut AlertState, phase: AlertPhase, now: &DateTime<Utc>) {
    state.phase = phase;
    state.phase_entered_at = *now;
}
