use std::{collections::BTreeMap, fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vigil_common::duration::secs;
use vigil_metrics::{AggregationWindow, SeriesKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
}

impl Comparator {
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Greater => value > threshold,
            Self::GreaterOrEqual => value >= threshold,
            Self::Less => value < threshold,
            Self::LessOrEqual => value <= threshold,
            Self::Equal => value == threshold,
            Self::NotEqual => value != threshold,
        }
    }
}

/// How a rule reduces its series to one number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fn", rename_all = "snake_case")]
pub enum Aggregation {
    Rate {
        #[serde(with = "secs")]
        over: Duration,
    },
    Increase {
        #[serde(with = "secs")]
        over: Duration,
    },
    Quantile {
        q: f64,
        #[serde(with = "secs")]
        over: Duration,
    },
    AvgOverTime {
        #[serde(with = "secs")]
        over: Duration,
    },
    Last,
}

impl Aggregation {
    /// `None` is the no-data outcome.
    pub fn evaluate(&self, window: &AggregationWindow, key: &SeriesKey) -> Option<f64> {
        match self {
            Self::Rate { over } => window.rate(key, *over),
            Self::Increase { over } => window.increase(key, *over),
            Self::Quantile { q, over } => window.quantile(key, *q, *over),
            Self::AvgOverTime { over } => window.avg_over_time(key, *over),
            Self::Last => window.last(key),
        }
    }

    pub fn range(&self) -> Option<Duration> {
        match self {
            Self::Rate { over }
            | Self::Increase { over }
            | Self::Quantile { over, .. }
            | Self::AvgOverTime { over } => Some(*over),
            Self::Last => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesSelector {
    pub metric: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl fmt::Display for SeriesSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.metric)?;
        if self.labels.is_empty() {
            return Ok(());
        }
        let rendered = self
            .labels
            .iter()
            .map(|(name, value)| format!("{name}={value:?}"))
            .collect::<Vec<_>>();
        write!(f, "{{{}}}", rendered.join(","))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertExpression {
    pub series: SeriesSelector,
    pub aggregation: Aggregation,
    pub comparator: Comparator,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    #[serde(rename = "expr")]
    pub expression: AlertExpression,
    #[serde(rename = "for", with = "secs", default)]
    pub for_duration: Duration,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertPhase {
    Ok,
    Pending,
    Firing,
    Resolved,
}

impl AlertPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Pending => "PENDING",
            Self::Firing => "FIRING",
            Self::Resolved => "RESOLVED",
        }
    }

    /// Numeric encoding used by the phase gauge.
    pub fn as_gauge_value(&self) -> f64 {
        match self {
            Self::Ok | Self::Resolved => 0.0,
            Self::Pending => 1.0,
            Self::Firing => 2.0,
        }
    }
}

impl fmt::Display for AlertPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertState {
    pub phase: AlertPhase,
    pub phase_entered_at: DateTime<Utc>,
    pub last_value: Option<f64>,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    /// Last FIRING notification of the current episode.
    pub last_notified_at: Option<DateTime<Utc>>,
}

impl AlertState {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            phase: AlertPhase::Ok,
            phase_entered_at: at,
            last_value: None,
            last_evaluated_at: None,
            last_notified_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub rule_name: String,
    pub severity: Severity,
    pub phase: AlertPhase,
    pub series_values: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
    /// Set on re-sends while an alert keeps firing.
    #[serde(default)]
    pub repeat: bool,
}
