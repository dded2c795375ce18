use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vigil_common::error::{Result, VigilError};

/// Latency-style default bounds, in seconds.
pub const DEFAULT_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    pub fn as_exposition_type(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricDescriptor {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub label_names: Vec<String>,
    /// Finite upper bounds, ascending. Empty unless `kind` is `Histogram`.
    pub buckets: Vec<f64>,
}

impl MetricDescriptor {
    pub fn counter(name: &str, help: &str, label_names: &[&str]) -> Self {
        Self::plain(name, help, MetricKind::Counter, label_names)
    }

    pub fn gauge(name: &str, help: &str, label_names: &[&str]) -> Self {
        Self::plain(name, help, MetricKind::Gauge, label_names)
    }

    pub fn histogram(name: &str, help: &str, label_names: &[&str], buckets: &[f64]) -> Self {
        Self {
            buckets: buckets.to_vec(),
            ..Self::plain(name, help, MetricKind::Histogram, label_names)
        }
    }

    fn plain(name: &str, help: &str, kind: MetricKind, label_names: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            kind,
            label_names: label_names.iter().map(|label| (*label).to_string()).collect(),
            buckets: Vec::new(),
        }
    }

    /// Validates names and bounds and returns the canonical form: bounds
    /// sorted and de-duplicated, no bounds on non-histograms.
    pub(crate) fn normalized(mut self) -> Result<Self> {
        if !is_valid_metric_name(&self.name) {
            return Err(VigilError::InvalidArgument(format!(
                "invalid metric name: {:?}",
                self.name
            )));
        }

        for (index, label) in self.label_names.iter().enumerate() {
            if !is_valid_label_name(label) {
                return Err(VigilError::InvalidArgument(format!(
                    "invalid label name {label:?} on metric {}",
                    self.name
                )));
            }
            if self.label_names[..index].contains(label) {
                return Err(VigilError::InvalidArgument(format!(
                    "duplicate label name {label:?} on metric {}",
                    self.name
                )));
            }
        }

        match self.kind {
            MetricKind::Histogram => {
                if self.label_names.iter().any(|label| label == "le") {
                    return Err(VigilError::InvalidArgument(format!(
                        "histogram {} may not use the reserved label \"le\"",
                        self.name
                    )));
                }
                if self.buckets.iter().any(|bound| !bound.is_finite()) {
                    return Err(VigilError::InvalidArgument(format!(
                        "histogram {} has a non-finite bucket bound",
                        self.name
                    )));
                }
                self.buckets.sort_by(|left, right| left.total_cmp(right));
                self.buckets.dedup();
            }
            MetricKind::Counter | MetricKind::Gauge => self.buckets.clear(),
        }

        Ok(self)
    }
}

fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_' || first == ':')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Identity of one labeled series: metric name plus label pairs in
/// descriptor order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub metric: String,
    pub labels: Vec<(String, String)>,
}

impl SeriesKey {
    pub fn new(metric: impl Into<String>, labels: Vec<(String, String)>) -> Self {
        Self {
            metric: metric.into(),
            labels,
        }
    }

    pub(crate) fn from_descriptor(descriptor: &MetricDescriptor, values: &[String]) -> Self {
        Self {
            metric: descriptor.name.clone(),
            labels: descriptor
                .label_names
                .iter()
                .cloned()
                .zip(values.iter().cloned())
                .collect(),
        }
    }

    /// True when the metric name matches and the label pairs are exactly
    /// `labels`, irrespective of order.
    pub fn matches(&self, metric: &str, labels: &BTreeMap<String, String>) -> bool {
        self.metric == metric
            && self.labels.len() == labels.len()
            && self
                .labels
                .iter()
                .all(|(name, value)| labels.get(name) == Some(value))
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.metric)?;
        if self.labels.is_empty() {
            return Ok(());
        }

        f.write_str("{")?;
        for (index, (name, value)) in self.labels.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            write!(f, "{name}=\"{}\"", crate::exporter::escape_label_value(value))?;
        }
        f.write_str("}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSnapshot {
    /// Cumulative counts aligned with the descriptor's finite bounds.
    pub cumulative_counts: Vec<u64>,
    pub count: u64,
    pub sum: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SeriesValue {
    Counter(f64),
    Gauge(f64),
    Histogram(HistogramSnapshot),
}

#[derive(Debug, Clone)]
pub struct SeriesSnapshot {
    pub label_values: Vec<String>,
    pub value: SeriesValue,
}

#[derive(Debug, Clone)]
pub struct FamilySnapshot {
    pub descriptor: MetricDescriptor,
    /// Sorted by label-value tuple.
    pub series: Vec<SeriesSnapshot>,
}

/// Point-in-time copy of every series, sorted by metric name.
#[derive(Debug, Clone)]
pub struct AggregateSnapshot {
    pub taken_at: DateTime<Utc>,
    pub families: Vec<FamilySnapshot>,
}

impl AggregateSnapshot {
    pub fn family(&self, metric: &str) -> Option<&FamilySnapshot> {
        self.families
            .iter()
            .find(|family| family.descriptor.name == metric)
    }

    pub fn get(&self, metric: &str, label_values: &[&str]) -> Option<&SeriesValue> {
        self.family(metric)?
            .series
            .iter()
            .find(|series| {
                series.label_values.len() == label_values.len()
                    && series
                        .label_values
                        .iter()
                        .zip(label_values)
                        .all(|(left, right)| left == right)
            })
            .map(|series| &series.value)
    }

    pub fn series_count(&self) -> usize {
        self.families.iter().map(|family| family.series.len()).sum()
    }
}
