use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use crate::{
    registry::MetricRegistry,
    types::{AggregateSnapshot, FamilySnapshot, HistogramSnapshot, SeriesSnapshot, SeriesValue},
};

pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Debug, Clone, Copy, Default)]
pub struct ExportOptions {
    /// Append the snapshot instant (unix millis) to every sample line.
    pub include_timestamps: bool,
}

#[derive(Clone)]
pub struct Exporter {
    registry: Arc<MetricRegistry>,
    options: ExportOptions,
}

impl Exporter {
    pub fn new(registry: Arc<MetricRegistry>) -> Self {
        Self {
            registry,
            options: ExportOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ExportOptions) -> Self {
        self.options = options;
        self
    }

    pub fn render(&self) -> Bytes {
        render_snapshot(&self.registry.snapshot(), &self.options)
    }
}

/// Serialises a snapshot in the text exposition format. Inconsistent
/// histogram series are omitted with a warning instead of failing the whole
/// render; metrics left without any sample line get no header either.
pub fn render_snapshot(snapshot: &AggregateSnapshot, options: &ExportOptions) -> Bytes {
    let timestamp = options
        .include_timestamps
        .then(|| snapshot.taken_at.timestamp_millis());
    let mut output = String::new();

    for family in &snapshot.families {
        render_family(&mut output, family, timestamp);
    }

    Bytes::from(output)
}

fn render_family(output: &mut String, family: &FamilySnapshot, timestamp: Option<i64>) {
    let descriptor = &family.descriptor;
    let samples = render_samples(family, timestamp);
    if samples.is_empty() {
        return;
    }

    output.push_str("# HELP ");
    output.push_str(&descriptor.name);
    output.push(' ');
    output.push_str(&escape_help(&descriptor.help));
    output.push('\n');

    output.push_str("# TYPE ");
    output.push_str(&descriptor.name);
    output.push(' ');
    output.push_str(descriptor.kind.as_exposition_type());
    output.push('\n');

    output.push_str(&samples);
}

fn render_samples(family: &FamilySnapshot, timestamp: Option<i64>) -> String {
    let descriptor = &family.descriptor;
    let mut samples = String::new();

    for series in &family.series {
        let labels = descriptor
            .label_names
            .iter()
            .map(String::as_str)
            .zip(series.label_values.iter().map(String::as_str))
            .collect::<Vec<_>>();

        match &series.value {
            SeriesValue::Counter(value) | SeriesValue::Gauge(value) => {
                push_sample_line(&mut samples, &descriptor.name, &labels, None, *value, timestamp);
            }
            SeriesValue::Histogram(histogram) => {
                if let Err(reason) = check_histogram(&descriptor.buckets, histogram) {
                    warn!(
                        metric = %descriptor.name,
                        labels = ?series_labels(family, series),
                        reason,
                        "omitting inconsistent histogram series from exposition"
                    );
                    continue;
                }

                let bucket_name = format!("{}_bucket", descriptor.name);
                let buckets = descriptor.buckets.iter().zip(&histogram.cumulative_counts);
                for (bound, cumulative) in buckets {
                    push_sample_line(
                        &mut samples,
                        &bucket_name,
                        &labels,
                        Some(&format_bucket_bound(*bound)),
                        *cumulative as f64,
                        timestamp,
                    );
                }
                push_sample_line(
                    &mut samples,
                    &bucket_name,
                    &labels,
                    Some("+Inf"),
                    histogram.count as f64,
                    timestamp,
                );
                push_sample_line(
                    &mut samples,
                    &format!("{}_sum", descriptor.name),
                    &labels,
                    None,
                    histogram.sum,
                    timestamp,
                );
                push_sample_line(
                    &mut samples,
                    &format!("{}_count", descriptor.name),
                    &labels,
                    None,
                    histogram.count as f64,
                    timestamp,
                );
            }
        }
    }

    samples
}

fn check_histogram(bounds: &[f64], histogram: &HistogramSnapshot) -> Result<(), &'static str> {
    if histogram.cumulative_counts.len() != bounds.len() {
        return Err("bucket count does not match descriptor");
    }
    if histogram
        .cumulative_counts
        .windows(2)
        .any(|pair| pair[0] > pair[1])
    {
        return Err("cumulative bucket counts decrease");
    }
    if histogram
        .cumulative_counts
        .last()
        .is_some_and(|last| *last > histogram.count)
    {
        return Err("bucket count exceeds total count");
    }
    Ok(())
}

fn series_labels(family: &FamilySnapshot, series: &SeriesSnapshot) -> Vec<String> {
    family
        .descriptor
        .label_names
        .iter()
        .zip(&series.label_values)
        .map(|(name, value)| format!("{name}={value}"))
        .collect()
}

fn push_sample_line(
    output: &mut String,
    name: &str,
    labels: &[(&str, &str)],
    le: Option<&str>,
    value: f64,
    timestamp: Option<i64>,
) {
    output.push_str(name);

    if !labels.is_empty() || le.is_some() {
        output.push('{');
        let extra = le.map(|bound| ("le", bound));
        for (index, (key, value)) in labels.iter().copied().chain(extra).enumerate() {
            if index > 0 {
                output.push(',');
            }
            output.push_str(key);
            output.push_str("=\"");
            output.push_str(&escape_label_value(value));
            output.push('"');
        }
        output.push('}');
    }

    output.push(' ');
    output.push_str(&format_metric_value(value));

    if let Some(ts) = timestamp {
        output.push(' ');
        output.push_str(&ts.to_string());
    }

    output.push('\n');
}

fn format_metric_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        let sign = if value > 0.0 { '+' } else { '-' };
        format!("{sign}Inf")
    } else if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        value.to_string()
    }
}

fn format_bucket_bound(value: f64) -> String {
    if value.is_infinite() {
        "+Inf".to_string()
    } else {
        value.to_string()
    }
}

fn escape_help(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n")
}

pub(crate) fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}
