pub mod collectors;
pub mod exporter;
pub mod registry;
pub mod types;
pub mod window;

pub use collectors::{engine::EngineMetrics, http::HttpMetrics, process::ProcessMetrics};
pub use exporter::{ExportOptions, Exporter, render_snapshot};
pub use registry::{MetricRegistry, RegistrationHandle};
pub use types::{
    AggregateSnapshot, DEFAULT_BUCKETS, MetricDescriptor, MetricKind, SeriesKey, SeriesValue,
};
pub use window::{AggregationWindow, Observation, WindowConfig};
