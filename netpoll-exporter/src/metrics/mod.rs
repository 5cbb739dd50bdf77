//! Metrics module.
//!
//! One process-wide registry backs every metric. Collectors register and
//! update their series through the [`MetricSink`] capability; the scheduler
//! uses the typed handles in [`SchedulingMetrics`].

mod exporter;
mod registry;
mod scheduling;

pub use exporter::PrometheusExporter;
pub use registry::{MetricSink, MetricsRegistry};
pub use scheduling::{CollectorInstrumentation, SchedulingMetrics};
