//! Prometheus metrics exporter.
//!
//! Exports the shared registry in Prometheus text format.

use prometheus::{Encoder, Registry, TextEncoder};

use super::MetricsRegistry;
use crate::{Error, Result};

/// Prometheus metrics exporter.
///
/// Cheap to clone; clones render the same registry.
#[derive(Clone)]
pub struct PrometheusExporter {
    registry: Registry,
}

impl PrometheusExporter {
    /// Create a new Prometheus exporter over the shared registry.
    pub fn new(metrics: &MetricsRegistry) -> Self {
        Self {
            registry: metrics.registry().clone(),
        }
    }

    /// Content type of [`export`](Self::export) output.
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }

    /// Export metrics in Prometheus text format.
    pub fn export(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::other(format!("metrics output: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_format() {
        let metrics = MetricsRegistry::new("netpoll");
        let gauge = metrics
            .int_gauge_vec("collector_active", "Active collections", &["collector", "tier"])
            .unwrap();
        gauge.with_label_values(&["sites", "medium"]).set(2);

        let exporter = PrometheusExporter::new(&metrics);
        let output = exporter.export().unwrap();

        assert!(output.contains("# HELP netpoll_collector_active Active collections"));
        assert!(output.contains("# TYPE netpoll_collector_active gauge"));
        assert!(output.contains(r#"netpoll_collector_active{collector="sites",tier="medium"} 2"#));
        assert!(exporter.content_type().starts_with("text/plain"));
    }

    #[test]
    fn test_clone_renders_shared_registry() {
        let metrics = MetricsRegistry::new("netpoll");
        let exporter = PrometheusExporter::new(&metrics);
        let cloned = exporter.clone();

        // Registered after the clone was taken.
        let counter = metrics
            .int_counter_vec("scrapes_total", "Scrapes", &["tier"])
            .unwrap();
        counter.with_label_values(&["fast"]).inc();

        let output = cloned.export().unwrap();
        assert!(output.contains(r#"netpoll_scrapes_total{tier="fast"} 1"#));
        assert_eq!(output, exporter.export().unwrap());
    }

    #[test]
    fn test_export_empty_registry() {
        let metrics = MetricsRegistry::new("netpoll");
        assert_eq!(PrometheusExporter::new(&metrics).export().unwrap(), "");
    }
}
