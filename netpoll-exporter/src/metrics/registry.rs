//! Shared metrics registry and the [`MetricSink`] capability.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use prometheus::core::Collector as PrometheusCollector;
use prometheus::{
    CounterVec, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
};
use tracing::debug;

use crate::{Error, Result};

/// Create, look up and update metrics by name.
///
/// Collectors and their sub-components hold a reference to a sink instead of
/// calling back into a parent.
pub trait MetricSink: Send + Sync {
    fn register_gauge(&self, name: &str, help: &str, labels: &[&str]) -> Result<()>;

    fn register_counter(&self, name: &str, help: &str, labels: &[&str]) -> Result<()>;

    /// `buckets` defaults to the Prometheus default buckets.
    fn register_histogram(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
        buckets: Option<Vec<f64>>,
    ) -> Result<()>;

    fn set_gauge(&self, name: &str, label_values: &[&str], value: f64) -> Result<()>;

    fn inc_counter(&self, name: &str, label_values: &[&str], by: f64) -> Result<()>;

    fn observe(&self, name: &str, label_values: &[&str], value: f64) -> Result<()>;

    /// Drop every series of a metric, e.g. before republishing a label set
    /// that may have shrunk.
    fn reset(&self, name: &str) -> Result<()>;
}

#[derive(Clone)]
enum SinkMetric {
    Gauge(GaugeVec),
    Counter(CounterVec),
    Histogram(HistogramVec),
}

impl SinkMetric {
    fn type_name(&self) -> &'static str {
        match self {
            SinkMetric::Gauge(_) => "gauge",
            SinkMetric::Counter(_) => "counter",
            SinkMetric::Histogram(_) => "histogram",
        }
    }
}

/// Process-wide metrics registry.
///
/// Every metric is prefixed with the configured namespace. Registering a name
/// twice fails with [`Error::MetricExists`].
pub struct MetricsRegistry {
    registry: Registry,
    namespace: String,
    sink_metrics: DashMap<String, SinkMetric>,
}

impl MetricsRegistry {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            registry: Registry::new(),
            namespace: namespace.into(),
            sink_metrics: DashMap::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Underlying prometheus registry, used by the exporter.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn opts(&self, name: &str, help: &str) -> Opts {
        Opts::new(name, help).namespace(self.namespace.clone())
    }

    fn histogram_opts(&self, name: &str, help: &str, buckets: Option<Vec<f64>>) -> HistogramOpts {
        let opts = HistogramOpts::new(name, help).namespace(self.namespace.clone());
        match buckets {
            Some(buckets) => opts.buckets(buckets),
            None => opts,
        }
    }

    fn register<C>(&self, name: &str, metric: C) -> Result<C>
    where
        C: PrometheusCollector + Clone + 'static,
    {
        match self.registry.register(Box::new(metric.clone())) {
            Ok(()) => {
                debug!(metric = %name, "Registered metric");
                Ok(metric)
            }
            Err(prometheus::Error::AlreadyReg) => Err(Error::MetricExists(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    pub fn gauge_vec(&self, name: &str, help: &str, labels: &[&str]) -> Result<GaugeVec> {
        self.register(name, GaugeVec::new(self.opts(name, help), labels)?)
    }

    pub fn int_gauge_vec(&self, name: &str, help: &str, labels: &[&str]) -> Result<IntGaugeVec> {
        self.register(name, IntGaugeVec::new(self.opts(name, help), labels)?)
    }

    pub fn counter_vec(&self, name: &str, help: &str, labels: &[&str]) -> Result<CounterVec> {
        self.register(name, CounterVec::new(self.opts(name, help), labels)?)
    }

    pub fn int_counter_vec(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
    ) -> Result<IntCounterVec> {
        self.register(name, IntCounterVec::new(self.opts(name, help), labels)?)
    }

    pub fn histogram_vec(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
        buckets: Option<Vec<f64>>,
    ) -> Result<HistogramVec> {
        self.register(
            name,
            HistogramVec::new(self.histogram_opts(name, help, buckets), labels)?,
        )
    }

    fn insert_sink_metric<F>(&self, name: &str, build: F) -> Result<()>
    where
        F: FnOnce() -> Result<SinkMetric>,
    {
        match self.sink_metrics.entry(name.to_string()) {
            Entry::Occupied(_) => Err(Error::MetricExists(name.to_string())),
            Entry::Vacant(entry) => {
                entry.insert(build()?);
                Ok(())
            }
        }
    }

    fn sink_metric(&self, name: &str) -> Result<SinkMetric> {
        self.sink_metrics
            .get(name)
            .map(|m| m.value().clone())
            .ok_or_else(|| Error::UnknownMetric(name.to_string()))
    }

    fn wrong_type(name: &str, metric: &SinkMetric, expected: &str) -> Error {
        Error::UnknownMetric(format!(
            "{} is a {}, not a {}",
            name,
            metric.type_name(),
            expected
        ))
    }

    /// Names registered through the [`MetricSink`] interface.
    pub fn sink_metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sink_metrics.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl MetricSink for MetricsRegistry {
    fn register_gauge(&self, name: &str, help: &str, labels: &[&str]) -> Result<()> {
        self.insert_sink_metric(name, || Ok(SinkMetric::Gauge(self.gauge_vec(name, help, labels)?)))
    }

    fn register_counter(&self, name: &str, help: &str, labels: &[&str]) -> Result<()> {
        self.insert_sink_metric(name, || {
            Ok(SinkMetric::Counter(self.counter_vec(name, help, labels)?))
        })
    }

    fn register_histogram(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
        buckets: Option<Vec<f64>>,
    ) -> Result<()> {
        self.insert_sink_metric(name, || {
            Ok(SinkMetric::Histogram(
                self.histogram_vec(name, help, labels, buckets)?,
            ))
        })
    }

    fn set_gauge(&self, name: &str, label_values: &[&str], value: f64) -> Result<()> {
        match self.sink_metric(name)? {
            SinkMetric::Gauge(gauge) => {
                gauge.get_metric_with_label_values(label_values)?.set(value);
                Ok(())
            }
            other => Err(Self::wrong_type(name, &other, "gauge")),
        }
    }

    fn inc_counter(&self, name: &str, label_values: &[&str], by: f64) -> Result<()> {
        match self.sink_metric(name)? {
            SinkMetric::Counter(counter) => {
                counter.get_metric_with_label_values(label_values)?.inc_by(by);
                Ok(())
            }
            other => Err(Self::wrong_type(name, &other, "counter")),
        }
    }

    fn observe(&self, name: &str, label_values: &[&str], value: f64) -> Result<()> {
        match self.sink_metric(name)? {
            SinkMetric::Histogram(histogram) => {
                histogram
                    .get_metric_with_label_values(label_values)?
                    .observe(value);
                Ok(())
            }
            other => Err(Self::wrong_type(name, &other, "histogram")),
        }
    }

    fn reset(&self, name: &str) -> Result<()> {
        match self.sink_metric(name)? {
            SinkMetric::Gauge(gauge) => gauge.reset(),
            SinkMetric::Counter(counter) => counter.reset(),
            SinkMetric::Histogram(histogram) => histogram.reset(),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::PrometheusExporter;

    fn render(registry: &MetricsRegistry) -> String {
        PrometheusExporter::new(registry).export().unwrap()
    }

    #[test]
    fn test_register_and_set_gauge() {
        let registry = MetricsRegistry::new("test");
        registry
            .register_gauge("site_up", "Site reachability", &["site"])
            .unwrap();
        registry.set_gauge("site_up", &["hq"], 1.0).unwrap();

        let text = render(&registry);
        assert!(text.contains("# TYPE test_site_up gauge"));
        assert!(text.contains(r#"test_site_up{site="hq"} 1"#));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = MetricsRegistry::new("test");
        registry.register_counter("polls", "Polls", &[]).unwrap();
        let err = registry.register_counter("polls", "Polls", &[]).unwrap_err();
        assert!(matches!(err, Error::MetricExists(name) if name == "polls"));

        // Typed registration collides on the prometheus side.
        registry.int_gauge_vec("depth", "Depth", &["tier"]).unwrap();
        let err = registry.int_gauge_vec("depth", "Depth", &["tier"]).unwrap_err();
        assert!(matches!(err, Error::MetricExists(_)));
    }

    #[test]
    fn test_unknown_and_mistyped_metrics() {
        let registry = MetricsRegistry::new("test");
        assert!(matches!(
            registry.set_gauge("missing", &[], 1.0),
            Err(Error::UnknownMetric(_))
        ));

        registry.register_counter("requests", "Requests", &[]).unwrap();
        let err = registry.set_gauge("requests", &[], 1.0).unwrap_err();
        assert!(err.to_string().contains("is a counter"));
    }

    #[test]
    fn test_label_cardinality_mismatch() {
        let registry = MetricsRegistry::new("test");
        registry
            .register_histogram("latency", "Latency", &["org"], None)
            .unwrap();
        assert!(matches!(
            registry.observe("latency", &["a", "b"], 0.5),
            Err(Error::Metrics(_))
        ));
        registry.observe("latency", &["a"], 0.5).unwrap();
    }

    #[test]
    fn test_reset_drops_series() {
        let registry = MetricsRegistry::new("test");
        registry.register_gauge("asset_up", "Asset", &["asset"]).unwrap();
        registry.set_gauge("asset_up", &["a1"], 1.0).unwrap();
        registry.reset("asset_up").unwrap();

        assert!(!render(&registry).contains("a1"));
        assert_eq!(registry.sink_metric_names(), vec!["asset_up".to_string()]);
    }
}
