//! Prometheus metrics
//!
//! Reconcile counters and latencies per controller, plus backend call
//! outcomes. Each [`Metrics`] owns its own registry so tests can create as
//! many as they like.

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

use crate::domain::ports::BackendOperation;
use crate::error::{Error, Result};

/// Operator metrics
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconciles: IntCounterVec,
    reconcile_duration: HistogramVec,
    backend_calls: IntCounterVec,
}

fn metrics_error(err: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registry: {}", err))
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let reconciles = IntCounterVec::new(
            Opts::new("volumegroup_reconcile_total", "Reconcile passes by outcome"),
            &["controller", "result"],
        )
        .map_err(metrics_error)?;
        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new(
                "volumegroup_reconcile_duration_seconds",
                "Duration of reconcile passes",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["controller"],
        )
        .map_err(metrics_error)?;
        let backend_calls = IntCounterVec::new(
            Opts::new("volumegroup_backend_calls_total", "Backend calls by outcome"),
            &["operation", "result"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(reconciles.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(reconcile_duration.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(backend_calls.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            reconciles,
            reconcile_duration,
            backend_calls,
        })
    }

    /// Record one reconcile pass
    pub fn record_reconcile(&self, controller: &str, success: bool, elapsed: Duration) {
        let result = if success { "success" } else { "error" };
        self.reconciles
            .with_label_values(&[controller, result])
            .inc();
        self.reconcile_duration
            .with_label_values(&[controller])
            .observe(elapsed.as_secs_f64());
    }

    /// Record one backend call
    pub fn record_backend_call(&self, operation: BackendOperation, success: bool) {
        let result = if success { "success" } else { "error" };
        self.backend_calls
            .with_label_values(&[&operation.to_string(), result])
            .inc();
    }

    pub fn reconcile_count(&self, controller: &str, success: bool) -> u64 {
        let result = if success { "success" } else { "error" };
        self.reconciles
            .with_label_values(&[controller, result])
            .get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode all metrics in the Prometheus text format
    pub fn encode(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.record_reconcile("volumegroup", true, Duration::from_millis(5));
        metrics.record_reconcile("volumegroup", true, Duration::from_millis(7));
        metrics.record_reconcile("volumegroup", false, Duration::from_millis(1));

        assert_eq!(metrics.reconcile_count("volumegroup", true), 2);
        assert_eq!(metrics.reconcile_count("volumegroup", false), 1);
        assert_eq!(metrics.reconcile_count("claim", true), 0);
    }

    #[test]
    fn test_encode_text_format() {
        let metrics = Metrics::new().unwrap();
        metrics.record_backend_call(BackendOperation::CreateGroup, true);
        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(text.contains("volumegroup_backend_calls_total"));
        assert!(text.contains("operation=\"CreateGroup\""));
    }
}
