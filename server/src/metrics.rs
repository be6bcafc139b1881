use anyhow::Result;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::error;

pub struct ServiceMetrics {
    registry: Registry,
    requests: IntCounterVec,
    failures: IntCounterVec,
    latency: HistogramVec,
}

impl ServiceMetrics {
    pub fn new() -> Result<Self> {
        let requests = IntCounterVec::new(
            Opts::new("imager_requests_total", "Total imager requests by operation."),
            &["op"],
        )?;
        let failures = IntCounterVec::new(
            Opts::new("imager_request_failures_total", "Failed imager requests by operation."),
            &["op"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new(
                "imager_request_latency_seconds",
                "Latency of imager requests.",
            ),
            &["op"],
        )?;

        let registry = Registry::new();
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(failures.clone()))?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            registry,
            requests,
            failures,
            latency,
        })
    }

    pub fn record(&self, op: &str, seconds: f64, succeeded: bool) {
        self.requests.with_label_values(&[op]).inc();
        self.latency.with_label_values(&[op]).observe(seconds);
        if !succeeded {
            self.failures.with_label_values(&[op]).inc();
        }
    }

    pub fn export(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(err) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            error!("Failed to encode metrics: {}", err);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
