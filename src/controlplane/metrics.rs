//! Plugin Metrics
//!
//! Prometheus collectors for RPC traffic and volume group state. Collectors
//! are registered on an injected [`Registry`] so several plugin instances
//! (or tests) never collide in the process-wide default registry.

use crate::error::{Code, Error, Result};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Duration;

const NAMESPACE: &str = "lvm_csi";

pub struct PluginMetrics {
    registry: Registry,
    requests: IntCounterVec,
    failures: IntCounterVec,
    duration: HistogramVec,
    bytes_free: IntGauge,
    volumes: IntGauge,
}

fn register_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration: {}", e))
}

impl PluginMetrics {
    pub fn new(registry: Registry) -> Result<Self> {
        let requests = IntCounterVec::new(
            Opts::new("requests_total", "RPCs received").namespace(NAMESPACE),
            &["rpc"],
        )
        .map_err(register_err)?;
        let failures = IntCounterVec::new(
            Opts::new("request_failures_total", "RPCs that returned an error").namespace(NAMESPACE),
            &["rpc", "code"],
        )
        .map_err(register_err)?;
        let duration = HistogramVec::new(
            HistogramOpts::new("request_duration_seconds", "RPC latency").namespace(NAMESPACE),
            &["rpc"],
        )
        .map_err(register_err)?;
        let bytes_free = IntGauge::with_opts(
            Opts::new("volume_group_bytes_free", "Free bytes in the volume group for linear volumes")
                .namespace(NAMESPACE),
        )
        .map_err(register_err)?;
        let volumes = IntGauge::with_opts(
            Opts::new("volumes", "Logical volumes in the volume group").namespace(NAMESPACE),
        )
        .map_err(register_err)?;

        registry.register(Box::new(requests.clone())).map_err(register_err)?;
        registry.register(Box::new(failures.clone())).map_err(register_err)?;
        registry.register(Box::new(duration.clone())).map_err(register_err)?;
        registry.register(Box::new(bytes_free.clone())).map_err(register_err)?;
        registry.register(Box::new(volumes.clone())).map_err(register_err)?;

        Ok(Self {
            registry,
            requests,
            failures,
            duration,
            bytes_free,
            volumes,
        })
    }

    /// Record one completed RPC
    pub fn observe(&self, rpc: &str, elapsed: Duration, failure: Option<Code>) {
        self.requests.with_label_values(&[rpc]).inc();
        self.duration
            .with_label_values(&[rpc])
            .observe(elapsed.as_secs_f64());
        if let Some(code) = failure {
            self.failures
                .with_label_values(&[rpc, &code.to_string()])
                .inc();
        }
    }

    pub fn set_bytes_free(&self, bytes: u64) {
        self.bytes_free.set(i64::try_from(bytes).unwrap_or(i64::MAX));
    }

    pub fn set_volume_count(&self, count: usize) {
        self.volumes.set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn requests(&self, rpc: &str) -> u64 {
        self.requests.with_label_values(&[rpc]).get()
    }

    pub fn failures(&self, rpc: &str, code: Code) -> u64 {
        self.failures
            .with_label_values(&[rpc, &code.to_string()])
            .get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every registered collector
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("metrics encoding: {}", e)))?;
        String::from_utf8(buffer).map_err(Error::internal)
    }
}
