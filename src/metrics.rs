use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use opentelemetry::global;
use opentelemetry::metrics::{Counter as OtelCounter, Histogram as OtelHistogram};

/// Metrics recorded by a coalescer. Includes lightweight atomics for tests and
/// OpenTelemetry handles for production.
#[derive(Clone)]
pub struct CoalesceMetrics {
    /// Underlying calls actually started.
    pub invocations_total: Arc<AtomicU64>,
    /// Calls that joined an existing in-flight operation.
    pub joined_total: Arc<AtomicU64>,
    /// Underlying calls that settled with an error.
    pub failures_total: Arc<AtomicU64>,
    /// Calls invoked directly because key derivation failed.
    pub uncoalesced_total: Arc<AtomicU64>,
    /// Serial-gate drains observed.
    pub drains_total: Arc<AtomicU64>,
    latency_hist: Option<OtelHistogram<f64>>,
    invocations_counter: Option<OtelCounter<u64>>,
    joined_counter: Option<OtelCounter<u64>>,
    failures_counter: Option<OtelCounter<u64>>,
    uncoalesced_counter: Option<OtelCounter<u64>>,
    drains_counter: Option<OtelCounter<u64>>,
}

impl CoalesceMetrics {
    pub fn new() -> Self {
        let meter = global::meter("request-coalesce");
        Self {
            invocations_total: Arc::new(AtomicU64::new(0)),
            joined_total: Arc::new(AtomicU64::new(0)),
            failures_total: Arc::new(AtomicU64::new(0)),
            uncoalesced_total: Arc::new(AtomicU64::new(0)),
            drains_total: Arc::new(AtomicU64::new(0)),
            latency_hist: Some(meter.f64_histogram("coalesce_call_latency_ms").build()),
            invocations_counter: Some(meter.u64_counter("coalesce_invocations_total").build()),
            joined_counter: Some(meter.u64_counter("coalesce_joined_total").build()),
            failures_counter: Some(meter.u64_counter("coalesce_failures_total").build()),
            uncoalesced_counter: Some(meter.u64_counter("coalesce_uncoalesced_total").build()),
            drains_counter: Some(meter.u64_counter("coalesce_drains_total").build()),
        }
    }

    /// Atomics only; nothing is exported.
    pub fn detached() -> Self {
        Self {
            invocations_total: Arc::new(AtomicU64::new(0)),
            joined_total: Arc::new(AtomicU64::new(0)),
            failures_total: Arc::new(AtomicU64::new(0)),
            uncoalesced_total: Arc::new(AtomicU64::new(0)),
            drains_total: Arc::new(AtomicU64::new(0)),
            latency_hist: None,
            invocations_counter: None,
            joined_counter: None,
            failures_counter: None,
            uncoalesced_counter: None,
            drains_counter: None,
        }
    }

    pub fn record_invocation(&self) {
        self.invocations_total.fetch_add(1, Ordering::Relaxed);
        if let Some(counter) = &self.invocations_counter {
            counter.add(1, &[]);
        }
    }

    pub fn record_joined(&self) {
        self.joined_total.fetch_add(1, Ordering::Relaxed);
        if let Some(counter) = &self.joined_counter {
            counter.add(1, &[]);
        }
    }

    pub fn record_settled(&self, latency: Duration, failed: bool) {
        if failed {
            self.failures_total.fetch_add(1, Ordering::Relaxed);
            if let Some(counter) = &self.failures_counter {
                counter.add(1, &[]);
            }
        }
        if let Some(hist) = &self.latency_hist {
            hist.record(latency.as_secs_f64() * 1000.0, &[]);
        }
    }

    pub fn record_uncoalesced(&self) {
        self.uncoalesced_total.fetch_add(1, Ordering::Relaxed);
        if let Some(counter) = &self.uncoalesced_counter {
            counter.add(1, &[]);
        }
    }

    pub fn record_drain(&self) {
        self.drains_total.fetch_add(1, Ordering::Relaxed);
        if let Some(counter) = &self.drains_counter {
            counter.add(1, &[]);
        }
    }

    pub fn invocations(&self) -> u64 {
        self.invocations_total.load(Ordering::Relaxed)
    }

    pub fn joined(&self) -> u64 {
        self.joined_total.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures_total.load(Ordering::Relaxed)
    }

    pub fn uncoalesced(&self) -> u64 {
        self.uncoalesced_total.load(Ordering::Relaxed)
    }

    pub fn drains(&self) -> u64 {
        self.drains_total.load(Ordering::Relaxed)
    }
}

impl Default for CoalesceMetrics {
    fn default() -> Self {
        Self::new()
    }
}
