#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use request_coalesce::{CoalesceMetrics, Coalescer, CoalescerBuilder, SerialGate};
use thiserror::Error;

/// Cloneable error used by fake lookups.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct LookupError(pub String);

impl LookupError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Counts how many times an underlying function was actually invoked.
#[derive(Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one invocation and returns the running total.
    pub fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn detached<V, E>() -> Coalescer<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    CoalescerBuilder::new()
        .with_metrics(CoalesceMetrics::detached())
        .build()
        .expect("build coalescer")
}

pub fn gated<V, E>(gate: &SerialGate) -> Coalescer<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    CoalescerBuilder::new()
        .with_serial_gate(gate.clone())
        .with_metrics(CoalesceMetrics::detached())
        .build()
        .expect("build gated coalescer")
}
