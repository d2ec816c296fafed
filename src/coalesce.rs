use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::oneshot;
use tracing::{Instrument, debug, info_span, warn};

use crate::error::{CoalesceError, KeyError, Result};
use crate::key::{CallKey, DEFAULT_MAX_KEY_DEPTH, KeyArg, KeyEncoder};
use crate::metrics::CoalesceMetrics;
use crate::serial::{DrainEvent, ListenerId, SerialGate};

/// Cloneable handle to an in-flight call. Every clone resolves to the same outcome.
pub type Pending<V, E> = Shared<BoxFuture<'static, std::result::Result<V, E>>>;

/// Which registry a call was recorded in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Registry {
    Primary,
    /// Used for new calls while the attached serial gate is active.
    Secondary,
}

impl Registry {
    pub fn as_str(self) -> &'static str {
        match self {
            Registry::Primary => "primary",
            Registry::Secondary => "secondary",
        }
    }
}

struct Entry<V, E> {
    generation: u64,
    pending: Pending<V, E>,
}

struct Registries<V, E> {
    primary: HashMap<CallKey, Entry<V, E>>,
    secondary: HashMap<CallKey, Entry<V, E>>,
    next_generation: u64,
}

impl<V, E> Registries<V, E> {
    fn map(&self, registry: Registry) -> &HashMap<CallKey, Entry<V, E>> {
        match registry {
            Registry::Primary => &self.primary,
            Registry::Secondary => &self.secondary,
        }
    }

    fn map_mut(&mut self, registry: Registry) -> &mut HashMap<CallKey, Entry<V, E>> {
        match registry {
            Registry::Primary => &mut self.primary,
            Registry::Secondary => &mut self.secondary,
        }
    }
}

struct Inner<V, E> {
    registries: Mutex<Registries<V, E>>,
    gate: Option<SerialGate>,
    listener: Option<ListenerId>,
    metrics: CoalesceMetrics,
    max_key_depth: usize,
}

impl<V, E> Inner<V, E> {
    fn lock(&self) -> MutexGuard<'_, Registries<V, E>> {
        self.registries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn settle(&self, registry: Registry, key: &CallKey, generation: u64) {
        let mut registries = self.lock();
        let map = registries.map_mut(registry);
        if map
            .get(key)
            .is_some_and(|entry| entry.generation == generation)
        {
            map.remove(key);
        }
    }
}

impl<V, E> Drop for Inner<V, E> {
    fn drop(&mut self) {
        if let (Some(gate), Some(id)) = (&self.gate, self.listener) {
            gate.remove_listener(id);
        }
    }
}

/// Owned registry of in-flight calls. Concurrent calls sharing a key share one
/// underlying invocation. Clones share the registries.
pub struct Coalescer<V, E> {
    inner: Arc<Inner<V, E>>,
}

// Polls the call to completion independently of its callers. Without a runtime the
// call only advances while some caller awaits it.
fn drive<V, E>(pending: &Pending<V, E>)
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(pending.clone());
        }
        Err(_) => debug!("no tokio runtime; call advances only while awaited"),
    }
}

impl<V, E> Clone for Coalescer<V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V, E> Coalescer<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Standalone coalescer with no serial gate.
    pub fn new() -> Self {
        Self::from_parts(None, CoalesceMetrics::new(), DEFAULT_MAX_KEY_DEPTH)
    }

    fn from_parts(gate: Option<SerialGate>, metrics: CoalesceMetrics, max_key_depth: usize) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner<V, E>>| {
            let listener = gate.as_ref().map(|gate| {
                let weak = weak.clone();
                let drains = metrics.clone();
                gate.add_listener(Arc::new(move |event: &DrainEvent| {
                    drains.record_drain();
                    if let Some(inner) = weak.upgrade() {
                        let secondary = inner.lock().secondary.len();
                        debug!(
                            sequence = event.sequence,
                            secondary_in_flight = secondary,
                            "coalescer observed drain"
                        );
                    }
                }))
            });
            Inner {
                registries: Mutex::new(Registries {
                    primary: HashMap::new(),
                    secondary: HashMap::new(),
                    next_generation: 0,
                }),
                gate,
                listener,
                metrics,
                max_key_depth,
            }
        });
        Self { inner }
    }

    /// Returns the in-flight call for `key`, or invokes `make` and records its future.
    ///
    /// Registration happens synchronously, so two calls made back to back before either
    /// is awaited share one invocation. The recorded call is driven on the current tokio
    /// runtime and runs to completion even if every caller drops its handle.
    pub fn call<Fut>(&self, key: CallKey, make: impl FnOnce() -> Fut) -> Pending<V, E>
    where
        Fut: Future<Output = std::result::Result<V, E>> + Send + 'static,
    {
        let registry = self.active_registry();
        let (sender, receiver) = oneshot::channel();
        let pending = {
            let mut registries = self.inner.lock();
            if let Some(entry) = registries.map(registry).get(&key) {
                self.inner.metrics.record_joined();
                debug!(%key, registry = registry.as_str(), "joined in-flight call");
                return entry.pending.clone();
            }

            let generation = registries.next_generation;
            registries.next_generation += 1;
            let pending = self.settling(registry, key.clone(), generation, receiver);
            registries.map_mut(registry).insert(
                key,
                Entry {
                    generation,
                    pending: pending.clone(),
                },
            );
            pending
        };
        self.inner.metrics.record_invocation();
        drive(&pending);

        // Lock released: `make` may call other wrappers on this coalescer.
        if sender.send(make().boxed()).is_err() {
            debug!("call handle dropped before registration finished");
        }
        pending
    }

    fn settling(
        &self,
        registry: Registry,
        key: CallKey,
        generation: u64,
        receiver: oneshot::Receiver<BoxFuture<'static, std::result::Result<V, E>>>,
    ) -> Pending<V, E> {
        let weak = Arc::downgrade(&self.inner);
        let started = Instant::now();
        let span = info_span!(
            "coalesce.call",
            key = %key,
            registry = registry.as_str(),
            generation
        );
        async move {
            let outcome = match receiver.await {
                Ok(operation) => Some(operation.await),
                Err(_) => None,
            };
            if let Some(inner) = weak.upgrade() {
                inner.settle(registry, &key, generation);
                if let Some(outcome) = &outcome {
                    inner
                        .metrics
                        .record_settled(started.elapsed(), outcome.is_err());
                }
            }
            match outcome {
                Some(outcome) => {
                    debug!(ok = outcome.is_ok(), "call settled");
                    outcome
                }
                None => panic!("coalesced function for {key} panicked before returning a future"),
            }
        }
        .instrument(span)
        .boxed()
        .shared()
    }

    /// Runs `operation` without registering it. Used when no key can be derived.
    pub fn call_uncoalesced<Fut>(&self, operation: Fut) -> Pending<V, E>
    where
        Fut: Future<Output = std::result::Result<V, E>> + Send + 'static,
    {
        self.inner.metrics.record_uncoalesced();
        self.inner.metrics.record_invocation();
        let pending = operation.boxed().shared();
        drive(&pending);
        pending
    }

    /// Derives the key for `args` using this coalescer's depth limit.
    pub fn key_for<A: KeyArg + ?Sized>(&self, args: &A) -> std::result::Result<CallKey, KeyError> {
        KeyEncoder::with_max_depth(self.inner.max_key_depth).finish(args)
    }

    /// Wraps `f` so concurrent calls with equal arguments share one invocation.
    pub fn wrap<F>(&self, f: F) -> Coalesced<F, V, E> {
        Coalesced {
            coalescer: self.clone(),
            namespace: None,
            f,
        }
    }

    /// Like [`Coalescer::wrap`], with keys prefixed by `name` so several functions can
    /// share this coalescer.
    pub fn wrap_named<F>(&self, name: impl Into<String>, f: F) -> Coalesced<F, V, E> {
        Coalesced {
            coalescer: self.clone(),
            namespace: Some(name.into()),
            f,
        }
    }

    /// Registry that new calls are recorded in right now.
    pub fn active_registry(&self) -> Registry {
        match &self.inner.gate {
            Some(gate) if gate.is_active() => Registry::Secondary,
            _ => Registry::Primary,
        }
    }

    /// Number of in-flight calls across both registries.
    pub fn in_flight(&self) -> usize {
        let registries = self.inner.lock();
        registries.primary.len() + registries.secondary.len()
    }

    pub fn in_flight_in(&self, registry: Registry) -> usize {
        self.inner.lock().map(registry).len()
    }

    pub fn is_in_flight(&self, key: &CallKey) -> bool {
        let registries = self.inner.lock();
        registries.primary.contains_key(key) || registries.secondary.contains_key(key)
    }

    pub fn serial_gate(&self) -> Option<&SerialGate> {
        self.inner.gate.as_ref()
    }

    pub fn metrics(&self) -> &CoalesceMetrics {
        &self.inner.metrics
    }
}

impl<V, E> Default for Coalescer<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V, E> std::fmt::Debug for Coalescer<V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registries = self.inner.lock();
        f.debug_struct("Coalescer")
            .field("primary", &registries.primary.len())
            .field("secondary", &registries.secondary.len())
            .field("gate", &self.inner.gate)
            .finish()
    }
}

/// Builder for configuring a coalescer.
#[derive(Clone)]
pub struct CoalescerBuilder {
    gate: Option<SerialGate>,
    metrics: Option<CoalesceMetrics>,
    max_key_depth: usize,
}

impl Default for CoalescerBuilder {
    fn default() -> Self {
        Self {
            gate: None,
            metrics: None,
            max_key_depth: DEFAULT_MAX_KEY_DEPTH,
        }
    }
}

impl CoalescerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes new calls to the secondary registry while `gate` is active.
    pub fn with_serial_gate(mut self, gate: SerialGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_metrics(mut self, metrics: CoalesceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_max_key_depth(mut self, depth: usize) -> Self {
        self.max_key_depth = depth;
        self
    }

    pub fn build<V, E>(self) -> Result<Coalescer<V, E>>
    where
        V: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        if self.max_key_depth == 0 {
            return Err(CoalesceError::InvalidOption {
                option: "max_key_depth",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(Coalescer::from_parts(
            self.gate,
            self.metrics.unwrap_or_default(),
            self.max_key_depth,
        ))
    }
}

/// A function wrapped by a [`Coalescer`]. Same arguments, same output, fewer calls.
pub struct Coalesced<F, V, E> {
    coalescer: Coalescer<V, E>,
    namespace: Option<String>,
    f: F,
}

impl<F: Clone, V, E> Clone for Coalesced<F, V, E> {
    fn clone(&self) -> Self {
        Self {
            coalescer: self.coalescer.clone(),
            namespace: self.namespace.clone(),
            f: self.f.clone(),
        }
    }
}

impl<F, V, E> Coalesced<F, V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn call<A, Fut>(&self, args: A) -> Pending<V, E>
    where
        A: KeyArg,
        F: Fn(A) -> Fut,
        Fut: Future<Output = std::result::Result<V, E>> + Send + 'static,
    {
        match self.coalescer.key_for(&args) {
            Ok(key) => {
                let key = match &self.namespace {
                    Some(namespace) => key.namespaced(namespace),
                    None => key,
                };
                self.coalescer.call(key, || (self.f)(args))
            }
            Err(err) => {
                warn!(error = %err, "key derivation failed; invoking without coalescing");
                self.coalescer.call_uncoalesced((self.f)(args))
            }
        }
    }

    pub fn coalescer(&self) -> &Coalescer<V, E> {
        &self.coalescer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn entry_is_cleared_after_settle() {
        let coalescer: Coalescer<u32, String> = Coalescer::new();
        let key = CallKey::from("[1]");

        let pending = coalescer.call(key.clone(), || async { Ok(1) });
        assert!(coalescer.is_in_flight(&key));
        assert_eq!(pending.await, Ok(1));
        assert!(!coalescer.is_in_flight(&key));
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn key_failure_falls_back_to_direct_call() {
        let coalescer: Coalescer<usize, String> = CoalescerBuilder::new()
            .with_metrics(CoalesceMetrics::detached())
            .with_max_key_depth(1)
            .build()
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let wrapped = coalescer.wrap(move |args: (Vec<Vec<u8>>,)| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, String>(args.0.len()) }
        });

        let a = wrapped.call((vec![vec![1]],));
        let b = wrapped.call((vec![vec![1]],));
        assert_eq!(coalescer.in_flight(), 0);
        assert_eq!(a.await, Ok(1));
        assert_eq!(b.await, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(coalescer.metrics().uncoalesced(), 2);
    }

    #[test]
    fn zero_depth_is_rejected() {
        let built = CoalescerBuilder::new()
            .with_max_key_depth(0)
            .build::<u8, String>();
        assert!(matches!(
            built,
            Err(CoalesceError::InvalidOption { option: "max_key_depth", .. })
        ));
    }
}
