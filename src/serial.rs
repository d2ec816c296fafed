use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::stream::Stream;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, debug_span};

use crate::error::{CoalesceError, Result};

/// Default number of undelivered drain events buffered per subscriber.
pub const DEFAULT_DRAIN_CAPACITY: usize = 16;

/// Published when the number of running serial operations returns to zero.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DrainEvent {
    /// Monotonic drain counter for the gate, starting at 1.
    pub sequence: u64,
    pub at: DateTime<Utc>,
}

/// Observer invoked synchronously on every drain, in registration order.
pub trait DrainListener: Send + Sync {
    fn on_drain(&self, event: &DrainEvent);
}

impl<F> DrainListener for F
where
    F: Fn(&DrainEvent) + Send + Sync,
{
    fn on_drain(&self, event: &DrainEvent) {
        self(event)
    }
}

/// Identifies a registered listener for later removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct GateState {
    active: usize,
    drains: u64,
}

struct GateInner {
    state: Mutex<GateState>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn DrainListener>)>>,
    next_listener: AtomicU64,
    sender: broadcast::Sender<DrainEvent>,
}

/// Counts running serial operations and announces when the count returns to zero.
#[derive(Clone)]
pub struct SerialGate {
    inner: Arc<GateInner>,
}

impl SerialGate {
    pub fn new() -> Self {
        Self::build(DEFAULT_DRAIN_CAPACITY)
    }

    /// Creates a gate whose subscribers buffer up to `capacity` undelivered drains.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(CoalesceError::InvalidOption {
                option: "drain_capacity",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(Self::build(capacity))
    }

    fn build(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(GateInner {
                state: Mutex::new(GateState::default()),
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(0),
                sender,
            }),
        }
    }

    /// Marks a serial operation as running until the returned guard is dropped.
    pub fn enter(&self) -> SerialGuard {
        let mut state = self.lock_state();
        state.active += 1;
        debug!(active = state.active, "serial operation started");
        SerialGuard { gate: self.clone() }
    }

    /// Runs `operation` as a serial operation. The gate is entered immediately, not on
    /// first poll, and left when the operation completes or is dropped.
    pub fn run<F>(&self, operation: F) -> impl Future<Output = F::Output> + use<F>
    where
        F: Future,
    {
        let guard = self.enter();
        async move {
            let _guard = guard;
            operation.await
        }
    }

    /// Wraps `f` so every call runs as a serial operation.
    pub fn wrap<F>(&self, f: F) -> Serialized<F> {
        Serialized {
            gate: self.clone(),
            f,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active() > 0
    }

    /// Number of serial operations currently running.
    pub fn active(&self) -> usize {
        self.lock_state().active
    }

    /// Number of drains published so far.
    pub fn drains(&self) -> u64 {
        self.lock_state().drains
    }

    pub fn add_listener(&self, listener: Arc<dyn DrainListener>) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, listener));
        id
    }

    /// Returns true when a listener with `id` was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Number of registered listeners.
    pub fn listeners(&self) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Subscribes to drain events published after this call.
    pub fn subscribe(&self) -> DrainSubscription {
        DrainSubscription::new(self.inner.sender.subscribe())
    }

    fn leave(&self) {
        let event = {
            let mut state = self.lock_state();
            state.active = state.active.saturating_sub(1);
            debug!(active = state.active, "serial operation finished");
            if state.active > 0 {
                return;
            }
            state.drains += 1;
            DrainEvent {
                sequence: state.drains,
                at: Utc::now(),
            }
        };
        self.publish(event);
    }

    fn publish(&self, event: DrainEvent) {
        let span = debug_span!("coalesce.drain", sequence = event.sequence);
        span.in_scope(|| {
            let listeners: Vec<Arc<dyn DrainListener>> = self
                .inner
                .listeners
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect();
            for listener in &listeners {
                listener.on_drain(&event);
            }
            let subscribers = self.inner.sender.send(event).unwrap_or(0);
            debug!(
                listeners = listeners.len(),
                subscribers, "serial gate drained"
            );
        });
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SerialGate {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SerialGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("SerialGate")
            .field("active", &state.active)
            .field("drains", &state.drains)
            .finish()
    }
}

/// Keeps a serial operation counted while alive.
#[must_use = "the serial operation ends when the guard is dropped"]
pub struct SerialGuard {
    gate: SerialGate,
}

impl Drop for SerialGuard {
    fn drop(&mut self) {
        self.gate.leave();
    }
}

/// A function whose calls each run as a serial operation.
#[derive(Clone)]
pub struct Serialized<F> {
    gate: SerialGate,
    f: F,
}

impl<F> Serialized<F> {
    pub fn call<A, Fut>(&self, args: A) -> impl Future<Output = Fut::Output> + use<F, A, Fut>
    where
        F: Fn(A) -> Fut,
        Fut: Future,
    {
        self.gate.run((self.f)(args))
    }

    pub fn gate(&self) -> &SerialGate {
        &self.gate
    }
}

/// Handle returned to drain subscribers.
pub struct DrainSubscription {
    inner: BroadcastStream<DrainEvent>,
}

impl DrainSubscription {
    fn new(receiver: broadcast::Receiver<DrainEvent>) -> Self {
        Self {
            inner: BroadcastStream::new(receiver),
        }
    }

    /// Receives the next drain. Events dropped because the subscriber lagged are skipped.
    /// Returns `None` once the gate is gone.
    pub async fn next(&mut self) -> Option<DrainEvent> {
        futures::StreamExt::next(self).await
    }
}

impl Stream for DrainSubscription {
    type Item = DrainEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => return Poll::Ready(Some(event)),
                Poll::Ready(Some(Err(lagged))) => {
                    debug!(%lagged, "drain subscriber lagged");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
