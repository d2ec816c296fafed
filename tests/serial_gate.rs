use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt;
use request_coalesce::{Coalescer, DrainEvent, Registry, SerialGate};
use tokio::time::timeout;

mod support;
use support::*;

#[tokio::test]
async fn calls_during_serial_window_use_secondary_registry() {
    let gate = SerialGate::new();
    let coalescer: Coalescer<u64, LookupError> = gated(&gate);
    let quote = coalescer.wrap(|(deal,): (u64,)| async move { Ok(deal * 2) });

    assert_eq!(coalescer.active_registry(), Registry::Primary);
    let guard = gate.enter();
    assert_eq!(coalescer.active_registry(), Registry::Secondary);

    let pending = quote.call((4,));
    assert_eq!(coalescer.in_flight_in(Registry::Secondary), 1);
    assert_eq!(coalescer.in_flight_in(Registry::Primary), 0);

    drop(guard);
    assert_eq!(coalescer.active_registry(), Registry::Primary);
    assert_eq!(pending.await, Ok(8));
    assert_eq!(coalescer.in_flight(), 0);
}

#[tokio::test]
async fn serial_window_does_not_join_primary_calls() {
    let gate = SerialGate::new();
    let coalescer: Coalescer<usize, LookupError> = gated(&gate);
    let calls = CallCounter::new();
    let counter = calls.clone();
    let position = coalescer.wrap(move |(): ()| {
        let n = counter.hit();
        async move { Ok(n) }
    });

    let before = position.call(());
    let guard = gate.enter();
    let during = position.call(());
    let during_again = position.call(());
    assert_eq!(calls.count(), 2);
    drop(guard);
    let after = position.call(());
    assert_eq!(calls.count(), 2, "after the drain new calls join the primary entry");

    assert_eq!(before.await, Ok(1));
    assert_eq!(during.await, Ok(2));
    assert_eq!(during_again.await, Ok(2));
    assert_eq!(after.await, Ok(1));
    assert_eq!(coalescer.in_flight(), 0);
}

#[tokio::test]
async fn drain_fires_once_after_last_serial_operation() {
    let gate = SerialGate::new();
    let heard = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&heard);
    gate.add_listener(Arc::new(move |_: &DrainEvent| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let mut drains = gate.subscribe();

    let repay = gate.wrap(|(deal,): (u64,)| async move {
        tokio::task::yield_now().await;
        Ok::<u64, LookupError>(deal)
    });

    let first = repay.call((1,));
    let second = repay.call((2,));
    assert_eq!(gate.active(), 2);
    let (first, second) = tokio::join!(first, second);
    assert_eq!(first, Ok(1));
    assert_eq!(second, Ok(2));

    assert_eq!(gate.active(), 0);
    assert_eq!(heard.load(Ordering::SeqCst), 1);
    let event = timeout(Duration::from_secs(1), drains.next())
        .await
        .expect("drain delivered")
        .expect("gate alive");
    assert_eq!(event.sequence, 1);
}

#[tokio::test]
async fn failed_serial_operation_still_drains() {
    let gate = SerialGate::new();
    let withdraw = gate.wrap(|(): ()| async { Err::<(), _>(LookupError::new("insufficient")) });

    let result = withdraw.call(()).await;
    assert_eq!(result, Err(LookupError::new("insufficient")));
    assert!(!gate.is_active());
    assert_eq!(gate.drains(), 1);
}

#[tokio::test]
async fn coalescer_counts_drains_and_unregisters_on_drop() {
    let gate = SerialGate::new();
    let coalescer: Coalescer<u8, LookupError> = gated(&gate);
    assert_eq!(gate.listeners(), 1);

    drop(gate.enter());
    drop(gate.enter());
    assert_eq!(coalescer.metrics().drains(), 2);

    drop(coalescer);
    assert_eq!(gate.listeners(), 0);
}

#[tokio::test]
async fn subscription_is_a_stream() {
    let gate = SerialGate::new();
    let drains = gate.subscribe();

    for _ in 0..3 {
        gate.run(async {}).await;
    }

    let sequences: Vec<u64> = drains.take(3).map(|event| event.sequence).collect().await;
    assert_eq!(sequences, vec![1, 2, 3]);
}
