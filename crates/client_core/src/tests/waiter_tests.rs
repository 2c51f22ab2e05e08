use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;
use crate::state::DisconnectSource;

const LONG: Duration = Duration::from_secs(5);

#[tokio::test]
async fn pending_waiter_receives_later_value() {
    let registry = WaiterRegistry::<u32>::new("test");
    let waiting = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.wait(LONG).await })
    };
    while registry.pending() == 0 {
        tokio::task::yield_now().await;
    }

    registry.resolve_all(7).fire();

    assert_eq!(waiting.await.expect("join"), Ok(7));
    assert_eq!(registry.pending(), 0);
}

#[tokio::test]
async fn available_value_resolves_without_registration() {
    let registry = WaiterRegistry::<&'static str>::new("test");
    drop(registry.resolve_all("conn-1"));

    let ticket = registry.register(LONG);
    assert_eq!(ticket.id(), None);
    assert_eq!(registry.pending(), 0);
    assert_eq!(ticket.resolved().await, Ok("conn-1"));
}

#[tokio::test]
async fn every_waiter_is_resolved_exactly_once() {
    let registry = WaiterRegistry::<u32>::new("test");
    let calls = Arc::new(AtomicUsize::new(0));
    for _ in 0..16 {
        let calls = Arc::clone(&calls);
        let id = registry.wait_with(LONG, move |outcome| {
            assert_eq!(outcome, Ok(3));
            calls.fetch_add(1, Ordering::SeqCst);
        });
        assert!(id.is_some());
    }

    let deferred = registry.resolve_all(3);
    assert_eq!(deferred.len(), 16);
    assert_eq!(calls.load(Ordering::SeqCst), 0, "nothing runs before fire");
    deferred.fire();
    registry.resolve_all(4).fire();
    registry.fail_all(WaitError::Withdrawn).fire();

    assert_eq!(calls.load(Ordering::SeqCst), 16);
}

#[tokio::test]
async fn waiter_times_out_and_is_removed() {
    let registry = WaiterRegistry::<u32>::new("test");
    let outcome = registry.wait(Duration::from_millis(20)).await;

    assert_eq!(
        outcome,
        Err(WaitError::Timeout(Duration::from_millis(20)))
    );
    assert_eq!(registry.pending(), 0);
}

#[tokio::test]
async fn fail_all_cancels_with_source_and_clears_value() {
    let registry = WaiterRegistry::<u32>::new("test");
    drop(registry.resolve_all(1));
    registry.invalidate();
    let ticket = registry.register(LONG);
    assert!(ticket.id().is_some());

    registry
        .fail_all(WaitError::Cancelled(DisconnectSource::UserInitiated))
        .fire();

    assert_eq!(
        ticket.resolved().await,
        Err(WaitError::Cancelled(DisconnectSource::UserInitiated))
    );
    assert_eq!(registry.current(), None);
}

#[tokio::test]
async fn completions_may_reenter_the_registry() {
    let registry = WaiterRegistry::<u32>::new("test");
    let nested = Arc::new(AtomicUsize::new(0));
    {
        let inner_registry = registry.clone();
        let nested = Arc::clone(&nested);
        registry.wait_with(LONG, move |outcome| {
            assert_eq!(outcome, Ok(9));
            // Value is already published, so this resolves inline.
            let nested_id = inner_registry.wait_with(LONG, move |inner| {
                assert_eq!(inner, Ok(9));
                nested.fetch_add(1, Ordering::SeqCst);
            });
            assert!(nested_id.is_none());
            assert_eq!(inner_registry.pending(), 0);
        });
    }

    registry.resolve_all(9).fire();

    assert_eq!(nested.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dropping_ticket_withdraws_waiter() {
    let registry = WaiterRegistry::<u32>::new("test");
    let ticket = registry.register(LONG);
    assert_eq!(registry.pending(), 1);

    drop(ticket);

    assert_eq!(registry.pending(), 0);
}

#[tokio::test]
async fn explicit_cancel_reports_withdrawn() {
    let registry = WaiterRegistry::<u32>::new("test");
    let (tx, rx) = tokio::sync::oneshot::channel();
    let id = registry
        .wait_with(LONG, move |outcome| {
            let _ = tx.send(outcome);
        })
        .expect("pending waiter");

    registry.cancel(id).fire();
    assert!(registry.expire(id).is_empty());

    assert_eq!(rx.await.expect("outcome"), Err(WaitError::Withdrawn));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_waits_never_miss_a_resolution() {
    for _ in 0..20 {
        let registry = WaiterRegistry::<u64>::new("race");
        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move { registry.wait(LONG).await }));
        }
        let resolver = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.resolve_all(42).fire() })
        };

        resolver.await.expect("resolver");
        for handle in handles {
            assert_eq!(handle.await.expect("join"), Ok(42));
        }
    }
}
