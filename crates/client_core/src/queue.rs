//! Durable queue of outbound mutations, replayed per resource scope once the
//! session can deliver them.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use shared::{
    domain::{IdempotencyKey, ResourceScope},
    protocol::{OutboundIntent, QueuedMutation},
};
use storage::LocalStore;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::{
    config::QueueConfig,
    delivery::MutationSender,
    error::{ClientError, DeliveryError, MutationFailure},
    retry::{ExponentialBackoff, RetryStrategy},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    Delivered,
    Failed(MutationFailure),
}

/// A mutation the queue gave up on.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedMutation {
    pub idempotency_key: IdempotencyKey,
    pub scope: ResourceScope,
    pub intent: OutboundIntent,
    pub reason: MutationFailure,
}

/// Returned by [`OfflineMutationQueue::enqueue`] once the entry is durable.
#[derive(Debug)]
pub struct QueuedAck {
    pub idempotency_key: IdempotencyKey,
    /// The key was already queued and this call replaced its payload.
    pub coalesced: bool,
    outcome: oneshot::Receiver<MutationOutcome>,
}

impl QueuedAck {
    /// Final outcome of the mutation. `None` if the queue was dropped first.
    pub async fn outcome(self) -> Option<MutationOutcome> {
        self.outcome.await.ok()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub failed: usize,
    /// Scopes whose replay stopped because the sender went away.
    pub interrupted: usize,
    /// Scopes that stopped at a permanent failure with entries still queued
    /// behind it. Those entries are picked up by the next pass.
    pub halted: usize,
}

impl DrainReport {
    fn merge(&mut self, other: DrainReport) {
        self.delivered += other.delivered;
        self.failed += other.failed;
        self.interrupted += other.interrupted;
        self.halted += other.halted;
    }
}

#[derive(Default)]
struct QueueCore {
    /// Keyed by enqueue sequence, so iteration is FIFO.
    pending: BTreeMap<u64, QueuedMutation>,
    keys: HashMap<IdempotencyKey, u64>,
    draining: HashSet<ResourceScope>,
    in_flight: HashSet<IdempotencyKey>,
    /// Payload updates for in-flight keys, applied if the attempt fails.
    held_updates: HashMap<IdempotencyKey, OutboundIntent>,
    waiters: HashMap<IdempotencyKey, Vec<oneshot::Sender<MutationOutcome>>>,
    next_sequence: u64,
}

impl QueueCore {
    fn entry(&self, key: &IdempotencyKey) -> Option<&QueuedMutation> {
        self.keys.get(key).and_then(|seq| self.pending.get(seq))
    }

    fn entry_mut(&mut self, key: &IdempotencyKey) -> Option<&mut QueuedMutation> {
        let seq = *self.keys.get(key)?;
        self.pending.get_mut(&seq)
    }

    fn remove(&mut self, key: &IdempotencyKey) -> Option<QueuedMutation> {
        let seq = self.keys.remove(key)?;
        self.held_updates.remove(key);
        self.pending.remove(&seq)
    }

    fn next_in_scope(&self, scope: &ResourceScope) -> Option<&QueuedMutation> {
        self.pending
            .values()
            .find(|mutation| &mutation.scope == scope)
    }
}

pub struct OfflineMutationQueue {
    config: QueueConfig,
    store: Arc<dyn LocalStore>,
    core: Mutex<QueueCore>,
    /// Serializes store writes so the latest snapshot of an entry always lands last.
    persist_lock: tokio::sync::Mutex<()>,
    failures: broadcast::Sender<FailedMutation>,
}

impl OfflineMutationQueue {
    pub fn new(config: QueueConfig, store: Arc<dyn LocalStore>, failure_buffer: usize) -> Self {
        let (failures, _) = broadcast::channel(failure_buffer.max(1));
        Self {
            config,
            store,
            core: Mutex::new(QueueCore {
                next_sequence: 1,
                ..QueueCore::default()
            }),
            persist_lock: tokio::sync::Mutex::new(()),
            failures,
        }
    }

    /// Loads entries left in the store by a previous run.
    pub async fn restore(&self) -> Result<usize, ClientError> {
        let stored = self
            .store
            .load_pending_mutations()
            .await
            .map_err(ClientError::Storage)?;
        let mut core = self.core.lock();
        let mut restored = 0;
        for mutation in stored {
            if core.keys.contains_key(&mutation.idempotency_key) {
                continue;
            }
            core.next_sequence = core.next_sequence.max(mutation.sequence + 1);
            core.keys
                .insert(mutation.idempotency_key.clone(), mutation.sequence);
            core.pending.insert(mutation.sequence, mutation);
            restored += 1;
        }
        if restored > 0 {
            info!(restored, "restored pending mutations");
        }
        Ok(restored)
    }

    pub fn len(&self) -> usize {
        self.core.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.lock().pending.is_empty()
    }

    /// Pending entries in enqueue order.
    pub fn snapshot(&self) -> Vec<QueuedMutation> {
        self.core.lock().pending.values().cloned().collect()
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<FailedMutation> {
        self.failures.subscribe()
    }

    /// Queues `intent` under `key` (generated when absent).
    ///
    /// Re-using a queued key replaces the payload, and the scope it derives,
    /// but keeps the entry's place in line. If that key is being delivered right now the new payload is
    /// held back and only takes effect should the attempt fail.
    pub async fn enqueue(
        &self,
        intent: OutboundIntent,
        key: Option<IdempotencyKey>,
    ) -> Result<QueuedAck, ClientError> {
        let key = key.unwrap_or_else(IdempotencyKey::generate);
        let (tx, rx) = oneshot::channel();
        let coalesced = {
            let mut core = self.core.lock();
            core.waiters.entry(key.clone()).or_default().push(tx);
            if core.in_flight.contains(&key) {
                core.held_updates.insert(key.clone(), intent);
                true
            } else if let Some(existing) = core.entry_mut(&key) {
                existing.scope = intent.scope();
                existing.intent = intent;
                true
            } else {
                let sequence = core.next_sequence;
                core.next_sequence += 1;
                let mutation = QueuedMutation {
                    idempotency_key: key.clone(),
                    sequence,
                    scope: intent.scope(),
                    intent,
                    enqueued_at: Utc::now(),
                    attempt: 0,
                    max_age: self.config.max_age,
                };
                core.keys.insert(key.clone(), sequence);
                core.pending.insert(sequence, mutation);
                false
            }
        };
        debug!(key = %key, coalesced, "mutation queued");
        self.persist(&key).await?;
        Ok(QueuedAck {
            idempotency_key: key,
            coalesced,
            outcome: rx,
        })
    }

    /// Removes an entry the server confirmed out of band.
    pub async fn ack(&self, key: &IdempotencyKey) -> Result<bool, ClientError> {
        self.complete(key, MutationOutcome::Delivered).await
    }

    /// Fails every entry older than its `max_age`. In-flight entries are left
    /// to their current attempt.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Vec<FailedMutation> {
        let stale: Vec<(IdempotencyKey, std::time::Duration)> = {
            let core = self.core.lock();
            core.pending
                .values()
                .filter(|mutation| {
                    mutation.is_expired(now) && !core.in_flight.contains(&mutation.idempotency_key)
                })
                .map(|mutation| (mutation.idempotency_key.clone(), mutation.max_age))
                .collect()
        };
        let mut failed = Vec::with_capacity(stale.len());
        for (key, max_age) in stale {
            if let Some(failure) = self.fail(&key, MutationFailure::Expired { max_age }).await {
                failed.push(failure);
            }
        }
        failed
    }

    /// Replays every scope that is not already draining. Scopes run
    /// concurrently. Each scope is strictly FIFO and stops at its first
    /// permanent failure for this pass; [`DrainReport::halted`] tells the
    /// caller another pass has work.
    pub async fn drain_ready(&self, sender: &dyn MutationSender) -> DrainReport {
        if !sender.is_ready() {
            return DrainReport::default();
        }
        let scopes: Vec<ResourceScope> = {
            let mut core = self.core.lock();
            let mut scopes: Vec<ResourceScope> = Vec::new();
            for mutation in core.pending.values() {
                if !core.draining.contains(&mutation.scope) && !scopes.contains(&mutation.scope) {
                    scopes.push(mutation.scope.clone());
                }
            }
            core.draining.extend(scopes.iter().cloned());
            scopes
        };
        if scopes.is_empty() {
            return DrainReport::default();
        }
        debug!(scopes = scopes.len(), "draining mutation queue");

        let reports = join_all(
            scopes
                .into_iter()
                .map(|scope| self.drain_scope(scope, sender)),
        )
        .await;
        let mut report = DrainReport::default();
        for scope_report in reports {
            report.merge(scope_report);
        }
        if report != DrainReport::default() {
            info!(
                delivered = report.delivered,
                failed = report.failed,
                interrupted = report.interrupted,
                halted = report.halted,
                "drain finished"
            );
        }
        report
    }

    async fn drain_scope(&self, scope: ResourceScope, sender: &dyn MutationSender) -> DrainReport {
        let mut draining = DrainingGuard {
            queue: self,
            scope: scope.clone(),
            armed: true,
        };
        let backoff = ExponentialBackoff::new(self.config.retry.clone());
        let mut report = DrainReport::default();

        loop {
            let now = Utc::now();
            let next = {
                let mut core = self.core.lock();
                let Some(next) = core.next_in_scope(&scope).cloned() else {
                    // Released under the same lock an enqueue takes, so a
                    // racing entry is either seen here or drained by its caller.
                    core.draining.remove(&scope);
                    draining.armed = false;
                    break;
                };
                if next.is_expired(now) {
                    Err(next)
                } else {
                    let key = next.idempotency_key.clone();
                    core.in_flight.insert(key.clone());
                    let entry = core.entry_mut(&key).map(|entry| {
                        entry.attempt = entry.attempt.saturating_add(1);
                        entry.clone()
                    });
                    Ok(entry.unwrap_or(next))
                }
            };
            let mutation = match next {
                Ok(mutation) => mutation,
                Err(expired) => {
                    let reason = MutationFailure::Expired {
                        max_age: expired.max_age,
                    };
                    if self.fail(&expired.idempotency_key, reason).await.is_some() {
                        report.failed += 1;
                    }
                    continue;
                }
            };
            let key = mutation.idempotency_key.clone();
            let in_flight = InFlightGuard {
                queue: self,
                key: key.clone(),
                armed: true,
            };
            if let Err(err) = self.persist(&key).await {
                warn!(key = %key, %err, "failed to persist attempt count");
            }

            match sender.deliver(&mutation).await {
                Ok(()) => {
                    drop(in_flight);
                    if let Err(err) = self.complete(&key, MutationOutcome::Delivered).await {
                        warn!(key = %key, %err, "delivered mutation could not be removed from the store");
                    }
                    report.delivered += 1;
                }
                Err(DeliveryError::Rejected(error)) => {
                    drop(in_flight);
                    self.fail(&key, MutationFailure::Rejected(error)).await;
                    report.failed += 1;
                    report.halted += self.has_pending_in(&scope) as usize;
                    break;
                }
                Err(DeliveryError::Transient(message)) => {
                    if mutation.attempt >= self.config.max_attempts {
                        drop(in_flight);
                        let reason = MutationFailure::AttemptsExhausted {
                            attempts: mutation.attempt,
                            last_error: message,
                        };
                        self.fail(&key, reason).await;
                        report.failed += 1;
                        report.halted += self.has_pending_in(&scope) as usize;
                        break;
                    }
                    // Releasing applies any payload update held during the attempt.
                    if in_flight.release() {
                        if let Err(err) = self.persist(&key).await {
                            warn!(key = %key, %err, "failed to persist held update");
                        }
                    }
                    if !sender.is_ready() {
                        debug!(scope = %scope, key = %key, "sender went away; pausing scope");
                        report.interrupted += 1;
                        break;
                    }
                    let delay = backoff.delay_for_attempt(mutation.attempt.saturating_sub(1));
                    debug!(key = %key, attempt = mutation.attempt, ?delay, %message, "retrying mutation");
                    tokio::time::sleep(delay).await;
                }
            }
        }
        report
    }

    async fn persist(&self, key: &IdempotencyKey) -> Result<(), ClientError> {
        let _write = self.persist_lock.lock().await;
        let snapshot = self.core.lock().entry(key).cloned();
        match snapshot {
            Some(mutation) => self
                .store
                .save_mutation(&mutation)
                .await
                .map_err(ClientError::Storage),
            None => Ok(()),
        }
    }

    async fn complete(
        &self,
        key: &IdempotencyKey,
        outcome: MutationOutcome,
    ) -> Result<bool, ClientError> {
        let (removed, waiters) = {
            let mut core = self.core.lock();
            let removed = core.remove(key);
            core.in_flight.remove(key);
            let waiters = if removed.is_some() {
                core.waiters.remove(key).unwrap_or_default()
            } else {
                Vec::new()
            };
            (removed, waiters)
        };
        if removed.is_none() {
            return Ok(false);
        }
        debug!(key = %key, "mutation completed");
        let deleted = {
            let _write = self.persist_lock.lock().await;
            self.store.delete_mutation(key).await
        };
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        deleted.map_err(ClientError::Storage)?;
        Ok(true)
    }

    async fn fail(&self, key: &IdempotencyKey, reason: MutationFailure) -> Option<FailedMutation> {
        let (removed, waiters) = {
            let mut core = self.core.lock();
            let removed = core.remove(key);
            core.in_flight.remove(key);
            let waiters = core.waiters.remove(key).unwrap_or_default();
            (removed, waiters)
        };
        let removed = removed?;
        warn!(key = %key, scope = %removed.scope, %reason, "mutation failed permanently");
        {
            let _write = self.persist_lock.lock().await;
            if let Err(err) = self.store.delete_mutation(key).await {
                warn!(key = %key, "failed to delete mutation: {err:#}");
            }
        }
        let failure = FailedMutation {
            idempotency_key: removed.idempotency_key,
            scope: removed.scope,
            intent: removed.intent,
            reason: reason.clone(),
        };
        let _ = self.failures.send(failure.clone());
        for waiter in waiters {
            let _ = waiter.send(MutationOutcome::Failed(reason.clone()));
        }
        Some(failure)
    }

    fn has_pending_in(&self, scope: &ResourceScope) -> bool {
        self.core.lock().next_in_scope(scope).is_some()
    }

    fn release_in_flight(&self, key: &IdempotencyKey) -> bool {
        let mut core = self.core.lock();
        core.in_flight.remove(key);
        let Some(intent) = core.held_updates.remove(key) else {
            return false;
        };
        match core.entry_mut(key) {
            Some(entry) => {
                entry.scope = intent.scope();
                entry.intent = intent;
                true
            }
            None => false,
        }
    }
}

struct DrainingGuard<'a> {
    queue: &'a OfflineMutationQueue,
    scope: ResourceScope,
    armed: bool,
}

impl Drop for DrainingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.queue.core.lock().draining.remove(&self.scope);
        }
    }
}

/// Clears the in-flight marker even when a drain is cancelled mid-delivery,
/// leaving the entry queued for the next pass.
struct InFlightGuard<'a> {
    queue: &'a OfflineMutationQueue,
    key: IdempotencyKey,
    armed: bool,
}

impl InFlightGuard<'_> {
    fn release(mut self) -> bool {
        self.armed = false;
        self.queue.release_in_flight(&self.key)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.queue.release_in_flight(&self.key);
        }
    }
}

#[cfg(test)]
#[path = "tests/queue_tests.rs"]
mod tests;
