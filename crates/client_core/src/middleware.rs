use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use shared::{
    domain::{ChannelId, ConnectionId, IdempotencyKey, ResourceScope, UserId},
    error::ApiError,
    protocol::{EventEnvelope, ServerEvent},
};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::{
    error::MiddlewareError,
    pipeline::{EventMiddleware, Stage, StageOutcome},
};

#[derive(Default)]
struct HealthState {
    last_ack: Option<Instant>,
    announced: Option<ConnectionId>,
}

/// Liveness bookkeeping shared between the session and the health-check
/// middleware.
#[derive(Default)]
pub struct HealthMonitor {
    state: Mutex<HealthState>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, connection_id: ConnectionId) {
        let mut state = self.state.lock();
        state.last_ack = Some(Instant::now());
        state.announced = Some(connection_id);
    }

    /// Restarts the ack window without announcing an id.
    pub fn touch(&self) {
        self.state.lock().last_ack = Some(Instant::now());
    }

    pub fn take_announced(&self) -> Option<ConnectionId> {
        self.state.lock().announced.take()
    }

    pub fn since_last_ack(&self) -> Option<Duration> {
        self.state.lock().last_ack.map(|at| at.elapsed())
    }

    pub fn reset(&self) {
        *self.state.lock() = HealthState::default();
    }
}

pub struct HealthCheckMiddleware {
    monitor: Arc<HealthMonitor>,
}

impl HealthCheckMiddleware {
    pub fn new(monitor: Arc<HealthMonitor>) -> Self {
        Self { monitor }
    }
}

impl EventMiddleware for HealthCheckMiddleware {
    fn name(&self) -> &'static str {
        "health_check"
    }

    fn stage(&self) -> Stage {
        Stage::Intercept
    }

    fn handle(&self, envelope: &EventEnvelope) -> Result<StageOutcome, MiddlewareError> {
        let ServerEvent::HealthCheck { connection_id } = envelope.event() else {
            return Ok(StageOutcome::Forward);
        };
        if connection_id.as_str().is_empty() {
            return Err(MiddlewareError::new(
                self.name(),
                "health check carried an empty connection id",
            ));
        }
        trace!(connection_id = %connection_id, "health check received");
        self.monitor.record(connection_id.clone());
        Ok(StageOutcome::Drop)
    }
}

/// Outstanding mutation acknowledgements, keyed by idempotency key.
#[derive(Default)]
pub struct AckTracker {
    pending: Mutex<HashMap<IdempotencyKey, oneshot::Sender<Result<(), ApiError>>>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: IdempotencyKey) -> oneshot::Receiver<Result<(), ApiError>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(key, tx);
        rx
    }

    /// Returns `false` when nobody was waiting for `key`.
    pub fn resolve(&self, key: &IdempotencyKey, outcome: Result<(), ApiError>) -> bool {
        match self.pending.lock().remove(key) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    pub fn forget(&self, key: &IdempotencyKey) {
        self.pending.lock().remove(key);
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

pub struct MutationAckMiddleware {
    acks: Arc<AckTracker>,
}

impl MutationAckMiddleware {
    pub fn new(acks: Arc<AckTracker>) -> Self {
        Self { acks }
    }
}

impl EventMiddleware for MutationAckMiddleware {
    fn name(&self) -> &'static str {
        "mutation_ack"
    }

    fn stage(&self) -> Stage {
        Stage::Intercept
    }

    fn handle(&self, envelope: &EventEnvelope) -> Result<StageOutcome, MiddlewareError> {
        let (key, outcome) = match envelope.event() {
            ServerEvent::MutationAck { idempotency_key } => (idempotency_key, Ok(())),
            ServerEvent::MutationRejected {
                idempotency_key,
                error,
            } => (idempotency_key, Err(error.clone())),
            _ => return Ok(StageOutcome::Forward),
        };
        if !self.acks.resolve(key, outcome) {
            debug!(key = %key, "acknowledgement for a mutation nobody is waiting on");
        }
        Ok(StageOutcome::Drop)
    }
}

/// Splits `EventBatch` into one derived envelope per contained event.
pub struct BatchSplitMiddleware;

impl BatchSplitMiddleware {
    fn flatten(parent: &EventEnvelope, events: &[ServerEvent], out: &mut Vec<EventEnvelope>) {
        for event in events {
            let derived = parent.derive(event.clone());
            match event {
                ServerEvent::EventBatch { events: nested } => {
                    Self::flatten(&derived, nested, out)
                }
                _ => out.push(derived),
            }
        }
    }
}

impl EventMiddleware for BatchSplitMiddleware {
    fn name(&self) -> &'static str {
        "batch_split"
    }

    fn stage(&self) -> Stage {
        Stage::Expand
    }

    fn handle(&self, envelope: &EventEnvelope) -> Result<StageOutcome, MiddlewareError> {
        let ServerEvent::EventBatch { events } = envelope.event() else {
            return Ok(StageOutcome::Forward);
        };
        let mut out = Vec::with_capacity(events.len());
        Self::flatten(envelope, events, &mut out);
        Ok(StageOutcome::Replace(out))
    }
}

/// Resource scopes the client currently cares about.
#[derive(Default)]
pub struct WatchList {
    scopes: RwLock<HashSet<ResourceScope>>,
}

impl WatchList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the scope was not watched before.
    pub fn watch(&self, scope: ResourceScope) -> bool {
        self.scopes.write().insert(scope)
    }

    pub fn unwatch(&self, scope: &ResourceScope) -> bool {
        self.scopes.write().remove(scope)
    }

    pub fn contains(&self, scope: &ResourceScope) -> bool {
        self.scopes.read().contains(scope)
    }

    pub fn snapshot(&self) -> Vec<ResourceScope> {
        let mut scopes: Vec<_> = self.scopes.read().iter().cloned().collect();
        scopes.sort();
        scopes
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.read().is_empty()
    }
}

/// Drops per-channel content events for channels that are not watched.
pub struct WatchedScopeFilter {
    watch: Arc<WatchList>,
}

impl WatchedScopeFilter {
    pub fn new(watch: Arc<WatchList>) -> Self {
        Self { watch }
    }
}

impl EventMiddleware for WatchedScopeFilter {
    fn name(&self) -> &'static str {
        "watched_scope"
    }

    fn stage(&self) -> Stage {
        Stage::Filter
    }

    fn handle(&self, envelope: &EventEnvelope) -> Result<StageOutcome, MiddlewareError> {
        let content = matches!(
            envelope.event(),
            ServerEvent::MessageNew { .. }
                | ServerEvent::MessageUpdated { .. }
                | ServerEvent::MessageDeleted { .. }
                | ServerEvent::ReactionNew { .. }
                | ServerEvent::ReactionDeleted { .. }
                | ServerEvent::MemberAdded { .. }
                | ServerEvent::MemberRemoved { .. }
        );
        match envelope.scope() {
            Some(scope) if content && !self.watch.contains(scope) => Ok(StageOutcome::Drop),
            _ => Ok(StageOutcome::Forward),
        }
    }
}

/// Unread counters per channel for the signed-in user.
pub struct ReadState {
    user_id: UserId,
    unread: Mutex<HashMap<ChannelId, u32>>,
}

impl ReadState {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            unread: Mutex::new(HashMap::new()),
        }
    }

    pub fn unread_count(&self, channel_id: ChannelId) -> u32 {
        self.unread.lock().get(&channel_id).copied().unwrap_or(0)
    }

    pub fn total_unread(&self) -> u32 {
        self.unread
            .lock()
            .values()
            .fold(0u32, |total, count| total.saturating_add(*count))
    }

    fn apply(&self, event: &ServerEvent) {
        match event {
            ServerEvent::MessageNew { message } if message.sender_id != self.user_id => {
                let mut unread = self.unread.lock();
                let count = unread.entry(message.channel_id).or_insert(0);
                *count = count.saturating_add(1);
            }
            ServerEvent::NotificationMarkRead {
                channel_id,
                user_id,
                ..
            } if *user_id == self.user_id => {
                self.unread.lock().remove(channel_id);
            }
            ServerEvent::ChannelDeleted { channel_id } => {
                self.unread.lock().remove(channel_id);
            }
            _ => {}
        }
    }
}

pub struct ReadStateMiddleware {
    read_state: Arc<ReadState>,
}

impl ReadStateMiddleware {
    pub fn new(read_state: Arc<ReadState>) -> Self {
        Self { read_state }
    }
}

impl EventMiddleware for ReadStateMiddleware {
    fn name(&self) -> &'static str {
        "read_state"
    }

    fn stage(&self) -> Stage {
        Stage::Transform
    }

    fn handle(&self, envelope: &EventEnvelope) -> Result<StageOutcome, MiddlewareError> {
        self.read_state.apply(envelope.event());
        Ok(StageOutcome::Forward)
    }
}
