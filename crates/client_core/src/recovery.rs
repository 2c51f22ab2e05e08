//! Decides when to reconnect, when to replay the mutation queue and when to
//! resync watched channels.
//!
//! The orchestrator is a single task fed by an mpsc channel (signals from the
//! facade and its own timers) and by the session's state-change broadcast. It
//! only holds weak references to the session and the queue.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::domain::ResourceScope;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    auth::{AuthContext, Token, TokenProvider},
    config::RecoveryConfig,
    delivery::MutationSender,
    error::WaitError,
    middleware::WatchList,
    queue::OfflineMutationQueue,
    retry::{ExponentialBackoff, RetryConfig, RetryStrategy},
    session::ConnectionSession,
    state::{ConnectionState, DisconnectSource, ReconnectCause, StateChange},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverySignal {
    ConnectionStateChanged(ConnectionState),
    AppForegrounded,
    AppBackgrounded,
    ConnectivityRestored,
    ConnectivityLost,
    TokenInvalidated,
}

/// Re-fetches state for channels the client watches after a reconnect.
#[async_trait]
pub trait ResyncHandler: Send + Sync {
    /// `since` is when the previous connection was lost, if there was one.
    async fn resync(&self, scopes: Vec<ResourceScope>, since: Option<DateTime<Utc>>)
        -> Result<()>;
}

pub struct NoopResync;

#[async_trait]
impl ResyncHandler for NoopResync {
    async fn resync(
        &self,
        _scopes: Vec<ResourceScope>,
        _since: Option<DateTime<Utc>>,
    ) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackgroundGrant {
    pub id: u64,
    pub window: Duration,
}

/// Grants a bounded amount of time to keep working after the app is
/// backgrounded.
pub trait BackgroundScheduler: Send + Sync {
    fn begin(&self) -> Option<BackgroundGrant>;
    fn end(&self, id: u64);
}

/// Platforms without background execution.
pub struct NoBackgroundTime;

impl BackgroundScheduler for NoBackgroundTime {
    fn begin(&self) -> Option<BackgroundGrant> {
        None
    }

    fn end(&self, _id: u64) {}
}

pub struct FixedBackgroundWindow {
    window: Duration,
    next_id: AtomicU64,
}

impl FixedBackgroundWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            next_id: AtomicU64::new(1),
        }
    }
}

impl BackgroundScheduler for FixedBackgroundWindow {
    fn begin(&self) -> Option<BackgroundGrant> {
        Some(BackgroundGrant {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            window: self.window,
        })
    }

    fn end(&self, id: u64) {
        debug!(grant = id, "background window ended");
    }
}

#[derive(Debug)]
enum RecoveryInput {
    Signal(RecoverySignal),
    Intent(bool),
    /// A token is needed but the caller connects on its own.
    TokenRequested,
    DrainRequested,
    ReconnectDue { epoch: u64 },
    TokenRefreshed(Result<Token, String>),
    RefreshRetryDue,
    BackgroundWindowExpired { id: u64 },
    Shutdown,
}

/// Cheap, cloneable way to feed the orchestrator.
#[derive(Clone)]
pub struct RecoveryHandle {
    tx: mpsc::UnboundedSender<RecoveryInput>,
}

impl RecoveryHandle {
    /// Returns `false` once the orchestrator has stopped.
    pub fn signal(&self, signal: RecoverySignal) -> bool {
        self.tx.send(RecoveryInput::Signal(signal)).is_ok()
    }

    /// Whether the caller wants to be connected. Automatic reconnects only
    /// happen while this is set.
    pub fn set_intent(&self, connected: bool) {
        let _ = self.tx.send(RecoveryInput::Intent(connected));
    }

    pub fn request_token(&self) {
        let _ = self.tx.send(RecoveryInput::TokenRequested);
    }

    pub fn request_drain(&self) {
        let _ = self.tx.send(RecoveryInput::DrainRequested);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(RecoveryInput::Shutdown);
    }
}

/// Everything the orchestrator talks to besides the session and the queue.
pub struct RecoveryCollaborators {
    pub sender: Arc<dyn MutationSender>,
    pub auth: Arc<AuthContext>,
    pub tokens: Arc<dyn TokenProvider>,
    pub resync: Arc<dyn ResyncHandler>,
    pub watch: Arc<WatchList>,
    pub background: Arc<dyn BackgroundScheduler>,
}

pub struct RecoveryOrchestrator {
    config: RecoveryConfig,
    reconnect_config: RetryConfig,
    session: Weak<ConnectionSession>,
    queue: Weak<OfflineMutationQueue>,
    deps: RecoveryCollaborators,
    tx: mpsc::UnboundedSender<RecoveryInput>,
    reconnect: ExponentialBackoff,
    refresh_backoff: ExponentialBackoff,

    intent: bool,
    online: bool,
    foreground: bool,
    /// Bumped to invalidate reconnects that were scheduled earlier.
    epoch: u64,
    refreshing: bool,
    /// Whether a successful refresh should be followed by a connect.
    connect_after_refresh: bool,
    refresh_failures: u32,
    grant: Option<BackgroundGrant>,
    was_connected: bool,
    lost_at: Option<DateTime<Utc>>,
    last_resync: Option<Instant>,
    tasks: Vec<JoinHandle<()>>,
}

impl RecoveryOrchestrator {
    pub fn spawn(
        config: RecoveryConfig,
        reconnect: RetryConfig,
        session: &Arc<ConnectionSession>,
        queue: &Arc<OfflineMutationQueue>,
        deps: RecoveryCollaborators,
    ) -> (RecoveryHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let changes = session.subscribe_changes();
        let orchestrator = Self {
            refresh_backoff: ExponentialBackoff::new(config.refresh_retry.clone()),
            reconnect: ExponentialBackoff::new(reconnect.clone()),
            reconnect_config: reconnect,
            config,
            session: Arc::downgrade(session),
            queue: Arc::downgrade(queue),
            deps,
            tx: tx.clone(),
            intent: false,
            online: true,
            foreground: true,
            epoch: 0,
            refreshing: false,
            connect_after_refresh: false,
            refresh_failures: 0,
            grant: None,
            was_connected: false,
            lost_at: None,
            last_resync: None,
            tasks: Vec::new(),
        };
        let task = tokio::spawn(orchestrator.run(rx, changes));
        (RecoveryHandle { tx }, task)
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<RecoveryInput>,
        mut changes: broadcast::Receiver<StateChange>,
    ) {
        loop {
            let input = tokio::select! {
                input = rx.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
                change = changes.recv() => match change {
                    Ok(change) => RecoveryInput::Signal(RecoverySignal::ConnectionStateChanged(change.to)),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "recovery fell behind on state changes; using current state");
                        let Some(session) = self.session.upgrade() else {
                            break;
                        };
                        RecoveryInput::Signal(RecoverySignal::ConnectionStateChanged(session.state()))
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            if matches!(input, RecoveryInput::Shutdown) {
                break;
            }
            self.handle(input).await;
            self.tasks.retain(|task| !task.is_finished());
        }

        if let Some(grant) = self.grant.take() {
            self.deps.background.end(grant.id);
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        debug!("recovery orchestrator stopped");
    }

    async fn handle(&mut self, input: RecoveryInput) {
        match input {
            RecoveryInput::Signal(signal) => self.on_signal(signal).await,
            RecoveryInput::Intent(connected) => {
                self.intent = connected;
                self.epoch += 1;
                debug!(connected, "connection intent changed");
            }
            RecoveryInput::TokenRequested => self.begin_refresh(),
            RecoveryInput::DrainRequested => self.spawn_drain(),
            RecoveryInput::ReconnectDue { epoch } => {
                if epoch != self.epoch || !self.may_reconnect() {
                    debug!(epoch, current = self.epoch, "dropping stale reconnect");
                    return;
                }
                self.connect_now();
            }
            RecoveryInput::TokenRefreshed(result) => self.on_token_refreshed(result).await,
            RecoveryInput::RefreshRetryDue => {
                self.refreshing = false;
                self.begin_refresh();
            }
            RecoveryInput::BackgroundWindowExpired { id } => {
                if self.foreground || self.grant.map(|grant| grant.id) != Some(id) {
                    return;
                }
                self.grant = None;
                self.deps.background.end(id);
                info!("background window expired");
                self.force_disconnect(DisconnectSource::SystemInitiated).await;
            }
            RecoveryInput::Shutdown => {}
        }
    }

    async fn on_signal(&mut self, signal: RecoverySignal) {
        match signal {
            RecoverySignal::ConnectionStateChanged(state) => self.on_state(state),
            RecoverySignal::TokenInvalidated => {
                self.deps.auth.invalidate();
                self.connect_after_refresh = true;
                self.begin_refresh();
            }
            RecoverySignal::ConnectivityLost => {
                self.online = false;
                info!("connectivity lost");
                self.force_disconnect(DisconnectSource::ConnectivityLost).await;
            }
            RecoverySignal::ConnectivityRestored => {
                self.online = true;
                info!("connectivity restored");
                self.resume();
            }
            RecoverySignal::AppBackgrounded => {
                self.foreground = false;
                if self.config.stays_connected_in_background {
                    if let Some(grant) = self.deps.background.begin() {
                        info!(window = ?grant.window, "staying connected in background");
                        self.grant = Some(grant);
                        let tx = self.tx.clone();
                        self.tasks.push(tokio::spawn(async move {
                            tokio::time::sleep(grant.window).await;
                            let _ = tx.send(RecoveryInput::BackgroundWindowExpired { id: grant.id });
                        }));
                        return;
                    }
                }
                self.force_disconnect(DisconnectSource::SystemInitiated).await;
            }
            RecoverySignal::AppForegrounded => {
                self.foreground = true;
                if let Some(grant) = self.grant.take() {
                    self.deps.background.end(grant.id);
                }
                self.resume();
            }
        }
    }

    fn on_state(&mut self, state: ConnectionState) {
        if !state.is_connected() && self.was_connected {
            self.was_connected = false;
            self.lost_at = Some(Utc::now());
        }
        match state {
            ConnectionState::Connected(connection_id) => {
                info!(%connection_id, "connected; replaying queue");
                self.was_connected = true;
                self.reconnect.reset();
                self.refresh_failures = 0;
                self.spawn_drain();
                self.spawn_resync();
            }
            ConnectionState::Disconnected(Some(source)) => {
                if source.should_reconnect() && self.may_reconnect() {
                    self.schedule_reconnect();
                } else {
                    debug!(%source, "not reconnecting automatically");
                }
            }
            ConnectionState::Reconnecting(ReconnectCause::TokenExpired) => {
                self.deps.auth.invalidate();
                self.connect_after_refresh = true;
                self.begin_refresh();
            }
            _ => {}
        }
    }

    fn may_reconnect(&self) -> bool {
        self.intent && self.online && (self.foreground || self.grant.is_some())
    }

    /// Reconnects right away after connectivity or foreground returns.
    fn resume(&mut self) {
        if !self.may_reconnect() {
            return;
        }
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if matches!(
            session.state(),
            ConnectionState::Disconnected(_) | ConnectionState::Reconnecting(_)
        ) {
            self.epoch += 1;
            self.reconnect.reset();
            self.connect_now();
        }
    }

    fn schedule_reconnect(&mut self) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if !session.mark_reconnecting() {
            return;
        }
        let delay = self.reconnect.next_delay();
        let epoch = self.epoch;
        info!(?delay, attempt = self.reconnect.attempts(), "scheduling reconnect");
        let tx = self.tx.clone();
        self.tasks.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(RecoveryInput::ReconnectDue { epoch });
        }));
    }

    fn connect_now(&mut self) {
        let Some(credentials) = self.deps.auth.credentials() else {
            debug!("no token available; refreshing before connecting");
            self.connect_after_refresh = true;
            self.begin_refresh();
            return;
        };
        let Some(session) = self.session.upgrade() else {
            return;
        };
        self.tasks.push(tokio::spawn(async move {
            match session.connect(credentials).await {
                Ok(outcome) => debug!(?outcome, "reconnect attempt"),
                Err(err) => warn!(%err, "reconnect attempt failed"),
            }
        }));
    }

    async fn force_disconnect(&mut self, source: DisconnectSource) {
        self.epoch += 1;
        if let Some(session) = self.session.upgrade() {
            session.disconnect(source).await;
        }
    }

    fn begin_refresh(&mut self) {
        if self.refreshing {
            debug!("token refresh already in flight; coalescing");
            return;
        }
        self.refreshing = true;
        let tokens = Arc::clone(&self.deps.tokens);
        let user_id = self.deps.auth.user_id();
        let tx = self.tx.clone();
        info!(user_id = user_id.0, "refreshing token");
        self.tasks.push(tokio::spawn(async move {
            let result = tokens
                .refresh_token(user_id)
                .await
                .map_err(|err| format!("{err:#}"));
            let _ = tx.send(RecoveryInput::TokenRefreshed(result));
        }));
    }

    async fn on_token_refreshed(&mut self, result: Result<Token, String>) {
        match result {
            Ok(token) => {
                self.refreshing = false;
                self.refresh_failures = 0;
                self.refresh_backoff.reset();
                self.deps.auth.set_token(token).fire();
                info!("token refreshed");
                if std::mem::take(&mut self.connect_after_refresh) && self.may_reconnect() {
                    self.connect_now();
                }
            }
            Err(message) => {
                self.refresh_failures += 1;
                if self.refresh_failures >= self.config.max_refresh_attempts {
                    warn!(attempts = self.refresh_failures, %message, "token refresh gave up");
                    self.refreshing = false;
                    self.connect_after_refresh = false;
                    self.refresh_failures = 0;
                    self.refresh_backoff.reset();
                    self.deps
                        .auth
                        .fail(WaitError::Failed(format!("token refresh failed: {message}")))
                        .fire();
                    self.force_disconnect(DisconnectSource::AuthenticationFailed)
                        .await;
                    return;
                }
                // Stays marked as refreshing so invalidations during the wait coalesce.
                let delay = self.refresh_backoff.next_delay();
                warn!(attempt = self.refresh_failures, ?delay, %message, "token refresh failed; retrying");
                let tx = self.tx.clone();
                self.tasks.push(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(RecoveryInput::RefreshRetryDue);
                }));
            }
        }
    }

    fn spawn_drain(&mut self) {
        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        if queue.is_empty() || !self.deps.sender.is_ready() {
            return;
        }
        let sender = Arc::clone(&self.deps.sender);
        let tx = self.tx.clone();
        self.tasks.push(tokio::spawn(async move {
            let report = queue.drain_ready(sender.as_ref()).await;
            if report.halted > 0 && sender.is_ready() {
                debug!(halted = report.halted, "scopes halted with work left; draining again");
                let _ = tx.send(RecoveryInput::DrainRequested);
            }
        }));
    }

    fn spawn_resync(&mut self) {
        let scopes = self.deps.watch.snapshot();
        if scopes.is_empty() {
            return;
        }
        if let Some(last) = self.last_resync {
            if last.elapsed() < self.config.sync_cooldown {
                debug!(since_last = ?last.elapsed(), "resync skipped during cooldown");
                return;
            }
        }
        self.last_resync = Some(Instant::now());
        let since = self.lost_at.take();
        let resync = Arc::clone(&self.deps.resync);
        let retries = self.config.sync_retries;
        let backoff = ExponentialBackoff::new(self.reconnect_config.clone());
        self.tasks.push(tokio::spawn(async move {
            let mut attempt = 0;
            loop {
                match resync.resync(scopes.clone(), since).await {
                    Ok(()) => {
                        debug!(scopes = scopes.len(), "resync complete");
                        return;
                    }
                    Err(err) if attempt < retries => {
                        let delay = backoff.next_delay();
                        warn!(attempt, ?delay, "resync failed: {err:#}");
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                    }
                    Err(err) => {
                        warn!(attempts = attempt + 1, "resync gave up: {err:#}");
                        return;
                    }
                }
            }
        }));
    }
}

#[cfg(test)]
#[path = "tests/recovery_tests.rs"]
mod tests;
