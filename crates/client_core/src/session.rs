use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use shared::{
    domain::ConnectionId,
    error::ErrorCode,
    protocol::{ClientFrame, ServerEvent},
};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    auth::Credentials,
    codec::Codec,
    config::ConnectionConfig,
    error::{ClientError, TransportError, WaitError},
    middleware::HealthMonitor,
    pipeline::EventPipeline,
    state::{ConnectionState, DisconnectSource, ReconnectCause, StateChange},
    transport::{ws_url_for, ConnectRequest, Transport, TransportCommand, TransportConnection,
        TransportEvent},
    waiter::{Deferred, WaiterRegistry},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Started,
    AlreadyConnecting,
    AlreadyConnected(ConnectionId),
    /// A disconnect won the race against the transport handshake.
    Superseded,
}

struct SessionCore {
    state: ConnectionState,
    /// Bumped whenever a transport is attached or torn down; tasks holding an
    /// older value are stale and must not touch the state.
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<TransportCommand>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionCore {
    fn teardown(&mut self) {
        self.generation += 1;
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(TransportCommand::Close);
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Owns the transport and the connection state machine.
///
/// All state lives behind one lock; waiter completions produced by a
/// transition run only after that lock is released.
pub struct ConnectionSession {
    server_url: String,
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    pipeline: Arc<EventPipeline>,
    health: Arc<HealthMonitor>,
    connection_ids: WaiterRegistry<ConnectionId>,
    state_tx: watch::Sender<ConnectionState>,
    changes: broadcast::Sender<StateChange>,
    core: Mutex<SessionCore>,
}

impl ConnectionSession {
    pub fn new(
        server_url: impl Into<String>,
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn Codec>,
        pipeline: Arc<EventPipeline>,
        health: Arc<HealthMonitor>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::default());
        let (changes, _) = broadcast::channel(64);
        Arc::new(Self {
            server_url: server_url.into(),
            config,
            transport,
            codec,
            pipeline,
            health,
            connection_ids: WaiterRegistry::new("connection_id"),
            state_tx,
            changes,
            core: Mutex::new(SessionCore {
                state: ConnectionState::default(),
                generation: 0,
                outbound: None,
                tasks: Vec::new(),
            }),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.core.lock().state.clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    pub fn current_connection_id(&self) -> Option<ConnectionId> {
        self.core.lock().state.connection_id().cloned()
    }

    /// Resolves with the id of the next (or current) established connection.
    pub async fn connection_id(&self, timeout: Duration) -> Result<ConnectionId, WaitError> {
        self.connection_ids.wait(timeout).await
    }

    pub fn pipeline(&self) -> &Arc<EventPipeline> {
        &self.pipeline
    }

    /// Opens a transport unless one is already open or opening.
    pub async fn connect(
        self: &Arc<Self>,
        credentials: Credentials,
    ) -> Result<ConnectOutcome, ClientError> {
        let url = ws_url_for(&self.server_url, credentials.user_id)?;
        let (generation, deferred) = {
            let mut core = self.core.lock();
            match &core.state {
                ConnectionState::Connecting | ConnectionState::WaitingForConnectionId => {
                    return Ok(ConnectOutcome::AlreadyConnecting)
                }
                ConnectionState::Connected(id) => {
                    return Ok(ConnectOutcome::AlreadyConnected(id.clone()))
                }
                ConnectionState::Disconnecting(_) => return Err(ClientError::DisconnectInProgress),
                ConnectionState::Disconnected(_) | ConnectionState::Reconnecting(_) => {}
            }
            let deferred = self.transition(&mut core, ConnectionState::Connecting);
            core.generation += 1;
            (core.generation, deferred)
        };
        deferred.fire();

        self.health.reset();
        info!(url = %url, user_id = credentials.user_id.0, "opening connection");
        let request = ConnectRequest {
            url,
            headers: vec![credentials.authorization_header()],
        };
        match self.transport.open(request).await {
            Ok(connection) => Ok(self.attach(generation, connection)),
            Err(err) => {
                warn!(%err, "failed to open connection");
                self.lose(generation, DisconnectSource::TransportError(err.to_string()));
                Err(err.into())
            }
        }
    }

    /// Tears the connection down. Always ends in `Disconnected`; connection-id
    /// waiters are cancelled with `source`.
    pub async fn disconnect(&self, source: DisconnectSource) -> ConnectionState {
        let (deferred, state) = {
            let mut core = self.core.lock();
            let mut deferred = Deferred::empty();
            let target = ConnectionState::Disconnected(Some(source.clone()));
            if core.state.is_disconnected() {
                if core.state.can_transition_to(&target) {
                    deferred.merge(self.transition(&mut core, target));
                }
            } else {
                deferred.merge(
                    self.transition(&mut core, ConnectionState::Disconnecting(source.clone())),
                );
                core.teardown();
                deferred.merge(self.transition(&mut core, target));
            }
            deferred.merge(self.connection_ids.fail_all(WaitError::Cancelled(source)));
            (deferred, core.state.clone())
        };
        deferred.fire();
        state
    }

    /// `Disconnected -> Reconnecting(TransportFailure)`, ahead of a scheduled retry.
    pub fn mark_reconnecting(&self) -> bool {
        let deferred = {
            let mut core = self.core.lock();
            if !core.state.is_disconnected() {
                return false;
            }
            self.transition(
                &mut core,
                ConnectionState::Reconnecting(ReconnectCause::TransportFailure),
            )
        };
        deferred.fire();
        true
    }

    pub fn send_frame(&self, frame: &ClientFrame) -> Result<(), ClientError> {
        let bytes = self.codec.encode(frame)?;
        let outbound = self
            .core
            .lock()
            .outbound
            .clone()
            .ok_or(ClientError::NotConnected)?;
        outbound
            .send(TransportCommand::Send(bytes))
            .map_err(|_| ClientError::Transport(TransportError::Closed))
    }

    fn attach(self: &Arc<Self>, generation: u64, connection: TransportConnection) -> ConnectOutcome {
        let TransportConnection { commands, events } = connection;
        let deferred = {
            let mut core = self.core.lock();
            if core.generation != generation || core.state != ConnectionState::Connecting {
                debug!("connection superseded while the transport was opening");
                let _ = commands.send(TransportCommand::Close);
                return ConnectOutcome::Superseded;
            }
            let deferred = self.transition(&mut core, ConnectionState::WaitingForConnectionId);
            core.outbound = Some(commands);
            self.health.touch();
            let weak = Arc::downgrade(self);
            core.tasks
                .push(tokio::spawn(read_loop(weak.clone(), generation, events)));
            core.tasks.push(tokio::spawn(heartbeat_loop(
                weak,
                generation,
                self.config.heartbeat_interval,
                self.config.ack_window,
            )));
            deferred
        };
        deferred.fire();
        ConnectOutcome::Started
    }

    fn is_current(&self, generation: u64) -> bool {
        self.core.lock().generation == generation
    }

    async fn handle_frame(&self, generation: u64, bytes: &[u8]) {
        let envelope = match self.codec.decode(bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(%err, len = bytes.len(), "skipping undecodable frame");
                return;
            }
        };

        if let ServerEvent::Error(error) = envelope.event() {
            if error.is_token_rejected() {
                self.expire_token(generation);
                return;
            }
            if error.code == ErrorCode::Unauthorized {
                self.lose(generation, DisconnectSource::ServerInitiated(error.clone()));
                return;
            }
        }

        self.pipeline.process(envelope).await;

        if let Some(connection_id) = self.health.take_announced() {
            self.announce(generation, connection_id);
        }
    }

    fn announce(&self, generation: u64, connection_id: ConnectionId) {
        let deferred = {
            let mut core = self.core.lock();
            if core.generation != generation {
                return;
            }
            if core.state != ConnectionState::WaitingForConnectionId {
                if let Some(current) = core.state.connection_id() {
                    if *current != connection_id {
                        warn!(%current, announced = %connection_id, "server announced a different connection id");
                    }
                }
                return;
            }
            self.transition(&mut core, ConnectionState::Connected(connection_id))
        };
        deferred.fire();
    }

    fn expire_token(&self, generation: u64) {
        let deferred = {
            let mut core = self.core.lock();
            if core.generation != generation {
                return;
            }
            let next = ConnectionState::Reconnecting(ReconnectCause::TokenExpired);
            if !core.state.can_transition_to(&next) {
                return;
            }
            core.teardown();
            self.transition(&mut core, next)
        };
        info!("token expired; waiting for refreshed credentials");
        deferred.fire();
    }

    fn lose(&self, generation: u64, source: DisconnectSource) {
        let deferred = {
            let mut core = self.core.lock();
            if core.generation != generation
                || matches!(
                    core.state,
                    ConnectionState::Disconnected(_) | ConnectionState::Disconnecting(_)
                )
            {
                return;
            }
            warn!(%source, "connection lost");
            core.teardown();
            self.transition(&mut core, ConnectionState::Disconnected(Some(source)))
        };
        deferred.fire();
    }

    /// Applies a legal transition and returns the waiter completions it caused.
    /// Must be called with the core lock held; the result must be fired after
    /// the lock is released.
    fn transition(&self, core: &mut SessionCore, next: ConnectionState) -> Deferred {
        if !core.state.can_transition_to(&next) {
            warn!(from = ?core.state, to = ?next, "rejected illegal connection state transition");
            return Deferred::empty();
        }

        let deferred = match &next {
            ConnectionState::Connected(id) => self.connection_ids.resolve_all(id.clone()),
            ConnectionState::Disconnected(Some(source)) if !source.should_reconnect() => self
                .connection_ids
                .fail_all(WaitError::Cancelled(source.clone())),
            _ => {
                self.connection_ids.invalidate();
                Deferred::empty()
            }
        };

        let previous = std::mem::replace(&mut core.state, next.clone());
        info!(from = ?previous, to = ?next, "connection state changed");
        self.state_tx.send_replace(next.clone());
        let _ = self.changes.send(StateChange {
            from: previous,
            to: next,
        });
        deferred
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.core.get_mut().teardown();
    }
}

async fn read_loop(
    session: Weak<ConnectionSession>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(session) = session.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Data(bytes) => {
                if !session.is_current(generation) {
                    return;
                }
                session.handle_frame(generation, &bytes).await;
            }
            TransportEvent::Closed(info) => {
                let reason = match info {
                    Some(info) => format!("closed by peer ({}): {}", info.code, info.reason),
                    None => "connection closed".to_string(),
                };
                session.lose(generation, DisconnectSource::TransportError(reason));
                return;
            }
            TransportEvent::Error(message) => {
                session.lose(generation, DisconnectSource::TransportError(message));
                return;
            }
        }
    }
    if let Some(session) = session.upgrade() {
        session.lose(
            generation,
            DisconnectSource::TransportError("transport stream ended".into()),
        );
    }
}

async fn heartbeat_loop(
    session: Weak<ConnectionSession>,
    generation: u64,
    every: Duration,
    ack_window: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(session) = session.upgrade() else {
            return;
        };
        if !session.is_current(generation) {
            return;
        }
        if session
            .health
            .since_last_ack()
            .is_some_and(|silence| silence > ack_window)
        {
            session.lose(generation, DisconnectSource::NoPongReceived);
            return;
        }
        let Some(connection_id) = session.current_connection_id() else {
            continue;
        };
        let frame = ClientFrame::Heartbeat {
            connection_id: Some(connection_id),
        };
        if let Err(err) = session.send_frame(&frame) {
            debug!(%err, "heartbeat not sent");
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
