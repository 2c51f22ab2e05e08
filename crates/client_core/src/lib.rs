use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{ChannelId, ConnectionId, IdempotencyKey, ResourceScope, UserId},
    protocol::{EventEnvelope, OutboundIntent, QueuedMutation},
};
use storage::LocalStore;
use tokio::{sync::broadcast, task::JoinHandle, time::MissedTickBehavior};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

pub mod auth;
pub mod codec;
pub mod config;
pub mod delivery;
pub mod error;
pub mod middleware;
pub mod pipeline;
pub mod queue;
pub mod recovery;
pub mod retry;
pub mod session;
pub mod state;
pub mod transport;
pub mod waiter;

pub use auth::{
    AuthContext, Credentials, HttpTokenProvider, MissingTokenProvider, StaticTokenProvider, Token,
    TokenProvider,
};
pub use codec::{Codec, JsonCodec};
pub use config::ClientConfig;
pub use error::{ClientError, MutationFailure, WaitError};
pub use queue::{DrainReport, FailedMutation, MutationOutcome, OfflineMutationQueue, QueuedAck};
pub use recovery::{
    BackgroundScheduler, FixedBackgroundWindow, NoBackgroundTime, NoopResync, RecoverySignal,
    ResyncHandler,
};
pub use session::{ConnectOutcome, ConnectionSession};
pub use state::{ConnectionState, ConnectionStatus, DisconnectSource};
pub use transport::{Transport, WebSocketTransport};

use crate::{
    delivery::SessionDelivery,
    middleware::{
        AckTracker, BatchSplitMiddleware, HealthCheckMiddleware, HealthMonitor,
        MutationAckMiddleware, ReadState, ReadStateMiddleware, WatchList, WatchedScopeFilter,
    },
    pipeline::EventPipeline,
    recovery::{RecoveryCollaborators, RecoveryHandle, RecoveryOrchestrator},
};

/// Collaborators the client is built from. Everything except the store has a
/// production default.
pub struct ClientDependencies {
    pub transport: Arc<dyn Transport>,
    pub codec: Arc<dyn Codec>,
    pub store: Arc<dyn LocalStore>,
    pub tokens: Arc<dyn TokenProvider>,
    pub resync: Arc<dyn ResyncHandler>,
    pub background: Arc<dyn BackgroundScheduler>,
}

impl ClientDependencies {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            transport: Arc::new(WebSocketTransport),
            codec: Arc::new(JsonCodec),
            store,
            tokens: Arc::new(MissingTokenProvider),
            resync: Arc::new(NoopResync),
            background: Arc::new(NoBackgroundTime),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_tokens(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_resync(mut self, resync: Arc<dyn ResyncHandler>) -> Self {
        self.resync = resync;
        self
    }

    pub fn with_background(mut self, background: Arc<dyn BackgroundScheduler>) -> Self {
        self.background = background;
        self
    }
}

#[async_trait]
pub trait ClientHandle: Send + Sync {
    /// Connects with the current token, fetching one first if none is set.
    async fn connect(&self) -> Result<ConnectOutcome, ClientError>;
    async fn connect_with(&self, credentials: Credentials) -> Result<ConnectOutcome, ClientError>;
    async fn disconnect(&self) -> ConnectionState;
    fn set_token(&self, token: Token);
    fn current_connection_id(&self) -> Option<ConnectionId>;
    async fn connection_id(&self) -> Result<ConnectionId, ClientError>;
    fn state(&self) -> ConnectionState;
    fn connection_status(&self) -> ConnectionStatus;
    async fn enqueue_mutation(&self, intent: OutboundIntent) -> Result<QueuedAck, ClientError>;
    async fn enqueue_mutation_with_key(
        &self,
        intent: OutboundIntent,
        key: IdempotencyKey,
    ) -> Result<QueuedAck, ClientError>;
    fn subscribe_events(&self) -> broadcast::Receiver<EventEnvelope>;
    fn event_stream(&self) -> BroadcastStream<EventEnvelope>;
    fn subscribe_failures(&self) -> broadcast::Receiver<FailedMutation>;
    fn watch_channel(&self, channel_id: ChannelId) -> bool;
    fn unwatch_channel(&self, channel_id: ChannelId) -> bool;
    fn signal(&self, signal: RecoverySignal);
    fn unread_count(&self, channel_id: ChannelId) -> u32;
    fn pending_mutations(&self) -> Vec<QueuedMutation>;
    async fn expire_stale(&self) -> Vec<FailedMutation>;
}

pub struct ChatClient {
    config: ClientConfig,
    auth: Arc<AuthContext>,
    session: Arc<ConnectionSession>,
    queue: Arc<OfflineMutationQueue>,
    watch: Arc<WatchList>,
    read_state: Arc<ReadState>,
    recovery: RecoveryHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl ChatClient {
    /// Builds every component, restores queued mutations and starts the
    /// recovery loop. Does not connect.
    pub async fn start(
        config: ClientConfig,
        user_id: UserId,
        deps: ClientDependencies,
    ) -> Result<Arc<Self>, ClientError> {
        config.validate()?;

        let health = Arc::new(HealthMonitor::new());
        let acks = Arc::new(AckTracker::new());
        let watch = Arc::new(WatchList::new());
        let read_state = Arc::new(ReadState::new(user_id));
        let pipeline = EventPipeline::builder()
            .with(BatchSplitMiddleware)
            .with(HealthCheckMiddleware::new(Arc::clone(&health)))
            .with(MutationAckMiddleware::new(Arc::clone(&acks)))
            .with(WatchedScopeFilter::new(Arc::clone(&watch)))
            .with(ReadStateMiddleware::new(Arc::clone(&read_state)))
            .build(Arc::clone(&deps.store), config.event_buffer)?;

        let session = ConnectionSession::new(
            config.server_url.clone(),
            config.connection.clone(),
            deps.transport,
            deps.codec,
            Arc::new(pipeline),
            health,
        );
        let queue = Arc::new(OfflineMutationQueue::new(
            config.queue.clone(),
            deps.store,
            config.event_buffer,
        ));
        let restored = queue.restore().await?;

        let auth = Arc::new(AuthContext::new(user_id));
        let sender = Arc::new(SessionDelivery::new(
            &session,
            acks,
            config.queue.ack_timeout,
        ));
        let (recovery, orchestrator) = RecoveryOrchestrator::spawn(
            config.recovery.clone(),
            config.reconnect.clone(),
            &session,
            &queue,
            RecoveryCollaborators {
                sender,
                auth: Arc::clone(&auth),
                tokens: deps.tokens,
                resync: deps.resync,
                watch: Arc::clone(&watch),
                background: deps.background,
            },
        );
        let sweeper = tokio::spawn(sweep_stale(
            Arc::downgrade(&queue),
            config.queue.sweep_interval,
        ));

        info!(user_id = user_id.0, restored, server_url = %config.server_url, "chat client started");
        Ok(Arc::new(Self {
            config,
            auth,
            session,
            queue,
            watch,
            read_state,
            recovery,
            tasks: vec![orchestrator, sweeper],
        }))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn user_id(&self) -> UserId {
        self.auth.user_id()
    }

    pub fn watched_channels(&self) -> Vec<ResourceScope> {
        self.watch.snapshot()
    }

    pub fn subscribe_state(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
        self.session.subscribe_state()
    }

    /// Disconnects and stops background work. The client is unusable after.
    pub async fn shutdown(&self) {
        self.recovery.set_intent(false);
        self.session.disconnect(DisconnectSource::UserInitiated).await;
        self.recovery.shutdown();
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.recovery.shutdown();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl ClientHandle for Arc<ChatClient> {
    async fn connect(&self) -> Result<ConnectOutcome, ClientError> {
        self.recovery.set_intent(true);
        let credentials = match self.auth.credentials() {
            Some(credentials) => credentials,
            None => {
                self.recovery.request_token();
                let token = self
                    .auth
                    .wait_token(self.config.recovery.token_wait)
                    .await?;
                Credentials::new(self.auth.user_id(), token)
            }
        };
        self.session.connect(credentials).await
    }

    async fn connect_with(&self, credentials: Credentials) -> Result<ConnectOutcome, ClientError> {
        if credentials.user_id != self.auth.user_id() {
            warn!(
                expected = self.auth.user_id().0,
                got = credentials.user_id.0,
                "credentials are for a different user"
            );
            return Err(ClientError::AuthExpired);
        }
        self.auth.set_token(credentials.token.clone()).fire();
        self.recovery.set_intent(true);
        self.session.connect(credentials).await
    }

    async fn disconnect(&self) -> ConnectionState {
        self.recovery.set_intent(false);
        self.session.disconnect(DisconnectSource::UserInitiated).await
    }

    fn set_token(&self, token: Token) {
        self.auth.set_token(token).fire();
    }

    fn current_connection_id(&self) -> Option<ConnectionId> {
        self.session.current_connection_id()
    }

    async fn connection_id(&self) -> Result<ConnectionId, ClientError> {
        Ok(self
            .session
            .connection_id(self.config.connection.connection_id_timeout)
            .await?)
    }

    fn state(&self) -> ConnectionState {
        self.session.state()
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.session.state().status()
    }

    async fn enqueue_mutation(&self, intent: OutboundIntent) -> Result<QueuedAck, ClientError> {
        let ack = self.queue.enqueue(intent, None).await?;
        self.recovery.request_drain();
        Ok(ack)
    }

    async fn enqueue_mutation_with_key(
        &self,
        intent: OutboundIntent,
        key: IdempotencyKey,
    ) -> Result<QueuedAck, ClientError> {
        let ack = self.queue.enqueue(intent, Some(key)).await?;
        self.recovery.request_drain();
        Ok(ack)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.session.pipeline().subscribe()
    }

    fn event_stream(&self) -> BroadcastStream<EventEnvelope> {
        BroadcastStream::new(self.subscribe_events())
    }

    fn subscribe_failures(&self) -> broadcast::Receiver<FailedMutation> {
        self.queue.subscribe_failures()
    }

    fn watch_channel(&self, channel_id: ChannelId) -> bool {
        self.watch.watch(ResourceScope::channel(channel_id))
    }

    fn unwatch_channel(&self, channel_id: ChannelId) -> bool {
        self.watch.unwatch(&ResourceScope::channel(channel_id))
    }

    fn signal(&self, signal: RecoverySignal) {
        if !self.recovery.signal(signal) {
            warn!("recovery loop has stopped; signal ignored");
        }
    }

    fn unread_count(&self, channel_id: ChannelId) -> u32 {
        self.read_state.unread_count(channel_id)
    }

    fn pending_mutations(&self) -> Vec<QueuedMutation> {
        self.queue.snapshot()
    }

    async fn expire_stale(&self) -> Vec<FailedMutation> {
        self.queue.expire_stale(Utc::now()).await
    }
}

async fn sweep_stale(queue: Weak<OfflineMutationQueue>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(queue) = queue.upgrade() else {
            return;
        };
        let expired = queue.expire_stale(Utc::now()).await;
        if !expired.is_empty() {
            info!(count = expired.len(), "expired stale mutations");
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
