//! In-process fakes for the transport, token provider and resync handler.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shared::{
    domain::{ConnectionId, IdempotencyKey, ResourceScope, UserId},
    error::ApiError,
    protocol::{ClientFrame, OutboundIntent, ServerEvent},
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    auth::{Token, TokenProvider},
    error::TransportError,
    recovery::ResyncHandler,
    state::ConnectionState,
    transport::{ConnectRequest, Transport, TransportCommand, TransportConnection, TransportEvent},
};

pub const WAIT: Duration = Duration::from_secs(5);

pub async fn within<T>(what: &str, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, future)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    within(what, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}

pub async fn wait_for_state(
    states: &mut watch::Receiver<ConnectionState>,
    what: &str,
    predicate: impl Fn(&ConnectionState) -> bool,
) -> ConnectionState {
    within(what, async {
        loop {
            {
                let current = states.borrow_and_update();
                if predicate(&*current) {
                    return current.clone();
                }
            }
            states.changed().await.expect("state channel closed");
        }
    })
    .await
}

/// Server side of one fake connection.
pub struct MockServerConn {
    pub request: ConnectRequest,
    to_client: mpsc::UnboundedSender<TransportEvent>,
    from_client: mpsc::UnboundedReceiver<TransportCommand>,
}

impl MockServerConn {
    pub fn push(&self, event: ServerEvent) {
        let bytes = serde_json::to_vec(&event).expect("encode server event");
        self.push_raw(bytes);
    }

    pub fn push_raw(&self, bytes: Vec<u8>) {
        let _ = self.to_client.send(TransportEvent::Data(bytes));
    }

    pub fn hello(&self, connection_id: &str) {
        self.push(ServerEvent::HealthCheck {
            connection_id: ConnectionId::new(connection_id),
        });
    }

    pub fn close(&self) {
        let _ = self.to_client.send(TransportEvent::Closed(None));
    }

    pub fn authorization(&self) -> Option<&str> {
        self.request
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("authorization"))
            .map(|(_, value)| value.as_str())
    }

    /// Next frame sent by the client; `None` once the client closed.
    pub async fn next_frame(&mut self) -> Option<ClientFrame> {
        within("client frame", async {
            match self.from_client.recv().await {
                Some(TransportCommand::Send(bytes)) => {
                    Some(serde_json::from_slice(&bytes).expect("decode client frame"))
                }
                Some(TransportCommand::Close) | None => None,
            }
        })
        .await
    }

    /// Next mutation frame, skipping heartbeats.
    pub async fn next_mutation(&mut self) -> Option<(IdempotencyKey, OutboundIntent)> {
        loop {
            match self.next_frame().await? {
                ClientFrame::Mutation {
                    idempotency_key,
                    intent,
                } => return Some((idempotency_key, intent)),
                ClientFrame::Heartbeat { .. } => continue,
            }
        }
    }

    pub async fn closed_by_client(&mut self) {
        within("client close", async {
            loop {
                match self.from_client.recv().await {
                    Some(TransportCommand::Close) | None => return,
                    Some(TransportCommand::Send(_)) => continue,
                }
            }
        })
        .await
    }
}

pub struct MockServer {
    accepted: mpsc::UnboundedReceiver<MockServerConn>,
}

impl MockServer {
    pub async fn accept(&mut self) -> MockServerConn {
        within("incoming connection", self.accepted.recv())
            .await
            .expect("transport dropped")
    }

    pub fn try_accept(&mut self) -> Option<MockServerConn> {
        self.accepted.try_recv().ok()
    }
}

pub struct MockTransport {
    accept: mpsc::UnboundedSender<MockServerConn>,
    opens: AtomicU32,
    failures_left: AtomicU32,
    open_delay: Mutex<Duration>,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, MockServer) {
        let (accept, accepted) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            accept,
            opens: AtomicU32::new(0),
            failures_left: AtomicU32::new(0),
            open_delay: Mutex::new(Duration::ZERO),
        });
        (transport, MockServer { accepted })
    }

    pub fn fail_next_opens(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = delay;
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, request: ConnectRequest) -> Result<TransportConnection, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let delay = *self.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let refused = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect("connection refused".into()));
        }

        let (commands, from_client) = mpsc::unbounded_channel();
        let (to_client, events) = mpsc::unbounded_channel();
        self.accept
            .send(MockServerConn {
                request,
                to_client,
                from_client,
            })
            .map_err(|_| TransportError::Connect("server gone".into()))?;
        Ok(TransportConnection { commands, events })
    }
}

#[derive(Debug, Clone)]
pub enum AutoReply {
    Ack,
    Reject(ApiError),
    Ignore,
    CloseConnection,
}

/// Accepts every connection, greets it with `conn-<n>` and answers mutations
/// according to `policy`. Returns the keys in the order they arrived.
pub fn spawn_auto_server<F>(
    mut server: MockServer,
    policy: F,
) -> (Arc<Mutex<Vec<IdempotencyKey>>>, JoinHandle<()>)
where
    F: Fn(&IdempotencyKey, &OutboundIntent) -> AutoReply + Send + Sync + 'static,
{
    let seen = Arc::new(Mutex::new(Vec::new()));
    let policy = Arc::new(policy);
    let recorded = Arc::clone(&seen);
    let task = tokio::spawn(async move {
        let mut served = 0u32;
        while let Some(mut conn) = server.accepted.recv().await {
            served += 1;
            conn.hello(&format!("conn-{served}"));
            let policy = Arc::clone(&policy);
            let recorded = Arc::clone(&recorded);
            tokio::spawn(async move {
                while let Some(command) = conn.from_client.recv().await {
                    let TransportCommand::Send(bytes) = command else {
                        return;
                    };
                    let Ok(ClientFrame::Mutation {
                        idempotency_key,
                        intent,
                    }) = serde_json::from_slice::<ClientFrame>(&bytes)
                    else {
                        continue;
                    };
                    recorded.lock().push(idempotency_key.clone());
                    match policy(&idempotency_key, &intent) {
                        AutoReply::Ack => conn.push(ServerEvent::MutationAck { idempotency_key }),
                        AutoReply::Reject(error) => conn.push(ServerEvent::MutationRejected {
                            idempotency_key,
                            error,
                        }),
                        AutoReply::Ignore => {}
                        AutoReply::CloseConnection => {
                            conn.close();
                            return;
                        }
                    }
                }
            });
        }
    });
    (seen, task)
}

/// Token provider that counts calls and can fail a number of times first.
pub struct CountingTokens {
    calls: AtomicU32,
    failures_left: AtomicU32,
    delay: Duration,
}

impl CountingTokens {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            failures_left: AtomicU32::new(0),
            delay,
        })
    }

    pub fn failing(delay: Duration, failures: u32) -> Arc<Self> {
        let tokens = Self::new(delay);
        tokens.failures_left.store(failures, Ordering::SeqCst);
        tokens
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for CountingTokens {
    async fn refresh_token(&self, user_id: UserId) -> Result<Token> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(anyhow!("token service unavailable"));
        }
        Ok(Token::new(format!("token-{}-{call}", user_id.0)))
    }
}

pub type ResyncCall = (Vec<ResourceScope>, Option<DateTime<Utc>>);

#[derive(Default)]
pub struct RecordingResync {
    calls: Mutex<Vec<ResyncCall>>,
    failures_left: AtomicU32,
}

impl RecordingResync {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(failures: u32) -> Arc<Self> {
        let resync = Self::default();
        resync.failures_left.store(failures, Ordering::SeqCst);
        Arc::new(resync)
    }

    pub fn calls(&self) -> Vec<ResyncCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ResyncHandler for RecordingResync {
    async fn resync(
        &self,
        scopes: Vec<ResourceScope>,
        since: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.calls.lock().push((scopes, since));
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(anyhow!("resync backend unavailable"));
        }
        Ok(())
    }
}
