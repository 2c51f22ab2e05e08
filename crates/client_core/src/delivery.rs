use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use shared::protocol::{ClientFrame, QueuedMutation};
use tokio::sync::watch;
use tracing::debug;

use crate::{
    error::DeliveryError,
    middleware::AckTracker,
    session::ConnectionSession,
    state::ConnectionState,
};

/// Hands one queued mutation to the server and reports how it went.
#[async_trait]
pub trait MutationSender: Send + Sync {
    /// Whether a delivery attempt could currently succeed.
    fn is_ready(&self) -> bool;
    async fn deliver(&self, mutation: &QueuedMutation) -> Result<(), DeliveryError>;
}

/// Sends mutations over the live session and waits for the server's ack.
pub struct SessionDelivery {
    session: Weak<ConnectionSession>,
    acks: Arc<AckTracker>,
    ack_timeout: Duration,
}

impl SessionDelivery {
    pub fn new(session: &Arc<ConnectionSession>, acks: Arc<AckTracker>, ack_timeout: Duration) -> Self {
        Self {
            session: Arc::downgrade(session),
            acks,
            ack_timeout,
        }
    }
}

#[async_trait]
impl MutationSender for SessionDelivery {
    fn is_ready(&self) -> bool {
        self.session
            .upgrade()
            .is_some_and(|session| session.state().is_connected())
    }

    async fn deliver(&self, mutation: &QueuedMutation) -> Result<(), DeliveryError> {
        let session = self
            .session
            .upgrade()
            .ok_or_else(|| DeliveryError::Transient("session is gone".into()))?;
        let key = mutation.idempotency_key.clone();
        let ack = self.acks.register(key.clone());
        let frame = ClientFrame::Mutation {
            idempotency_key: key.clone(),
            intent: mutation.intent.clone(),
        };
        if let Err(err) = session.send_frame(&frame) {
            self.acks.forget(&key);
            return Err(DeliveryError::Transient(err.to_string()));
        }
        let state = session.subscribe_state();
        drop(session);

        let outcome = tokio::select! {
            acked = ack => match acked {
                Ok(Ok(())) => Ok(()),
                Ok(Err(error)) if error.code.is_retryable() => {
                    Err(DeliveryError::Transient(error.message))
                }
                Ok(Err(error)) => Err(DeliveryError::Rejected(error)),
                Err(_) => Err(DeliveryError::Transient("acknowledgement dropped".into())),
            },
            _ = tokio::time::sleep(self.ack_timeout) => {
                Err(DeliveryError::Transient(format!(
                    "no acknowledgement within {:?}",
                    self.ack_timeout
                )))
            }
            _ = left_connected(state) => {
                Err(DeliveryError::Transient("connection lost before acknowledgement".into()))
            }
        };
        self.acks.forget(&key);
        if let Err(err) = &outcome {
            debug!(key = %key, %err, "delivery attempt failed");
        }
        outcome
    }
}

async fn left_connected(mut state: watch::Receiver<ConnectionState>) {
    loop {
        if !state.borrow_and_update().is_connected() {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}
