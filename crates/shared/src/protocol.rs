use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::{
        ChannelId, ChannelKind, ConnectionId, IdempotencyKey, MessageId, ResourceScope, UserId,
    },
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub channel_id: ChannelId,
    pub kind: ChannelKind,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionPayload {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub user_id: UserId,
    pub reaction_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    HealthCheck {
        connection_id: ConnectionId,
    },
    ChannelUpdated {
        channel: ChannelSummary,
    },
    ChannelDeleted {
        channel_id: ChannelId,
    },
    MessageNew {
        message: MessagePayload,
    },
    MessageUpdated {
        message: MessagePayload,
    },
    MessageDeleted {
        channel_id: ChannelId,
        message_id: MessageId,
    },
    ReactionNew {
        reaction: ReactionPayload,
    },
    ReactionDeleted {
        reaction: ReactionPayload,
    },
    MemberAdded {
        channel_id: ChannelId,
        user_id: UserId,
    },
    MemberRemoved {
        channel_id: ChannelId,
        user_id: UserId,
    },
    NotificationMarkRead {
        channel_id: ChannelId,
        user_id: UserId,
        #[serde(default)]
        last_read_message_id: Option<MessageId>,
    },
    EventBatch {
        events: Vec<ServerEvent>,
    },
    MutationAck {
        idempotency_key: IdempotencyKey,
    },
    MutationRejected {
        idempotency_key: IdempotencyKey,
        error: ApiError,
    },
    Error(ApiError),
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HealthCheck { .. } => "health_check",
            Self::ChannelUpdated { .. } => "channel_updated",
            Self::ChannelDeleted { .. } => "channel_deleted",
            Self::MessageNew { .. } => "message_new",
            Self::MessageUpdated { .. } => "message_updated",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::ReactionNew { .. } => "reaction_new",
            Self::ReactionDeleted { .. } => "reaction_deleted",
            Self::MemberAdded { .. } => "member_added",
            Self::MemberRemoved { .. } => "member_removed",
            Self::NotificationMarkRead { .. } => "notification_mark_read",
            Self::EventBatch { .. } => "event_batch",
            Self::MutationAck { .. } => "mutation_ack",
            Self::MutationRejected { .. } => "mutation_rejected",
            Self::Error(_) => "error",
        }
    }

    /// Routing scope of the event, if it concerns a single channel.
    pub fn scope(&self) -> Option<ResourceScope> {
        let channel_id = match self {
            Self::ChannelUpdated { channel } => channel.channel_id,
            Self::ChannelDeleted { channel_id }
            | Self::MessageDeleted { channel_id, .. }
            | Self::MemberAdded { channel_id, .. }
            | Self::MemberRemoved { channel_id, .. }
            | Self::NotificationMarkRead { channel_id, .. } => *channel_id,
            Self::MessageNew { message } | Self::MessageUpdated { message } => message.channel_id,
            Self::ReactionNew { reaction } | Self::ReactionDeleted { reaction } => {
                reaction.channel_id
            }
            Self::HealthCheck { .. }
            | Self::EventBatch { .. }
            | Self::MutationAck { .. }
            | Self::MutationRejected { .. }
            | Self::Error(_) => return None,
        };
        Some(ResourceScope::channel(channel_id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundIntent {
    SendMessage {
        channel_id: ChannelId,
        text: String,
    },
    EditMessage {
        channel_id: ChannelId,
        message_id: MessageId,
        text: String,
    },
    DeleteMessage {
        channel_id: ChannelId,
        message_id: MessageId,
    },
    AddReaction {
        channel_id: ChannelId,
        message_id: MessageId,
        reaction_type: String,
    },
    RemoveReaction {
        channel_id: ChannelId,
        message_id: MessageId,
        reaction_type: String,
    },
    MarkRead {
        channel_id: ChannelId,
        message_id: MessageId,
    },
}

impl OutboundIntent {
    pub fn channel_id(&self) -> ChannelId {
        match self {
            Self::SendMessage { channel_id, .. }
            | Self::EditMessage { channel_id, .. }
            | Self::DeleteMessage { channel_id, .. }
            | Self::AddReaction { channel_id, .. }
            | Self::RemoveReaction { channel_id, .. }
            | Self::MarkRead { channel_id, .. } => *channel_id,
        }
    }

    pub fn scope(&self) -> ResourceScope {
        ResourceScope::channel(self.channel_id())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<ConnectionId>,
    },
    Mutation {
        idempotency_key: IdempotencyKey,
        intent: OutboundIntent,
    },
}

/// A decoded unit of server-pushed state change.
///
/// Envelopes are never mutated after construction. Middleware that rewrites an
/// event produces a new envelope through [`EventEnvelope::derive`], which keeps
/// a link to its source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_id: Option<Uuid>,
    received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scope: Option<ResourceScope>,
    event: ServerEvent,
}

impl EventEnvelope {
    pub fn new(event: ServerEvent) -> Self {
        Self::received_at(event, Utc::now())
    }

    pub fn received_at(event: ServerEvent, received_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            received_at,
            scope: event.scope(),
            event,
        }
    }

    /// Builds a new envelope carrying `event`, linked back to `self`.
    pub fn derive(&self, event: ServerEvent) -> Self {
        let scope = event.scope().or_else(|| self.scope.clone());
        Self {
            id: Uuid::new_v4(),
            parent_id: Some(self.id),
            received_at: self.received_at,
            scope,
            event,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn parent_id(&self) -> Option<Uuid> {
        self.parent_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn scope(&self) -> Option<&ResourceScope> {
        self.scope.as_ref()
    }

    pub fn event(&self) -> &ServerEvent {
        &self.event
    }

    pub fn kind(&self) -> &'static str {
        self.event.kind()
    }
}

/// A pending outbound operation as it is kept in the durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    pub idempotency_key: IdempotencyKey,
    pub sequence: u64,
    pub scope: ResourceScope,
    pub intent: OutboundIntent,
    pub enqueued_at: DateTime<Utc>,
    pub attempt: u32,
    #[serde(with = "duration_secs")]
    pub max_age: Duration,
}

impl QueuedMutation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let Ok(max_age) = chrono::Duration::from_std(self.max_age) else {
            return false;
        };
        now.signed_duration_since(self.enqueued_at) > max_age
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
