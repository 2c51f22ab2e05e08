use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{ChannelId, ConnectionId, IdempotencyKey, MessageId, ResourceScope, UserId},
    error::{ApiError, ErrorCode},
    protocol::{MessagePayload, QueuedMutation, ServerEvent},
};
use storage::MemoryStore;

use super::*;
use crate::middleware::{
    AckTracker, BatchSplitMiddleware, HealthCheckMiddleware, HealthMonitor,
    MutationAckMiddleware, ReadState, ReadStateMiddleware, WatchList, WatchedScopeFilter,
};

const ME: UserId = UserId(1);
const OTHER: UserId = UserId(2);

struct Fixture {
    pipeline: EventPipeline,
    store: Arc<MemoryStore>,
    watch: Arc<WatchList>,
    health: Arc<HealthMonitor>,
    acks: Arc<AckTracker>,
    read_state: Arc<ReadState>,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let watch = Arc::new(WatchList::new());
    let health = Arc::new(HealthMonitor::new());
    let acks = Arc::new(AckTracker::new());
    let read_state = Arc::new(ReadState::new(ME));
    let pipeline = EventPipeline::builder()
        .with(BatchSplitMiddleware)
        .with(HealthCheckMiddleware::new(Arc::clone(&health)))
        .with(MutationAckMiddleware::new(Arc::clone(&acks)))
        .with(WatchedScopeFilter::new(Arc::clone(&watch)))
        .with(ReadStateMiddleware::new(Arc::clone(&read_state)))
        .build(store.clone(), 64)
        .expect("pipeline");
    Fixture {
        pipeline,
        store,
        watch,
        health,
        acks,
        read_state,
    }
}

fn message(channel: i64, id: i64, sender: UserId) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        channel_id: ChannelId(channel),
        sender_id: sender,
        text: format!("message {id}"),
        created_at: Utc::now(),
        updated_at: None,
    }
}

#[tokio::test]
async fn created_updated_deleted_are_published_and_persisted_in_order() {
    let fx = fixture();
    fx.watch.watch(ResourceScope::channel(ChannelId(10)));
    let mut rx = fx.pipeline.subscribe();

    let inputs = vec![
        ServerEvent::MessageNew {
            message: message(10, 1, OTHER),
        },
        ServerEvent::MessageUpdated {
            message: message(10, 1, OTHER),
        },
        ServerEvent::MessageDeleted {
            channel_id: ChannelId(10),
            message_id: MessageId(1),
        },
    ];
    for event in inputs {
        let report = fx.pipeline.process(EventEnvelope::new(event)).await;
        assert_eq!(report.published.len(), 1);
    }

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(rx.recv().await.expect("event").kind());
    }
    assert_eq!(
        received,
        vec!["message_new", "message_updated", "message_deleted"]
    );
    let applied: Vec<_> = fx
        .store
        .applied_events()
        .await
        .iter()
        .map(|envelope| envelope.kind())
        .collect();
    assert_eq!(applied, received);
}

#[tokio::test]
async fn every_envelope_visits_every_stage_in_declared_order() {
    let fx = fixture();
    fx.watch.watch(ResourceScope::channel(ChannelId(1)));
    let expected = vec![
        "batch_split",
        "health_check",
        "mutation_ack",
        "watched_scope",
        "read_state",
    ];

    let envelopes = vec![
        ServerEvent::HealthCheck {
            connection_id: ConnectionId::new("c-1"),
        },
        ServerEvent::MutationAck {
            idempotency_key: IdempotencyKey::new("k"),
        },
        ServerEvent::EventBatch { events: vec![] },
        ServerEvent::MessageNew {
            message: message(99, 1, OTHER),
        },
        ServerEvent::MessageNew {
            message: message(1, 2, OTHER),
        },
        ServerEvent::Error(ApiError::new(ErrorCode::Internal, "boom")),
    ];
    for event in envelopes {
        let report = fx.pipeline.process(EventEnvelope::new(event)).await;
        assert_eq!(report.visited, expected);
    }
}

#[tokio::test]
async fn batch_is_split_into_linked_envelopes_and_filtered() {
    let fx = fixture();
    fx.watch.watch(ResourceScope::channel(ChannelId(5)));
    let batch = EventEnvelope::new(ServerEvent::EventBatch {
        events: vec![
            ServerEvent::MessageNew {
                message: message(5, 1, OTHER),
            },
            ServerEvent::MessageNew {
                message: message(6, 2, OTHER),
            },
            ServerEvent::EventBatch {
                events: vec![ServerEvent::MemberAdded {
                    channel_id: ChannelId(5),
                    user_id: OTHER,
                }],
            },
        ],
    });

    let report = fx.pipeline.process(batch.clone()).await;

    let kinds: Vec<_> = report.published.iter().map(|e| e.kind()).collect();
    assert_eq!(kinds, vec!["message_new", "member_added"]);
    assert_eq!(report.published[0].parent_id(), Some(batch.id()));
    assert_ne!(report.published[1].parent_id(), Some(batch.id()));
    assert!(report.published[1].parent_id().is_some());
    assert_eq!(fx.store.applied_events().await.len(), 2);
}

#[tokio::test]
async fn health_checks_and_acks_are_consumed() {
    let fx = fixture();
    let ack = fx.acks.register(IdempotencyKey::new("k-1"));

    let health = fx
        .pipeline
        .process(EventEnvelope::new(ServerEvent::HealthCheck {
            connection_id: ConnectionId::new("conn-7"),
        }))
        .await;
    let acked = fx
        .pipeline
        .process(EventEnvelope::new(ServerEvent::MutationAck {
            idempotency_key: IdempotencyKey::new("k-1"),
        }))
        .await;

    assert!(health.published.is_empty());
    assert!(acked.published.is_empty());
    assert_eq!(fx.health.take_announced(), Some(ConnectionId::new("conn-7")));
    assert_eq!(ack.await.expect("ack"), Ok(()));
    assert!(fx.store.applied_events().await.is_empty());
}

#[tokio::test]
async fn acks_and_health_checks_inside_a_batch_are_consumed() {
    let fx = fixture();
    fx.watch.watch(ResourceScope::channel(ChannelId(5)));
    let ack = fx.acks.register(IdempotencyKey::new("k-2"));

    let report = fx
        .pipeline
        .process(EventEnvelope::new(ServerEvent::EventBatch {
            events: vec![
                ServerEvent::MutationAck {
                    idempotency_key: IdempotencyKey::new("k-2"),
                },
                ServerEvent::HealthCheck {
                    connection_id: ConnectionId::new("conn-9"),
                },
                ServerEvent::MessageNew {
                    message: message(5, 1, OTHER),
                },
            ],
        }))
        .await;

    let kinds: Vec<_> = report.published.iter().map(|e| e.kind()).collect();
    assert_eq!(kinds, vec!["message_new"]);
    assert_eq!(ack.await.expect("ack"), Ok(()));
    assert_eq!(fx.health.take_announced(), Some(ConnectionId::new("conn-9")));
    assert_eq!(fx.store.applied_events().await.len(), 1);
}

#[tokio::test]
async fn read_state_tracks_unread_messages() {
    let fx = fixture();
    fx.watch.watch(ResourceScope::channel(ChannelId(3)));
    for (id, sender) in [(1, OTHER), (2, OTHER), (3, ME)] {
        fx.pipeline
            .process(EventEnvelope::new(ServerEvent::MessageNew {
                message: message(3, id, sender),
            }))
            .await;
    }
    assert_eq!(fx.read_state.unread_count(ChannelId(3)), 2);

    fx.pipeline
        .process(EventEnvelope::new(ServerEvent::NotificationMarkRead {
            channel_id: ChannelId(3),
            user_id: ME,
            last_read_message_id: Some(MessageId(3)),
        }))
        .await;
    assert_eq!(fx.read_state.unread_count(ChannelId(3)), 0);
    assert_eq!(fx.read_state.total_unread(), 0);
}

struct Flaky;

impl EventMiddleware for Flaky {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn stage(&self) -> Stage {
        Stage::Transform
    }

    fn handle(&self, envelope: &EventEnvelope) -> Result<StageOutcome, MiddlewareError> {
        match envelope.event() {
            ServerEvent::ChannelDeleted { .. } => {
                Err(MiddlewareError::new(self.name(), "cannot handle deletes"))
            }
            _ => Ok(StageOutcome::Forward),
        }
    }
}

#[tokio::test]
async fn failing_stage_is_skipped_without_halting_the_stream() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = EventPipeline::builder()
        .with(Flaky)
        .build(store.clone(), 8)
        .expect("pipeline");

    let failed = pipeline
        .process(EventEnvelope::new(ServerEvent::ChannelDeleted {
            channel_id: ChannelId(1),
        }))
        .await;
    let next = pipeline
        .process(EventEnvelope::new(ServerEvent::ChannelDeleted {
            channel_id: ChannelId(2),
        }))
        .await;

    assert_eq!(failed.failures.len(), 1);
    assert_eq!(failed.published.len(), 1);
    assert_eq!(next.published.len(), 1);
    assert_eq!(store.applied_events().await.len(), 2);
}

struct Named(&'static str, Stage);

impl EventMiddleware for Named {
    fn name(&self) -> &'static str {
        self.0
    }

    fn stage(&self) -> Stage {
        self.1
    }

    fn handle(&self, _envelope: &EventEnvelope) -> Result<StageOutcome, MiddlewareError> {
        Ok(StageOutcome::Forward)
    }
}

#[test]
fn builder_rejects_stages_out_of_order() {
    let err = EventPipeline::builder()
        .with(Named("filter", Stage::Filter))
        .with(Named("intercept", Stage::Intercept))
        .build(Arc::new(MemoryStore::new()), 8)
        .err()
        .expect("out of order");
    assert_eq!(
        err,
        PipelineConfigError::StageOutOfOrder {
            name: "intercept",
            stage: Stage::Intercept,
            previous: Stage::Filter,
        }
    );
}

#[test]
fn builder_rejects_duplicate_names() {
    let err = EventPipeline::builder()
        .with(Named("same", Stage::Intercept))
        .with(Named("same", Stage::Filter))
        .build(Arc::new(MemoryStore::new()), 8)
        .err()
        .expect("duplicate");
    assert_eq!(err, PipelineConfigError::DuplicateName("same"));
}

struct BrokenStore;

#[async_trait]
impl LocalStore for BrokenStore {
    async fn apply_event(&self, _envelope: &EventEnvelope) -> Result<()> {
        Err(anyhow!("disk full"))
    }

    async fn load_pending_mutations(&self) -> Result<Vec<QueuedMutation>> {
        Ok(Vec::new())
    }

    async fn save_mutation(&self, _mutation: &QueuedMutation) -> Result<()> {
        Ok(())
    }

    async fn delete_mutation(&self, _key: &IdempotencyKey) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn persistence_failure_still_notifies_subscribers() {
    let pipeline = EventPipeline::builder()
        .build(Arc::new(BrokenStore), 8)
        .expect("pipeline");
    let mut rx = pipeline.subscribe();

    pipeline
        .process(EventEnvelope::new(ServerEvent::ChannelDeleted {
            channel_id: ChannelId(4),
        }))
        .await;

    assert_eq!(rx.recv().await.expect("event").kind(), "channel_deleted");
}
