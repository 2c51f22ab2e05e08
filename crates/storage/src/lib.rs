use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{IdempotencyKey, ResourceScope},
    protocol::{EventEnvelope, QueuedMutation},
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use tokio::sync::Mutex;

/// Durable local state consumed by the client core.
///
/// Implementations must be crash-safe: once `save_mutation` returns the
/// mutation survives a restart until `delete_mutation` is called for its key.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn apply_event(&self, envelope: &EventEnvelope) -> Result<()>;
    async fn load_pending_mutations(&self) -> Result<Vec<QueuedMutation>>;
    async fn save_mutation(&self, mutation: &QueuedMutation) -> Result<()>;
    async fn delete_mutation(&self, key: &IdempotencyKey) -> Result<()>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub envelope_id: String,
    pub parent_id: Option<String>,
    pub scope: Option<ResourceScope>,
    pub event_type: String,
    pub received_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool_options = if is_memory_url(database_url) {
            // Every connection to `:memory:` opens a fresh database.
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn list_applied_events(&self, scope: Option<&ResourceScope>) -> Result<Vec<StoredEvent>> {
        let rows = match scope {
            Some(scope) => {
                sqlx::query(
                    "SELECT envelope_id, parent_id, scope, event_type, received_at
                     FROM applied_events WHERE scope = ? ORDER BY rowid",
                )
                .bind(scope.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT envelope_id, parent_id, scope, event_type, received_at
                     FROM applied_events ORDER BY rowid",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter()
            .map(|row| -> Result<StoredEvent> {
                let received_at: String = row.try_get("received_at")?;
                Ok(StoredEvent {
                    envelope_id: row.try_get("envelope_id")?,
                    parent_id: row.try_get("parent_id")?,
                    scope: row
                        .try_get::<Option<String>, _>("scope")?
                        .map(ResourceScope::new),
                    event_type: row.try_get("event_type")?,
                    received_at: parse_timestamp(&received_at)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl LocalStore for Storage {
    async fn apply_event(&self, envelope: &EventEnvelope) -> Result<()> {
        let payload_json =
            serde_json::to_string(envelope.event()).context("failed to encode event payload")?;
        sqlx::query(
            "INSERT INTO applied_events (envelope_id, parent_id, scope, event_type, payload_json, received_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(envelope_id) DO NOTHING",
        )
        .bind(envelope.id().to_string())
        .bind(envelope.parent_id().map(|id| id.to_string()))
        .bind(envelope.scope().map(|scope| scope.as_str().to_owned()))
        .bind(envelope.kind())
        .bind(payload_json)
        .bind(envelope.timestamp().to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to apply event {}", envelope.id()))?;
        Ok(())
    }

    async fn load_pending_mutations(&self) -> Result<Vec<QueuedMutation>> {
        let rows = sqlx::query(
            "SELECT idempotency_key, sequence, scope, intent_json, enqueued_at, attempt, max_age_secs
             FROM pending_mutations ORDER BY sequence",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to load pending mutations")?;

        let mut mutations = Vec::with_capacity(rows.len());
        for row in rows {
            let intent_json: String = row.try_get("intent_json")?;
            let enqueued_at: String = row.try_get("enqueued_at")?;
            let sequence: i64 = row.try_get("sequence")?;
            let attempt: i64 = row.try_get("attempt")?;
            let max_age_secs: i64 = row.try_get("max_age_secs")?;
            mutations.push(QueuedMutation {
                idempotency_key: IdempotencyKey::new(row.try_get::<String, _>("idempotency_key")?),
                sequence: sequence.max(0) as u64,
                scope: ResourceScope::new(row.try_get::<String, _>("scope")?),
                intent: serde_json::from_str(&intent_json)
                    .context("failed to decode queued intent")?,
                enqueued_at: parse_timestamp(&enqueued_at)?,
                attempt: attempt.clamp(0, i64::from(u32::MAX)) as u32,
                max_age: Duration::from_secs(max_age_secs.max(0) as u64),
            });
        }
        Ok(mutations)
    }

    async fn save_mutation(&self, mutation: &QueuedMutation) -> Result<()> {
        let intent_json =
            serde_json::to_string(&mutation.intent).context("failed to encode queued intent")?;
        sqlx::query(
            "INSERT INTO pending_mutations (idempotency_key, sequence, scope, intent_json, enqueued_at, attempt, max_age_secs)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(idempotency_key) DO UPDATE SET
                scope = excluded.scope,
                intent_json = excluded.intent_json,
                attempt = excluded.attempt,
                max_age_secs = excluded.max_age_secs",
        )
        .bind(mutation.idempotency_key.as_str())
        .bind(i64::try_from(mutation.sequence).unwrap_or(i64::MAX))
        .bind(mutation.scope.as_str())
        .bind(intent_json)
        .bind(mutation.enqueued_at.to_rfc3339())
        .bind(i64::from(mutation.attempt))
        .bind(i64::try_from(mutation.max_age.as_secs()).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save mutation {}", mutation.idempotency_key))?;
        Ok(())
    }

    async fn delete_mutation(&self, key: &IdempotencyKey) -> Result<()> {
        sqlx::query("DELETE FROM pending_mutations WHERE idempotency_key = ?")
            .bind(key.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete mutation {key}"))?;
        Ok(())
    }
}

/// Volatile store for tests and `--ephemeral` runs.
#[derive(Default)]
pub struct MemoryStore {
    events: Mutex<Vec<EventEnvelope>>,
    mutations: Mutex<BTreeMap<IdempotencyKey, QueuedMutation>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn applied_events(&self) -> Vec<EventEnvelope> {
        self.events.lock().await.clone()
    }

    pub async fn stored_mutations(&self) -> Vec<QueuedMutation> {
        let mut mutations: Vec<_> = self.mutations.lock().await.values().cloned().collect();
        mutations.sort_by_key(|mutation| mutation.sequence);
        mutations
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn apply_event(&self, envelope: &EventEnvelope) -> Result<()> {
        self.events.lock().await.push(envelope.clone());
        Ok(())
    }

    async fn load_pending_mutations(&self) -> Result<Vec<QueuedMutation>> {
        Ok(self.stored_mutations().await)
    }

    async fn save_mutation(&self, mutation: &QueuedMutation) -> Result<()> {
        self.mutations
            .lock()
            .await
            .insert(mutation.idempotency_key.clone(), mutation.clone());
        Ok(())
    }

    async fn delete_mutation(&self, key: &IdempotencyKey) -> Result<()> {
        self.mutations.lock().await.remove(key);
        Ok(())
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid timestamp '{raw}'"))?
        .with_timezone(&Utc))
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
