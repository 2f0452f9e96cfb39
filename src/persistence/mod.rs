//! Persistence adapter: checkpoint log plus an opaque key/value store,
//! spec.md §4.7 and §5.
//!
//! Grounded on the teacher's `sqlx`-backed storage layer (`storage/postgres.rs`
//! in the teacher, here retargeted to the embedded, WAL-mode SQLite file
//! spec.md asks for — a single-node, file-resident database is the only
//! persistence story spec.md needs, and no example repo in the pack uses
//! `sled`/`redb`/`rocksdb`; `sqlx`+`sqlite` is the nearest real dependency
//! match, also used this way by the orchestrator crate in the pack).
//! `latest_checkpoint` always queries the durable store directly — spec.md
//! §5's `Resume` is its only caller and must never read a stale in-process
//! view, so there's no read path that would legitimately want a cache.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::models::checkpoint::Checkpoint;
use crate::models::workflow::WorkflowId;
use crate::Result;

#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;
    /// The most recently captured checkpoint for a workflow, or `None` if
    /// the workflow has never checkpointed. Always reads through to the
    /// durable store — never served from cache (spec.md §5 `Resume`).
    async fn latest_checkpoint(&self, workflow_id: WorkflowId) -> Result<Option<Checkpoint>>;
    async fn put_kv(&self, key: &str, value: serde_json::Value) -> Result<()>;
    async fn get_kv(&self, key: &str) -> Result<Option<serde_json::Value>>;
}

/// SQLite-backed implementation. WAL mode is set at connect time so
/// concurrent readers don't block the single writer (spec.md §4.7's "embedded
/// file database with write-ahead logging").
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    pub async fn connect(database_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new().max_connections(8).connect_with(options).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                workflow_id TEXT NOT NULL,
                step_id INTEGER NOT NULL,
                phase TEXT NOT NULL,
                captured_at TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (workflow_id, step_id)
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        info!(database_path, "persistence store ready");
        Ok(Self { pool })
    }
}

#[async_trait]
impl PersistenceAdapter for SqlitePersistence {
    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let body = serde_json::to_string(checkpoint)?;
        let phase = serde_json::to_string(&checkpoint.phase)?;
        sqlx::query(
            "INSERT INTO checkpoints (workflow_id, step_id, phase, captured_at, body)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(workflow_id, step_id) DO UPDATE SET body = excluded.body, captured_at = excluded.captured_at",
        )
        .bind(checkpoint.workflow_id.0.to_string())
        .bind(checkpoint.step_id as i64)
        .bind(phase)
        .bind(checkpoint.captured_at.to_rfc3339())
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_checkpoint(&self, workflow_id: WorkflowId) -> Result<Option<Checkpoint>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT body FROM checkpoints WHERE workflow_id = ?1 ORDER BY captured_at DESC LIMIT 1",
        )
        .bind(workflow_id.0.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((body,)) => {
                let checkpoint: Checkpoint = serde_json::from_str(&body)?;
                Ok(Some(checkpoint))
            }
            None => Ok(None),
        }
    }

    async fn put_kv(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let serialized = serde_json::to_string(&value)?;
        sqlx::query(
            "INSERT INTO kv_store (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(serialized)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_kv(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv_store WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some((value,)) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }
}

/// In-memory implementation for tests and the scenario suite — no cache
/// bypass distinction needed since there's nothing durable to miss.
#[derive(Default)]
pub struct InMemoryPersistence {
    checkpoints: DashMap<WorkflowId, Vec<Checkpoint>>,
    kv: DashMap<String, serde_json::Value>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceAdapter for InMemoryPersistence {
    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoints.entry(checkpoint.workflow_id).or_default().push(checkpoint.clone());
        Ok(())
    }

    async fn latest_checkpoint(&self, workflow_id: WorkflowId) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoints.get(&workflow_id).and_then(|v| v.last().cloned()))
    }

    async fn put_kv(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.kv.insert(key.to_string(), value);
        Ok(())
    }

    async fn get_kv(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.kv.get(key).map(|v| v.clone()))
    }
}

pub type SharedPersistence = Arc<dyn PersistenceAdapter>;
