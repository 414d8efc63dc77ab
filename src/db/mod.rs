//! Pending record store: the device-local durable queue.
//!
//! This module is split into:
//! - `model`: view models returned by queries.
//! - `repo`: SQL-only functions over a SQLite pool.
//! - [`PendingStore`]: the serialized handle the gateway and the sync
//!   coordinator share.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::model::{PendingRecord, RecordKind};

pub mod model;
pub mod repo;

pub use model::QueueStats;
pub use repo::*;

/// Local storage failure. Fatal to the sync subsystem; never swallowed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("payload serialization error: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("pending record {local_id} is corrupt: {reason}")]
    Corrupt { local_id: i64, reason: String },
}

/// Shared handle to the pending queue. Every operation runs under one async
/// lock so a drain and a gateway enqueue never interleave.
#[derive(Debug, Clone)]
pub struct PendingStore {
    pool: Pool,
    lock: Arc<Mutex<()>>,
}

impl PendingStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Open (creating if needed) the database at `database_url` and migrate it.
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let pool = repo::init_pool(database_url).await?;
        repo::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub async fn enqueue(
        &self,
        kind: RecordKind,
        remote_id: &str,
        payload: &serde_json::Value,
    ) -> Result<i64, StoreError> {
        let _guard = self.lock.lock().await;
        repo::enqueue_pending(&self.pool, kind, remote_id, payload).await
    }

    pub async fn list_all(&self) -> Result<Vec<PendingRecord>, StoreError> {
        let _guard = self.lock.lock().await;
        repo::list_pending(&self.pool).await
    }

    pub async fn remove_by_local_id(&self, local_id: i64) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        repo::delete_pending(&self.pool, local_id).await
    }

    pub async fn record_failure(&self, local_id: i64, error: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        repo::record_failure(&self.pool, local_id, error).await
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let _guard = self.lock.lock().await;
        repo::count_pending(&self.pool).await
    }

    pub async fn stats(&self) -> Result<QueueStats, StoreError> {
        let _guard = self.lock.lock().await;
        repo::queue_stats(&self.pool).await
    }
}
