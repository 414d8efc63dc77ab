//! Append-only audit stream of distribution-affecting actions.

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::model::{collections, ActivityAction, ActivityLogEntry};
use crate::remote::{DocRef, Precondition, RemoteError, RemoteStore, Write};

#[derive(Debug, Error)]
pub enum ActivityError {
    #[error("{0} is not allowed to clear the activity log")]
    Unauthorized(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Build a new entry and the write that stores it. Callers put the write in
/// the same batch as the action it describes.
pub fn entry_write(
    actor: &str,
    action: ActivityAction,
    bucket_id: Option<&str>,
    item_count: usize,
    duplicate_count: usize,
) -> Result<(ActivityLogEntry, Write), RemoteError> {
    let entry = ActivityLogEntry {
        id: Uuid::new_v4().to_string(),
        actor: actor.to_string(),
        action,
        bucket_id: bucket_id.map(str::to_string),
        item_count: u32::try_from(item_count).unwrap_or(u32::MAX),
        duplicate_count: u32::try_from(duplicate_count).unwrap_or(u32::MAX),
        timestamp: Utc::now(),
    };
    let data = serde_json::to_value(&entry).map_err(|err| RemoteError::Malformed {
        doc: format!("{}/{}", collections::ACTIVITY_LOG, entry.id),
        message: err.to_string(),
    })?;
    let write = Write::set(DocRef::new(collections::ACTIVITY_LOG, entry.id.clone()), data)
        .when(Precondition::Missing);
    Ok((entry, write))
}

pub struct ActivityLog {
    remote: Arc<dyn RemoteStore>,
    admins: Vec<String>,
}

impl ActivityLog {
    pub fn new(remote: Arc<dyn RemoteStore>, admins: Vec<String>) -> Self {
        Self { remote, admins }
    }

    pub fn is_admin(&self, actor: &str) -> bool {
        self.admins.iter().any(|a| a == actor)
    }

    /// Newest entries first.
    #[instrument(skip_all)]
    pub async fn recent(&self, limit: usize) -> Result<Vec<ActivityLogEntry>, RemoteError> {
        let docs = self.remote.list(collections::ACTIVITY_LOG).await?;
        let mut entries = docs
            .iter()
            .map(|d| d.decode::<ActivityLogEntry>(collections::ACTIVITY_LOG))
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        entries.truncate(limit);
        Ok(entries)
    }

    /// Delete every entry. Returns how many were removed; clearing an empty
    /// log is a successful no-op.
    #[instrument(skip_all, fields(actor = %actor))]
    pub async fn clear(&self, actor: &str) -> Result<usize, ActivityError> {
        if !self.is_admin(actor) {
            warn!(actor, "unauthorized activity log clear");
            return Err(ActivityError::Unauthorized(actor.to_string()));
        }
        let docs = self.remote.list(collections::ACTIVITY_LOG).await?;
        let limit = self.remote.max_batch_writes().max(1);
        for chunk in docs.chunks(limit) {
            let writes = chunk
                .iter()
                .map(|d| Write::delete(DocRef::new(collections::ACTIVITY_LOG, d.id.clone())))
                .collect();
            self.remote.commit(writes).await?;
        }
        info!(actor, removed = docs.len(), "activity log cleared");
        Ok(docs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemoteStore;

    #[tokio::test]
    async fn clear_requires_admin_and_is_idempotent() {
        let remote = Arc::new(MemoryRemoteStore::new(30, 2));
        let log = ActivityLog::new(remote.clone(), vec!["boss".into()]);
        for _ in 0..3 {
            let (_, w) = entry_write("op", ActivityAction::Distribute, Some("P1"), 1, 0).unwrap();
            remote.commit(vec![w]).await.unwrap();
        }

        assert!(matches!(
            log.clear("op").await,
            Err(ActivityError::Unauthorized(_))
        ));
        assert_eq!(remote.count(collections::ACTIVITY_LOG), 3);

        assert_eq!(log.clear("boss").await.unwrap(), 3);
        assert_eq!(log.clear("boss").await.unwrap(), 0);
        assert!(log.recent(10).await.unwrap().is_empty());
    }
}
