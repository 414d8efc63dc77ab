//! Remote-first, local-fallback commit of finalized records.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db::{PendingStore, StoreError};
use crate::model::{CommitOutcome, RecordKind, RepairLogEntry, Session};
use crate::remote::RemoteStore;
use crate::sync::push_record;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Neither the remote store nor the local queue accepted the record.
    #[error("sync unavailable: {0}")]
    Storage(#[from] StoreError),
    #[error("record cannot be serialized: {0}")]
    Payload(#[from] serde_json::Error),
}

pub struct SessionCommitGateway {
    store: PendingStore,
    remote: Arc<dyn RemoteStore>,
    write_timeout: Duration,
}

impl SessionCommitGateway {
    pub fn new(store: PendingStore, remote: Arc<dyn RemoteStore>, write_timeout: Duration) -> Self {
        Self {
            store,
            remote,
            write_timeout,
        }
    }

    pub async fn commit_session(&self, session: &Session) -> Result<CommitOutcome, GatewayError> {
        self.commit(RecordKind::Session, session).await
    }

    pub async fn commit_repair_log(
        &self,
        entry: &RepairLogEntry,
    ) -> Result<CommitOutcome, GatewayError> {
        self.commit(RecordKind::RepairLog, entry).await
    }

    #[instrument(skip_all, fields(kind = kind.as_str()))]
    async fn commit<T: Serialize>(
        &self,
        kind: RecordKind,
        record: &T,
    ) -> Result<CommitOutcome, GatewayError> {
        let remote_id = Uuid::new_v4().to_string();
        let mut payload = serde_json::to_value(record)?;
        if let Value::Object(map) = &mut payload {
            map.insert("id".into(), Value::String(remote_id.clone()));
        }

        match push_record(
            self.remote.as_ref(),
            kind,
            &remote_id,
            &payload,
            self.write_timeout,
        )
        .await
        {
            Ok(()) => {
                info!(%remote_id, "record written to remote store");
                Ok(CommitOutcome::Remote)
            }
            Err(err) => {
                // On a timeout the write may already be stored remotely; the
                // queued copy reuses `remote_id` so the retry overwrites it.
                let local_id = self.store.enqueue(kind, &remote_id, &payload).await?;
                warn!(%err, %remote_id, local_id, "remote write failed; record queued");
                Ok(CommitOutcome::Queued)
            }
        }
    }
}
