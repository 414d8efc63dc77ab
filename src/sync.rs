//! Drains the pending record store into the remote store.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::connectivity::Connectivity;
use crate::db::{PendingStore, StoreError};
use crate::model::RecordKind;
use crate::remote::{DocRef, RemoteError, RemoteStore};

/// Write a record under its idempotency key. Used for both the direct commit
/// and every later retry, so a repeated write overwrites instead of duplicating.
pub(crate) async fn push_record(
    remote: &dyn RemoteStore,
    kind: RecordKind,
    remote_id: &str,
    payload: &Value,
    timeout: Duration,
) -> Result<(), RemoteError> {
    let doc = DocRef::new(kind.collection(), remote_id);
    match tokio::time::timeout(timeout, remote.set(doc, payload.clone())).await {
        Ok(res) => res,
        Err(_) => Err(RemoteError::Timeout(timeout)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Draining,
    /// Local storage failed; pending records cannot be read or removed.
    Unavailable { reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another drain held the flag; nothing was done.
    Skipped,
    Completed(DrainReport),
}

/// Clears the drain flag however the drain ends, including cancellation. A
/// drain dropped mid-way also takes the status back from `Draining` to `Idle`.
struct DrainGuard<'a> {
    flag: &'a AtomicBool,
    status: &'a watch::Sender<SyncStatus>,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.status.send_if_modified(|s| {
            if *s == SyncStatus::Draining {
                *s = SyncStatus::Idle;
                true
            } else {
                false
            }
        });
        self.flag.store(false, Ordering::Release);
    }
}

pub struct SyncCoordinator {
    store: PendingStore,
    remote: Arc<dyn RemoteStore>,
    write_timeout: Duration,
    draining: AtomicBool,
    status: watch::Sender<SyncStatus>,
}

impl SyncCoordinator {
    pub fn new(store: PendingStore, remote: Arc<dyn RemoteStore>, write_timeout: Duration) -> Self {
        let (status, _rx) = watch::channel(SyncStatus::Idle);
        Self {
            store,
            remote,
            write_timeout,
            draining: AtomicBool::new(false),
            status,
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Apply every pending record, oldest first. A second call while a drain
    /// is running returns [`DrainOutcome::Skipped`] immediately.
    #[instrument(skip_all)]
    pub async fn drain(&self) -> Result<DrainOutcome, StoreError> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("drain already running; trigger ignored");
            return Ok(DrainOutcome::Skipped);
        }
        let _guard = DrainGuard {
            flag: &self.draining,
            status: &self.status,
        };
        self.status.send_replace(SyncStatus::Draining);

        match self.drain_records().await {
            Ok(report) => {
                self.status.send_replace(SyncStatus::Idle);
                Ok(DrainOutcome::Completed(report))
            }
            Err(err) => {
                error!(%err, "local storage failed; sync unavailable");
                self.status.send_replace(SyncStatus::Unavailable {
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn drain_records(&self) -> Result<DrainReport, StoreError> {
        let records = self.store.list_all().await?;
        let mut report = DrainReport::default();
        if records.is_empty() {
            return Ok(report);
        }
        info!(pending = records.len(), "draining pending records");

        for rec in records {
            let res = push_record(
                self.remote.as_ref(),
                rec.kind,
                &rec.remote_id,
                &rec.payload,
                self.write_timeout,
            )
            .await;
            match res {
                Ok(()) => {
                    self.store.remove_by_local_id(rec.local_id).await?;
                    report.applied += 1;
                    info!(
                        local_id = rec.local_id,
                        remote_id = %rec.remote_id,
                        kind = rec.kind.as_str(),
                        "pending record synced"
                    );
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        %err,
                        local_id = rec.local_id,
                        remote_id = %rec.remote_id,
                        attempt = rec.attempt,
                        "pending record failed; left in queue"
                    );
                    self.store
                        .record_failure(rec.local_id, &err.to_string())
                        .await?;
                }
            }
        }
        info!(applied = report.applied, failed = report.failed, "drain finished");
        Ok(report)
    }

    fn spawn_drain(self: &Arc<Self>, trigger: &'static str) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.drain().await {
                Ok(DrainOutcome::Skipped) => {}
                Ok(DrainOutcome::Completed(report)) => {
                    info!(trigger, applied = report.applied, failed = report.failed, "drain complete")
                }
                Err(err) => error!(trigger, %err, "drain aborted"),
            }
        });
    }

    /// Drain once at startup, then on every transition to `Available`.
    /// Returns when the connectivity source is dropped.
    pub async fn run(self: Arc<Self>, mut connectivity: watch::Receiver<Connectivity>) {
        self.spawn_drain("startup");
        while connectivity.changed().await.is_ok() {
            let state = *connectivity.borrow_and_update();
            if state == Connectivity::Available {
                self.spawn_drain("connectivity");
            }
        }
        info!("connectivity source closed; sync coordinator stopping");
    }
}
