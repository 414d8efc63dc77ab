//! Wires the depot components around one pending store and one remote store.

use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::activity::ActivityLog;
use crate::config::Config;
use crate::connectivity::{spawn_probe, Connectivity, ConnectivityMonitor};
use crate::db::{PendingStore, StoreError};
use crate::distribution::DistributionEngine;
use crate::gateway::SessionCommitGateway;
use crate::remote::{HttpRemoteStore, RemoteError, RemoteStore};
use crate::sync::SyncCoordinator;

#[derive(Debug, Error)]
pub enum OpenError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("remote client setup failed: {0}")]
    Remote(#[from] RemoteError),
}

pub struct Depot {
    pub store: PendingStore,
    pub remote: Arc<dyn RemoteStore>,
    pub gateway: SessionCommitGateway,
    pub coordinator: Arc<SyncCoordinator>,
    pub engine: DistributionEngine,
    pub activity: ActivityLog,
    pub monitor: Arc<ConnectivityMonitor>,
    cfg: Config,
}

impl Depot {
    /// Open the local queue at the configured location and connect to the
    /// configured remote store.
    pub async fn open(cfg: &Config) -> Result<Self, OpenError> {
        let remote: Arc<dyn RemoteStore> = Arc::new(HttpRemoteStore::from_config(&cfg.remote)?);
        let store = PendingStore::open(&cfg.database_url()).await?;
        Ok(Self::with_parts(cfg, store, remote))
    }

    pub fn with_parts(cfg: &Config, store: PendingStore, remote: Arc<dyn RemoteStore>) -> Self {
        let write_timeout = cfg.write_timeout();
        Self {
            gateway: SessionCommitGateway::new(store.clone(), remote.clone(), write_timeout),
            coordinator: Arc::new(SyncCoordinator::new(
                store.clone(),
                remote.clone(),
                write_timeout,
            )),
            engine: DistributionEngine::new(remote.clone(), cfg.retry_policy()),
            activity: ActivityLog::new(remote.clone(), cfg.audit.admins.clone()),
            monitor: Arc::new(ConnectivityMonitor::new(Connectivity::Lost)),
            store,
            remote,
            cfg: cfg.clone(),
        }
    }

    /// Start the connectivity probe and the sync coordinator. Both run until
    /// the returned handles are aborted.
    pub fn spawn_background(&self) -> (JoinHandle<()>, JoinHandle<()>) {
        let probe = spawn_probe(
            self.monitor.clone(),
            self.remote.clone(),
            self.cfg.probe_interval(),
        );
        let sync = tokio::spawn(self.coordinator.clone().run(self.monitor.subscribe()));
        (probe, sync)
    }
}
