//! Network availability as seen by the device.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::remote::RemoteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Available,
    Lost,
}

/// Publishes connectivity transitions to any number of subscribers.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<Connectivity>,
}

impl ConnectivityMonitor {
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Connectivity {
        *self.tx.borrow()
    }

    /// Record the observed state. Subscribers are woken only on a transition.
    pub fn report(&self, state: Connectivity) -> bool {
        let changed = self.tx.send_if_modified(|cur| {
            if *cur == state {
                false
            } else {
                *cur = state;
                true
            }
        });
        if changed {
            info!(?state, "connectivity changed");
        }
        changed
    }
}

/// Ping the remote store every `interval` and report the result.
pub fn spawn_probe(
    monitor: Arc<ConnectivityMonitor>,
    remote: Arc<dyn RemoteStore>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let state = match remote.ping().await {
                Ok(()) => Connectivity::Available,
                Err(err) => {
                    if monitor.current() == Connectivity::Available {
                        warn!(%err, "remote store unreachable");
                    }
                    Connectivity::Lost
                }
            };
            monitor.report(state);
        }
    })
}
