use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::fanout::{FanoutHub, ViewerId, ViewerInfo};
use crate::serializer::ModelSerializer;

/// Answers snapshot requests and pushes catch-up snapshots. Every snapshot is
/// cut through the model serializer, so it sits at a well-defined point in
/// the chunk stream; the hub then splices it in front of the held chunks.
#[derive(Clone)]
pub struct ResyncCoordinator {
    hub: FanoutHub,
    serializer: Arc<ModelSerializer>,
}

impl ResyncCoordinator {
    pub fn new(hub: FanoutHub, serializer: Arc<ModelSerializer>) -> Self {
        Self { hub, serializer }
    }

    /// Returns `true` if this call delivered a snapshot. A request folded
    /// into an outstanding ticket returns `false`; that ticket's snapshot
    /// serves it.
    pub async fn request_snapshot(&self, id: ViewerId, reason: &str) -> bool {
        if !self.hub.begin_snapshot(id) {
            debug!(target: "pier::resync", viewer = %id, reason, "snapshot request coalesced");
            return false;
        }
        self.deliver(&[id], reason).await > 0
    }

    /// Cuts one snapshot and delivers it to every viewer matching `predicate`.
    pub async fn broadcast_snapshot<P>(&self, predicate: P, reason: &str) -> usize
    where
        P: Fn(&ViewerInfo) -> bool,
    {
        let ids = self.hub.begin_snapshot_matching(predicate);
        if ids.is_empty() {
            return 0;
        }
        self.deliver(&ids, reason).await
    }

    async fn deliver(&self, ids: &[ViewerId], reason: &str) -> usize {
        match self.serializer.snapshot().await {
            Ok(snapshot) => {
                let delivered = self.hub.complete_snapshot(ids, &snapshot);
                debug!(
                    target: "pier::resync",
                    reason,
                    requested = ids.len(),
                    delivered,
                    seq = ?snapshot.seq,
                    "snapshot delivered"
                );
                delivered
            }
            Err(err) => {
                counter!("beach_pier_snapshot_failures_total", 1);
                warn!(target: "pier::resync", reason, error = %err, "snapshot failed");
                self.hub.fail_snapshot(ids);
                0
            }
        }
    }

    /// Serves catch-up tickets the hub issued on its own, batching whatever
    /// is queued into a single snapshot.
    pub fn spawn_recovery(&self, mut queue: mpsc::UnboundedReceiver<ViewerId>) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            while let Some(first) = queue.recv().await {
                let mut ids = vec![first];
                while let Ok(id) = queue.try_recv() {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
                coordinator.deliver(&ids, "backpressure").await;
            }
        })
    }

    /// Periodically refreshes every viewer. Disabled for a zero interval.
    pub fn spawn_refresher(&self, every: Duration) -> Option<JoinHandle<()>> {
        if every.is_zero() {
            return None;
        }
        let coordinator = self.clone();
        let mut ticker = time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(tokio::spawn(async move {
            loop {
                ticker.tick().await;
                if coordinator.hub.is_empty() {
                    continue;
                }
                coordinator.broadcast_snapshot(|_| true, "periodic").await;
            }
        }))
    }
}
