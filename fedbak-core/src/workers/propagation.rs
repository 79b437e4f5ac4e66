use crate::data::DataStore;
use crate::fed_client::{BackupClient, FederationClient};
use crate::metadata_store::{BlockMeta, MetadataStore};
use crate::verify::check_integrity;
use crate::workers::queue::{ChangeQueue, ChangeReceiver};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Pushes queued block changes out to the peers holding replicas.
/// A snapshot whose block no longer exists locally means the remote
/// copies must go; a live block means the remote copies must be
/// refreshed and re-verified. Failed refreshes are re-enqueued, so
/// updates reach every replica at least once.
pub struct PropagationWorker {
    store: Arc<dyn MetadataStore>,
    data: Arc<DataStore>,
    fed: Arc<dyn FederationClient>,
    backup: Arc<dyn BackupClient>,
    queue: ChangeQueue,
    /// The try-lock doubles as the skip-if-running guard.
    receiver: tokio::sync::Mutex<ChangeReceiver>,
    interval: Duration,
}

impl PropagationWorker {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        data: Arc<DataStore>,
        fed: Arc<dyn FederationClient>,
        backup: Arc<dyn BackupClient>,
        queue: ChangeQueue,
        receiver: ChangeReceiver,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            data,
            fed,
            backup,
            queue,
            receiver: tokio::sync::Mutex::new(receiver),
            interval,
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// Drains the queue and handles every snapshot. A snapshot that
    /// fails is re-enqueued on its own; the rest of the batch still
    /// goes out.
    pub async fn tick(&self) {
        let Ok(mut receiver) = self.receiver.try_lock() else {
            debug!("propagation run still active; skipping tick");
            return;
        };

        for snapshot in receiver.drain() {
            match self.store.get_block(&snapshot.id) {
                Ok(None) => self.propagate_delete(&snapshot).await,
                Ok(Some(current)) => self.propagate_update(current).await,
                Err(err) => {
                    error!(block = %snapshot.id, %err,
                        "could not load block state; change re-queued");
                    self.queue.push(snapshot);
                }
            }
        }
    }

    /// The block is gone locally; remove its remote copies. A peer
    /// answering NotFound already lost the copy, which is the outcome
    /// we want. Other failures leave the remote copy behind; they are
    /// logged but not re-queued, so the stray copy lingers until the
    /// peer is deleted or re-verifies against a fresh reservation.
    async fn propagate_delete(&self, snapshot: &BlockMeta) {
        for (peer, remote_id) in &snapshot.server_to_id {
            match self.fed.delete_block(peer, remote_id).await {
                Ok(()) => info!(peer, block = %snapshot.id, "remote replica deleted"),
                Err(err) if err.is_not_found() => {
                    debug!(peer, block = %snapshot.id, "remote replica already gone")
                }
                Err(err) => warn!(peer, block = %snapshot.id, %err,
                    "remote replica delete failed; stray copy may remain"),
            }
        }
    }

    /// Refreshes every replica of a live block. Any replica that
    /// cannot be refreshed and verified puts the block back on the
    /// queue for the next tick.
    async fn propagate_update(&self, block: BlockMeta) {
        if block.server_to_id.is_empty() {
            return;
        }
        let payload = match self.data.read_block(self.store.as_ref(), &block).await {
            Ok(payload) => payload,
            Err(err) => {
                warn!(block = %block.id, %err,
                    "could not read block for refresh; change re-queued");
                self.queue.push(block);
                return;
            }
        };

        let mut all_verified = true;
        for (peer, remote_id) in &block.server_to_id {
            let refreshed = async {
                let token = self.fed.block_jwt(peer, remote_id).await?;
                self.backup
                    .update_block(peer, remote_id, &token, payload.clone())
                    .await?;
                check_integrity(self.fed.as_ref(), peer, remote_id, &payload).await
            }
            .await;

            match refreshed {
                Ok(true) => debug!(peer, block = %block.id, "replica refreshed"),
                Ok(false) => {
                    warn!(peer, block = %block.id, "refreshed replica failed verification");
                    all_verified = false;
                }
                Err(err) => {
                    warn!(peer, block = %block.id, %err, "replica refresh failed");
                    all_verified = false;
                }
            }
        }

        if !all_verified {
            self.queue.push(block);
        }
    }
}
