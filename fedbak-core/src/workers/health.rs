use crate::data::DataStore;
use crate::error::Result;
use crate::fed_client::FederationClient;
use crate::metadata_store::{BlockMeta, MetadataStore};
use crate::verify::check_integrity;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

const TICK: Duration = Duration::from_secs(60);

struct SamplerState {
    /// Ticks since the last active run.
    counter: u64,
    /// Block ids not yet sampled in the current pass. Refilled from
    /// the full block set and shuffled once drained.
    pool: Vec<String>,
}

/// Re-verifies a random slice of the replicated blocks on a slower
/// cadence than placement, so silent corruption on a peer is noticed
/// without re-reading everything every hour. Each active run samples
/// `percent` of the blocks; a block leaves the sampling pool only
/// when every one of its replicas answered the challenge correctly.
pub struct HealthWorker {
    store: Arc<dyn MetadataStore>,
    data: Arc<DataStore>,
    fed: Arc<dyn FederationClient>,
    percent: u8,
    /// Minutes between active runs.
    interval: u64,
    /// The try-lock doubles as the skip-if-running guard.
    state: tokio::sync::Mutex<SamplerState>,
}

impl HealthWorker {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        data: Arc<DataStore>,
        fed: Arc<dyn FederationClient>,
        percent: u8,
        interval: u64,
    ) -> Self {
        Self {
            store,
            data,
            fed,
            percent,
            interval: interval.max(1),
            state: tokio::sync::Mutex::new(SamplerState {
                counter: 0,
                pool: Vec::new(),
            }),
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.tick().await {
                error!(%err, "health sampling run failed");
            }
        }
    }

    /// One minute-tick: usually just advances the counter, every
    /// `interval` ticks it samples.
    pub async fn tick(&self) -> Result<()> {
        let Ok(mut state) = self.state.try_lock() else {
            debug!("health sampling still active; skipping tick");
            return Ok(());
        };

        state.counter += 1;
        if state.counter < self.interval {
            return Ok(());
        }
        state.counter = 0;
        self.sample(&mut state).await
    }

    async fn sample(&self, state: &mut SamplerState) -> Result<()> {
        let blocks = self.store.list_blocks()?;
        let amount = blocks.len() * self.percent as usize / 100;

        if state.pool.is_empty() {
            state.pool = blocks.iter().map(|block| block.id.clone()).collect();
            state.pool.shuffle(&mut rand::rng());
        }

        let mut sampled = 0;
        while sampled < amount {
            let Some(id) = state.pool.pop() else {
                break;
            };
            sampled += 1;
            // The block may be gone since the pool was refilled.
            let Some(block) = blocks.iter().find(|block| block.id == id) else {
                continue;
            };
            if !self.all_replicas_healthy(block).await {
                // Back to the far end of the pool: retried only after
                // the rest of the pass.
                state.pool.insert(0, id);
            }
        }
        Ok(())
    }

    /// Challenges every replica; no short-circuit, so one bad peer
    /// does not hide a second one.
    async fn all_replicas_healthy(&self, block: &BlockMeta) -> bool {
        let payload = match self.data.read_block(self.store.as_ref(), block).await {
            Ok(payload) => payload,
            Err(err) => {
                warn!(block = %block.id, %err, "could not assemble block for sampling");
                return false;
            }
        };

        let mut all_ok = true;
        for (peer, remote_id) in &block.server_to_id {
            match check_integrity(self.fed.as_ref(), peer, remote_id, &payload).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(peer, block = %block.id, "replica failed health check");
                    all_ok = false;
                }
                Err(err) => {
                    warn!(peer, block = %block.id, %err, "replica health check unreachable");
                    all_ok = false;
                }
            }
        }
        all_ok
    }

    #[cfg(test)]
    async fn pool_len(&self) -> usize {
        self.state.lock().await.pool.len()
    }
}
