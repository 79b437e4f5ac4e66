use crate::data::DataStore;
use crate::error::{BakError, Result};
use crate::fed_client::{BackupClient, FederationClient};
use crate::metadata_store::{BlockMeta, ExternalBlock, MetadataStore, ServerEntry};
use crate::verify::check_integrity;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Every block should live on at least this many peers.
pub const REPLICA_TARGET: usize = 2;

/// Bounded retries when picking ids for reservation records.
const RESERVE_ID_RETRIES: usize = 1000;

/// Finds under-replicated blocks and places copies on peers. Placing
/// on a peer that already reserved capacity for us is cheap (fast
/// path); otherwise capacity is exchanged first: we reserve blocks
/// for the peer locally and ask the peer to reserve for us, sized so
/// both sides commit the same number of bytes (slow path).
pub struct PlacementWorker {
    store: Arc<dyn MetadataStore>,
    data: Arc<DataStore>,
    fed: Arc<dyn FederationClient>,
    backup: Arc<dyn BackupClient>,
    interval: Duration,
    running: tokio::sync::Mutex<()>,
}

/// Units such that `own × local_size == peer × peer_size == lcm`.
/// Overflow in the lcm means the two block sizes cannot be reconciled.
pub fn reservation_units(local_size: u64, peer_size: u64) -> Result<(u64, u64)> {
    if local_size == 0 || peer_size == 0 {
        return Err(BakError::InvariantViolation(
            "block sizes must be positive".to_string(),
        ));
    }
    let lcm = (local_size / gcd(local_size, peer_size))
        .checked_mul(peer_size)
        .ok_or_else(|| {
            BakError::InvariantViolation(format!(
                "reservation sizing overflow for block sizes {local_size} and {peer_size}"
            ))
        })?;
    Ok((lcm / local_size, lcm / peer_size))
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

impl PlacementWorker {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        data: Arc<DataStore>,
        fed: Arc<dyn FederationClient>,
        backup: Arc<dyn BackupClient>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            data,
            fed,
            backup,
            interval,
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Ok(_guard) = self.running.try_lock() else {
                debug!("placement run still active; skipping tick");
                continue;
            };
            if let Err(err) = self.tick().await {
                error!(%err, "placement run failed");
            }
        }
    }

    /// One full pass over the under-replicated blocks.
    pub async fn tick(&self) -> Result<()> {
        let servers = self.store.list_servers()?;
        let now = Utc::now();

        for block in self.store.list_blocks()? {
            if block.server_to_id.len() >= REPLICA_TARGET {
                continue;
            }
            let candidates: Vec<&ServerEntry> = servers
                .iter()
                .filter(|server| self.is_candidate(&block, server, now))
                .collect();
            self.place_block(&block, &candidates).await;
        }
        Ok(())
    }

    /// Filling a slot a peer already reserved costs nothing extra, so
    /// every candidate is checked for one before any candidate gets a
    /// capacity exchange.
    async fn place_block(&self, block: &BlockMeta, candidates: &[&ServerEntry]) {
        for server in candidates {
            match self.try_fast_path(block, &server.hostname).await {
                Ok(true) => return,
                Ok(false) => {}
                Err(err) => warn!(peer = %server.hostname, block = %block.id, %err,
                    "placement attempt failed"),
            }
        }
        for server in candidates {
            match self.try_slow_path(block, &server.hostname).await {
                Ok(true) => return,
                Ok(false) => {}
                Err(err) => warn!(peer = %server.hostname, block = %block.id, %err,
                    "placement attempt failed"),
            }
        }
    }

    fn is_candidate(
        &self,
        block: &BlockMeta,
        server: &ServerEntry,
        now: chrono::DateTime<Utc>,
    ) -> bool {
        server.is_verified
            && server.healthy
            && !server.in_maintenance(now)
            && !block.server_to_id.contains_key(&server.hostname)
    }

    /// Fast path: a block the peer already reserved for us and never
    /// filled. `Ok(true)` ends the search for this block: either a
    /// copy was placed or an upload attempt was made and its outcome
    /// logged.
    async fn try_fast_path(&self, block: &BlockMeta, peer: &str) -> Result<bool> {
        let info = self.fed.server_info(peer).await?;
        if !info.is_verified {
            debug!(peer, "peer does not consider us verified; skipping");
            return Ok(false);
        }
        let remote = self.fed.list_blocks(peer).await?;
        match remote.iter().find(|b| b.last_modified == 0) {
            Some(free) => {
                self.upload_to(block, peer, &free.id).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Slow path: exchange capacity first, then upload into the fresh
    /// slot. The peer's numbers are fetched right before sizing.
    async fn try_slow_path(&self, block: &BlockMeta, peer: &str) -> Result<bool> {
        let info = self.fed.server_info(peer).await?;
        if !info.is_verified {
            return Ok(false);
        }
        let (own_units, peer_units) = reservation_units(self.data.block_size(), info.block_size)?;
        if info.free_blocks < peer_units as i64 {
            debug!(peer, "peer lacks free capacity for an exchange");
            return Ok(false);
        }
        if self.data.free_external_blocks(self.store.as_ref())? < own_units as i64 {
            debug!(peer, "not enough local capacity to reciprocate");
            return Ok(false);
        }

        let reserved = self.reserve_local(peer, own_units)?;
        if let Err(err) = self.fed.reserve_blocks(peer, peer_units).await {
            warn!(peer, %err, "peer reservation failed; rolling back local reservations");
            self.rollback_local(&reserved);
            return Ok(false);
        }

        let remote = self.fed.list_blocks(peer).await?;
        match remote.iter().find(|b| b.last_modified == 0) {
            Some(free) => {
                self.upload_to(block, peer, &free.id).await;
                Ok(true)
            }
            None => {
                warn!(peer, "reservation succeeded but no free block listed; rolling back");
                self.rollback_local(&reserved);
                Ok(false)
            }
        }
    }

    fn reserve_local(&self, peer: &str, units: u64) -> Result<Vec<String>> {
        let mut reserved = Vec::with_capacity(units as usize);
        for _ in 0..units {
            let mut retries = 0;
            loop {
                let candidate = ExternalBlock {
                    id: Uuid::new_v4().to_string(),
                    server_hostname: peer.to_string(),
                };
                if self.store.add_new_external_block(&candidate)? {
                    reserved.push(candidate.id);
                    break;
                }
                retries += 1;
                if retries >= RESERVE_ID_RETRIES {
                    self.rollback_local(&reserved);
                    return Err(BakError::InvariantViolation(
                        "could not allocate a unique reservation id".to_string(),
                    ));
                }
            }
        }
        Ok(reserved)
    }

    fn rollback_local(&self, ids: &[String]) {
        for id in ids {
            if let Err(err) = self.store.delete_external_block(id) {
                warn!(id, %err, "could not roll back local reservation");
            }
        }
    }

    /// Upload sequence: token, transfer, challenge. The replica map
    /// is only updated once the peer proves it holds matching bytes;
    /// a failed attempt is logged and the next placement run retries.
    async fn upload_to(&self, block: &BlockMeta, peer: &str, remote_id: &str) {
        match self.upload_sequence(block, peer, remote_id).await {
            Ok(true) => info!(peer, block = %block.id, remote_id, "replica placed"),
            Ok(false) => warn!(peer, block = %block.id, remote_id,
                "replica failed verification after upload; mapping not recorded"),
            Err(err) => warn!(peer, block = %block.id, remote_id, %err, "replica upload failed"),
        }
    }

    async fn upload_sequence(
        &self,
        block: &BlockMeta,
        peer: &str,
        remote_id: &str,
    ) -> Result<bool> {
        let token = self.fed.block_jwt(peer, remote_id).await?;
        let payload = self.data.read_block(self.store.as_ref(), block).await?;
        self.backup
            .upload_block(peer, remote_id, &token, payload.clone())
            .await?;
        if check_integrity(self.fed.as_ref(), peer, remote_id, &payload).await? {
            self.store.add_block_server(&block.id, peer, remote_id)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fed_client::{BlockInfo, FedInfo};
    use crate::hash::HashMethod;
    use crate::memory_store::MemoryStore;
    use crate::metadata_store::FileEntry;
    use crate::workers::test_support::MockPeerNetwork;
    use bytes::Bytes;

    const BLOCK_SIZE: u64 = 256;

    fn fed_info(hostname: &str, block_size: u64, free_blocks: i64) -> FedInfo {
        FedInfo {
            hostname: hostname.to_string(),
            owner: "owner".to_string(),
            block_size,
            free_blocks,
            healthcheck_percent: 10,
            healthcheck_interval: 60,
            hash_methods: vec![HashMethod::Sha256.name().to_string()],
            is_verified: true,
            known_server: Vec::new(),
        }
    }

    fn peer_entry(hostname: &str) -> ServerEntry {
        ServerEntry {
            hostname: hostname.to_string(),
            old_hostnames: Vec::new(),
            is_verified: true,
            healthy: true,
            maintenance: None,
            future_hostname: None,
            backup_code: "code".to_string(),
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
        data: Arc<DataStore>,
        peers: Arc<MockPeerNetwork>,
        worker: PlacementWorker,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let data = Arc::new(
            DataStore::new(dir.path().to_path_buf(), BLOCK_SIZE, BLOCK_SIZE * 16).unwrap(),
        );
        let peers = Arc::new(MockPeerNetwork::new());
        let worker = PlacementWorker::new(
            store.clone(),
            data.clone(),
            peers.clone(),
            peers.clone(),
            Duration::from_secs(600),
        );
        Fixture {
            _dir: dir,
            store,
            data,
            peers,
            worker,
        }
    }

    async fn seed_block(fixture: &Fixture) -> BlockMeta {
        let file = FileEntry {
            id: "f1".to_string(),
            path: "notes.txt".to_string(),
        };
        fixture.store.add_new_file(&file).unwrap();
        let blocks = fixture
            .data
            .create_file(fixture.store.as_ref(), &file, Bytes::from(vec![7u8; 100]))
            .await
            .unwrap();
        assert_eq!(blocks.len(), 1);
        blocks.into_iter().next().unwrap()
    }

    #[test]
    fn test_reservation_units_match_lcm() {
        for (a, b) in [(1, 1), (4, 6), (7, 13), (256, 768), (1024, 1024)] {
            let (own, peer) = reservation_units(a, b).unwrap();
            assert_eq!(own * a, peer * b);
            assert_eq!(own, b / gcd(a, b));
            assert_eq!(peer, a / gcd(a, b));
        }
    }

    #[test]
    fn test_reservation_units_overflow_is_fatal() {
        let err = reservation_units(u64::MAX - 1, u64::MAX - 2).unwrap_err();
        assert!(matches!(err, BakError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn test_fast_path_prefers_free_remote_slot() {
        let fixture = fixture();
        let block = seed_block(&fixture).await;

        // p1 has a free reserved slot; p2 would need a slow-path
        // exchange at triple the block size.
        fixture.store.add_new_server(&peer_entry("p1")).unwrap();
        fixture.store.add_new_server(&peer_entry("p2")).unwrap();
        fixture.peers.add_peer("p1", fed_info("p1", BLOCK_SIZE, 4));
        fixture
            .peers
            .add_peer("p2", fed_info("p2", BLOCK_SIZE * 3, 4));
        fixture.peers.script_lists(
            "p1",
            vec![vec![
                BlockInfo {
                    id: "used".to_string(),
                    last_modified: 1000,
                },
                BlockInfo {
                    id: "free-slot".to_string(),
                    last_modified: 0,
                },
            ]],
        );

        fixture.worker.tick().await.unwrap();

        assert!(fixture.peers.reserve_calls.lock().unwrap().is_empty());
        assert_eq!(
            *fixture.peers.upload_calls.lock().unwrap(),
            vec![("p1".to_string(), "free-slot".to_string())]
        );
        let stored = fixture.store.get_block(&block.id).unwrap().unwrap();
        assert_eq!(stored.server_to_id.get("p1").unwrap(), "free-slot");
    }

    #[tokio::test]
    async fn test_free_slot_on_later_candidate_beats_capacity_exchange() {
        let fixture = fixture();
        let block = seed_block(&fixture).await;

        // "a" sorts first and would accept an exchange; "b" already
        // holds a free reserved slot for us. No reservation should
        // happen on either side.
        fixture.store.add_new_server(&peer_entry("a")).unwrap();
        fixture.store.add_new_server(&peer_entry("b")).unwrap();
        fixture.peers.add_peer("a", fed_info("a", BLOCK_SIZE, 4));
        fixture.peers.add_peer("b", fed_info("b", BLOCK_SIZE, 4));
        fixture.peers.script_lists("a", vec![Vec::new()]);
        fixture.peers.script_lists(
            "b",
            vec![vec![BlockInfo {
                id: "free-slot".to_string(),
                last_modified: 0,
            }]],
        );

        fixture.worker.tick().await.unwrap();

        assert!(fixture.peers.reserve_calls.lock().unwrap().is_empty());
        assert!(fixture.store.list_external_blocks().unwrap().is_empty());
        assert_eq!(
            *fixture.peers.upload_calls.lock().unwrap(),
            vec![("b".to_string(), "free-slot".to_string())]
        );
        let stored = fixture.store.get_block(&block.id).unwrap().unwrap();
        assert_eq!(stored.server_to_id.get("b").unwrap(), "free-slot");
    }

    #[tokio::test]
    async fn test_slow_path_exchanges_capacity_then_uploads() {
        let fixture = fixture();
        let block = seed_block(&fixture).await;

        fixture.store.add_new_server(&peer_entry("p1")).unwrap();
        // Peer blocks are 3x ours: we owe 3 local units, it owes 1.
        fixture
            .peers
            .add_peer("p1", fed_info("p1", BLOCK_SIZE * 3, 5));
        fixture.peers.script_lists(
            "p1",
            vec![
                Vec::new(),
                vec![BlockInfo {
                    id: "r1".to_string(),
                    last_modified: 0,
                }],
            ],
        );

        fixture.worker.tick().await.unwrap();

        assert_eq!(
            *fixture.peers.reserve_calls.lock().unwrap(),
            vec![("p1".to_string(), 1)]
        );
        let local = fixture.store.list_external_blocks_for("p1").unwrap();
        assert_eq!(local.len(), 3);
        let stored = fixture.store.get_block(&block.id).unwrap().unwrap();
        assert_eq!(stored.server_to_id.get("p1").unwrap(), "r1");
    }

    #[tokio::test]
    async fn test_slow_path_rolls_back_when_peer_reservation_fails() {
        let fixture = fixture();
        let block = seed_block(&fixture).await;

        fixture.store.add_new_server(&peer_entry("p1")).unwrap();
        fixture.peers.add_peer("p1", fed_info("p1", BLOCK_SIZE, 5));
        fixture.peers.script_lists("p1", vec![Vec::new()]);
        fixture.peers.fail_next("reserve_blocks", 1);

        fixture.worker.tick().await.unwrap();

        assert!(fixture.store.list_external_blocks().unwrap().is_empty());
        assert!(fixture.peers.upload_calls.lock().unwrap().is_empty());
        let stored = fixture.store.get_block(&block.id).unwrap().unwrap();
        assert!(stored.server_to_id.is_empty());
    }

    #[tokio::test]
    async fn test_failed_verification_records_no_mapping() {
        let fixture = fixture();
        let block = seed_block(&fixture).await;

        fixture.store.add_new_server(&peer_entry("p1")).unwrap();
        fixture.peers.add_peer("p1", fed_info("p1", BLOCK_SIZE, 4));
        fixture.peers.script_lists(
            "p1",
            vec![vec![BlockInfo {
                id: "free-slot".to_string(),
                last_modified: 0,
            }]],
        );
        fixture.peers.fail_next("verify_block", 1);

        fixture.worker.tick().await.unwrap();

        assert_eq!(fixture.peers.upload_calls.lock().unwrap().len(), 1);
        let stored = fixture.store.get_block(&block.id).unwrap().unwrap();
        assert!(stored.server_to_id.is_empty());
    }

    #[tokio::test]
    async fn test_replicated_block_is_left_alone() {
        let fixture = fixture();
        let block = seed_block(&fixture).await;
        fixture
            .store
            .add_block_server(&block.id, "p1", "r1")
            .unwrap();
        fixture
            .store
            .add_block_server(&block.id, "p2", "r2")
            .unwrap();
        fixture.store.add_new_server(&peer_entry("p3")).unwrap();
        fixture.peers.add_peer("p3", fed_info("p3", BLOCK_SIZE, 4));

        fixture.worker.tick().await.unwrap();

        assert!(fixture.peers.upload_calls.lock().unwrap().is_empty());
        assert!(fixture.peers.reserve_calls.lock().unwrap().is_empty());
    }
}
