//! A scriptable in-memory peer network implementing both client
//! traits, shared by the worker and verifier tests.

use crate::error::{BakError, Result};
use crate::fed_client::{
    BackupClient, BackupCode, BlockInfo, FedInfo, FederationClient, VerificationReply,
};
use crate::hash::HashMethod;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
pub struct MockPeerNetwork {
    /// `server_info` responses per peer hostname.
    pub infos: Mutex<HashMap<String, FedInfo>>,
    /// Scripted `list_blocks` responses per peer; each call pops the
    /// next list, the last one repeats.
    pub lists: Mutex<HashMap<String, VecDeque<Vec<BlockInfo>>>>,
    /// Remote block contents keyed by (peer, block id). Uploads write
    /// here and verification challenges hash from here.
    pub contents: Mutex<HashMap<(String, String), Bytes>>,
    /// Remaining scripted failures per operation name.
    pub failures: Mutex<HashMap<&'static str, usize>>,

    pub reserve_calls: Mutex<Vec<(String, u64)>>,
    pub verify_calls: Mutex<Vec<(String, String)>>,
    pub upload_calls: Mutex<Vec<(String, String)>>,
    pub update_calls: Mutex<Vec<(String, String)>>,
    pub delete_calls: Mutex<Vec<(String, String)>>,
}

impl MockPeerNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&self, hostname: &str, info: FedInfo) {
        self.infos
            .lock()
            .unwrap()
            .insert(hostname.to_string(), info);
    }

    pub fn script_lists(&self, hostname: &str, lists: Vec<Vec<BlockInfo>>) {
        self.lists
            .lock()
            .unwrap()
            .insert(hostname.to_string(), lists.into_iter().collect());
    }

    pub fn set_content(&self, hostname: &str, block_id: &str, data: &[u8]) {
        self.contents.lock().unwrap().insert(
            (hostname.to_string(), block_id.to_string()),
            Bytes::copy_from_slice(data),
        );
    }

    /// Makes the next `count` calls of `op` fail with a peer error.
    pub fn fail_next(&self, op: &'static str, count: usize) {
        self.failures.lock().unwrap().insert(op, count);
    }

    fn take_failure(&self, op: &'static str) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl FederationClient for MockPeerNetwork {
    async fn server_info(&self, peer: &str) -> Result<FedInfo> {
        if self.take_failure("server_info") {
            return Err(BakError::PeerHttp(format!("{peer} unreachable")));
        }
        self.infos
            .lock()
            .unwrap()
            .get(peer)
            .cloned()
            .ok_or_else(|| BakError::NotFound(format!("unknown peer {peer}")))
    }

    async fn request_verification(&self, _peer: &str) -> Result<VerificationReply> {
        unimplemented!("not exercised by worker tests")
    }

    async fn confirm_verification(&self, _peer: &str) -> Result<BackupCode> {
        unimplemented!("not exercised by worker tests")
    }

    async fn restore_server(&self, _peer: &str, _backup_code: &str) -> Result<()> {
        unimplemented!("not exercised by worker tests")
    }

    async fn migrate_server(&self, _peer: &str, _new_hostname: &str) -> Result<()> {
        unimplemented!("not exercised by worker tests")
    }

    async fn set_maintenance(&self, _peer: &str, _from: i64, _to: i64) -> Result<()> {
        unimplemented!("not exercised by worker tests")
    }

    async fn delete_server(&self, _peer: &str) -> Result<()> {
        unimplemented!("not exercised by worker tests")
    }

    async fn list_blocks(&self, peer: &str) -> Result<Vec<BlockInfo>> {
        if self.take_failure("list_blocks") {
            return Err(BakError::PeerHttp(format!("{peer} unreachable")));
        }
        let mut lists = self.lists.lock().unwrap();
        let Some(queue) = lists.get_mut(peer) else {
            return Ok(Vec::new());
        };
        if queue.len() > 1 {
            Ok(queue.pop_front().unwrap())
        } else {
            Ok(queue.front().cloned().unwrap_or_default())
        }
    }

    async fn reserve_blocks(&self, peer: &str, amount: u64) -> Result<()> {
        self.reserve_calls
            .lock()
            .unwrap()
            .push((peer.to_string(), amount));
        if self.take_failure("reserve_blocks") {
            return Err(BakError::PeerHttp(format!("{peer} unreachable")));
        }
        Ok(())
    }

    async fn block_jwt(&self, peer: &str, block_id: &str) -> Result<String> {
        if self.take_failure("block_jwt") {
            return Err(BakError::PeerHttp(format!("{peer} unreachable")));
        }
        Ok(format!("token-{peer}-{block_id}"))
    }

    async fn verify_block(
        &self,
        peer: &str,
        block_id: &str,
        hash_method: &str,
        salt: &[u8],
    ) -> Result<String> {
        self.verify_calls
            .lock()
            .unwrap()
            .push((peer.to_string(), block_id.to_string()));
        if self.take_failure("verify_block") {
            return Err(BakError::PeerHttp(format!("{peer} unreachable")));
        }
        let method = HashMethod::from_name(hash_method)
            .ok_or_else(|| BakError::CapacityExceeded(format!("unsupported {hash_method}")))?;
        let contents = self.contents.lock().unwrap();
        let content = contents
            .get(&(peer.to_string(), block_id.to_string()))
            .ok_or_else(|| BakError::NotFound(format!("no content for {block_id} on {peer}")))?;
        Ok(method.salted_hex(content, salt))
    }

    async fn delete_block(&self, peer: &str, block_id: &str) -> Result<()> {
        self.delete_calls
            .lock()
            .unwrap()
            .push((peer.to_string(), block_id.to_string()));
        if self.take_failure("delete_block") {
            return Err(BakError::PeerHttp(format!("{peer} unreachable")));
        }
        let removed = self
            .contents
            .lock()
            .unwrap()
            .remove(&(peer.to_string(), block_id.to_string()));
        if removed.is_none() {
            return Err(BakError::NotFound(format!(
                "no content for {block_id} on {peer}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BackupClient for MockPeerNetwork {
    async fn upload_block(
        &self,
        peer: &str,
        block_id: &str,
        _token: &str,
        data: Bytes,
    ) -> Result<()> {
        self.upload_calls
            .lock()
            .unwrap()
            .push((peer.to_string(), block_id.to_string()));
        if self.take_failure("upload_block") {
            return Err(BakError::PeerHttp(format!("{peer} unreachable")));
        }
        self.contents
            .lock()
            .unwrap()
            .insert((peer.to_string(), block_id.to_string()), data);
        Ok(())
    }

    async fn update_block(
        &self,
        peer: &str,
        block_id: &str,
        _token: &str,
        data: Bytes,
    ) -> Result<()> {
        self.update_calls
            .lock()
            .unwrap()
            .push((peer.to_string(), block_id.to_string()));
        if self.take_failure("update_block") {
            return Err(BakError::PeerHttp(format!("{peer} unreachable")));
        }
        self.contents
            .lock()
            .unwrap()
            .insert((peer.to_string(), block_id.to_string()), data);
        Ok(())
    }

    async fn download_block(&self, peer: &str, block_id: &str, _token: &str) -> Result<Bytes> {
        self.contents
            .lock()
            .unwrap()
            .get(&(peer.to_string(), block_id.to_string()))
            .cloned()
            .ok_or_else(|| BakError::NotFound(format!("no content for {block_id} on {peer}")))
    }
}
