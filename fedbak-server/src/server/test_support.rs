//! Router-level test harness: a node backed by an in-memory metadata
//! store, a temp-dir data store and a scriptable federation stub.

use super::{build_router, ServerState};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use fedbak_core::error::{BakError, Result};
use fedbak_core::fed_client::{
    BackupCode, BlockInfo, FedInfo, FederationClient, VerificationReply,
};
use fedbak_core::jwt::TokenIssuer;
use fedbak_core::workers::queue::{ChangeQueue, ChangeReceiver};
use fedbak_core::{DataStore, MemoryStore, NodeConfig};
use async_trait::async_trait;
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

pub(crate) const BLOCK_SIZE: u64 = 128;

/// Only `server_info` is reachable from the handlers; everything else
/// is outbound-worker territory.
pub(crate) struct StubFed {
    pub infos: Mutex<HashMap<String, FedInfo>>,
}

impl StubFed {
    pub fn set_info(&self, hostname: &str, block_size: u64, free_blocks: i64) {
        self.infos.lock().unwrap().insert(
            hostname.to_string(),
            FedInfo {
                hostname: hostname.to_string(),
                owner: "peer-owner".to_string(),
                block_size,
                free_blocks,
                healthcheck_percent: 10,
                healthcheck_interval: 60,
                hash_methods: vec!["SHA256".to_string()],
                is_verified: true,
                known_server: Vec::new(),
            },
        );
    }
}

#[async_trait]
impl FederationClient for StubFed {
    async fn server_info(&self, peer: &str) -> Result<FedInfo> {
        self.infos
            .lock()
            .unwrap()
            .get(peer)
            .cloned()
            .ok_or_else(|| BakError::PeerHttp(format!("{peer} unreachable")))
    }
    async fn request_verification(&self, _peer: &str) -> Result<VerificationReply> {
        unimplemented!()
    }
    async fn confirm_verification(&self, _peer: &str) -> Result<BackupCode> {
        unimplemented!()
    }
    async fn restore_server(&self, _peer: &str, _backup_code: &str) -> Result<()> {
        unimplemented!()
    }
    async fn migrate_server(&self, _peer: &str, _new_hostname: &str) -> Result<()> {
        unimplemented!()
    }
    async fn set_maintenance(&self, _peer: &str, _from: i64, _to: i64) -> Result<()> {
        unimplemented!()
    }
    async fn delete_server(&self, _peer: &str) -> Result<()> {
        unimplemented!()
    }
    async fn list_blocks(&self, _peer: &str) -> Result<Vec<BlockInfo>> {
        unimplemented!()
    }
    async fn reserve_blocks(&self, _peer: &str, _amount: u64) -> Result<()> {
        unimplemented!()
    }
    async fn block_jwt(&self, _peer: &str, _block_id: &str) -> Result<String> {
        unimplemented!()
    }
    async fn verify_block(
        &self,
        _peer: &str,
        _block_id: &str,
        _hash_method: &str,
        _salt: &[u8],
    ) -> Result<String> {
        unimplemented!()
    }
    async fn delete_block(&self, _peer: &str, _block_id: &str) -> Result<()> {
        unimplemented!()
    }
}

pub(crate) struct TestNode {
    pub _dir: tempfile::TempDir,
    pub state: Arc<ServerState>,
    pub router: Router,
    pub fed: Arc<StubFed>,
    pub receiver: ChangeReceiver,
}

pub(crate) fn test_node() -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let config = NodeConfig {
        hostname: "self.example".to_string(),
        owner: "admin@self.example".to_string(),
        mount_path: dir.path().to_path_buf(),
        bind_addr: "127.0.0.1:0".to_string(),
        block_size: BLOCK_SIZE,
        storage_budget: BLOCK_SIZE * 8,
        health_check_percent: 10,
        health_check_interval: 60,
        placement_interval_secs: 600,
        propagation_interval_secs: 10,
        db_path: None,
        peer_scheme: "https".to_string(),
    };

    let store = Arc::new(MemoryStore::new());
    let data = Arc::new(
        DataStore::new(
            config.mount_path.clone(),
            config.block_size,
            config.external_capacity(),
        )
        .unwrap(),
    );
    let fed = Arc::new(StubFed {
        infos: Mutex::new(HashMap::new()),
    });
    let (queue, receiver) = ChangeQueue::channel();

    let state = Arc::new(ServerState {
        config,
        store,
        data,
        fed: fed.clone(),
        tokens: TokenIssuer::new(),
        queue,
    });
    let router = build_router(state.clone());

    TestNode {
        _dir: dir,
        state,
        router,
        fed,
        receiver,
    }
}

pub(crate) async fn send(router: &Router, request: Request<Body>) -> (StatusCode, bytes::Bytes) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

pub(crate) fn fed_request(method: &str, uri: &str, domain: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("domain", domain)
        .body(Body::empty())
        .unwrap()
}

pub(crate) fn fed_json<T: Serialize>(
    method: &str,
    uri: &str,
    domain: &str,
    payload: &T,
) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("domain", domain)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(payload).unwrap()))
        .unwrap()
}

pub(crate) fn parse<T: DeserializeOwned>(body: &[u8]) -> T {
    serde_json::from_slice(body).unwrap()
}
