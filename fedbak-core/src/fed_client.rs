use crate::error::{BakError, Result};
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

// ##### Wire types #####
//
// Field names are part of the wire format; both the clients below and
// the server handlers serialize these.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FedInfo {
    pub hostname: String,
    pub owner: String,
    pub block_size: u64,
    pub free_blocks: i64,
    pub healthcheck_percent: u8,
    pub healthcheck_interval: u64,
    pub hash_methods: Vec<String>,
    /// Whether the node answering considers the caller verified.
    pub is_verified: bool,
    pub known_server: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockInfo {
    pub id: String,
    /// Unix seconds of the last content write, 0 for a free block.
    pub last_modified: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockList {
    pub blocks: Vec<BlockInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Amount {
    pub amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupCode {
    pub backup_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainField {
    pub domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub from: i64,
    pub to: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockVerify {
    pub hash_method: String,
    /// Base64 of the challenge salt bytes.
    pub salt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashField {
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtField {
    pub jwt: String,
}

/// Outcome of asking a peer to start verification.
#[derive(Debug, Clone)]
pub struct VerificationReply {
    pub already_verified: bool,
    pub backup_code: String,
}

// ##### Client contracts #####

/// Peer metadata operations. One implementation per transport; tests
/// substitute the trait directly.
#[async_trait]
pub trait FederationClient: Send + Sync {
    async fn server_info(&self, peer: &str) -> Result<FedInfo>;
    async fn request_verification(&self, peer: &str) -> Result<VerificationReply>;
    async fn confirm_verification(&self, peer: &str) -> Result<BackupCode>;
    async fn restore_server(&self, peer: &str, backup_code: &str) -> Result<()>;
    async fn migrate_server(&self, peer: &str, new_hostname: &str) -> Result<()>;
    async fn set_maintenance(&self, peer: &str, from: i64, to: i64) -> Result<()>;
    async fn delete_server(&self, peer: &str) -> Result<()>;
    async fn list_blocks(&self, peer: &str) -> Result<Vec<BlockInfo>>;
    async fn reserve_blocks(&self, peer: &str, amount: u64) -> Result<()>;
    async fn block_jwt(&self, peer: &str, block_id: &str) -> Result<String>;
    async fn verify_block(
        &self,
        peer: &str,
        block_id: &str,
        hash_method: &str,
        salt: &[u8],
    ) -> Result<String>;
    async fn delete_block(&self, peer: &str, block_id: &str) -> Result<()>;
}

/// Block content transfer, authorized by a capability token.
#[async_trait]
pub trait BackupClient: Send + Sync {
    async fn upload_block(&self, peer: &str, block_id: &str, token: &str, data: Bytes)
        -> Result<()>;
    async fn update_block(&self, peer: &str, block_id: &str, token: &str, data: Bytes)
        -> Result<()>;
    async fn download_block(&self, peer: &str, block_id: &str, token: &str) -> Result<Bytes>;
}

// ##### HTTP implementations #####

fn status_error(status: StatusCode, peer: &str, what: &str) -> BakError {
    match status {
        StatusCode::NOT_FOUND => BakError::NotFound(format!("{what} on {peer}")),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BakError::Unauthorized(format!("{what} on {peer}"))
        }
        StatusCode::CONFLICT => BakError::Conflict(format!("{what} on {peer}")),
        StatusCode::INSUFFICIENT_STORAGE | StatusCode::NOT_ACCEPTABLE => {
            BakError::CapacityExceeded(format!("{what} on {peer}: {status}"))
        }
        _ => BakError::PeerHttp(format!("{what} on {peer}: {status}")),
    }
}

pub struct HttpFederationClient {
    http: reqwest::Client,
    own_hostname: String,
    scheme: String,
}

impl HttpFederationClient {
    pub fn new(own_hostname: String, scheme: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            own_hostname,
            scheme,
        }
    }

    fn url(&self, peer: &str, path: &str) -> String {
        format!("{}://{}/api/fed/v1/{}", self.scheme, peer, path)
    }

    fn request(&self, method: reqwest::Method, peer: &str, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.url(peer, path))
            .header("domain", &self.own_hostname)
    }
}

#[async_trait]
impl FederationClient for HttpFederationClient {
    async fn server_info(&self, peer: &str) -> Result<FedInfo> {
        let resp = self
            .request(reqwest::Method::GET, peer, "server/info")
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), peer, "server info"));
        }
        Ok(resp.json().await?)
    }

    async fn request_verification(&self, peer: &str) -> Result<VerificationReply> {
        let resp = self
            .request(reqwest::Method::PUT, peer, "server/verify")
            .send()
            .await?;
        let already_verified = match resp.status().as_u16() {
            202 => true,
            209 => false,
            _ => return Err(status_error(resp.status(), peer, "verification request")),
        };
        let code: BackupCode = resp.json().await?;
        Ok(VerificationReply {
            already_verified,
            backup_code: code.backup_code,
        })
    }

    async fn confirm_verification(&self, peer: &str) -> Result<BackupCode> {
        let resp = self
            .request(reqwest::Method::POST, peer, "server/verify")
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), peer, "verification confirm"));
        }
        Ok(resp.json().await?)
    }

    async fn restore_server(&self, peer: &str, backup_code: &str) -> Result<()> {
        let resp = self
            .request(reqwest::Method::PUT, peer, "server/restore")
            .json(&BackupCode {
                backup_code: backup_code.to_string(),
            })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), peer, "server restore"));
        }
        Ok(())
    }

    async fn migrate_server(&self, peer: &str, new_hostname: &str) -> Result<()> {
        let resp = self
            .request(reqwest::Method::PUT, peer, "server/migrate")
            .json(&DomainField {
                domain: new_hostname.to_string(),
            })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), peer, "server migrate"));
        }
        Ok(())
    }

    async fn set_maintenance(&self, peer: &str, from: i64, to: i64) -> Result<()> {
        let resp = self
            .request(reqwest::Method::POST, peer, "server/maintenance")
            .json(&MaintenanceWindow { from, to })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), peer, "maintenance window"));
        }
        Ok(())
    }

    async fn delete_server(&self, peer: &str) -> Result<()> {
        let resp = self
            .request(reqwest::Method::DELETE, peer, "server")
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), peer, "server delete"));
        }
        Ok(())
    }

    async fn list_blocks(&self, peer: &str) -> Result<Vec<BlockInfo>> {
        let resp = self
            .request(reqwest::Method::GET, peer, "block")
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), peer, "block list"));
        }
        let list: BlockList = resp.json().await?;
        Ok(list.blocks)
    }

    async fn reserve_blocks(&self, peer: &str, amount: u64) -> Result<()> {
        let resp = self
            .request(reqwest::Method::POST, peer, "block")
            .json(&Amount { amount })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), peer, "block reservation"));
        }
        Ok(())
    }

    async fn block_jwt(&self, peer: &str, block_id: &str) -> Result<String> {
        let resp = self
            .request(reqwest::Method::GET, peer, &format!("block/{block_id}/jwt"))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), peer, "block jwt"));
        }
        let token: JwtField = resp.json().await?;
        Ok(token.jwt)
    }

    async fn verify_block(
        &self,
        peer: &str,
        block_id: &str,
        hash_method: &str,
        salt: &[u8],
    ) -> Result<String> {
        let resp = self
            .request(reqwest::Method::POST, peer, &format!("block/{block_id}"))
            .json(&BlockVerify {
                hash_method: hash_method.to_string(),
                salt: base64::engine::general_purpose::STANDARD.encode(salt),
            })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), peer, "block verify"));
        }
        let hash: HashField = resp.json().await?;
        Ok(hash.hash)
    }

    async fn delete_block(&self, peer: &str, block_id: &str) -> Result<()> {
        let resp = self
            .request(reqwest::Method::DELETE, peer, &format!("block/{block_id}"))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), peer, "block delete"));
        }
        Ok(())
    }
}

pub struct HttpBackupClient {
    http: reqwest::Client,
    scheme: String,
}

impl HttpBackupClient {
    pub fn new(scheme: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            scheme,
        }
    }

    fn url(&self, peer: &str, block_id: &str) -> String {
        format!("{}://{}/api/bak/v1/block/{}", self.scheme, peer, block_id)
    }
}

#[async_trait]
impl BackupClient for HttpBackupClient {
    async fn upload_block(
        &self,
        peer: &str,
        block_id: &str,
        token: &str,
        data: Bytes,
    ) -> Result<()> {
        let resp = self
            .http
            .post(self.url(peer, block_id))
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), peer, "block upload"));
        }
        Ok(())
    }

    async fn update_block(
        &self,
        peer: &str,
        block_id: &str,
        token: &str,
        data: Bytes,
    ) -> Result<()> {
        let resp = self
            .http
            .put(self.url(peer, block_id))
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), peer, "block update"));
        }
        Ok(())
    }

    async fn download_block(&self, peer: &str, block_id: &str, token: &str) -> Result<Bytes> {
        let resp = self
            .http
            .get(self.url(peer, block_id))
            .bearer_auth(token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), peer, "block download"));
        }
        Ok(resp.bytes().await?)
    }
}
