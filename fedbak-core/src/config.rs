use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Node configuration. `hostname`, `owner`, `mount_path` and
/// `block_size` have no sensible defaults and must be present in the
/// config file or environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Externally reachable hostname (with optional port) of this node.
    pub hostname: String,
    /// Human-readable owner name, shared with peers.
    pub owner: String,
    /// Directory holding client files and peer block contents.
    pub mount_path: PathBuf,
    /// Listen address for the HTTP APIs.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Size of one block in bytes. All transfers carry exactly this
    /// many bytes.
    pub block_size: u64,
    /// Bytes usable for client files; peers are promised twice this
    /// amount of external block capacity.
    pub storage_budget: u64,
    /// Portion of blocks (percent, 1..=100) re-verified on every
    /// active healthcheck tick.
    #[serde(default = "default_health_check_percent")]
    pub health_check_percent: u8,
    /// Healthcheck activation interval in minutes.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
    /// Replica placement pass interval in seconds.
    #[serde(default = "default_placement_interval")]
    pub placement_interval_secs: u64,
    /// Change propagation pass interval in seconds.
    #[serde(default = "default_propagation_interval")]
    pub propagation_interval_secs: u64,
    /// Sqlite metadata database. Defaults to `metadata.db` under the
    /// mount path.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    /// URL scheme for peer requests. Production federations run https
    /// behind mutual TLS; tests use http.
    #[serde(default = "default_peer_scheme")]
    pub peer_scheme: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8420".to_string()
}

fn default_health_check_percent() -> u8 {
    10
}

fn default_health_check_interval() -> u64 {
    60
}

fn default_placement_interval() -> u64 {
    600
}

fn default_propagation_interval() -> u64 {
    10
}

fn default_peer_scheme() -> String {
    "https".to_string()
}

impl NodeConfig {
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("FEDBAK"))
            .build()
            .map_err(|e| crate::error::BakError::Config(e.to_string()))?;

        let config: NodeConfig = settings
            .try_deserialize()
            .map_err(|e| crate::error::BakError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.block_size == 0 {
            return Err(crate::error::BakError::Config(
                "block_size must be positive".to_string(),
            ));
        }
        if self.health_check_percent == 0 || self.health_check_percent > 100 {
            return Err(crate::error::BakError::Config(
                "health_check_percent must be in 1..=100".to_string(),
            ));
        }
        if self.health_check_interval == 0 {
            return Err(crate::error::BakError::Config(
                "health_check_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.mount_path.join("metadata.db"))
    }

    /// Total bytes promised to peers as external block capacity.
    pub fn external_capacity(&self) -> u64 {
        self.storage_budget * 2
    }
}
