//! Core library of the fedbak backup federation node: block codec,
//! metadata and data stores, peer clients, capability tokens and the
//! background workers. Everything here is exercised without a socket;
//! the HTTP surface lives in `fedbak-server`.

pub mod codec;
pub mod config;
pub mod data;
pub mod error;
pub mod fed_client;
pub mod hash;
pub mod jwt;
pub mod memory_store;
pub mod metadata_store;
pub mod verify;
pub mod workers;

pub use config::NodeConfig;
pub use data::DataStore;
pub use error::{BakError, Result};
pub use memory_store::MemoryStore;
pub use metadata_store::{MetadataStore, SqliteStore};
