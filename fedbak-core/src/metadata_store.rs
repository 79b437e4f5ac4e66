use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A client file known to this node. Content lives on disk under the
/// mount path; `path` is the client-side path and is opaque here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: String,
    pub path: String,
}

/// A byte range of one file packed into a block. `start` inclusive,
/// `stop` exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRange {
    pub file_id: String,
    pub start: u64,
    pub stop: u64,
}

impl FileRange {
    pub fn len(&self) -> u64 {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.stop <= self.start
    }
}

/// A local block: which file ranges it packs and which peers hold a
/// verified replica (hostname → external block id on that peer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub id: String,
    pub server_to_id: BTreeMap<String, String>,
    pub ranges: Vec<FileRange>,
}

/// Capacity reserved locally for one named peer. The block is free
/// exactly while no content backs it on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalBlock {
    pub id: String,
    pub server_hostname: String,
}

/// A maintenance window announced by a peer. Windows longer than two
/// days are rejected at acceptance time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Maintenance {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

pub const MAX_MAINTENANCE_SECS: i64 = 2 * 24 * 60 * 60;

/// A known peer node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub hostname: String,
    pub old_hostnames: Vec<String>,
    pub is_verified: bool,
    pub healthy: bool,
    pub maintenance: Option<Maintenance>,
    pub future_hostname: Option<String>,
    pub backup_code: String,
}

impl ServerEntry {
    /// Whether `now` falls inside an announced maintenance window.
    pub fn in_maintenance(&self, now: DateTime<Utc>) -> bool {
        self.maintenance
            .as_ref()
            .map(|window| window.start <= now && now < window.end)
            .unwrap_or(false)
    }
}

/// Durable record of files, blocks, external blocks and peers.
///
/// All `add_new_*` operations return `Ok(false)` when an entry with
/// the same id/hostname already exists; callers treat that as a
/// normal retry signal, not a fault. Every call is atomic on its own;
/// no cross-call transactions are provided or assumed.
pub trait MetadataStore: Send + Sync {
    fn add_new_file(&self, file: &FileEntry) -> Result<bool>;
    fn get_file(&self, id: &str) -> Result<Option<FileEntry>>;
    fn get_file_path(&self, id: &str) -> Result<Option<String>>;
    fn delete_file(&self, id: &str) -> Result<bool>;
    fn list_files(&self) -> Result<Vec<FileEntry>>;

    fn add_new_block(&self, block: &BlockMeta) -> Result<bool>;
    fn get_block(&self, id: &str) -> Result<Option<BlockMeta>>;
    /// Replaces the stored ranges and replica map of an existing block.
    fn update_block(&self, block: &BlockMeta) -> Result<bool>;
    fn delete_block(&self, id: &str) -> Result<bool>;
    fn list_blocks(&self) -> Result<Vec<BlockMeta>>;
    fn add_block_server(&self, id: &str, hostname: &str, external_id: &str) -> Result<bool>;
    fn remove_block_server(&self, id: &str, hostname: &str) -> Result<bool>;

    fn add_new_external_block(&self, block: &ExternalBlock) -> Result<bool>;
    fn get_external_block(&self, id: &str) -> Result<Option<ExternalBlock>>;
    fn delete_external_block(&self, id: &str) -> Result<bool>;
    fn list_external_blocks(&self) -> Result<Vec<ExternalBlock>>;
    fn list_external_blocks_for(&self, hostname: &str) -> Result<Vec<ExternalBlock>>;

    fn add_new_server(&self, server: &ServerEntry) -> Result<bool>;
    /// Looks a peer up by hostname. When no live record matches but a
    /// record's `future_hostname` does, the pending migration is
    /// finalized (old hostname moves into history) before returning.
    fn get_server(&self, hostname: &str) -> Result<Option<ServerEntry>>;
    fn update_server(&self, server: &ServerEntry) -> Result<bool>;
    fn update_server_hostname(&self, old_hostname: &str, new_hostname: &str) -> Result<bool>;
    fn delete_server(&self, hostname: &str) -> Result<bool>;
    fn list_servers(&self) -> Result<Vec<ServerEntry>>;

    fn get_jwt_key(&self, block_id: &str) -> Result<Option<String>>;
    fn put_jwt_key(&self, block_id: &str, token: &str) -> Result<()>;
    fn delete_jwt_key(&self, block_id: &str) -> Result<()>;
}

pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self { db_path };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                path TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS blocks (
                id TEXT PRIMARY KEY,
                server_to_id TEXT NOT NULL,
                ranges TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS external_blocks (
                id TEXT PRIMARY KEY,
                server_hostname TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_external_blocks_hostname
             ON external_blocks(server_hostname)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS servers (
                hostname TEXT PRIMARY KEY,
                record TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS jwt_keys (
                block_id TEXT PRIMARY KEY,
                token TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    fn row_to_block(id: String, server_to_id: String, ranges: String) -> Result<BlockMeta> {
        Ok(BlockMeta {
            id,
            server_to_id: serde_json::from_str(&server_to_id)?,
            ranges: serde_json::from_str(&ranges)?,
        })
    }
}

impl MetadataStore for SqliteStore {
    fn add_new_file(&self, file: &FileEntry) -> Result<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO files (id, path) VALUES (?1, ?2)",
            params![file.id, file.path],
        )?;
        Ok(inserted > 0)
    }

    fn get_file(&self, id: &str) -> Result<Option<FileEntry>> {
        let conn = self.conn()?;
        let row = conn
            .query_row("SELECT path FROM files WHERE id = ?1", [id], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(row.map(|path| FileEntry {
            id: id.to_string(),
            path,
        }))
    }

    fn get_file_path(&self, id: &str) -> Result<Option<String>> {
        Ok(self.get_file(id)?.map(|file| file.path))
    }

    fn delete_file(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let affected = conn.execute("DELETE FROM files WHERE id = ?1", [id])?;
        Ok(affected > 0)
    }

    fn list_files(&self) -> Result<Vec<FileEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, path FROM files")?;
        let rows = stmt.query_map([], |row| {
            Ok(FileEntry {
                id: row.get(0)?,
                path: row.get(1)?,
            })
        })?;

        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    fn add_new_block(&self, block: &BlockMeta) -> Result<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO blocks (id, server_to_id, ranges) VALUES (?1, ?2, ?3)",
            params![
                block.id,
                serde_json::to_string(&block.server_to_id)?,
                serde_json::to_string(&block.ranges)?,
            ],
        )?;
        Ok(inserted > 0)
    }

    fn get_block(&self, id: &str) -> Result<Option<BlockMeta>> {
        let conn = self.conn()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT server_to_id, ranges FROM blocks WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((server_to_id, ranges)) => {
                Ok(Some(Self::row_to_block(id.to_string(), server_to_id, ranges)?))
            }
            None => Ok(None),
        }
    }

    fn update_block(&self, block: &BlockMeta) -> Result<bool> {
        let conn = self.conn()?;
        let affected = conn.execute(
            "UPDATE blocks SET server_to_id = ?2, ranges = ?3 WHERE id = ?1",
            params![
                block.id,
                serde_json::to_string(&block.server_to_id)?,
                serde_json::to_string(&block.ranges)?,
            ],
        )?;
        Ok(affected > 0)
    }

    fn delete_block(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let affected = conn.execute("DELETE FROM blocks WHERE id = ?1", [id])?;
        Ok(affected > 0)
    }

    fn list_blocks(&self) -> Result<Vec<BlockMeta>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, server_to_id, ranges FROM blocks")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut blocks = Vec::new();
        for row in rows {
            let (id, server_to_id, ranges) = row?;
            blocks.push(Self::row_to_block(id, server_to_id, ranges)?);
        }
        Ok(blocks)
    }

    fn add_block_server(&self, id: &str, hostname: &str, external_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let row: Option<String> = tx
            .query_row("SELECT server_to_id FROM blocks WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;
        let Some(raw) = row else {
            return Ok(false);
        };
        let mut server_to_id: BTreeMap<String, String> = serde_json::from_str(&raw)?;
        server_to_id.insert(hostname.to_string(), external_id.to_string());
        tx.execute(
            "UPDATE blocks SET server_to_id = ?2 WHERE id = ?1",
            params![id, serde_json::to_string(&server_to_id)?],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn remove_block_server(&self, id: &str, hostname: &str) -> Result<bool> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let row: Option<String> = tx
            .query_row("SELECT server_to_id FROM blocks WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;
        let Some(raw) = row else {
            return Ok(false);
        };
        let mut server_to_id: BTreeMap<String, String> = serde_json::from_str(&raw)?;
        if server_to_id.remove(hostname).is_none() {
            return Ok(false);
        }
        tx.execute(
            "UPDATE blocks SET server_to_id = ?2 WHERE id = ?1",
            params![id, serde_json::to_string(&server_to_id)?],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn add_new_external_block(&self, block: &ExternalBlock) -> Result<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO external_blocks (id, server_hostname) VALUES (?1, ?2)",
            params![block.id, block.server_hostname],
        )?;
        Ok(inserted > 0)
    }

    fn get_external_block(&self, id: &str) -> Result<Option<ExternalBlock>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT server_hostname FROM external_blocks WHERE id = ?1",
                [id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(row.map(|server_hostname| ExternalBlock {
            id: id.to_string(),
            server_hostname,
        }))
    }

    fn delete_external_block(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let affected = conn.execute("DELETE FROM external_blocks WHERE id = ?1", [id])?;
        Ok(affected > 0)
    }

    fn list_external_blocks(&self) -> Result<Vec<ExternalBlock>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, server_hostname FROM external_blocks")?;
        let rows = stmt.query_map([], |row| {
            Ok(ExternalBlock {
                id: row.get(0)?,
                server_hostname: row.get(1)?,
            })
        })?;

        let mut blocks = Vec::new();
        for row in rows {
            blocks.push(row?);
        }
        Ok(blocks)
    }

    fn list_external_blocks_for(&self, hostname: &str) -> Result<Vec<ExternalBlock>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, server_hostname FROM external_blocks WHERE server_hostname = ?1")?;
        let rows = stmt.query_map([hostname], |row| {
            Ok(ExternalBlock {
                id: row.get(0)?,
                server_hostname: row.get(1)?,
            })
        })?;

        let mut blocks = Vec::new();
        for row in rows {
            blocks.push(row?);
        }
        Ok(blocks)
    }

    fn add_new_server(&self, server: &ServerEntry) -> Result<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO servers (hostname, record) VALUES (?1, ?2)",
            params![server.hostname, serde_json::to_string(server)?],
        )?;
        Ok(inserted > 0)
    }

    fn get_server(&self, hostname: &str) -> Result<Option<ServerEntry>> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let row: Option<String> = tx
            .query_row("SELECT record FROM servers WHERE hostname = ?1", [hostname], |row| {
                row.get(0)
            })
            .optional()?;
        if let Some(raw) = row {
            return Ok(Some(serde_json::from_str(&raw)?));
        }

        // No live record; a record whose future_hostname matches means
        // a pending migration gets finalized now.
        let mut stmt = tx.prepare("SELECT hostname, record FROM servers")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut pending: Option<ServerEntry> = None;
        for row in rows {
            let (_, raw) = row?;
            let server: ServerEntry = serde_json::from_str(&raw)?;
            if server.future_hostname.as_deref() == Some(hostname) {
                pending = Some(server);
                break;
            }
        }
        drop(stmt);

        let Some(mut server) = pending else {
            return Ok(None);
        };

        let old_hostname = std::mem::replace(&mut server.hostname, hostname.to_string());
        server.old_hostnames.push(old_hostname.clone());
        server.future_hostname = None;

        tx.execute(
            "UPDATE servers SET hostname = ?2, record = ?3 WHERE hostname = ?1",
            params![old_hostname, server.hostname, serde_json::to_string(&server)?],
        )?;
        tx.commit()?;

        Ok(Some(server))
    }

    fn update_server(&self, server: &ServerEntry) -> Result<bool> {
        let conn = self.conn()?;
        let affected = conn.execute(
            "UPDATE servers SET record = ?2 WHERE hostname = ?1",
            params![server.hostname, serde_json::to_string(server)?],
        )?;
        Ok(affected > 0)
    }

    fn update_server_hostname(&self, old_hostname: &str, new_hostname: &str) -> Result<bool> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let row: Option<String> = tx
            .query_row(
                "SELECT record FROM servers WHERE hostname = ?1",
                [old_hostname],
                |row| row.get(0),
            )
            .optional()?;
        let Some(raw) = row else {
            return Ok(false);
        };
        let mut server: ServerEntry = serde_json::from_str(&raw)?;
        server.old_hostnames.push(server.hostname.clone());
        server.hostname = new_hostname.to_string();
        server.future_hostname = None;
        tx.execute(
            "UPDATE servers SET hostname = ?2, record = ?3 WHERE hostname = ?1",
            params![old_hostname, new_hostname, serde_json::to_string(&server)?],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn delete_server(&self, hostname: &str) -> Result<bool> {
        let conn = self.conn()?;
        let affected = conn.execute("DELETE FROM servers WHERE hostname = ?1", [hostname])?;
        Ok(affected > 0)
    }

    fn list_servers(&self) -> Result<Vec<ServerEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT record FROM servers")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut servers = Vec::new();
        for row in rows {
            servers.push(serde_json::from_str(&row?)?);
        }
        Ok(servers)
    }

    fn get_jwt_key(&self, block_id: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT token FROM jwt_keys WHERE block_id = ?1",
                [block_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(row)
    }

    fn put_jwt_key(&self, block_id: &str, token: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO jwt_keys (block_id, token) VALUES (?1, ?2)",
            params![block_id, token],
        )?;
        Ok(())
    }

    fn delete_jwt_key(&self, block_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM jwt_keys WHERE block_id = ?1", [block_id])?;
        Ok(())
    }
}
