use crate::error::Result;
use crate::metadata_store::{
    BlockMeta, ExternalBlock, FileEntry, MetadataStore, ServerEntry,
};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// In-memory [`MetadataStore`], used by tests and ephemeral
/// deployments. A single mutex makes every call atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    files: BTreeMap<String, FileEntry>,
    blocks: BTreeMap<String, BlockMeta>,
    external_blocks: BTreeMap<String, ExternalBlock>,
    servers: BTreeMap<String, ServerEntry>,
    jwt_keys: BTreeMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryStore {
    fn add_new_file(&self, file: &FileEntry) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.files.contains_key(&file.id) {
            return Ok(false);
        }
        inner.files.insert(file.id.clone(), file.clone());
        Ok(true)
    }

    fn get_file(&self, id: &str) -> Result<Option<FileEntry>> {
        Ok(self.inner.lock().unwrap().files.get(id).cloned())
    }

    fn get_file_path(&self, id: &str) -> Result<Option<String>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .files
            .get(id)
            .map(|file| file.path.clone()))
    }

    fn delete_file(&self, id: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().files.remove(id).is_some())
    }

    fn list_files(&self) -> Result<Vec<FileEntry>> {
        Ok(self.inner.lock().unwrap().files.values().cloned().collect())
    }

    fn add_new_block(&self, block: &BlockMeta) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.blocks.contains_key(&block.id) {
            return Ok(false);
        }
        inner.blocks.insert(block.id.clone(), block.clone());
        Ok(true)
    }

    fn get_block(&self, id: &str) -> Result<Option<BlockMeta>> {
        Ok(self.inner.lock().unwrap().blocks.get(id).cloned())
    }

    fn update_block(&self, block: &BlockMeta) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.blocks.contains_key(&block.id) {
            return Ok(false);
        }
        inner.blocks.insert(block.id.clone(), block.clone());
        Ok(true)
    }

    fn delete_block(&self, id: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().blocks.remove(id).is_some())
    }

    fn list_blocks(&self) -> Result<Vec<BlockMeta>> {
        Ok(self.inner.lock().unwrap().blocks.values().cloned().collect())
    }

    fn add_block_server(&self, id: &str, hostname: &str, external_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.blocks.get_mut(id) {
            Some(block) => {
                block
                    .server_to_id
                    .insert(hostname.to_string(), external_id.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn remove_block_server(&self, id: &str, hostname: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.blocks.get_mut(id) {
            Some(block) => Ok(block.server_to_id.remove(hostname).is_some()),
            None => Ok(false),
        }
    }

    fn add_new_external_block(&self, block: &ExternalBlock) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.external_blocks.contains_key(&block.id) {
            return Ok(false);
        }
        inner.external_blocks.insert(block.id.clone(), block.clone());
        Ok(true)
    }

    fn get_external_block(&self, id: &str) -> Result<Option<ExternalBlock>> {
        Ok(self.inner.lock().unwrap().external_blocks.get(id).cloned())
    }

    fn delete_external_block(&self, id: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .external_blocks
            .remove(id)
            .is_some())
    }

    fn list_external_blocks(&self) -> Result<Vec<ExternalBlock>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .external_blocks
            .values()
            .cloned()
            .collect())
    }

    fn list_external_blocks_for(&self, hostname: &str) -> Result<Vec<ExternalBlock>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .external_blocks
            .values()
            .filter(|block| block.server_hostname == hostname)
            .cloned()
            .collect())
    }

    fn add_new_server(&self, server: &ServerEntry) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.servers.contains_key(&server.hostname) {
            return Ok(false);
        }
        inner.servers.insert(server.hostname.clone(), server.clone());
        Ok(true)
    }

    fn get_server(&self, hostname: &str) -> Result<Option<ServerEntry>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(server) = inner.servers.get(hostname) {
            return Ok(Some(server.clone()));
        }

        let pending = inner
            .servers
            .values()
            .find(|server| server.future_hostname.as_deref() == Some(hostname))
            .map(|server| server.hostname.clone());
        let Some(old_hostname) = pending else {
            return Ok(None);
        };

        let mut server = inner.servers.remove(&old_hostname).unwrap();
        server.old_hostnames.push(old_hostname);
        server.hostname = hostname.to_string();
        server.future_hostname = None;
        inner.servers.insert(hostname.to_string(), server.clone());
        Ok(Some(server))
    }

    fn update_server(&self, server: &ServerEntry) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.servers.contains_key(&server.hostname) {
            return Ok(false);
        }
        inner.servers.insert(server.hostname.clone(), server.clone());
        Ok(true)
    }

    fn update_server_hostname(&self, old_hostname: &str, new_hostname: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(mut server) = inner.servers.remove(old_hostname) else {
            return Ok(false);
        };
        server.old_hostnames.push(server.hostname.clone());
        server.hostname = new_hostname.to_string();
        server.future_hostname = None;
        inner.servers.insert(new_hostname.to_string(), server);
        Ok(true)
    }

    fn delete_server(&self, hostname: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().servers.remove(hostname).is_some())
    }

    fn list_servers(&self) -> Result<Vec<ServerEntry>> {
        Ok(self.inner.lock().unwrap().servers.values().cloned().collect())
    }

    fn get_jwt_key(&self, block_id: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().unwrap().jwt_keys.get(block_id).cloned())
    }

    fn put_jwt_key(&self, block_id: &str, token: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .jwt_keys
            .insert(block_id.to_string(), token.to_string());
        Ok(())
    }

    fn delete_jwt_key(&self, block_id: &str) -> Result<()> {
        self.inner.lock().unwrap().jwt_keys.remove(block_id);
        Ok(())
    }
}
