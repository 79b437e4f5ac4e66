use crate::codec::{self, HeaderEntry};
use crate::error::{BakError, Result};
use crate::hash::HashMethod;
use crate::metadata_store::{BlockMeta, FileEntry, FileRange, MetadataStore};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

const FILE_DIR: &str = "files";
const EXTERNAL_DIR: &str = "external";

/// Bounded retries for user-facing random-id creation.
const MAX_ID_RETRIES: usize = 10;

/// File and block contents under the mount path. Client files live in
/// `files/` keyed by file id; peer block contents live in `external/`
/// keyed by external block id. An external block with no backing file
/// is free.
pub struct DataStore {
    mount_path: PathBuf,
    block_size: u64,
    external_capacity: u64,
}

impl DataStore {
    pub fn new(mount_path: PathBuf, block_size: u64, external_capacity: u64) -> Result<Self> {
        std::fs::create_dir_all(mount_path.join(FILE_DIR))?;
        std::fs::create_dir_all(mount_path.join(EXTERNAL_DIR))?;
        Ok(Self {
            mount_path,
            block_size,
            external_capacity,
        })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    fn file_path(&self, id: &str) -> PathBuf {
        self.mount_path.join(FILE_DIR).join(id)
    }

    fn external_path(&self, id: &str) -> PathBuf {
        self.mount_path.join(EXTERNAL_DIR).join(id)
    }

    // ##### Client files #####

    /// Stores a new file and chunks it into blocks. Returns the
    /// created blocks; a zero-length file creates none.
    pub async fn create_file(
        &self,
        store: &dyn MetadataStore,
        file: &FileEntry,
        content: Bytes,
    ) -> Result<Vec<BlockMeta>> {
        let path = self.file_path(&file.id);
        if path.exists() {
            return Err(BakError::Conflict(format!("file {} already exists", file.id)));
        }

        let mut out = fs::File::create(&path).await?;
        out.write_all(&content).await?;
        out.sync_all().await?;
        drop(out);

        // Header size is the same for every new block: each one holds a
        // single range of this very file.
        let header_size = self.single_range_header_size(file)? as u64;
        let boundaries =
            codec::compute_new_block_boundaries(content.len() as u64, header_size, self.block_size)?;

        let mut blocks = Vec::new();
        for (start, stop) in boundaries {
            let mut retries = 0;
            let block = loop {
                let candidate = BlockMeta {
                    id: Uuid::new_v4().to_string(),
                    server_to_id: BTreeMap::new(),
                    ranges: vec![FileRange {
                        file_id: file.id.clone(),
                        start,
                        stop,
                    }],
                };
                if store.add_new_block(&candidate)? {
                    break candidate;
                }
                retries += 1;
                if retries > MAX_ID_RETRIES {
                    return Err(BakError::InvariantViolation(
                        "could not allocate a unique block id".to_string(),
                    ));
                }
            };
            blocks.push(block);
        }

        Ok(blocks)
    }

    /// Replaces a file's content in place. Blocks referencing the file
    /// are returned for re-propagation; the range layout is kept
    /// (growth beyond the last range is not re-chunked).
    pub async fn update_file(
        &self,
        store: &dyn MetadataStore,
        file: &FileEntry,
        content: Bytes,
    ) -> Result<Vec<BlockMeta>> {
        let path = self.file_path(&file.id);
        if !path.exists() {
            return Err(BakError::NotFound(format!("file {} does not exist", file.id)));
        }

        let mut out = fs::File::create(&path).await?;
        out.write_all(&content).await?;
        out.sync_all().await?;
        drop(out);

        let blocks = store
            .list_blocks()?
            .into_iter()
            .filter(|block| block.ranges.iter().any(|range| range.file_id == file.id))
            .collect();
        Ok(blocks)
    }

    /// Deletes a file and shrinks every block referencing it. Blocks
    /// whose range list becomes empty are deleted from the metadata
    /// store; the returned snapshots keep their replica maps so the
    /// propagation worker can clean up the remote copies.
    pub async fn delete_file(
        &self,
        store: &dyn MetadataStore,
        file: &FileEntry,
    ) -> Result<Vec<BlockMeta>> {
        let path = self.file_path(&file.id);
        if !path.exists() {
            return Err(BakError::NotFound(format!("file {} does not exist", file.id)));
        }
        fs::remove_file(&path).await?;

        let mut touched = Vec::new();
        for mut block in store.list_blocks()? {
            if !block.ranges.iter().any(|range| range.file_id == file.id) {
                continue;
            }
            block.ranges.retain(|range| range.file_id != file.id);
            if block.ranges.is_empty() {
                store.delete_block(&block.id)?;
            } else {
                store.update_block(&block)?;
            }
            touched.push(block);
        }

        Ok(touched)
    }

    pub async fn read_file(&self, id: &str) -> Result<Bytes> {
        let path = self.file_path(id);
        if !path.exists() {
            return Err(BakError::NotFound(format!("file {} does not exist", id)));
        }
        Ok(Bytes::from(fs::read(&path).await?))
    }

    pub async fn file_last_modified(&self, id: &str) -> Result<i64> {
        let path = self.file_path(id);
        let meta = fs::metadata(&path)
            .await
            .map_err(|_| BakError::NotFound(format!("file {} does not exist", id)))?;
        Ok(unix_secs(meta.modified()?))
    }

    // ##### Local blocks #####

    /// Assembles the canonical byte payload of a block: header, file
    /// fragments in range order, zero padding up to the block size.
    /// These bytes feed both transfer and hashing.
    pub async fn read_block(
        &self,
        store: &dyn MetadataStore,
        block: &BlockMeta,
    ) -> Result<Bytes> {
        let entries = self.header_entries(store, &block.ranges)?;
        let header = codec::encode_header(&entries)?;

        let mut fragments = Vec::with_capacity(block.ranges.len());
        for range in &block.ranges {
            fragments.push(self.read_file_range(range).await?);
        }

        codec::assemble_block(self.block_size, &header, &fragments)
    }

    async fn read_file_range(&self, range: &FileRange) -> Result<Bytes> {
        let path = self.file_path(&range.file_id);
        let mut file = fs::File::open(&path)
            .await
            .map_err(|_| BakError::NotFound(format!("file {} does not exist", range.file_id)))?;
        file.seek(std::io::SeekFrom::Start(range.start)).await?;
        let mut buf = vec![0u8; range.len() as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    fn header_entries(
        &self,
        store: &dyn MetadataStore,
        ranges: &[FileRange],
    ) -> Result<Vec<HeaderEntry>> {
        let mut entries = Vec::with_capacity(ranges.len());
        for range in ranges {
            // A range referencing an unknown file means corrupt
            // metadata; well-formed stores never produce it.
            let path = store.get_file_path(&range.file_id)?.ok_or_else(|| {
                BakError::InvariantViolation(format!(
                    "block references unknown file {}",
                    range.file_id
                ))
            })?;
            entries.push(HeaderEntry {
                start: range.start,
                stop: range.stop,
                file_name: base_name(&path),
            });
        }
        Ok(entries)
    }

    fn single_range_header_size(&self, file: &FileEntry) -> Result<usize> {
        let header = codec::encode_header(&[HeaderEntry {
            start: 0,
            stop: 10,
            file_name: base_name(&file.path),
        }])?;
        Ok(header.len())
    }

    // ##### External blocks #####

    /// How many more external blocks this node can promise to peers.
    pub fn free_external_blocks(&self, store: &dyn MetadataStore) -> Result<i64> {
        let promised = store.list_external_blocks()?.len() as i64;
        Ok((self.external_capacity / self.block_size) as i64 - promised)
    }

    pub async fn create_external_block(&self, id: &str, data: Bytes) -> Result<()> {
        let path = self.external_path(id);
        if path.exists() {
            return Err(BakError::Conflict(format!(
                "external block {} already has content",
                id
            )));
        }
        let mut out = fs::File::create(&path).await?;
        out.write_all(&data).await?;
        out.sync_all().await?;
        Ok(())
    }

    pub async fn update_external_block(&self, id: &str, data: Bytes) -> Result<()> {
        let path = self.external_path(id);
        if !path.exists() {
            return Err(BakError::NotFound(format!(
                "external block {} has no content",
                id
            )));
        }
        let mut out = fs::File::create(&path).await?;
        out.write_all(&data).await?;
        out.sync_all().await?;
        Ok(())
    }

    /// Removes the content backing an external block, if any. Missing
    /// content is fine: freeing a free block is a no-op.
    pub async fn delete_external_block_content(&self, id: &str) -> Result<()> {
        let path = self.external_path(id);
        if path.exists() {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    pub async fn read_external_block(&self, id: &str) -> Result<Bytes> {
        let path = self.external_path(id);
        if !path.exists() {
            return Err(BakError::NotFound(format!(
                "external block {} has no content",
                id
            )));
        }
        Ok(Bytes::from(fs::read(&path).await?))
    }

    /// Unix seconds of the last content write, 0 for a free block.
    /// Peers use 0 to recognize reserved-but-unused capacity.
    pub async fn external_last_modified(&self, id: &str) -> Result<i64> {
        let path = self.external_path(id);
        match fs::metadata(&path).await {
            Ok(meta) => Ok(unix_secs(meta.modified()?)),
            Err(_) => Ok(0),
        }
    }

    pub async fn external_salted_hash(
        &self,
        id: &str,
        salt: &[u8],
        method: HashMethod,
    ) -> Result<String> {
        let content = self.read_external_block(id).await?;
        Ok(method.salted_hex(&content, salt))
    }
}

fn base_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn unix_secs(time: std::time::SystemTime) -> i64 {
    time.duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;

    const BLOCK_SIZE: u64 = 256;

    fn setup() -> (tempfile::TempDir, DataStore, MemoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let data = DataStore::new(dir.path().to_path_buf(), BLOCK_SIZE, BLOCK_SIZE * 8).unwrap();
        (dir, data, MemoryStore::new())
    }

    fn file_entry(id: &str, path: &str) -> FileEntry {
        FileEntry {
            id: id.to_string(),
            path: path.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_file_chunks_into_blocks() {
        let (_dir, data, store) = setup();
        let file = file_entry("f1", "/home/u/report.pdf");
        store.add_new_file(&file).unwrap();

        let content = Bytes::from(vec![42u8; 600]);
        let blocks = data.create_file(&store, &file, content).await.unwrap();

        // header: 16 offset bytes + "report.pdf" + terminator = 27,
        // capacity 229 per block, ceil(600/229) = 3
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].ranges[0].start, 0);
        assert_eq!(blocks.last().unwrap().ranges[0].stop, 600);
        for window in blocks.windows(2) {
            assert_eq!(window[0].ranges[0].stop, window[1].ranges[0].start);
        }
        assert_eq!(store.list_blocks().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_create_empty_file_creates_no_blocks() {
        let (_dir, data, store) = setup();
        let file = file_entry("f1", "empty.bin");
        store.add_new_file(&file).unwrap();

        let blocks = data.create_file(&store, &file, Bytes::new()).await.unwrap();
        assert!(blocks.is_empty());
        assert!(store.list_blocks().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_file_twice_conflicts() {
        let (_dir, data, store) = setup();
        let file = file_entry("f1", "a.txt");
        store.add_new_file(&file).unwrap();
        data.create_file(&store, &file, Bytes::from_static(b"x"))
            .await
            .unwrap();
        let err = data
            .create_file(&store, &file, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, BakError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_read_block_is_canonical() {
        let (_dir, data, store) = setup();
        let file = file_entry("f1", "song.mp3");
        store.add_new_file(&file).unwrap();

        let content: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
        let blocks = data
            .create_file(&store, &file, Bytes::from(content.clone()))
            .await
            .unwrap();
        assert_eq!(blocks.len(), 1);

        let payload = data.read_block(&store, &blocks[0]).await.unwrap();
        assert_eq!(payload.len() as u64, BLOCK_SIZE);

        let (entries, header_len) = codec::decode_header(&payload).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].file_name, "song.mp3");
        assert_eq!(entries[0].start, 0);
        assert_eq!(entries[0].stop, 200);
        assert_eq!(&payload[header_len..header_len + 200], &content[..]);
        assert!(payload[header_len + 200..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_read_block_unknown_file_is_invariant_violation() {
        let (_dir, data, store) = setup();
        let block = BlockMeta {
            id: "b1".to_string(),
            server_to_id: BTreeMap::new(),
            ranges: vec![FileRange {
                file_id: "ghost".to_string(),
                start: 0,
                stop: 10,
            }],
        };
        let err = data.read_block(&store, &block).await.unwrap_err();
        assert!(matches!(err, BakError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn test_delete_file_shrinks_and_deletes_blocks() {
        let (_dir, data, store) = setup();
        let file = file_entry("f1", "doc.txt");
        store.add_new_file(&file).unwrap();
        let created = data
            .create_file(&store, &file, Bytes::from(vec![1u8; 500]))
            .await
            .unwrap();
        assert!(created.len() > 1);

        store.delete_file("f1").unwrap();
        let touched = data.delete_file(&store, &file).await.unwrap();
        assert_eq!(touched.len(), created.len());
        assert!(touched.iter().all(|block| block.ranges.is_empty()));
        assert!(store.list_blocks().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_external_block_lifecycle() {
        let (_dir, data, store) = setup();

        assert_eq!(data.external_last_modified("e1").await.unwrap(), 0);

        data.create_external_block("e1", Bytes::from_static(b"peer bytes"))
            .await
            .unwrap();
        assert!(data.external_last_modified("e1").await.unwrap() > 0);
        let err = data
            .create_external_block("e1", Bytes::from_static(b"again"))
            .await
            .unwrap_err();
        assert!(matches!(err, BakError::Conflict(_)));

        data.update_external_block("e1", Bytes::from_static(b"new bytes"))
            .await
            .unwrap();
        assert_eq!(
            data.read_external_block("e1").await.unwrap(),
            Bytes::from_static(b"new bytes")
        );

        let hash = data
            .external_salted_hash("e1", b"salt", HashMethod::Sha256)
            .await
            .unwrap();
        assert_eq!(hash, HashMethod::Sha256.salted_hex(b"new bytes", b"salt"));

        data.delete_external_block_content("e1").await.unwrap();
        assert_eq!(data.external_last_modified("e1").await.unwrap(), 0);
        assert_eq!(data.free_external_blocks(&store).unwrap(), 8);
    }
}
