use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::RwLock;

use ahash::AHashMap;
use tracing::{event, Level};

use crate::error::{GraphsyncError, Result};
use crate::link::Link;

/// Loader and storer of blocks by link.
///
/// Implementations must tolerate concurrent readers and writers: a `get`
/// observes a block once the `put` storing it has returned.
pub trait BlockStore: Send + Sync {
    /// Fails with `GraphsyncError::NotFound` when the block is absent.
    fn get(&self, link: &Link) -> Result<Vec<u8>>;
    fn put(&self, data: Vec<u8>) -> Result<Link>;
    fn has(&self, link: &Link) -> bool;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    blocks: RwLock<AHashMap<Link, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            blocks: RwLock::new(AHashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.read().map(|blocks| blocks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove(&self, link: &Link) -> bool {
        match self.blocks.write() {
            Ok(mut blocks) => blocks.remove(link).is_some(),
            Err(_) => false,
        }
    }
}

fn poisoned() -> GraphsyncError {
    GraphsyncError::Io(String::from("block store lock poisoned"))
}

impl BlockStore for MemoryStore {
    fn get(&self, link: &Link) -> Result<Vec<u8>> {
        let blocks = self.blocks.read().map_err(|_| poisoned())?;
        blocks.get(link).cloned().ok_or(GraphsyncError::NotFound(*link))
    }

    fn put(&self, data: Vec<u8>) -> Result<Link> {
        let link = Link::for_bytes(&data);
        let mut blocks = self.blocks.write().map_err(|_| poisoned())?;
        blocks.entry(link).or_insert(data);
        Ok(link)
    }

    fn has(&self, link: &Link) -> bool {
        self.blocks
            .read()
            .map(|blocks| blocks.contains_key(link))
            .unwrap_or(false)
    }
}

/// Blocks as files in a directory, one file per block named by the hex link.
#[derive(Debug, Clone)]
pub struct FileStore {
    directory: PathBuf,
}

impl FileStore {
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        event!(Level::INFO, "file store at {}", directory.display());
        Ok(FileStore { directory })
    }

    fn filename(&self, link: &Link) -> PathBuf {
        let mut filename = self.directory.clone();
        filename.push(format!("{}.blk", link.to_hex()));
        filename
    }
}

impl BlockStore for FileStore {
    fn get(&self, link: &Link) -> Result<Vec<u8>> {
        let filename = self.filename(link);
        if !filename.exists() {
            return Err(GraphsyncError::NotFound(*link));
        }
        let mut file = File::open(filename)?;
        let mut data = Vec::<u8>::new();
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    fn put(&self, data: Vec<u8>) -> Result<Link> {
        let link = Link::for_bytes(&data);
        let filename = self.filename(&link);
        if !filename.exists() {
            // write then rename so readers never see a partial block
            let mut staging = filename.clone();
            staging.set_extension("tmp");
            let mut buffer = File::create(&staging)?;
            buffer.write_all(&data[..])?;
            buffer.sync_all()?;
            fs::rename(staging, filename)?;
        }
        Ok(link)
    }

    fn has(&self, link: &Link) -> bool {
        self.filename(link).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_put_get() {
        let store = MemoryStore::new();
        let link = store.put(vec![1, 2, 3]).unwrap();
        assert!(store.has(&link));
        assert_eq!(store.get(&link).unwrap(), vec![1, 2, 3]);
        assert_eq!(store.len(), 1);
        let absent = Link::for_bytes(b"absent");
        assert_eq!(store.get(&absent), Err(GraphsyncError::NotFound(absent)));
        assert!(store.remove(&link));
        assert!(store.is_empty());
    }

    #[test]
    fn file_store_put_get() {
        let mut directory = std::env::temp_dir();
        directory.push(format!("graphsync-store-{}", uuid::Uuid::new_v4()));
        let store = FileStore::new(&directory).unwrap();
        let link = store.put(b"block bytes".to_vec()).unwrap();
        assert!(store.has(&link));
        assert_eq!(store.get(&link).unwrap(), b"block bytes".to_vec());
        assert!(matches!(
            store.get(&Link::for_bytes(b"nope")),
            Err(GraphsyncError::NotFound(_))
        ));
        fs::remove_dir_all(directory).unwrap();
    }
}
