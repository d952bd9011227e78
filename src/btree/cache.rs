//! Buffered cache over the serializer.
//!
//! The cache owns the in-memory image of the tree and hands out
//! transactions: shared guards for readers, an exclusive guard for the one
//! writer. Mutations accumulate dirtiness; the image is written back through
//! the serializer once the dirty estimate crosses `max_dirty_size`, on an
//! explicit flush, and when the cache is dropped. The
//! `expected_change_count` passed with a write transaction is an advisory
//! eviction hint: it sizes the dirty estimate and nothing else, so
//! conservative overestimates are harmless.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, warn};

use crate::btree::{BtreeError, BtreeResult, ReplTimestamp, Serializer};
use crate::protocol::buffer::{
    read_bytes, read_u32, read_u64, write_bytes, write_u32, write_u64,
};
use crate::protocol::{Cas, DataBuffer, Exptime, Flags, KeyRange, StoreKey};

const SUPERBLOCK_BLOCK: u32 = 0;
const ENTRIES_BLOCK: u32 = 1;
const DELETES_BLOCK: u32 = 2;
const ERASES_BLOCK: u32 = 3;

/// Rough bytes-per-change used to translate the eviction hint into a dirty
/// estimate.
const CHANGE_SIZE_HINT: u64 = 4096;

/// Dynamic sizing for the cache.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Maximum bytes the buffered image should occupy.
    pub max_size: u64,

    /// Dirty bytes tolerated before the image is written back.
    pub max_dirty_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1 << 30,
            max_dirty_size: 1 << 29,
        }
    }
}

/// One stored key's record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub value: DataBuffer,
    pub flags: Flags,
    pub exptime: Exptime,
    /// `0` until a CAS is assigned or proposed.
    pub cas: Cas,
    /// Last-modification stamp compared by backfill.
    pub recency: ReplTimestamp,
}

impl Entry {
    fn encode(&self, out: &mut Vec<u8>) {
        write_bytes(out, self.value.as_slice());
        write_u32(out, self.flags);
        write_u32(out, self.exptime);
        write_u64(out, self.cas);
        write_u32(out, self.recency.0);
    }

    fn decode(input: &mut &[u8]) -> BtreeResult<Entry> {
        let value = DataBuffer::from(read_bytes(input)?);
        let flags = read_u32(input)?;
        let exptime = read_u32(input)?;
        let cas = read_u64(input)?;
        let recency = ReplTimestamp(read_u32(input)?);
        Ok(Entry {
            value,
            flags,
            exptime,
            cas,
            recency,
        })
    }
}

/// The buffered tree image: the superblock state plus the ordered entries
/// and the deletion records backfill consumes.
#[derive(Debug, Default)]
pub struct StoreImage {
    /// Metainfo pairs persisted on the superblock.
    pub(crate) metainfo: Vec<(Vec<u8>, Vec<u8>)>,

    /// Monotonic CAS allocator, persisted on the superblock.
    pub(crate) cas_counter: u64,

    /// Live entries in key order.
    pub(crate) entries: BTreeMap<StoreKey, Entry>,

    /// Per-key tombstones (the delete queue).
    pub(crate) deleted: BTreeMap<StoreKey, ReplTimestamp>,

    /// Recorded whole-range erases.
    pub(crate) erased: Vec<(KeyRange, ReplTimestamp)>,
}

impl StoreImage {
    fn encode_blocks(&self) -> Vec<(u32, Vec<u8>)> {
        let mut superblock = Vec::new();
        write_u64(&mut superblock, self.cas_counter);
        write_u32(&mut superblock, self.metainfo.len() as u32);
        for (key, value) in &self.metainfo {
            write_bytes(&mut superblock, key);
            write_bytes(&mut superblock, value);
        }

        let mut entries = Vec::new();
        write_u32(&mut entries, self.entries.len() as u32);
        for (key, entry) in &self.entries {
            write_bytes(&mut entries, key.as_slice());
            entry.encode(&mut entries);
        }

        let mut deletes = Vec::new();
        write_u32(&mut deletes, self.deleted.len() as u32);
        for (key, recency) in &self.deleted {
            write_bytes(&mut deletes, key.as_slice());
            write_u32(&mut deletes, recency.0);
        }

        let mut erases = Vec::new();
        write_u32(&mut erases, self.erased.len() as u32);
        for (range, recency) in &self.erased {
            range.encode(&mut erases);
            write_u32(&mut erases, recency.0);
        }

        vec![
            (SUPERBLOCK_BLOCK, superblock),
            (ENTRIES_BLOCK, entries),
            (DELETES_BLOCK, deletes),
            (ERASES_BLOCK, erases),
        ]
    }

    fn decode_blocks(blocks: Vec<(u32, Vec<u8>)>) -> BtreeResult<StoreImage> {
        let mut image = StoreImage::default();
        for (id, payload) in blocks {
            let mut input = payload.as_slice();
            match id {
                SUPERBLOCK_BLOCK => {
                    image.cas_counter = read_u64(&mut input)?;
                    let count = read_u32(&mut input)?;
                    for _ in 0..count {
                        let key = read_bytes(&mut input)?;
                        let value = read_bytes(&mut input)?;
                        image.metainfo.push((key, value));
                    }
                }
                ENTRIES_BLOCK => {
                    let count = read_u32(&mut input)?;
                    for _ in 0..count {
                        let key = StoreKey::new(read_bytes(&mut input)?);
                        let entry = Entry::decode(&mut input)?;
                        image.entries.insert(key, entry);
                    }
                }
                DELETES_BLOCK => {
                    let count = read_u32(&mut input)?;
                    for _ in 0..count {
                        let key = StoreKey::new(read_bytes(&mut input)?);
                        let recency = ReplTimestamp(read_u32(&mut input)?);
                        image.deleted.insert(key, recency);
                    }
                }
                ERASES_BLOCK => {
                    let count = read_u32(&mut input)?;
                    for _ in 0..count {
                        let range = KeyRange::decode(&mut input)?;
                        let recency = ReplTimestamp(read_u32(&mut input)?);
                        image.erased.push((range, recency));
                    }
                }
                other => {
                    return Err(BtreeError::Corrupt(format!("unknown block id {}", other)));
                }
            }
        }
        Ok(image)
    }
}

struct DirtyState {
    bytes: u64,
}

/// The buffered, transactional layer between the slice and the serializer.
pub struct Cache {
    serializer: Arc<Serializer>,
    image: Arc<RwLock<StoreImage>>,
    dirty: Arc<Mutex<DirtyState>>,
    config: CacheConfig,
}

impl Cache {
    /// Writes a fresh, empty image through the serializer.
    pub fn create(serializer: &Serializer) -> BtreeResult<()> {
        serializer.store_blocks(&StoreImage::default().encode_blocks())
    }

    /// Loads the image from the serializer and takes ownership of it.
    pub fn new(serializer: Serializer, config: CacheConfig) -> BtreeResult<Cache> {
        let blocks = serializer.load_blocks()?;
        let loaded_bytes: u64 = blocks.iter().map(|(_, b)| b.len() as u64).sum();
        let image = StoreImage::decode_blocks(blocks)?;
        if loaded_bytes > config.max_size {
            warn!(
                loaded_bytes,
                max_size = config.max_size,
                "store image exceeds the configured cache size"
            );
        }
        debug!(
            entries = image.entries.len(),
            max_size = config.max_size,
            max_dirty_size = config.max_dirty_size,
            "cache initialized"
        );
        Ok(Cache {
            serializer: Arc::new(serializer),
            image: Arc::new(RwLock::new(image)),
            dirty: Arc::new(Mutex::new(DirtyState { bytes: 0 })),
            config,
        })
    }

    /// Begins a shared transaction. `snapshot` pins the view for reads
    /// that span yields.
    pub async fn begin_read(&self, snapshot: bool) -> ReadTransaction {
        ReadTransaction {
            guard: self.image.clone().read_owned().await,
            snapshot,
        }
    }

    /// Begins the exclusive transaction, carrying the eviction hint and
    /// the repli timestamp the caller operates at.
    pub async fn begin_write(
        &self,
        expected_change_count: usize,
        timestamp: ReplTimestamp,
    ) -> WriteTransaction {
        WriteTransaction {
            guard: self.image.clone().write_owned().await,
            serializer: self.serializer.clone(),
            dirty: self.dirty.clone(),
            max_dirty_size: self.config.max_dirty_size,
            expected_change_count,
            timestamp,
        }
    }

    /// Mutates the image without a transaction. Only valid while nothing
    /// else holds the cache, i.e. during store initialization.
    pub(crate) fn with_image_mut<R>(
        &self,
        f: impl FnOnce(&mut StoreImage) -> R,
    ) -> BtreeResult<R> {
        let mut guard = self
            .image
            .try_write()
            .map_err(|_| BtreeError::Corrupt("cache busy during initialization".into()))?;
        let result = f(&mut guard);
        self.serializer.store_blocks(&guard.encode_blocks())?;
        Ok(result)
    }

    /// Writes the current image back through the serializer.
    pub fn flush(&self) -> BtreeResult<()> {
        let guard = self
            .image
            .try_read()
            .map_err(|_| BtreeError::Corrupt("cache busy during flush".into()))?;
        self.serializer.store_blocks(&guard.encode_blocks())?;
        self.dirty.lock().bytes = 0;
        Ok(())
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        if self.dirty.lock().bytes > 0 {
            if let Err(e) = self.flush() {
                warn!(error = %e, "final cache flush failed");
            }
        }
    }
}

/// Read access to the image under a transaction.
pub trait TxnRead {
    fn image(&self) -> &StoreImage;
}

/// A shared transaction over the buffered image.
pub struct ReadTransaction {
    guard: OwnedRwLockReadGuard<StoreImage>,
    snapshot: bool,
}

impl ReadTransaction {
    pub fn is_snapshot(&self) -> bool {
        self.snapshot
    }
}

impl TxnRead for ReadTransaction {
    fn image(&self) -> &StoreImage {
        &self.guard
    }
}

/// The exclusive transaction. Dropping it commits: the dirty estimate grows
/// by the eviction hint, and the image is written back once the estimate
/// crosses the configured threshold.
pub struct WriteTransaction {
    guard: OwnedRwLockWriteGuard<StoreImage>,
    serializer: Arc<Serializer>,
    dirty: Arc<Mutex<DirtyState>>,
    max_dirty_size: u64,
    expected_change_count: usize,
    timestamp: ReplTimestamp,
}

impl WriteTransaction {
    pub fn image_mut(&mut self) -> &mut StoreImage {
        &mut self.guard
    }

    pub fn timestamp(&self) -> ReplTimestamp {
        self.timestamp
    }

    pub fn expected_change_count(&self) -> usize {
        self.expected_change_count
    }
}

impl TxnRead for WriteTransaction {
    fn image(&self) -> &StoreImage {
        &self.guard
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        let mut dirty = self.dirty.lock();
        dirty.bytes += self.expected_change_count as u64 * CHANGE_SIZE_HINT;
        if dirty.bytes < self.max_dirty_size {
            return;
        }
        match self.serializer.store_blocks(&self.guard.encode_blocks()) {
            Ok(()) => dirty.bytes = 0,
            Err(e) => warn!(error = %e, "write-back failed; keeping image dirty"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(value: &str, recency: u32) -> Entry {
        Entry {
            value: DataBuffer::from(value),
            flags: 0,
            exptime: 0,
            cas: 0,
            recency: ReplTimestamp(recency),
        }
    }

    fn new_cache(dir: &TempDir) -> Cache {
        let path = dir.path().join("t.mc");
        Serializer::create(&path).unwrap();
        let serializer = Serializer::open(&path).unwrap();
        Cache::create(&serializer).unwrap();
        Cache::new(serializer, CacheConfig::default()).unwrap()
    }

    #[test]
    fn test_image_block_round_trip() {
        let mut image = StoreImage::default();
        image.cas_counter = 42;
        image.metainfo.push((b"mk".to_vec(), b"mv".to_vec()));
        image.entries.insert(StoreKey::from("a"), entry("1", 3));
        image.deleted.insert(StoreKey::from("b"), ReplTimestamp(4));
        image
            .erased
            .push((KeyRange::universe(), ReplTimestamp(5)));

        let decoded = StoreImage::decode_blocks(image.encode_blocks()).unwrap();
        assert_eq!(decoded.cas_counter, 42);
        assert_eq!(decoded.metainfo, image.metainfo);
        assert_eq!(decoded.entries, image.entries);
        assert_eq!(decoded.deleted, image.deleted);
        assert_eq!(decoded.erased, image.erased);
    }

    #[tokio::test]
    async fn test_write_transaction_persists_on_cache_drop() {
        let dir = TempDir::new().unwrap();
        {
            let cache = new_cache(&dir);
            let mut txn = cache.begin_write(1, ReplTimestamp(1)).await;
            txn.image_mut()
                .entries
                .insert(StoreKey::from("k"), entry("v", 1));
            drop(txn);
        }

        let serializer = Serializer::open(&dir.path().join("t.mc")).unwrap();
        let reopened = Cache::new(serializer, CacheConfig::default()).unwrap();
        let txn = reopened.begin_read(false).await;
        assert_eq!(
            txn.image().entries.get(&StoreKey::from("k")),
            Some(&entry("v", 1))
        );
    }

    #[tokio::test]
    async fn test_small_dirty_estimate_defers_write_back() {
        let dir = TempDir::new().unwrap();
        let cache = new_cache(&dir);

        let mut txn = cache.begin_write(1, ReplTimestamp(1)).await;
        txn.image_mut()
            .entries
            .insert(StoreKey::from("k"), entry("v", 1));
        drop(txn);

        // Below max_dirty_size nothing has been written back yet.
        let on_disk = Serializer::open(&dir.path().join("t.mc"))
            .unwrap()
            .load_blocks()
            .unwrap();
        let image = StoreImage::decode_blocks(on_disk).unwrap();
        assert!(image.entries.is_empty());
        assert!(cache.dirty.lock().bytes > 0);
    }

    #[tokio::test]
    async fn test_dirty_threshold_triggers_write_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.mc");
        Serializer::create(&path).unwrap();
        let serializer = Serializer::open(&path).unwrap();
        Cache::create(&serializer).unwrap();
        let cache = Cache::new(
            serializer,
            CacheConfig {
                max_size: 1 << 30,
                max_dirty_size: CHANGE_SIZE_HINT,
            },
        )
        .unwrap();

        let mut txn = cache.begin_write(1, ReplTimestamp(1)).await;
        txn.image_mut()
            .entries
            .insert(StoreKey::from("k"), entry("v", 1));
        drop(txn);

        let on_disk = Serializer::open(&path).unwrap().load_blocks().unwrap();
        let image = StoreImage::decode_blocks(on_disk).unwrap();
        assert_eq!(image.entries.len(), 1);
    }
}
