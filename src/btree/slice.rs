//! The B-tree slice: superblock acquisition and operation ordering.
//!
//! A slice is thread-affine: it remembers the thread that built it and
//! every superblock acquisition asserts it is still running there. Order
//! tokens are a causal debugging aid — each acquisition checks a token
//! minted by the store through the slice's order checkpoint, which asserts
//! that tokens arrive in mint order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use crate::btree::cache::{Cache, ReadTransaction, TxnRead, WriteTransaction};
use crate::btree::{Access, BtreeResult, ReplTimestamp};
use crate::protocol::{Cas, KeyRange};

/// A causal tag minted by an `OrderSource` and checked through an
/// `OrderCheckpoint` to detect reordering bugs.
#[derive(Clone, Copy, Debug)]
pub struct OrderToken {
    seq: u64,
    tag: &'static str,
}

impl OrderToken {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }
}

/// Mints order tokens in a monotonically increasing sequence.
#[derive(Debug, Default)]
pub struct OrderSource {
    counter: AtomicU64,
}

impl OrderSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_in(&self, tag: &'static str) -> OrderToken {
        OrderToken {
            seq: self.counter.fetch_add(1, Ordering::SeqCst),
            tag,
        }
    }
}

/// Asserts that order tokens pass through in mint order.
#[derive(Debug, Default)]
pub struct OrderCheckpoint {
    last_seen: AtomicU64,
}

impl OrderCheckpoint {
    pub fn check_through(&self, token: OrderToken) -> OrderToken {
        let previous = self.last_seen.swap(token.seq + 1, Ordering::SeqCst);
        debug_assert!(
            previous <= token.seq + 1,
            "order token {} ({}) arrived after {}",
            token.seq,
            token.tag,
            previous
        );
        token
    }
}

/// The acquired superblock: proof that the root buffer is held under the
/// current transaction, carrying the order token it was acquired with.
pub struct Superblock {
    order_token: OrderToken,
}

impl Superblock {
    pub fn order_token(&self) -> OrderToken {
        self.order_token
    }

    /// The raw metainfo pairs stored on the superblock.
    pub fn metainfo_pairs<'a, T: TxnRead>(&self, txn: &'a T) -> &'a [(Vec<u8>, Vec<u8>)] {
        &txn.image().metainfo
    }

    pub fn clear_metainfo(&self, txn: &mut WriteTransaction) {
        txn.image_mut().metainfo.clear();
    }

    pub fn push_metainfo_pair(&self, txn: &mut WriteTransaction, key: Vec<u8>, value: Vec<u8>) {
        txn.image_mut().metainfo.push((key, value));
    }

    /// Allocates the next CAS from the superblock's monotonic counter.
    pub fn mint_cas(&self, txn: &mut WriteTransaction) -> Cas {
        let image = txn.image_mut();
        image.cas_counter += 1;
        image.cas_counter
    }
}

/// Ordered key/value operations over the cache, plus superblock
/// acquisition. Owned exclusively by one store.
pub struct BtreeSlice {
    cache: Cache,
    order_checkpoint: OrderCheckpoint,
    home_thread: ThreadId,
}

impl BtreeSlice {
    /// One-time initialization of a fresh cache: the metainfo must cover
    /// `universe` at all times, so it starts as a single empty blob over
    /// the whole domain.
    pub fn create(cache: &Cache) -> BtreeResult<()> {
        cache.with_image_mut(|image| {
            let mut key = Vec::new();
            KeyRange::universe().encode(&mut key);
            image.metainfo.clear();
            image.metainfo.push((key, Vec::new()));
        })
    }

    pub fn new(cache: Cache) -> BtreeSlice {
        BtreeSlice {
            cache,
            order_checkpoint: OrderCheckpoint::default(),
            home_thread: thread::current().id(),
        }
    }

    /// Slices are thread-affine; every acquisition path asserts it.
    pub fn assert_thread(&self) {
        debug_assert_eq!(
            self.home_thread,
            thread::current().id(),
            "btree slice used off its home thread"
        );
    }

    pub fn order_checkpoint(&self) -> &OrderCheckpoint {
        &self.order_checkpoint
    }

    /// Acquires the superblock under a shared transaction.
    pub async fn superblock_for_reading(
        &self,
        _access: Access,
        order_token: OrderToken,
        snapshot: bool,
    ) -> (Superblock, ReadTransaction) {
        self.assert_thread();
        let txn = self.cache.begin_read(snapshot).await;
        (Superblock { order_token }, txn)
    }

    /// Acquires the superblock for a backfill traversal: shared access
    /// with coarse locking so the traversal cannot starve writers.
    pub async fn superblock_for_backfilling(
        &self,
        order_token: OrderToken,
    ) -> (Superblock, ReadTransaction) {
        self.assert_thread();
        let txn = self.cache.begin_read(true).await;
        (Superblock { order_token }, txn)
    }

    /// Acquires the superblock under the exclusive transaction.
    pub async fn superblock_for_writing(
        &self,
        _access: Access,
        expected_change_count: usize,
        timestamp: ReplTimestamp,
        order_token: OrderToken,
    ) -> (Superblock, WriteTransaction) {
        self.assert_thread();
        let txn = self.cache.begin_write(expected_change_count, timestamp).await;
        (Superblock { order_token }, txn)
    }
}
