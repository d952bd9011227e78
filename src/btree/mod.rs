//! The persistent B-tree store behind the engine.
//!
//! The stack is layered the way the store owns it: a `Serializer` moves
//! block frames to and from one file, a `Cache` buffers the tree image and
//! hands out read/write transactions, and a `BtreeSlice` exposes superblock
//! acquisition plus the ordered key/value operations the dispatch layer
//! calls. The node format and page layout are internal to this module;
//! everything above it sees only transactions, the superblock and typed
//! operation results.

pub mod cache;
pub mod ops;
pub mod serializer;
pub mod slice;

pub use cache::{Cache, CacheConfig, Entry, ReadTransaction, StoreImage, TxnRead, WriteTransaction};
pub use ops::{BackfillAtom, BackfillEvent};
pub use serializer::Serializer;
pub use slice::{BtreeSlice, OrderCheckpoint, OrderSource, OrderToken, Superblock};

use thiserror::Error;

use crate::protocol::DecodeError;

/// Largest value payload a single entry may hold.
pub const MAX_VALUE_SIZE: usize = 1 << 20;

/// Access mode requested for a superblock acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// The coarse per-entry recency stamp kept on disk and compared by
/// backfill.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplTimestamp(pub u32);

impl ReplTimestamp {
    /// "Unstamped": mutations carrying this stamp record recency 0 and are
    /// treated as ancient by backfill.
    pub const INVALID: ReplTimestamp = ReplTimestamp(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// The stamp actually recorded on an entry: `self` when valid,
    /// otherwise the distant past.
    pub fn or_ancient(self) -> ReplTimestamp {
        if self.is_valid() {
            self
        } else {
            ReplTimestamp(0)
        }
    }
}

/// The fine-grained timestamp the replication layer hands down. Converting
/// to `ReplTimestamp` loses precision: values saturate at `u32::MAX - 1`
/// (the quantum is 1:1 below the clamp).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateTimestamp(pub u64);

impl StateTimestamp {
    pub fn zero() -> Self {
        StateTimestamp(0)
    }

    pub fn to_repli_timestamp(self) -> ReplTimestamp {
        ReplTimestamp(self.0.min(u64::from(u32::MAX - 1)) as u32)
    }
}

/// Failures raised by the serializer/cache/slice stack.
#[derive(Error, Debug)]
pub enum BtreeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt store file: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

pub type BtreeResult<T> = Result<T, BtreeError>;
