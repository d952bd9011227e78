//! # memshard: a per-shard storage engine over a persistent B-tree
//!
//! memshard binds a memcached-style key/value command set to a buffered,
//! transactional, persistent B-tree store. One `Store` owns one shard — a
//! contiguous key range, `universe` by default — backed by one file on disk.
//! It provides:
//!
//! - **Request algebra**: `Read` and `Write` value types with a
//!   `region / shard / unshard` algebra, so a routing layer above can split a
//!   request across shards and merge the responses back together
//! - **Transactional superblock access**: every operation runs against a
//!   superblock acquired from the B-tree under a reader/writer FIFO
//!   discipline, so effects are observed in token-mint order
//! - **Atomic metainfo**: an opaque region → blob map persisted on the
//!   superblock, updated in the same transaction as the mutation it describes
//! - **Streaming backfill**: an ordered stream of delete-range, delete-key
//!   and set-key chunks that brings a peer's copy of a subrange up to date
//!   since a given timestamp, plus the receiver that applies them
//!
//! The memcached wire parser, request routing and replication coordination
//! live outside this crate; they consume the `Store` API directly.

// Core modules
pub mod btree;
pub mod interrupt;
pub mod protocol;
pub mod store;

// Re-export main types at crate root for convenience
pub use interrupt::Interruptor;
pub use protocol::{
    DataBuffer, KeyRange, Read, ReadResponse, RegionMap, StoreKey, Write, WriteResponse,
};
pub use store::{BackfillChunk, Store, StoreError, StoreResult};
