//! Shard protocol: the request/response value types and their algebra.
//!
//! A `Read` or `Write` describes one client command plus the effective time
//! it should be evaluated at. Each request knows the key range it touches
//! (`region()`), can be narrowed to a sub-range (`shard()`), and can merge
//! the responses of its shards back into a single response (`unshard()`).
//! The routing layer above the store uses this algebra to split a request
//! across shards and recombine the results without understanding the
//! individual commands.
//!
//! The module also owns the serde primitives: length-prefixed framing for
//! data buffers and for streamed range-read results, reused by the metainfo
//! codec on the persistence side.

pub mod buffer;
pub mod read;
pub mod region;
pub mod write;

pub use buffer::{read_opt_data_buffer, write_opt_data_buffer, DataBuffer};
pub use read::{GetResult, KeyWithBuffer, Read, ReadQuery, ReadResponse, RgetResult};
pub use region::{BoundMode, KeyRange, RegionMap, RightBound, StoreKey, MAX_KEY_SIZE};
pub use write::{
    AddPolicy, AppendPrependKind, AppendPrependResult, DeleteResult, IncrDecrKind,
    IncrDecrResult, Mutation, ReplacePolicy, SetResult, Write, WriteResponse,
};

use thiserror::Error;

/// Expiration times and the effective time they are compared against.
/// `0` means "never expires".
pub type Exptime = u32;

/// Opaque per-key flags stored and returned verbatim.
pub type Flags = u32;

/// A compare-and-swap version tag. `0` on a stored entry means no CAS has
/// been assigned yet; `INVALID_CAS` is the "no CAS supplied" sentinel in
/// requests.
pub type Cas = u64;

/// Sentinel meaning "no CAS": as `old_cas` it disables the precondition, as
/// `proposed_cas` it asks the store to mint a fresh CAS.
pub const INVALID_CAS: Cas = u64::MAX;

/// Framing failures while decoding serialized buffers, ranges or streams.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("input underflow: needed {needed} more byte(s)")]
    Underflow { needed: usize },

    #[error("negative serialized size: {0}")]
    NegativeSize(i64),

    #[error("truncated payload: size {size} but only {available} byte(s) left")]
    Truncated { size: usize, available: usize },

    #[error("invalid tag byte: {0}")]
    BadTag(u8),
}

/// Shard-protocol errors: framing failures plus violated algebra
/// preconditions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("region {sub} is not contained in {parent}")]
    DomainViolation { sub: KeyRange, parent: KeyRange },

    #[error("regions do not form a partition: {0}")]
    NotAPartition(String),

    #[error("expected exactly {expected} response(s), got {got}")]
    ResponseCount { expected: usize, got: usize },

    #[error("response variant does not match the request")]
    ResponseMismatch,
}
