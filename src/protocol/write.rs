//! Mutations: value types, per-variant results and the (trivial) shard
//! algebra. Every mutation touches exactly one key, so a `Write`'s region
//! is always a point range and sharding is the identity.

use crate::protocol::region::{KeyRange, StoreKey};
use crate::protocol::{Cas, DataBuffer, Exptime, Flags, GetResult, ProtocolError, INVALID_CAS};

/// Whether a `Set` may create a missing key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddPolicy {
    Yes,
    No,
}

/// Whether a `Set` may overwrite an existing key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplacePolicy {
    Yes,
    No,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IncrDecrKind {
    Incr,
    Decr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendPrependKind {
    Append,
    Prepend,
}

/// The mutation inside a `Write`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    /// Promotes the key's value and assigns it a CAS.
    GetCas { key: StoreKey },
    Set {
        key: StoreKey,
        data: DataBuffer,
        flags: Flags,
        exptime: Exptime,
        add_policy: AddPolicy,
        replace_policy: ReplacePolicy,
        old_cas: Cas,
    },
    IncrDecr {
        key: StoreKey,
        kind: IncrDecrKind,
        amount: u64,
    },
    AppendPrepend {
        key: StoreKey,
        data: DataBuffer,
        kind: AppendPrependKind,
    },
    Delete {
        key: StoreKey,
        dont_put_in_delete_queue: bool,
    },
}

impl Mutation {
    pub fn key(&self) -> &StoreKey {
        match self {
            Mutation::GetCas { key }
            | Mutation::Set { key, .. }
            | Mutation::IncrDecr { key, .. }
            | Mutation::AppendPrepend { key, .. }
            | Mutation::Delete { key, .. } => key,
        }
    }
}

/// A write request: one mutation, the CAS proposed for the resulting entry
/// (`INVALID_CAS` to mint one; must be `INVALID_CAS` for `Delete`), and the
/// effective time expiration is evaluated against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Write {
    pub mutation: Mutation,
    pub proposed_cas: Cas,
    pub effective_time: Exptime,
}

impl Write {
    pub fn new(mutation: Mutation, proposed_cas: Cas, effective_time: Exptime) -> Self {
        debug_assert!(
            !matches!(mutation, Mutation::Delete { .. }) || proposed_cas == INVALID_CAS,
            "delete must not carry a proposed CAS"
        );
        Self {
            mutation,
            proposed_cas,
            effective_time,
        }
    }

    /// The point range of the mutation's key.
    pub fn region(&self) -> KeyRange {
        KeyRange::point(self.mutation.key())
    }

    /// A write never spans shards; narrowing to anything but its own
    /// region is a violation.
    pub fn shard(&self, region: &KeyRange) -> Result<Write, ProtocolError> {
        if *region != self.region() {
            return Err(ProtocolError::DomainViolation {
                sub: region.clone(),
                parent: self.region(),
            });
        }
        Ok(self.clone())
    }

    pub fn unshard(&self, responses: Vec<WriteResponse>) -> Result<WriteResponse, ProtocolError> {
        if responses.len() != 1 {
            return Err(ProtocolError::ResponseCount {
                expected: 1,
                got: responses.len(),
            });
        }
        let mut responses = responses;
        Ok(responses.remove(0))
    }
}

/// Outcome of a `Set`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetResult {
    Stored,
    /// The policies forbade creating or replacing the key.
    NotStored,
    /// The `old_cas` precondition failed.
    Exists,
    TooLarge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IncrDecrResult {
    Success(u64),
    NotFound,
    NotNumber,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendPrependResult {
    Success,
    NotFound,
    TooLarge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteResult {
    Deleted,
    NotFound,
}

/// The response to a `Write`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteResponse {
    GetCas(GetResult),
    Set(SetResult),
    IncrDecr(IncrDecrResult),
    AppendPrepend(AppendPrependResult),
    Delete(DeleteResult),
}
