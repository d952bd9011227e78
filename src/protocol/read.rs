//! Point and range reads: value types, shard algebra and the result merger.

use std::collections::VecDeque;

use crate::protocol::buffer::{
    read_bool, read_bytes, read_opt_data_buffer, write_bool, write_bytes, write_opt_data_buffer,
};
use crate::protocol::region::{BoundMode, KeyRange, RightBound, StoreKey};
use crate::protocol::{Cas, DataBuffer, DecodeError, Exptime, Flags, ProtocolError};

/// The query inside a `Read`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadQuery {
    /// Single-key lookup.
    Get { key: StoreKey },
    /// Range scan with independently-specified bounds.
    Rget {
        left_mode: BoundMode,
        left_key: StoreKey,
        right_mode: BoundMode,
        right_key: StoreKey,
    },
}

/// A read request: a query plus the effective time expiration is evaluated
/// against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Read {
    pub query: ReadQuery,
    pub effective_time: Exptime,
}

impl Read {
    pub fn get(key: StoreKey, effective_time: Exptime) -> Self {
        Self {
            query: ReadQuery::Get { key },
            effective_time,
        }
    }

    pub fn rget(
        left_mode: BoundMode,
        left_key: StoreKey,
        right_mode: BoundMode,
        right_key: StoreKey,
        effective_time: Exptime,
    ) -> Self {
        Self {
            query: ReadQuery::Rget {
                left_mode,
                left_key,
                right_mode,
                right_key,
            },
            effective_time,
        }
    }

    /// The smallest key range the query touches.
    pub fn region(&self) -> KeyRange {
        match &self.query {
            ReadQuery::Get { key } => KeyRange::point(key),
            ReadQuery::Rget {
                left_mode,
                left_key,
                right_mode,
                right_key,
            } => KeyRange::new(*left_mode, left_key, *right_mode, right_key),
        }
    }

    /// Narrows the read to `sub`, which must lie within `region()`. The
    /// narrowed rget adopts closed-left / open-right bounds so that shard
    /// pieces concatenate without overlap.
    pub fn shard(&self, sub: &KeyRange) -> Result<Read, ProtocolError> {
        let region = self.region();
        match &self.query {
            ReadQuery::Get { .. } => {
                if *sub != region {
                    return Err(ProtocolError::DomainViolation {
                        sub: sub.clone(),
                        parent: region,
                    });
                }
                Ok(self.clone())
            }
            ReadQuery::Rget { .. } => {
                if !region.is_superset(sub) {
                    return Err(ProtocolError::DomainViolation {
                        sub: sub.clone(),
                        parent: region,
                    });
                }
                let (right_mode, right_key) = match sub.right() {
                    RightBound::Unbounded => (BoundMode::None, StoreKey::min()),
                    RightBound::Bounded(right) => (BoundMode::Open, right.clone()),
                };
                Ok(Read::rget(
                    BoundMode::Closed,
                    sub.left().clone(),
                    right_mode,
                    right_key,
                    self.effective_time,
                ))
            }
        }
    }

    /// Merges shard responses back into a single response. A `Get` expects
    /// exactly one response; an `Rget` merges the response streams in
    /// ascending key order.
    pub fn unshard(&self, responses: Vec<ReadResponse>) -> Result<ReadResponse, ProtocolError> {
        match &self.query {
            ReadQuery::Get { .. } => {
                if responses.len() != 1 {
                    return Err(ProtocolError::ResponseCount {
                        expected: 1,
                        got: responses.len(),
                    });
                }
                Ok(responses.into_iter().next().unwrap_or_else(|| unreachable!()))
            }
            ReadQuery::Rget { .. } => {
                let mut mergees = Vec::with_capacity(responses.len());
                for response in responses {
                    match response {
                        ReadResponse::Rget(result) => mergees.push(result),
                        ReadResponse::Get(_) => return Err(ProtocolError::ResponseMismatch),
                    }
                }
                Ok(ReadResponse::Rget(RgetResult::merge(mergees)))
            }
        }
    }
}

/// Result of a single-key lookup.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GetResult {
    pub value: Option<DataBuffer>,
    pub flags: Flags,
    pub cas: Cas,
}

/// One element of a range-read result stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyWithBuffer {
    pub key: StoreKey,
    pub value: DataBuffer,
}

/// A finite, key-ascending sequence of `(key, value)` pairs. Holds one
/// already-ordered run per contributing shard and merges them lazily; the
/// shards partition the key space, so equal keys cannot collide.
#[derive(Clone, Debug, Default)]
pub struct RgetResult {
    mergees: Vec<VecDeque<KeyWithBuffer>>,
}

impl RgetResult {
    pub fn from_pairs(pairs: Vec<KeyWithBuffer>) -> Self {
        debug_assert!(pairs.windows(2).all(|w| w[0].key < w[1].key));
        Self {
            mergees: vec![pairs.into()],
        }
    }

    /// An ordered merge across several result streams.
    pub fn merge(results: Vec<RgetResult>) -> Self {
        Self {
            mergees: results.into_iter().flat_map(|r| r.mergees).collect(),
        }
    }

    /// Serializes the stream: a `next` marker before each element and a
    /// final `next = false` terminator. Consumes the iterator.
    pub fn encode(self, out: &mut Vec<u8>) {
        for pair in self {
            write_bool(out, true);
            write_bytes(out, pair.key.as_slice());
            write_opt_data_buffer(out, Some(&pair.value));
        }
        write_bool(out, false);
    }

    /// Decodes a serialized stream, retaining every element.
    pub fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let mut pairs = Vec::new();
        while read_bool(input)? {
            let key = StoreKey::new(read_bytes(input)?);
            let value = read_opt_data_buffer(input)?.unwrap_or_default();
            pairs.push(KeyWithBuffer { key, value });
        }
        Ok(Self::from_pairs(pairs))
    }
}

impl Iterator for RgetResult {
    type Item = KeyWithBuffer;

    fn next(&mut self) -> Option<KeyWithBuffer> {
        let mut best: Option<usize> = None;
        for (idx, mergee) in self.mergees.iter().enumerate() {
            if let Some(front) = mergee.front() {
                match best {
                    Some(current)
                        if self.mergees[current]
                            .front()
                            .is_some_and(|b| b.key <= front.key) => {}
                    _ => best = Some(idx),
                }
            }
        }
        best.and_then(|idx| self.mergees[idx].pop_front())
    }
}

impl PartialEq for RgetResult {
    fn eq(&self, other: &Self) -> bool {
        let a: Vec<KeyWithBuffer> = self.clone().collect();
        let b: Vec<KeyWithBuffer> = other.clone().collect();
        a == b
    }
}

impl Eq for RgetResult {}

/// The response to a `Read`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadResponse {
    Get(GetResult),
    Rget(RgetResult),
}
