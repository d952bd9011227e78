//! Shared-ownership data buffers and the length-prefixed framing primitives.
//!
//! A `DataBuffer` is the value payload of a stored key: immutable after
//! production and held simultaneously by any number of response holders, so
//! it is a cheap-to-clone reference-counted blob. The framing layout is
//! shared by every codec in the crate: an `i64` little-endian size followed
//! by the payload, with an `exists` byte in front where the buffer is
//! optional. A negative size on input is rejected rather than wrapped.

use bytes::Bytes;

use crate::protocol::DecodeError;

/// An immutable, reference-counted byte blob.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataBuffer {
    data: Bytes,
}

impl DataBuffer {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for DataBuffer {
    fn from(v: Vec<u8>) -> Self {
        Self::new(v)
    }
}

impl From<&[u8]> for DataBuffer {
    fn from(v: &[u8]) -> Self {
        Self::new(Bytes::copy_from_slice(v))
    }
}

impl From<&str> for DataBuffer {
    fn from(v: &str) -> Self {
        Self::new(Bytes::copy_from_slice(v.as_bytes()))
    }
}

impl AsRef<[u8]> for DataBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

pub fn write_bool(out: &mut Vec<u8>, v: bool) {
    out.push(v as u8);
}

pub fn read_bool(input: &mut &[u8]) -> Result<bool, DecodeError> {
    let (&tag, rest) = input
        .split_first()
        .ok_or(DecodeError::Underflow { needed: 1 })?;
    *input = rest;
    match tag {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(DecodeError::BadTag(other)),
    }
}

pub fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn read_u32(input: &mut &[u8]) -> Result<u32, DecodeError> {
    if input.len() < 4 {
        return Err(DecodeError::Underflow {
            needed: 4 - input.len(),
        });
    }
    let (head, rest) = input.split_at(4);
    *input = rest;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(head);
    Ok(u32::from_le_bytes(raw))
}

pub fn write_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn read_u64(input: &mut &[u8]) -> Result<u64, DecodeError> {
    if input.len() < 8 {
        return Err(DecodeError::Underflow {
            needed: 8 - input.len(),
        });
    }
    let (head, rest) = input.split_at(8);
    *input = rest;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(head);
    Ok(u64::from_le_bytes(raw))
}

pub fn write_i64(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn read_i64(input: &mut &[u8]) -> Result<i64, DecodeError> {
    if input.len() < 8 {
        return Err(DecodeError::Underflow {
            needed: 8 - input.len(),
        });
    }
    let (head, rest) = input.split_at(8);
    *input = rest;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(head);
    Ok(i64::from_le_bytes(raw))
}

/// Writes a size-prefixed byte string.
pub fn write_bytes(out: &mut Vec<u8>, data: &[u8]) {
    write_i64(out, data.len() as i64);
    out.extend_from_slice(data);
}

/// Reads a size-prefixed byte string, rejecting negative and truncated
/// sizes.
pub fn read_bytes(input: &mut &[u8]) -> Result<Vec<u8>, DecodeError> {
    let size = read_i64(input)?;
    if size < 0 {
        return Err(DecodeError::NegativeSize(size));
    }
    let size = size as usize;
    if input.len() < size {
        return Err(DecodeError::Truncated {
            size,
            available: input.len(),
        });
    }
    let (head, rest) = input.split_at(size);
    *input = rest;
    Ok(head.to_vec())
}

/// Writes an optional buffer: `exists` byte, then the framed payload.
pub fn write_opt_data_buffer(out: &mut Vec<u8>, buf: Option<&DataBuffer>) {
    match buf {
        Some(buf) => {
            write_bool(out, true);
            write_bytes(out, buf.as_slice());
        }
        None => write_bool(out, false),
    }
}

pub fn read_opt_data_buffer(input: &mut &[u8]) -> Result<Option<DataBuffer>, DecodeError> {
    if !read_bool(input)? {
        return Ok(None);
    }
    Ok(Some(DataBuffer::from(read_bytes(input)?)))
}
