//! The metainfo codec.
//!
//! The metainfo is an opaque region → blob map whose domain is always
//! `universe`. It lives on the superblock as a flat sequence of
//! `(serialized key range, blob)` pairs, written with the shared framing
//! codec, and is reconstructed into a `RegionMap` on every access.

use tracing::debug;

use crate::btree::{BtreeError, Superblock, TxnRead, WriteTransaction};
use crate::protocol::{KeyRange, RegionMap};
use crate::store::{Metainfo, StoreError, StoreResult};

/// Reads the pairs off the superblock and reassembles the map, insisting
/// that it covers `universe`.
pub(crate) fn get_metainfo_internal<T: TxnRead>(
    superblock: &Superblock,
    txn: &T,
) -> StoreResult<Metainfo> {
    let mut pairs = Vec::new();
    for (key_bytes, blob) in superblock.metainfo_pairs(txn) {
        let mut input = key_bytes.as_slice();
        let region = KeyRange::decode(&mut input)?;
        pairs.push((region, blob.clone()));
    }
    let map = RegionMap::from_pairs(pairs)?;
    if !map.get_domain().is_universe() {
        return Err(StoreError::Btree(BtreeError::Corrupt(format!(
            "metainfo covers {} instead of the universe",
            map.get_domain()
        ))));
    }
    Ok(map)
}

/// Replaces the pairs on the superblock with the given map.
pub(crate) fn set_metainfo_internal(
    superblock: &Superblock,
    txn: &mut WriteTransaction,
    metainfo: &Metainfo,
) {
    superblock.clear_metainfo(txn);
    for (region, blob) in metainfo.iter() {
        let mut key = Vec::new();
        region.encode(&mut key);
        superblock.push_metainfo_pair(txn, key, blob.clone());
    }
    debug!(regions = metainfo.len(), "metainfo persisted");
}

/// Verifies that the stored map agrees with `expected` over `expected`'s
/// domain, returning the full stored map.
pub(crate) fn check_metainfo<T: TxnRead>(
    superblock: &Superblock,
    txn: &T,
    expected: &Metainfo,
) -> StoreResult<Metainfo> {
    let current = get_metainfo_internal(superblock, txn)?;
    if current.mask(&expected.get_domain())? != *expected {
        return Err(StoreError::MetainfoMismatch(expected.get_domain()));
    }
    Ok(current)
}

/// Overlays `new` onto `old` and persists the result. The overall domain
/// must remain `universe`.
pub(crate) fn update_metainfo(
    superblock: &Superblock,
    txn: &mut WriteTransaction,
    old: Metainfo,
    new: Metainfo,
) -> StoreResult<()> {
    let mut updated = old;
    updated.update(new)?;
    debug_assert!(updated.get_domain().is_universe());
    set_metainfo_internal(superblock, txn, &updated);
    Ok(())
}
