//! The per-command operations of the B-tree slice.
//!
//! Every operation runs against an acquired transaction. Reads filter
//! expired entries against the caller's effective time; mutations stamp the
//! entry with the transaction's repli timestamp and keep the deletion
//! records the backfill traversal consumes. None of these functions
//! suspend: once dispatched, an operation runs to completion.

use std::ops::Bound;

use crate::btree::cache::{Entry, ReadTransaction, TxnRead, WriteTransaction};
use crate::btree::slice::{BtreeSlice, Superblock};
use crate::btree::{ReplTimestamp, MAX_VALUE_SIZE};
use crate::protocol::{
    AddPolicy, AppendPrependKind, AppendPrependResult, BoundMode, Cas, DataBuffer, DeleteResult,
    Exptime, Flags, GetResult, IncrDecrKind, IncrDecrResult, KeyRange, KeyWithBuffer,
    ReplacePolicy, RgetResult, RightBound, SetResult, StoreKey, INVALID_CAS,
};

/// One live key/value carried by a backfill traversal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackfillAtom {
    pub key: StoreKey,
    pub value: DataBuffer,
    pub flags: Flags,
    pub exptime: Exptime,
    pub recency: ReplTimestamp,
    /// The entry's CAS, or `0` if none was ever assigned.
    pub cas_or_zero: Cas,
}

/// What a backfill traversal saw, in ascending key order per kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackfillEvent {
    DeleteRange(KeyRange),
    DeleteKey { key: StoreKey, recency: ReplTimestamp },
    SetKey(BackfillAtom),
}

fn is_live(entry: &Entry, effective_time: Exptime) -> bool {
    entry.exptime == 0 || entry.exptime > effective_time
}

fn range_bounds(range: &KeyRange) -> (Bound<StoreKey>, Bound<StoreKey>) {
    let left = Bound::Included(range.left().clone());
    let right = match range.right() {
        RightBound::Bounded(key) => Bound::Excluded(key.clone()),
        RightBound::Unbounded => Bound::Unbounded,
    };
    (left, right)
}

fn resolve_cas(superblock: &Superblock, txn: &mut WriteTransaction, proposed_cas: Cas) -> Cas {
    if proposed_cas == INVALID_CAS {
        superblock.mint_cas(txn)
    } else {
        proposed_cas
    }
}

impl BtreeSlice {
    /// Single-key lookup.
    pub fn get(&self, txn: &ReadTransaction, key: &StoreKey, effective_time: Exptime) -> GetResult {
        match txn.image().entries.get(key) {
            Some(entry) if is_live(entry, effective_time) => GetResult {
                value: Some(entry.value.clone()),
                flags: entry.flags,
                cas: entry.cas,
            },
            _ => GetResult::default(),
        }
    }

    /// Range scan. The result is materialized before the transaction is
    /// released and then terminates without re-entering the tree.
    pub fn rget(
        &self,
        txn: &ReadTransaction,
        left_mode: BoundMode,
        left_key: &StoreKey,
        right_mode: BoundMode,
        right_key: &StoreKey,
        effective_time: Exptime,
    ) -> RgetResult {
        let range = KeyRange::new(left_mode, left_key, right_mode, right_key);
        let pairs: Vec<KeyWithBuffer> = txn
            .image()
            .entries
            .range(range_bounds(&range))
            .filter(|(_, entry)| is_live(entry, effective_time))
            .map(|(key, entry)| KeyWithBuffer {
                key: key.clone(),
                value: entry.value.clone(),
            })
            .collect();
        RgetResult::from_pairs(pairs)
    }

    /// Promotes the key's value to CAS-bearing and returns it.
    pub fn get_cas(
        &self,
        txn: &mut WriteTransaction,
        superblock: &Superblock,
        key: &StoreKey,
        proposed_cas: Cas,
        timestamp: ReplTimestamp,
        effective_time: Exptime,
    ) -> GetResult {
        let needs_cas = match txn.image().entries.get(key) {
            Some(entry) if is_live(entry, effective_time) => entry.cas == 0,
            _ => return GetResult::default(),
        };
        if needs_cas {
            let cas = resolve_cas(superblock, txn, proposed_cas);
            if let Some(entry) = txn.image_mut().entries.get_mut(key) {
                entry.cas = cas;
                entry.recency = timestamp.or_ancient();
            }
        }
        let image = txn.image();
        let entry = &image.entries[key];
        GetResult {
            value: Some(entry.value.clone()),
            flags: entry.flags,
            cas: entry.cas,
        }
    }

    /// Stores a value under the add/replace policies and the optional
    /// `old_cas` precondition.
    #[allow(clippy::too_many_arguments)]
    pub fn set(
        &self,
        txn: &mut WriteTransaction,
        superblock: &Superblock,
        key: &StoreKey,
        data: DataBuffer,
        flags: Flags,
        exptime: Exptime,
        add_policy: AddPolicy,
        replace_policy: ReplacePolicy,
        old_cas: Cas,
        proposed_cas: Cas,
        timestamp: ReplTimestamp,
        effective_time: Exptime,
    ) -> SetResult {
        if data.len() > MAX_VALUE_SIZE {
            return SetResult::TooLarge;
        }
        match txn.image().entries.get(key) {
            Some(entry) if is_live(entry, effective_time) => {
                if replace_policy == ReplacePolicy::No {
                    return SetResult::NotStored;
                }
                if old_cas != INVALID_CAS && entry.cas != old_cas {
                    return SetResult::Exists;
                }
            }
            _ => {
                if add_policy == AddPolicy::No {
                    return SetResult::NotStored;
                }
                if old_cas != INVALID_CAS {
                    return SetResult::NotStored;
                }
            }
        }
        let cas = resolve_cas(superblock, txn, proposed_cas);
        let image = txn.image_mut();
        image.entries.insert(
            key.clone(),
            Entry {
                value: data,
                flags,
                exptime,
                cas,
                recency: timestamp.or_ancient(),
            },
        );
        image.deleted.remove(key);
        SetResult::Stored
    }

    /// Decimal-ASCII arithmetic on the stored value: increment wraps at
    /// 2^64, decrement saturates at zero.
    #[allow(clippy::too_many_arguments)]
    pub fn incr_decr(
        &self,
        txn: &mut WriteTransaction,
        superblock: &Superblock,
        key: &StoreKey,
        kind: IncrDecrKind,
        amount: u64,
        proposed_cas: Cas,
        timestamp: ReplTimestamp,
        effective_time: Exptime,
    ) -> IncrDecrResult {
        let current = match txn.image().entries.get(key) {
            Some(entry) if is_live(entry, effective_time) => {
                match std::str::from_utf8(entry.value.as_slice())
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                {
                    Some(n) => n,
                    None => return IncrDecrResult::NotNumber,
                }
            }
            _ => return IncrDecrResult::NotFound,
        };
        let new_value = match kind {
            IncrDecrKind::Incr => current.wrapping_add(amount),
            IncrDecrKind::Decr => current.saturating_sub(amount),
        };
        let cas = resolve_cas(superblock, txn, proposed_cas);
        if let Some(entry) = txn.image_mut().entries.get_mut(key) {
            entry.value = DataBuffer::from(new_value.to_string().into_bytes());
            entry.cas = cas;
            entry.recency = timestamp.or_ancient();
        }
        IncrDecrResult::Success(new_value)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn append_prepend(
        &self,
        txn: &mut WriteTransaction,
        superblock: &Superblock,
        key: &StoreKey,
        data: DataBuffer,
        kind: AppendPrependKind,
        proposed_cas: Cas,
        timestamp: ReplTimestamp,
        effective_time: Exptime,
    ) -> AppendPrependResult {
        match txn.image().entries.get(key) {
            Some(entry) if is_live(entry, effective_time) => {
                if entry.value.len() + data.len() > MAX_VALUE_SIZE {
                    return AppendPrependResult::TooLarge;
                }
            }
            _ => return AppendPrependResult::NotFound,
        }
        let cas = resolve_cas(superblock, txn, proposed_cas);
        if let Some(entry) = txn.image_mut().entries.get_mut(key) {
            let mut combined = Vec::with_capacity(entry.value.len() + data.len());
            match kind {
                AppendPrependKind::Append => {
                    combined.extend_from_slice(entry.value.as_slice());
                    combined.extend_from_slice(data.as_slice());
                }
                AppendPrependKind::Prepend => {
                    combined.extend_from_slice(data.as_slice());
                    combined.extend_from_slice(entry.value.as_slice());
                }
            }
            entry.value = DataBuffer::from(combined);
            entry.cas = cas;
            entry.recency = timestamp.or_ancient();
        }
        AppendPrependResult::Success
    }

    /// Removes the key, recording a tombstone unless the caller opted out
    /// of the delete queue.
    pub fn delete(
        &self,
        txn: &mut WriteTransaction,
        key: &StoreKey,
        dont_put_in_delete_queue: bool,
        timestamp: ReplTimestamp,
        effective_time: Exptime,
    ) -> DeleteResult {
        let image = txn.image_mut();
        let live = image
            .entries
            .get(key)
            .is_some_and(|entry| is_live(entry, effective_time));
        if !live {
            return DeleteResult::NotFound;
        }
        image.entries.remove(key);
        if !dont_put_in_delete_queue {
            image.deleted.insert(key.clone(), timestamp.or_ancient());
        }
        DeleteResult::Deleted
    }

    /// Removes every key in `range` that the optional tester admits, along
    /// with the tombstones it covers. A stamped transaction records the
    /// erase so backfill can replay it as a range deletion.
    pub fn erase_range(
        &self,
        txn: &mut WriteTransaction,
        key_tester: Option<&dyn Fn(&StoreKey) -> bool>,
        range: &KeyRange,
        timestamp: ReplTimestamp,
    ) -> usize {
        let admits = |key: &StoreKey| key_tester.map_or(true, |tester| tester(key));
        let image = txn.image_mut();

        let doomed: Vec<StoreKey> = image
            .entries
            .range(range_bounds(range))
            .map(|(key, _)| key.clone())
            .filter(|key| admits(key))
            .collect();
        for key in &doomed {
            image.entries.remove(key);
        }

        let stale: Vec<StoreKey> = image
            .deleted
            .range(range_bounds(range))
            .map(|(key, _)| key.clone())
            .filter(|key| admits(key))
            .collect();
        for key in &stale {
            image.deleted.remove(key);
        }

        if timestamp.is_valid() {
            image.erased.push((range.clone(), timestamp));
        }
        doomed.len()
    }

    /// Walks `range` and reports everything that changed at or after
    /// `since_when`: replayable range erases first, then tombstones and
    /// live entries merged in ascending key order.
    pub fn backfill(
        &self,
        txn: &ReadTransaction,
        range: &KeyRange,
        since_when: ReplTimestamp,
    ) -> Vec<BackfillEvent> {
        let image = txn.image();
        let mut events = Vec::new();

        let mut erases: Vec<KeyRange> = image
            .erased
            .iter()
            .filter(|(_, recency)| *recency >= since_when)
            .map(|(erased, _)| erased.intersection(range))
            .filter(|cut| !cut.is_empty())
            .collect();
        erases.sort_by(|a, b| a.left().cmp(b.left()));
        events.extend(erases.into_iter().map(BackfillEvent::DeleteRange));

        let mut tombstones = image
            .deleted
            .range(range_bounds(range))
            .filter(|(_, recency)| **recency >= since_when)
            .peekable();
        let mut live = image
            .entries
            .range(range_bounds(range))
            .filter(|(_, entry)| entry.recency >= since_when)
            .peekable();

        loop {
            let take_tombstone = match (tombstones.peek(), live.peek()) {
                (Some((dead_key, _)), Some((live_key, _))) => dead_key < live_key,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            if take_tombstone {
                let (key, recency) = tombstones.next().unwrap_or_else(|| unreachable!());
                events.push(BackfillEvent::DeleteKey {
                    key: key.clone(),
                    recency: *recency,
                });
            } else {
                let (key, entry) = live.next().unwrap_or_else(|| unreachable!());
                events.push(BackfillEvent::SetKey(BackfillAtom {
                    key: key.clone(),
                    value: entry.value.clone(),
                    flags: entry.flags,
                    exptime: entry.exptime,
                    recency: entry.recency,
                    cas_or_zero: entry.cas,
                }));
            }
        }
        events
    }
}
