//! Streaming backfill: the chunk types, the producer and the receiver.
//!
//! A backfill brings a peer's copy of a subrange up to date since a given
//! per-subrange timestamp. The producer traverses the tree once per
//! `(sub-range, start timestamp)` partition and streams three chunk shapes
//! over a channel: whole-range erases, per-key tombstones and live
//! key/values. Within a sub-range chunks ascend by key; across sub-ranges
//! the interleaving is unconstrained. The receiver applies one chunk per
//! write transaction and is idempotent, so a retried stream converges to
//! the same state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::btree::{
    Access, BackfillAtom, BackfillEvent, ReplTimestamp, StateTimestamp,
};
use crate::interrupt::Interruptor;
use crate::protocol::{
    AddPolicy, KeyRange, RegionMap, ReplacePolicy, StoreKey, INVALID_CAS,
};
use crate::store::fifo::{ReadToken, WriteToken};
use crate::store::{metainfo, Metainfo, Store, StoreError, StoreResult};

/// One unit of backfill traffic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackfillChunk {
    /// Erase every key in `range`.
    DeleteRange { range: KeyRange },
    /// A single-key tombstone.
    DeleteKey {
        key: StoreKey,
        recency: ReplTimestamp,
    },
    /// A live key/value to store.
    SetKey { atom: BackfillAtom },
}

impl From<BackfillEvent> for BackfillChunk {
    fn from(event: BackfillEvent) -> Self {
        match event {
            BackfillEvent::DeleteRange(range) => BackfillChunk::DeleteRange { range },
            BackfillEvent::DeleteKey { key, recency } => BackfillChunk::DeleteKey { key, recency },
            BackfillEvent::SetKey(atom) => BackfillChunk::SetKey { atom },
        }
    }
}

/// Progress of one sub-range traversal.
#[derive(Debug, Default)]
pub struct TraversalProgress {
    emitted: AtomicU64,
    total: AtomicU64,
}

impl TraversalProgress {
    fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
    }

    fn bump(&self) {
        self.emitted.fetch_add(1, Ordering::SeqCst);
    }

    /// Fractional completion in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        let total = self.total.load(Ordering::SeqCst);
        if total == 0 {
            return 1.0;
        }
        self.emitted.load(Ordering::SeqCst) as f64 / total as f64
    }
}

/// Aggregated progress across the sub-ranges of one backfill, one
/// constituent per sub-range.
#[derive(Debug, Default)]
pub struct BackfillProgress {
    constituents: Mutex<Vec<Arc<TraversalProgress>>>,
}

impl BackfillProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_constituent(&self, constituent: Arc<TraversalProgress>) {
        self.constituents.lock().push(constituent);
    }

    /// Mean completion of the registered constituents; `0` before any
    /// sub-range has been registered.
    pub fn guess_completion(&self) -> f64 {
        let constituents = self.constituents.lock();
        if constituents.is_empty() {
            return 0.0;
        }
        constituents.iter().map(|c| c.fraction()).sum::<f64>() / constituents.len() as f64
    }
}

impl Store {
    /// Streams the chunks that bring a peer up to date since `start_point`.
    ///
    /// The current metainfo, masked to `start_point`'s domain, is shown to
    /// `should_backfill` first; if it declines, no chunks are emitted and
    /// `false` is returned. Every chunk send is a cancellation point; a
    /// closed chunk channel counts as cancellation.
    pub async fn send_backfill(
        &self,
        start_point: &RegionMap<StateTimestamp>,
        should_backfill: impl FnOnce(&Metainfo) -> bool,
        chunk_tx: &mpsc::Sender<BackfillChunk>,
        progress: &BackfillProgress,
        token: ReadToken,
        interruptor: &Interruptor,
    ) -> StoreResult<bool> {
        let (superblock, txn) = self.acquire_superblock_for_backfill(token, interruptor).await?;

        let masked = metainfo::get_metainfo_internal(&superblock, &txn)?
            .mask(&start_point.get_domain())?;
        if !should_backfill(&masked) {
            debug!("backfill declined by the caller");
            return Ok(false);
        }

        let mut chunks_sent = 0u64;
        for (sub_range, since) in start_point.iter() {
            // The fine timestamp collapses to the coarse on-disk stamp here.
            let since_when = since.to_repli_timestamp();
            let constituent = Arc::new(TraversalProgress::default());
            progress.add_constituent(constituent.clone());

            let events = self.slice().backfill(&txn, sub_range, since_when);
            constituent.set_total(events.len() as u64);
            debug!(
                sub_range = %sub_range,
                since = since_when.0,
                events = events.len(),
                "backfilling sub-range"
            );

            for event in events {
                tokio::select! {
                    biased;
                    _ = interruptor.interrupted() => return Err(StoreError::Interrupted),
                    sent = chunk_tx.send(event.into()) => {
                        if sent.is_err() {
                            return Err(StoreError::Interrupted);
                        }
                    }
                }
                constituent.bump();
                chunks_sent += 1;
            }
        }
        info!(chunks = chunks_sent, "backfill stream complete");
        Ok(true)
    }

    /// Applies one backfill chunk. Deletes bypass the delete queue and all
    /// applications carry the invalid repli timestamp; sequencing the
    /// matching metainfo update is the caller's responsibility.
    pub async fn receive_backfill(
        &self,
        chunk: BackfillChunk,
        token: WriteToken,
        interruptor: &Interruptor,
    ) -> StoreResult<()> {
        let expected_change_count = 1;
        let (superblock, mut txn) = self
            .acquire_superblock_for_write(Access::Write, expected_change_count, token, interruptor)
            .await?;

        match chunk {
            BackfillChunk::DeleteRange { range } => {
                let tester = |key: &StoreKey| range.contains_key(key.as_slice());
                self.slice()
                    .erase_range(&mut txn, Some(&tester), &range, ReplTimestamp::INVALID);
            }
            BackfillChunk::DeleteKey { key, .. } => {
                self.slice()
                    .delete(&mut txn, &key, true, ReplTimestamp::INVALID, 0);
            }
            BackfillChunk::SetKey { atom } => {
                self.slice().set(
                    &mut txn,
                    &superblock,
                    &atom.key,
                    atom.value,
                    atom.flags,
                    atom.exptime,
                    AddPolicy::Yes,
                    ReplacePolicy::Yes,
                    INVALID_CAS,
                    atom.cas_or_zero,
                    ReplTimestamp::INVALID,
                    0,
                );
            }
        }
        Ok(())
    }
}
