//! The per-shard store: one key range, one file, one B-tree.
//!
//! A `Store` owns its serializer → cache → B-tree slice stack exclusively
//! and serves reads, writes, metainfo access, backfill and resets through
//! it. Callers first mint a token (fixing their place in the FIFO request
//! order), then pass it into the operation together with an `Interruptor`.
//! Every operation acquires the superblock under a transaction; writes
//! bundle their metainfo update into the same transaction as the mutation,
//! so the two commit atomically.

pub mod backfill;
pub mod fifo;
mod metainfo;

pub use backfill::{BackfillChunk, BackfillProgress, TraversalProgress};
pub use fifo::{ReadToken, WriteToken};

use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

use crate::btree::{
    Access, BtreeError, BtreeSlice, Cache, CacheConfig, OrderSource, ReadTransaction,
    ReplTimestamp, Serializer, StateTimestamp, Superblock, WriteTransaction,
};
use crate::interrupt::Interruptor;
use crate::protocol::{
    DecodeError, KeyRange, Mutation, ProtocolError, Read, ReadQuery, ReadResponse, RegionMap,
    Write, WriteResponse, INVALID_CAS,
};

use fifo::FifoEnforcer;

/// The opaque region → blob map co-located with the superblock. Its domain
/// is always `universe`.
pub type Metainfo = RegionMap<Vec<u8>>;

/// Errors surfaced by store operations. Nothing is recovered locally.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("operation interrupted")]
    Interrupted,

    #[error("stored metainfo disagrees with the expected map on {0}")]
    MetainfoMismatch(KeyRange),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Btree(#[from] BtreeError),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One shard's storage engine. Owns the whole persistence stack; the shard
/// covers `universe` from construction until a reset narrows its contents.
pub struct Store {
    slice: BtreeSlice,
    enforcer: FifoEnforcer,
    order_source: OrderSource,
}

impl Store {
    /// Opens the store file, creating and initializing it first when
    /// `create` is set.
    pub fn new(path: &Path, create: bool) -> StoreResult<Store> {
        if create {
            Serializer::create(path)?;
        }
        let serializer = Serializer::open(path)?;
        if create {
            Cache::create(&serializer)?;
        }
        let cache = Cache::new(serializer, CacheConfig::default())?;
        if create {
            BtreeSlice::create(&cache)?;
        }
        info!(path = %path.display(), create, "store opened");
        Ok(Store {
            slice: BtreeSlice::new(cache),
            enforcer: FifoEnforcer::new(),
            order_source: OrderSource::new(),
        })
    }

    /// Mints the token fixing a read's place in the request order.
    pub fn new_read_token(&self) -> ReadToken {
        self.enforcer.enter_read()
    }

    /// Mints the token fixing a write's place in the request order.
    pub fn new_write_token(&self) -> WriteToken {
        self.enforcer.enter_write()
    }

    pub(crate) fn slice(&self) -> &BtreeSlice {
        &self.slice
    }

    async fn acquire_superblock_for_read(
        &self,
        access: Access,
        snapshot: bool,
        token: ReadToken,
        interruptor: &Interruptor,
    ) -> StoreResult<(Superblock, ReadTransaction)> {
        self.slice.assert_thread();
        let local_token = token;
        tokio::select! {
            biased;
            _ = interruptor.interrupted() => return Err(StoreError::Interrupted),
            _ = local_token.acquire() => {}
        }
        let order_token = self.order_source.check_in("store::acquire_superblock_for_read");
        let order_token = self.slice.order_checkpoint().check_through(order_token);
        Ok(self
            .slice
            .superblock_for_reading(access, order_token, snapshot)
            .await)
    }

    pub(crate) async fn acquire_superblock_for_backfill(
        &self,
        token: ReadToken,
        interruptor: &Interruptor,
    ) -> StoreResult<(Superblock, ReadTransaction)> {
        self.slice.assert_thread();
        let local_token = token;
        tokio::select! {
            biased;
            _ = interruptor.interrupted() => return Err(StoreError::Interrupted),
            _ = local_token.acquire() => {}
        }
        let order_token = self
            .order_source
            .check_in("store::acquire_superblock_for_backfill");
        let order_token = self.slice.order_checkpoint().check_through(order_token);
        Ok(self.slice.superblock_for_backfilling(order_token).await)
    }

    pub(crate) async fn acquire_superblock_for_write(
        &self,
        access: Access,
        expected_change_count: usize,
        token: WriteToken,
        interruptor: &Interruptor,
    ) -> StoreResult<(Superblock, WriteTransaction)> {
        self.slice.assert_thread();
        let local_token = token;
        tokio::select! {
            biased;
            _ = interruptor.interrupted() => return Err(StoreError::Interrupted),
            _ = local_token.acquire() => {}
        }
        let order_token = self.order_source.check_in("store::acquire_superblock_for_write");
        let order_token = self.slice.order_checkpoint().check_through(order_token);
        Ok(self
            .slice
            .superblock_for_writing(access, expected_change_count, ReplTimestamp::INVALID, order_token)
            .await)
    }

    /// Reads the current metainfo.
    pub async fn get_metainfo(
        &self,
        token: ReadToken,
        interruptor: &Interruptor,
    ) -> StoreResult<Metainfo> {
        let (superblock, txn) = self
            .acquire_superblock_for_read(Access::Read, false, token, interruptor)
            .await?;
        metainfo::get_metainfo_internal(&superblock, &txn)
    }

    /// Overlays `new_metainfo` onto the stored map.
    pub async fn set_metainfo(
        &self,
        new_metainfo: &Metainfo,
        token: WriteToken,
        interruptor: &Interruptor,
    ) -> StoreResult<()> {
        let (superblock, mut txn) = self
            .acquire_superblock_for_write(Access::Write, 1, token, interruptor)
            .await?;
        let old = metainfo::get_metainfo_internal(&superblock, &txn)?;
        metainfo::update_metainfo(&superblock, &mut txn, old, new_metainfo.clone())
    }

    /// Serves a read after confirming the stored metainfo matches
    /// `expected_metainfo` over its domain.
    pub async fn read(
        &self,
        expected_metainfo: &Metainfo,
        read: Read,
        token: ReadToken,
        interruptor: &Interruptor,
    ) -> StoreResult<ReadResponse> {
        let (superblock, txn) = self
            .acquire_superblock_for_read(Access::Read, false, token, interruptor)
            .await?;
        metainfo::check_metainfo(&superblock, &txn, expected_metainfo)?;

        let response = match &read.query {
            ReadQuery::Get { key } => {
                ReadResponse::Get(self.slice.get(&txn, key, read.effective_time))
            }
            ReadQuery::Rget {
                left_mode,
                left_key,
                right_mode,
                right_key,
            } => ReadResponse::Rget(self.slice.rget(
                &txn,
                *left_mode,
                left_key,
                *right_mode,
                right_key,
                read.effective_time,
            )),
        };
        Ok(response)
    }

    /// Applies a mutation at `timestamp`, bundling the metainfo transition
    /// from `expected_metainfo` to the overlay `new_metainfo` into the same
    /// transaction.
    pub async fn write(
        &self,
        expected_metainfo: &Metainfo,
        new_metainfo: &Metainfo,
        write: Write,
        timestamp: StateTimestamp,
        token: WriteToken,
        interruptor: &Interruptor,
    ) -> StoreResult<WriteResponse> {
        // Roughly a leaf node's worth of keys; the hint is advisory.
        let expected_change_count = 2;
        let (superblock, mut txn) = self
            .acquire_superblock_for_write(Access::Write, expected_change_count, token, interruptor)
            .await?;
        self.check_and_update_metainfo(&superblock, &mut txn, expected_metainfo, new_metainfo)?;

        let Write {
            mutation,
            proposed_cas,
            effective_time,
        } = write;
        let ts = timestamp.to_repli_timestamp();
        debug!(key = %mutation.key(), timestamp = ts.0, "dispatching write");

        let response = match mutation {
            Mutation::GetCas { key } => WriteResponse::GetCas(self.slice.get_cas(
                &mut txn,
                &superblock,
                &key,
                proposed_cas,
                ts,
                effective_time,
            )),
            Mutation::Set {
                key,
                data,
                flags,
                exptime,
                add_policy,
                replace_policy,
                old_cas,
            } => WriteResponse::Set(self.slice.set(
                &mut txn,
                &superblock,
                &key,
                data,
                flags,
                exptime,
                add_policy,
                replace_policy,
                old_cas,
                proposed_cas,
                ts,
                effective_time,
            )),
            Mutation::IncrDecr { key, kind, amount } => {
                WriteResponse::IncrDecr(self.slice.incr_decr(
                    &mut txn,
                    &superblock,
                    &key,
                    kind,
                    amount,
                    proposed_cas,
                    ts,
                    effective_time,
                ))
            }
            Mutation::AppendPrepend { key, data, kind } => {
                WriteResponse::AppendPrepend(self.slice.append_prepend(
                    &mut txn,
                    &superblock,
                    &key,
                    data,
                    kind,
                    proposed_cas,
                    ts,
                    effective_time,
                ))
            }
            Mutation::Delete {
                key,
                dont_put_in_delete_queue,
            } => {
                debug_assert_eq!(proposed_cas, INVALID_CAS);
                WriteResponse::Delete(self.slice.delete(
                    &mut txn,
                    &key,
                    dont_put_in_delete_queue,
                    ts,
                    effective_time,
                ))
            }
        };
        Ok(response)
    }

    /// Erases every key in `subregion` and overlays `new_metainfo`, in one
    /// transaction.
    pub async fn reset_data(
        &self,
        subregion: &KeyRange,
        new_metainfo: &Metainfo,
        token: WriteToken,
        interruptor: &Interruptor,
    ) -> StoreResult<()> {
        // Advisory hint; a reset may wipe far more than this.
        let expected_change_count = 2;
        let (superblock, mut txn) = self
            .acquire_superblock_for_write(Access::Write, expected_change_count, token, interruptor)
            .await?;

        let old = metainfo::get_metainfo_internal(&superblock, &txn)?;
        metainfo::update_metainfo(&superblock, &mut txn, old, new_metainfo.clone())?;

        let erased = self
            .slice
            .erase_range(&mut txn, None, subregion, ReplTimestamp::INVALID);
        info!(subregion = %subregion, erased, "reset complete");
        Ok(())
    }

    fn check_and_update_metainfo(
        &self,
        superblock: &Superblock,
        txn: &mut WriteTransaction,
        expected_metainfo: &Metainfo,
        new_metainfo: &Metainfo,
    ) -> StoreResult<()> {
        let old = metainfo::check_metainfo(superblock, txn, expected_metainfo)?;
        metainfo::update_metainfo(superblock, txn, old, new_metainfo.clone())
    }
}
