//! Integration tests for the memshard store.
//! Drives the full engine — tokens, superblock transactions, metainfo and
//! backfill — through the public API against real store files.

use tempfile::TempDir;
use tokio::sync::mpsc;

use memshard::btree::StateTimestamp;
use memshard::protocol::{
    AddPolicy, BoundMode, DeleteResult, Mutation, ReadResponse, ReplacePolicy, SetResult,
    WriteResponse, INVALID_CAS,
};
use memshard::store::Metainfo;
use memshard::{
    BackfillChunk, DataBuffer, Interruptor, KeyRange, Read, RegionMap, Store, StoreError,
    StoreKey, Write,
};

/// The metainfo a freshly created store carries: an empty blob over the
/// whole universe.
fn blank_metainfo() -> Metainfo {
    RegionMap::new(KeyRange::universe(), Vec::new())
}

fn set_mutation(key: &str, value: &str) -> Write {
    Write::new(
        Mutation::Set {
            key: StoreKey::from(key),
            data: DataBuffer::from(value),
            flags: 0,
            exptime: 0,
            add_policy: AddPolicy::Yes,
            replace_policy: ReplacePolicy::Yes,
            old_cas: INVALID_CAS,
        },
        INVALID_CAS,
        0,
    )
}

async fn put(store: &Store, key: &str, value: &str, timestamp: u64) -> SetResult {
    let response = store
        .write(
            &blank_metainfo(),
            &blank_metainfo(),
            set_mutation(key, value),
            StateTimestamp(timestamp),
            store.new_write_token(),
            &Interruptor::new(),
        )
        .await
        .expect("write failed");
    match response {
        WriteResponse::Set(result) => result,
        other => panic!("unexpected response {:?}", other),
    }
}

async fn get(store: &Store, key: &str) -> memshard::protocol::GetResult {
    let response = store
        .read(
            &blank_metainfo(),
            Read::get(StoreKey::from(key), 0),
            store.new_read_token(),
            &Interruptor::new(),
        )
        .await
        .expect("read failed");
    match response {
        ReadResponse::Get(result) => result,
        other => panic!("unexpected response {:?}", other),
    }
}

// ============================================================================
// End-to-end scenarios
// ============================================================================

#[tokio::test]
async fn test_set_then_get() {
    let dir = TempDir::new().unwrap();
    let store = Store::new(&dir.path().join("t.mc"), true).unwrap();

    assert_eq!(put(&store, "a", "hello", 1).await, SetResult::Stored);

    let result = get(&store, "a").await;
    assert_eq!(result.value, Some(DataBuffer::from("hello")));
    assert_eq!(result.flags, 0);
    assert_ne!(result.cas, 0);
}

#[tokio::test]
async fn test_cas_mismatch_leaves_value_intact() {
    let dir = TempDir::new().unwrap();
    let store = Store::new(&dir.path().join("t.mc"), true).unwrap();
    put(&store, "a", "hello", 1).await;

    let mismatching = Write::new(
        Mutation::Set {
            key: StoreKey::from("a"),
            data: DataBuffer::from("x"),
            flags: 0,
            exptime: 0,
            add_policy: AddPolicy::No,
            replace_policy: ReplacePolicy::Yes,
            old_cas: 0,
        },
        INVALID_CAS,
        0,
    );
    let response = store
        .write(
            &blank_metainfo(),
            &blank_metainfo(),
            mismatching,
            StateTimestamp(2),
            store.new_write_token(),
            &Interruptor::new(),
        )
        .await
        .unwrap();
    assert_eq!(response, WriteResponse::Set(SetResult::Exists));

    assert_eq!(get(&store, "a").await.value, Some(DataBuffer::from("hello")));
}

#[tokio::test]
async fn test_rget_shard_merge() {
    let dir = TempDir::new().unwrap();
    let store = Store::new(&dir.path().join("t.mc"), true).unwrap();
    for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
        put(&store, key, &(i + 1).to_string(), 1).await;
    }

    let read = Read::rget(
        BoundMode::Closed,
        StoreKey::from("a"),
        BoundMode::Closed,
        StoreKey::from("d"),
        0,
    );

    // Split the request's region into ["a", "c") and ["c", "d"]; execute
    // each piece and merge the responses.
    let region = read.region();
    let split = StoreKey::from("c");
    let left = region.intersection(&KeyRange::new(
        BoundMode::None,
        &StoreKey::min(),
        BoundMode::Open,
        &split,
    ));
    let right = region.intersection(&KeyRange::new(
        BoundMode::Closed,
        &split,
        BoundMode::None,
        &StoreKey::min(),
    ));

    let mut responses = Vec::new();
    for sub in [right, left] {
        let piece = read.shard(&sub).unwrap();
        responses.push(
            store
                .read(
                    &blank_metainfo(),
                    piece,
                    store.new_read_token(),
                    &Interruptor::new(),
                )
                .await
                .unwrap(),
        );
    }

    let merged = read.unshard(responses).unwrap();
    let ReadResponse::Rget(result) = merged else {
        panic!("rget expected");
    };
    let pairs: Vec<(StoreKey, DataBuffer)> = result.map(|p| (p.key, p.value)).collect();
    assert_eq!(
        pairs,
        vec![
            (StoreKey::from("a"), DataBuffer::from("1")),
            (StoreKey::from("b"), DataBuffer::from("2")),
            (StoreKey::from("c"), DataBuffer::from("3")),
            (StoreKey::from("d"), DataBuffer::from("4")),
        ]
    );
}

#[tokio::test]
async fn test_delete_and_metainfo_commit_atomically() {
    let dir = TempDir::new().unwrap();
    let store = Store::new(&dir.path().join("t.mc"), true).unwrap();
    put(&store, "a", "doomed", 1).await;

    let ab_range = KeyRange::new(
        BoundMode::Closed,
        &StoreKey::from("a"),
        BoundMode::Open,
        &StoreKey::from("b"),
    );
    let overlay = RegionMap::new(ab_range.clone(), b"B".to_vec());

    let response = store
        .write(
            &blank_metainfo(),
            &overlay,
            Write::new(
                Mutation::Delete {
                    key: StoreKey::from("a"),
                    dont_put_in_delete_queue: false,
                },
                INVALID_CAS,
                0,
            ),
            StateTimestamp(2),
            store.new_write_token(),
            &Interruptor::new(),
        )
        .await
        .unwrap();
    assert_eq!(response, WriteResponse::Delete(DeleteResult::Deleted));

    // Both effects of the transaction are visible: the key is gone and the
    // blob landed on its sub-range.
    let mut expected = blank_metainfo();
    expected.update(overlay.clone()).unwrap();
    let response = store
        .read(
            &expected,
            Read::get(StoreKey::from("a"), 0),
            store.new_read_token(),
            &Interruptor::new(),
        )
        .await
        .unwrap();
    assert_eq!(
        response,
        ReadResponse::Get(memshard::protocol::GetResult::default())
    );

    let metainfo = store
        .get_metainfo(store.new_read_token(), &Interruptor::new())
        .await
        .unwrap();
    assert_eq!(metainfo.mask(&ab_range).unwrap(), overlay);
}

#[tokio::test]
async fn test_backfill_round_trip() {
    let dir = TempDir::new().unwrap();
    let source = Store::new(&dir.path().join("s1.mc"), true).unwrap();
    let target = Store::new(&dir.path().join("s2.mc"), true).unwrap();
    put(&source, "k", "v", 5).await;

    let start_point = RegionMap::new(KeyRange::universe(), StateTimestamp(0));
    let (tx, mut rx) = mpsc::channel(64);
    let progress = memshard::store::BackfillProgress::new();

    let sent = source
        .send_backfill(
            &start_point,
            |_| true,
            &tx,
            &progress,
            source.new_read_token(),
            &Interruptor::new(),
        )
        .await
        .unwrap();
    assert!(sent);
    assert_eq!(progress.guess_completion(), 1.0);
    drop(tx);

    while let Some(chunk) = rx.recv().await {
        target
            .receive_backfill(chunk, target.new_write_token(), &Interruptor::new())
            .await
            .unwrap();
    }

    assert_eq!(get(&target, "k").await.value, Some(DataBuffer::from("v")));
}

#[tokio::test]
async fn test_reset_erases_and_rewrites_metainfo() {
    let dir = TempDir::new().unwrap();
    let store = Store::new(&dir.path().join("t.mc"), true).unwrap();
    for key in ["a", "b", "c"] {
        put(&store, key, "v", 1).await;
    }

    let new_metainfo = RegionMap::new(KeyRange::universe(), b"Z".to_vec());
    store
        .reset_data(
            &KeyRange::universe(),
            &new_metainfo,
            store.new_write_token(),
            &Interruptor::new(),
        )
        .await
        .unwrap();

    let response = store
        .read(
            &new_metainfo,
            Read::rget(
                BoundMode::None,
                StoreKey::min(),
                BoundMode::None,
                StoreKey::min(),
                0,
            ),
            store.new_read_token(),
            &Interruptor::new(),
        )
        .await
        .unwrap();
    let ReadResponse::Rget(result) = response else {
        panic!("rget expected");
    };
    assert_eq!(result.count(), 0);

    let metainfo = store
        .get_metainfo(store.new_read_token(), &Interruptor::new())
        .await
        .unwrap();
    assert_eq!(metainfo, new_metainfo);
}

// ============================================================================
// Boundaries and invariants
// ============================================================================

#[tokio::test]
async fn test_empty_rget_yields_nothing() {
    let dir = TempDir::new().unwrap();
    let store = Store::new(&dir.path().join("t.mc"), true).unwrap();

    let response = store
        .read(
            &blank_metainfo(),
            Read::rget(
                BoundMode::None,
                StoreKey::min(),
                BoundMode::None,
                StoreKey::min(),
                0,
            ),
            store.new_read_token(),
            &Interruptor::new(),
        )
        .await
        .unwrap();
    let ReadResponse::Rget(result) = response else {
        panic!("rget expected");
    };
    assert_eq!(result.count(), 0);
}

#[tokio::test]
async fn test_unbounded_rget_modes() {
    let dir = TempDir::new().unwrap();
    let store = Store::new(&dir.path().join("t.mc"), true).unwrap();
    for key in ["a", "m", "z"] {
        put(&store, key, "v", 1).await;
    }

    // left none = from -inf; right open at "m" excludes it.
    let response = store
        .read(
            &blank_metainfo(),
            Read::rget(
                BoundMode::None,
                StoreKey::min(),
                BoundMode::Open,
                StoreKey::from("m"),
                0,
            ),
            store.new_read_token(),
            &Interruptor::new(),
        )
        .await
        .unwrap();
    let ReadResponse::Rget(result) = response else {
        panic!("rget expected");
    };
    assert_eq!(
        result.map(|p| p.key).collect::<Vec<_>>(),
        vec![StoreKey::from("a")]
    );

    // right none = to +inf.
    let response = store
        .read(
            &blank_metainfo(),
            Read::rget(
                BoundMode::Closed,
                StoreKey::from("m"),
                BoundMode::None,
                StoreKey::min(),
                0,
            ),
            store.new_read_token(),
            &Interruptor::new(),
        )
        .await
        .unwrap();
    let ReadResponse::Rget(result) = response else {
        panic!("rget expected");
    };
    assert_eq!(
        result.map(|p| p.key).collect::<Vec<_>>(),
        vec![StoreKey::from("m"), StoreKey::from("z")]
    );
}

#[tokio::test]
async fn test_zero_byte_value_is_legal() {
    let dir = TempDir::new().unwrap();
    let store = Store::new(&dir.path().join("t.mc"), true).unwrap();

    assert_eq!(put(&store, "empty", "", 1).await, SetResult::Stored);
    let result = get(&store, "empty").await;
    assert_eq!(result.value, Some(DataBuffer::from("")));
}

#[tokio::test]
async fn test_receiver_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let source = Store::new(&dir.path().join("s1.mc"), true).unwrap();
    let target = Store::new(&dir.path().join("s2.mc"), true).unwrap();
    put(&source, "k", "v", 3).await;

    let start_point = RegionMap::new(KeyRange::universe(), StateTimestamp(0));
    let (tx, mut rx) = mpsc::channel(64);
    let progress = memshard::store::BackfillProgress::new();
    source
        .send_backfill(
            &start_point,
            |_| true,
            &tx,
            &progress,
            source.new_read_token(),
            &Interruptor::new(),
        )
        .await
        .unwrap();
    drop(tx);

    let chunk = rx.recv().await.expect("one chunk expected");
    for _ in 0..2 {
        target
            .receive_backfill(chunk.clone(), target.new_write_token(), &Interruptor::new())
            .await
            .unwrap();
    }

    let result = get(&target, "k").await;
    assert_eq!(result.value, Some(DataBuffer::from("v")));
    match chunk {
        BackfillChunk::SetKey { atom } => assert_eq!(result.cas, atom.cas_or_zero),
        other => panic!("unexpected chunk {:?}", other),
    }
}

#[tokio::test]
async fn test_declined_backfill_sends_nothing() {
    let dir = TempDir::new().unwrap();
    let source = Store::new(&dir.path().join("s1.mc"), true).unwrap();
    put(&source, "k", "v", 3).await;

    let start_point = RegionMap::new(KeyRange::universe(), StateTimestamp(0));
    let (tx, mut rx) = mpsc::channel(64);
    let progress = memshard::store::BackfillProgress::new();
    let sent = source
        .send_backfill(
            &start_point,
            |_| false,
            &tx,
            &progress,
            source.new_read_token(),
            &Interruptor::new(),
        )
        .await
        .unwrap();
    assert!(!sent);
    drop(tx);
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_interrupted_write_is_clean() {
    let dir = TempDir::new().unwrap();
    let store = Store::new(&dir.path().join("t.mc"), true).unwrap();

    let interruptor = Interruptor::new();
    interruptor.interrupt();
    let result = store
        .write(
            &blank_metainfo(),
            &blank_metainfo(),
            set_mutation("a", "x"),
            StateTimestamp(1),
            store.new_write_token(),
            &interruptor,
        )
        .await;
    assert!(matches!(result, Err(StoreError::Interrupted)));

    // No partial state is observable and the queue is not wedged.
    assert_eq!(get(&store, "a").await.value, None);
}

#[tokio::test]
async fn test_fifo_read_after_write_sees_the_write() {
    let dir = TempDir::new().unwrap();
    let store = std::sync::Arc::new(Store::new(&dir.path().join("t.mc"), true).unwrap());

    // Mint a write token first, then a read token: the read must block
    // until the write retires, and therefore observes its effect.
    let write_token = store.new_write_token();
    let read_token = store.new_read_token();

    let reader = {
        let store = store.clone();
        tokio::spawn(async move {
            let response = store
                .read(
                    &blank_metainfo(),
                    Read::get(StoreKey::from("a"), 0),
                    read_token,
                    &Interruptor::new(),
                )
                .await
                .unwrap();
            match response {
                ReadResponse::Get(result) => result.value,
                other => panic!("unexpected response {:?}", other),
            }
        })
    };
    tokio::task::yield_now().await;

    store
        .write(
            &blank_metainfo(),
            &blank_metainfo(),
            set_mutation("a", "ordered"),
            StateTimestamp(1),
            write_token,
            &Interruptor::new(),
        )
        .await
        .unwrap();

    assert_eq!(reader.await.unwrap(), Some(DataBuffer::from("ordered")));
}

#[tokio::test]
async fn test_store_persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("t.mc");
    let overlay = RegionMap::new(KeyRange::universe(), b"marker".to_vec());
    {
        let store = Store::new(&path, true).unwrap();
        put(&store, "durable", "value", 1).await;
        store
            .set_metainfo(&overlay, store.new_write_token(), &Interruptor::new())
            .await
            .unwrap();
    }

    let store = Store::new(&path, false).unwrap();
    let response = store
        .read(
            &overlay,
            Read::get(StoreKey::from("durable"), 0),
            store.new_read_token(),
            &Interruptor::new(),
        )
        .await
        .unwrap();
    let ReadResponse::Get(result) = response else {
        panic!("get expected");
    };
    assert_eq!(result.value, Some(DataBuffer::from("value")));
    let metainfo = store
        .get_metainfo(store.new_read_token(), &Interruptor::new())
        .await
        .unwrap();
    assert_eq!(metainfo, overlay);
}
