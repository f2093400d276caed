//! Region-level durability: WAL replay on open, and the flush watermark
//! that keeps replay from revisiting flushed records.

use std::sync::Arc;

use lattice_server::region::{Region, RegionTuning};
use lattice_server::wal::{RollSignal, Wal};
use lattice_server::{BatchOp, BatchUpdate};

mod common;
use common::user_region;

fn tuning() -> RegionTuning {
    RegionTuning {
        memcache_flush_size: 1 << 20,
        split_size: u64::MAX / 2,
        compaction_threshold: 3,
        max_versions: 3,
    }
}

fn put(row: &str, value: &str) -> BatchUpdate {
    BatchUpdate {
        row: row.as_bytes().to_vec(),
        ops: vec![BatchOp::Put {
            column: b"f:x".to_vec(),
            value: value.as_bytes().to_vec(),
        }],
    }
}

#[test]
fn unflushed_edits_replay_from_the_wal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let keyspace = Arc::new(
        fjall::Config::new(dir.path().join("storage"))
            .open()
            .expect("keyspace"),
    );
    let wal = Arc::new(
        Wal::create(
            dir.path().join("wal"),
            10_000,
            Arc::new(RollSignal::default()),
        )
        .expect("wal"),
    );
    let desc = user_region();

    let region = Region::open(keyspace.clone(), wal.clone(), desc.clone(), tuning(), || {})
        .expect("open");
    region.batch_update(0, put("a", "1")).expect("write");
    region.batch_update(0, put("b", "2")).expect("write");
    // Simulate a crash: the region is dropped without close or flush.
    drop(region);

    let progress_calls = std::sync::atomic::AtomicU32::new(0);
    let recovered = Region::open(keyspace, wal, desc, tuning(), || {
        progress_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    })
    .expect("reopen");
    assert!(progress_calls.load(std::sync::atomic::Ordering::SeqCst) > 0);
    let value = recovered
        .get(b"a", b"f:x", 1, u64::MAX)
        .expect("read")
        .into_iter()
        .next()
        .expect("replayed value");
    assert_eq!(&value[..], b"1");
    assert!(recovered.memtable_bytes() > 0, "edits live in the memtable");
}

#[test]
fn flushed_edits_come_back_from_the_store_not_the_wal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let keyspace = Arc::new(
        fjall::Config::new(dir.path().join("storage"))
            .open()
            .expect("keyspace"),
    );
    let wal = Arc::new(
        Wal::create(
            dir.path().join("wal"),
            10_000,
            Arc::new(RollSignal::default()),
        )
        .expect("wal"),
    );
    let desc = user_region();

    let region = Region::open(keyspace.clone(), wal.clone(), desc.clone(), tuning(), || {})
        .expect("open");
    region.batch_update(0, put("a", "1")).expect("write");
    region.flushcache().expect("flush");
    drop(region);

    let recovered =
        Region::open(keyspace, wal, desc, tuning(), || {}).expect("reopen");
    assert_eq!(recovered.memtable_bytes(), 0, "nothing should replay");
    let value = recovered
        .get(b"a", b"f:x", 1, u64::MAX)
        .expect("read")
        .into_iter()
        .next()
        .expect("stored value");
    assert_eq!(&value[..], b"1");
    assert!(recovered.min_sequence_id() > 0);
}
