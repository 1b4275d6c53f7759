//! End-to-end scenarios from spec.md §8, driven against a real (tempdir)
//! basedir rather than the in-module unit fixtures in `src/server.rs`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use storage_core::{Canary, StorageConfig, StorageServer, TestWriteVector};
use storage_types::{CancelSecret, NodeId, RenewSecret, StorageIndex, WriteEnablerSecret};
use tempfile::tempdir;

fn node_id() -> NodeId {
    NodeId::new([0x42u8; 20])
}

/// Scenario 1: immutable allocate-write-close-read.
#[tokio::test]
async fn immutable_allocate_write_close_read() {
    let dir = tempdir().unwrap();
    let server = StorageServer::new(StorageConfig::new(dir.path()), node_id()).unwrap();
    let si = StorageIndex::new([b'A'; 16]);
    let rs = RenewSecret::new([0x11u8; 32]);
    let cs = CancelSecret::new([0x22u8; 32]);
    let (canary, _handle) = Canary::new();

    let result = server.allocate_buckets(si, rs, cs, &[0], 1000, canary).await.unwrap();
    assert!(result.already_have.is_empty());
    assert_eq!(result.allocated.len(), 1);

    let mut writer = result.allocated.into_iter().next().unwrap().1;
    writer.write(0, &[0xffu8; 1000]).unwrap();
    writer
        .close(storage_format::LeaseRecord::fresh(0, rs, cs, 1_000_000))
        .await
        .unwrap();

    let buckets = server.get_buckets(si).unwrap();
    assert_eq!(buckets[&0].read(0, 1000).unwrap(), vec![0xffu8; 1000]);
}

/// Scenario 2: re-allocating the same (SI, shnum) after it's finalized
/// reports it in `already_have` and allocates nothing new.
#[tokio::test]
async fn conflicting_reallocate_reports_already_have() {
    let dir = tempdir().unwrap();
    let server = StorageServer::new(StorageConfig::new(dir.path()), node_id()).unwrap();
    let si = StorageIndex::new([b'B'; 16]);
    let rs = RenewSecret::new([1u8; 32]);
    let cs = CancelSecret::new([2u8; 32]);

    let (canary1, _h1) = Canary::new();
    let first = server.allocate_buckets(si, rs, cs, &[0], 1000, canary1).await.unwrap();
    let mut writer = first.allocated.into_iter().next().unwrap().1;
    writer.write(0, &[0xffu8; 1000]).unwrap();
    writer.close(storage_format::LeaseRecord::fresh(0, rs, cs, 0)).await.unwrap();

    let (canary2, _h2) = Canary::new();
    let second = server.allocate_buckets(si, rs, cs, &[0], 1000, canary2).await.unwrap();
    assert_eq!(second.already_have, HashSet::from([0]));
    assert!(second.allocated.is_empty());
}

/// Scenario 3 + 4: mutable test-and-set, success then failure.
#[tokio::test]
async fn mutable_test_and_set_success_then_failure_leaves_data_untouched() {
    let dir = tempdir().unwrap();
    let server = StorageServer::new(StorageConfig::new(dir.path()), node_id()).unwrap();
    let si = StorageIndex::new([b'C'; 16]);
    let we = WriteEnablerSecret::new([0x77u8; 32]);
    let rs = RenewSecret::new([0x88u8; 32]);
    let cs = CancelSecret::new([0x99u8; 32]);

    let mut tw = HashMap::new();
    tw.insert(
        0u8,
        TestWriteVector {
            test_vector: vec![(0, 1, storage_core::TestOp::Eq, vec![])],
            write_vector: vec![(0, b"hello".to_vec())],
            new_length: None,
        },
    );
    let (ok, reads) = server.slot_testv_and_readv_and_writev(si, we, rs, cs, &tw, &[]).await.unwrap();
    assert!(ok);
    assert!(reads[&0].is_empty());

    let read_back = server.slot_readv(si, &[0], &[(0, 5)]).await.unwrap();
    assert_eq!(read_back[&0], vec![b"hello".to_vec()]);

    let mut bad_tw = HashMap::new();
    bad_tw.insert(
        0u8,
        TestWriteVector {
            test_vector: vec![(0, 5, storage_core::TestOp::Eq, b"world".to_vec())],
            write_vector: vec![(0, b"XXXXX".to_vec())],
            new_length: None,
        },
    );
    let (ok2, reads2) = server
        .slot_testv_and_readv_and_writev(si, we, rs, cs, &bad_tw, &[(0, 5)])
        .await
        .unwrap();
    assert!(!ok2);
    assert_eq!(reads2[&0], vec![b"hello".to_vec()]);

    let unchanged = server.slot_readv(si, &[0], &[(0, 5)]).await.unwrap();
    assert_eq!(unchanged[&0], vec![b"hello".to_vec()]);
}

/// Scenario 5: lease expiration by age deletes the share and the
/// crawler's history records it.
#[tokio::test]
async fn lease_expiration_by_age_deletes_share_and_records_history() {
    use storage_crawler::{CrawlerTiming, ExpirationMode, ExpirerConfig, LeaseExpirer, ShareCrawler, ShareTypeFilter};

    let dir = tempdir().unwrap();
    let server = Arc::new(StorageServer::new(StorageConfig::new(dir.path()), node_id()).unwrap());
    let si = StorageIndex::new([b'D'; 16]);
    let we = WriteEnablerSecret::new([1u8; 32]);
    let rs = RenewSecret::new([2u8; 32]);
    let cs = CancelSecret::new([3u8; 32]);

    let mut tw = HashMap::new();
    tw.insert(
        0u8,
        TestWriteVector {
            test_vector: vec![],
            write_vector: vec![(0, b"payload".to_vec())],
            new_length: None,
        },
    );
    server.slot_testv_and_readv_and_writev(si, we, rs, cs, &tw, &[]).await.unwrap();

    // Force the lease far enough into the past for the `age` policy below.
    let share_path = server.basedir().join("shares").join(si.prefix()).join(si.to_base32()).join("0");
    let mut share = storage_format::MutableShareFile::open(&share_path, si).unwrap();
    share.remove_leases(|_| true).unwrap();
    share.add_or_renew_lease(0, rs, cs, 0).unwrap();
    let mut leases = share.leases().unwrap();
    leases[0].expiration_time = 1_000;
    share.set_leases(&leases).unwrap();
    drop(share);

    let mut sharetypes = HashSet::new();
    sharetypes.insert(ShareTypeFilter::Mutable);
    sharetypes.insert(ShareTypeFilter::Immutable);
    let config = ExpirerConfig {
        expiration_enabled: true,
        mode: ExpirationMode::Age { override_duration: 2_000 },
        sharetypes,
    };
    let visitor = LeaseExpirer::new(config);
    let (mut crawler, mut visitor) = ShareCrawler::new(
        Arc::clone(&server),
        dir.path().join("lease_checker.state"),
        dir.path().join("lease_checker.history"),
        CrawlerTiming::default(),
        visitor,
    )
    .unwrap();

    loop {
        if crawler.run_one_slice(&mut visitor).await.unwrap() {
            break;
        }
    }

    assert!(!share_path.exists());
    let summary = crawler.history().0.get(&0).unwrap();
    assert_eq!(summary["space-recovered"]["actual-shares"], serde_json::json!(1));
}

/// Scenario 6: crawler resumption picks up after the last completed
/// prefix rather than restarting the whole cycle.
#[tokio::test]
async fn crawler_resumption_does_not_restart_the_cycle() {
    use storage_crawler::{CrawlerTiming, ExpirationMode, ExpirerConfig, LeaseExpirer, ShareCrawler, ShareTypeFilter, prefix_order};

    let dir = tempdir().unwrap();
    let server = Arc::new(StorageServer::new(StorageConfig::new(dir.path()), node_id()).unwrap());

    let mut sharetypes = HashSet::new();
    sharetypes.insert(ShareTypeFilter::Mutable);
    sharetypes.insert(ShareTypeFilter::Immutable);
    let config = ExpirerConfig {
        expiration_enabled: false,
        mode: ExpirationMode::Age { override_duration: 2_000 },
        sharetypes,
    };
    let state_path = dir.path().join("lease_checker.state");
    let history_path = dir.path().join("lease_checker.history");

    // First process: run exactly one slice (an otherwise-empty basedir
    // completes an entire cycle in a single slice, so assert on state
    // instead of forcing a partial cycle).
    {
        let visitor = LeaseExpirer::new(config.clone());
        let (mut crawler, mut visitor) =
            ShareCrawler::new(Arc::clone(&server), state_path.clone(), history_path.clone(), CrawlerTiming::default(), visitor).unwrap();
        let completed = crawler.run_one_slice(&mut visitor).await.unwrap();
        assert!(completed, "an empty basedir should finish a full cycle within one slice");
        assert_eq!(crawler.current_cycle(), 1);
    }

    // Restart: a fresh `ShareCrawler` reloads state from disk and should
    // continue from cycle 1, not cycle 0.
    {
        let visitor = LeaseExpirer::new(config);
        let (crawler, _visitor) =
            ShareCrawler::new(Arc::clone(&server), state_path, history_path, CrawlerTiming::default(), visitor).unwrap();
        assert_eq!(crawler.current_cycle(), 1);
    }

    // Sanity: the prefix order used by resumption is the same stable
    // permutation every time (spec.md §3.5).
    assert_eq!(prefix_order(), prefix_order());
}
