use crate::consts::SHARD_MAPPING_PREFIX;
use crate::engine::IterOptions;
use crate::tests::harness::{test_config, TestServer};
use crate::types::{prefix_range, KeyRange};
use tempfile::tempdir;

#[tokio::test]
async fn restart_preserves_data_and_mapping() {
    let root = tempdir().unwrap();
    let path = root.path().join("store");
    let log = crate::logsys::MemoryLog::new();
    let counter = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));

    let durable_before;
    {
        let t = TestServer::open_with(
            &path,
            test_config(),
            log.clone(),
            crate::peer::EmptyPeer::new(),
            counter.clone(),
        )
        .await;
        t.assign(&KeyRange::new(b"a", b"c")).await;
        t.assign(&KeyRange::new(b"c", b"f")).await;
        t.set(b"b", b"1").await;
        let v = t.set(b"d", b"2").await;
        // everything including the availability records must be durable
        t.wait_durable(v).await;
        durable_before = t.server.durable_version.get();
        t.server.stop().await.unwrap();
    }

    let t = TestServer::open_with(
        &path,
        test_config(),
        log.clone(),
        crate::peer::EmptyPeer::new(),
        counter.clone(),
    )
    .await;
    assert!(t.server.durable_version.get() >= durable_before);

    let rows = t.read_range(b"a", b"f").await.unwrap();
    assert_eq!(
        rows,
        vec![(b"b".to_vec(), b"1".to_vec()), (b"d".to_vec(), b"2".to_vec())]
    );

    // two distinct physical shards own the two ranges on disk
    let shards = t.server.shard_manager.shards().await;
    let owner = |key: &[u8]| {
        shards
            .iter()
            .find(|ds| ds.range.contains(key))
            .map(|ds| ds.physical_id.clone())
            .unwrap()
    };
    assert_ne!(owner(b"b"), owner(b"d"));

    // and the durable boundary records agree
    let engine = t.server.shard_manager.engine();
    let range = prefix_range(SHARD_MAPPING_PREFIX);
    let mut iter = engine
        .iter(crate::consts::METADATA_SHARD_ID, IterOptions::bounded(&range))
        .await
        .unwrap();
    let mut assigned_boundaries = 0;
    let mut entry = iter.seek(SHARD_MAPPING_PREFIX).await.unwrap();
    while let Some(e) = entry {
        if !e.value.is_empty() {
            assigned_boundaries += 1;
        }
        entry = iter.next_entry().await.unwrap();
    }
    assert_eq!(assigned_boundaries, 2);
}

#[tokio::test]
async fn restart_replays_log_tail_idempotently() {
    let root = tempdir().unwrap();
    let path = root.path().join("store");
    let log = crate::logsys::MemoryLog::new();
    let counter = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));

    {
        let t = TestServer::open_with(
            &path,
            test_config(),
            log.clone(),
            crate::peer::EmptyPeer::new(),
            counter.clone(),
        )
        .await;
        let v_assign = t.assign(&KeyRange::new(b"a", b"z")).await;
        t.wait_durable(v_assign).await;
        let v1 = t.set(b"k1", b"before").await;
        t.wait_durable(v1).await;
        // these land in memory and in the log, but are not yet durable
        t.set(b"k1", b"after").await;
        t.set(b"k2", b"tail").await;
        t.server.stop().await.unwrap();
    }

    // recovery replays (durableVersion, version] from the retained log
    let t = TestServer::open_with(
        &path,
        test_config(),
        log.clone(),
        crate::peer::EmptyPeer::new(),
        counter.clone(),
    )
    .await;
    let target = counter.load(std::sync::atomic::Ordering::SeqCst);
    t.server.version.when_at_least(target).await;
    assert_eq!(t.get(b"k1").await.unwrap(), Some(b"after".to_vec()));
    assert_eq!(t.get(b"k2").await.unwrap(), Some(b"tail".to_vec()));
    t.check_vm_invariants().await;
}

#[tokio::test]
async fn byte_sample_rebuilds_after_restart() {
    let root = tempdir().unwrap();
    let path = root.path().join("store");
    let log = crate::logsys::MemoryLog::new();
    let counter = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));

    {
        let t = TestServer::open_with(
            &path,
            test_config(),
            log.clone(),
            crate::peer::EmptyPeer::new(),
            counter.clone(),
        )
        .await;
        t.assign(&KeyRange::new(b"a", b"z")).await;
        let mut v = 0;
        for i in 0..50u32 {
            // large values are always sampled
            v = t.set(format!("big{:03}", i).as_bytes(), &vec![7u8; 5000]).await;
        }
        t.wait_durable(v).await;
        assert!(t.server.byte_sample.total_estimate() > 0);
        t.server.stop().await.unwrap();
    }

    let t = TestServer::open_with(
        &path,
        test_config(),
        log.clone(),
        crate::peer::EmptyPeer::new(),
        counter.clone(),
    )
    .await;
    // the rebuild task runs in the background shortly after start
    for _ in 0..100 {
        if t.server.byte_sample.total_estimate() > 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let est = t.server.byte_sample.total_estimate();
    assert!(est >= 50 * 5000, "sample estimate {} too small", est);
}
