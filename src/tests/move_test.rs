//! Shard movement between two in-process servers sharing one sequencer:
//! the destination fetches the range (and overlapping change feeds) from
//! the source through the loopback peer.

use crate::feed;
use crate::peer::LoopbackPeer;
use crate::tests::harness::{test_config, TestServer};
use crate::types::KeyRange;
use tempfile::tempdir;

#[tokio::test]
async fn fetch_moves_data_between_servers() {
    let root = tempdir().unwrap();
    let counter = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));

    let src = TestServer::open_with(
        root.path().join("src"),
        test_config(),
        crate::logsys::MemoryLog::new(),
        crate::peer::EmptyPeer::new(),
        counter.clone(),
    )
    .await;
    src.assign(&KeyRange::new(b"a", b"z")).await;
    for i in 0..20u32 {
        src.set(format!("mv{:03}", i).as_bytes(), format!("val{}", i).as_bytes())
            .await;
    }

    let dst = TestServer::open_with(
        root.path().join("dst"),
        test_config(),
        crate::logsys::MemoryLog::new(),
        LoopbackPeer::new(src.server.clone()),
        counter.clone(),
    )
    .await;

    // the destination's fetch pins a version the source must be able to
    // serve; keep the source's version frontier moving alongside
    let dst_server = dst.server.clone();
    let src_feeder = {
        let src_log = src.log.clone();
        let counter = counter.clone();
        let done = dst_server.shutdown_signal();
        tokio::spawn(async move {
            let mut done = done;
            loop {
                if *done.borrow() {
                    return;
                }
                let v = counter.fetch_add(10, std::sync::atomic::Ordering::SeqCst) + 10;
                src_log.push_empty(v);
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(5)) => {}
                    _ = done.changed() => return,
                }
            }
        })
    };

    dst.assign(&KeyRange::new(b"a", b"m")).await;
    src_feeder.abort();

    let rows = dst.read_range(b"a", b"m").await.unwrap();
    assert_eq!(rows.len(), 20);
    assert_eq!(rows[0].0, b"mv000".to_vec());
    assert_eq!(rows[19].1, b"val19".to_vec());
    dst.check_shard_cover();
}

#[tokio::test]
async fn fetch_carries_overlapping_feeds() {
    let root = tempdir().unwrap();
    let counter = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));

    let src = TestServer::open_with(
        root.path().join("src"),
        test_config(),
        crate::logsys::MemoryLog::new(),
        crate::peer::EmptyPeer::new(),
        counter.clone(),
    )
    .await;
    src.assign(&KeyRange::new(b"a", b"z")).await;
    src.register_feed(b"MF", &KeyRange::new(b"a", b"m")).await;
    let v_write = src.set(b"f1", b"feed-data").await;
    src.wait_durable(v_write).await;

    let dst = TestServer::open_with(
        root.path().join("dst"),
        test_config(),
        crate::logsys::MemoryLog::new(),
        LoopbackPeer::new(src.server.clone()),
        counter.clone(),
    )
    .await;

    let src_feeder = {
        let src_log = src.log.clone();
        let counter = counter.clone();
        let mut done = dst.server.shutdown_signal();
        tokio::spawn(async move {
            loop {
                if *done.borrow() {
                    return;
                }
                let v = counter.fetch_add(10, std::sync::atomic::Ordering::SeqCst) + 10;
                src_log.push_empty(v);
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(5)) => {}
                    _ = done.changed() => return,
                }
            }
        })
    };
    dst.assign(&KeyRange::new(b"a", b"m")).await;
    src_feeder.abort();

    // the feed exists on the destination with its history intact
    let feed_handle = dst.server.feeds.get(b"MF").expect("feed must move with the shard");
    assert_eq!(feed_handle.read().await.range, KeyRange::new(b"a", b"m"));
    let reply = feed::get_feed_mutations(&dst.server, b"MF", 0, u64::MAX, None, usize::MAX)
        .await
        .unwrap();
    let data: Vec<_> = reply.entries.iter().filter(|e| !e.mutations.is_empty()).collect();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].version, v_write);
}
