use crate::mlog::Mutation;
use crate::tests::harness::{test_config, TestServer};
use crate::types::KeyRange;
use std::sync::atomic::Ordering;
use tempfile::tempdir;

/// Writes outpace the durability loop; the pipeline must stall at the
/// queue ceiling, keep serving reads, and resume once the loop drains.
#[tokio::test]
async fn queue_ceiling_stalls_and_recovers() {
    let root = tempdir().unwrap();
    let mut cfg = test_config();
    cfg.queue_hard_bytes = 16 * 1024;
    cfg.queue_overage_bytes = 4 * 1024;
    cfg.durability_interval = std::time::Duration::from_millis(50);
    let t = TestServer::open_with(
        root.path().join("store"),
        cfg.clone(),
        crate::logsys::MemoryLog::new(),
        crate::peer::EmptyPeer::new(),
        std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0)),
    )
    .await;
    t.assign(&KeyRange::new(b"a", b"z")).await;

    // flood the log without waiting for the pipeline
    let payload = vec![9u8; 512];
    let mut last_version = 0;
    for i in 0..200u32 {
        last_version = t.next_version();
        t.log.push(
            last_version,
            vec![Mutation::set(format!("flood{:04}", i).as_bytes(), &payload)],
        );
    }

    let mut stalled = false;
    let ceiling = (cfg.queue_hard_bytes + cfg.queue_overage_bytes) as u64;
    for _ in 0..200 {
        let queue = t.server.counters.queue_bytes();
        // bounded memory: the queue never runs past ceiling plus one batch
        assert!(
            queue <= ceiling + 8 * 1024,
            "queue {} exceeded the brake ceiling {}",
            queue,
            ceiling
        );
        if t.server.current_version() < last_version && queue > cfg.queue_hard_bytes as u64 {
            stalled = true;
            // reads keep working at whatever version is current
            let rows = t.read_range(b"a", b"z").await.unwrap();
            assert!(!rows.is_empty());
        }
        if t.server.current_version() >= last_version {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(stalled, "the pipeline never hit the emergency brake");

    // consumption resumes once the durability loop catches up
    tokio::time::timeout(
        std::time::Duration::from_secs(30),
        t.server.version.when_at_least(last_version),
    )
    .await
    .expect("log consumption never resumed");
    assert!(t.server.counters.set_mutations.load(Ordering::Relaxed) >= 200);
    t.check_vm_invariants().await;
}
