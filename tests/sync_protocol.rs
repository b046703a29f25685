//! Synchronization protocol tests
//!
//! Proves the join/copy protocol end to end:
//!
//! 1. Joining triggers exactly one synchronization, applied first
//! 2. Per-replica FIFO ordering of fanned-out writes
//! 3. Writes issued during a copy queue behind it; none are lost
//! 4. Eventual parity: after wait_until_synchronised, queues are empty
//! 5. A failed copy quarantines the joiner, not the template
//! 6. Full queues back-pressure the writer

use std::sync::Arc;
use std::time::{Duration, Instant};

use nimbusdb::backend::{DatabaseHandle, MemoryHandle, Row, StatementAction};
use nimbusdb::cluster::{ClusterConfig, ClusterCoordinator, ClusterError, ReplicaStatus};

fn row(id: u64) -> Row {
    let mut row = Row::new();
    row.insert("id".to_string(), serde_json::json!(id));
    row
}

fn test_config(label: &str) -> ClusterConfig {
    ClusterConfig::new(label)
        .with_rng_seed(7)
        .with_template_wait_ms(1_000)
        .with_required_tables(["accounts"])
}

fn settle(cluster: &ClusterCoordinator) {
    assert!(
        cluster.wait_until_synchronised(Some(10_000)),
        "cluster failed to reach parity"
    );
}

fn wait_for_status(
    cluster: &ClusterCoordinator,
    handle: &dyn DatabaseHandle,
    status: ReplicaStatus,
) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cluster.get_status(handle).ok() == Some(status) {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!(
        "member never reached {status}, currently {:?}",
        cluster.get_status(handle)
    );
}

// =============================================================================
// JOIN TRIGGERS SYNC
// =============================================================================

/// A joiner's first applied item is the one synchronization copy, and the
/// copied data matches the template.
#[test]
fn test_join_applies_sync_first_and_once() {
    let cluster = ClusterCoordinator::new(test_config("join"));
    let h1 = MemoryHandle::new("join-h1");
    h1.put_rows("accounts", vec![row(1), row(2)]);
    cluster.add_database(h1.clone()).unwrap();
    settle(&cluster);

    let h2 = MemoryHandle::new("join-h2");
    cluster.add_database(h2.clone()).unwrap();
    settle(&cluster);

    let journal = h2.journal();
    assert_eq!(journal.first().map(String::as_str), Some("sync:accounts"));
    assert_eq!(
        journal.iter().filter(|e| e.starts_with("sync:")).count(),
        1
    );
    assert_eq!(h2.row_count("accounts"), 2);
}

/// The single-member bootstrap skips the copy entirely.
#[test]
fn test_first_member_bootstraps_without_copy() {
    let cluster = ClusterCoordinator::new(test_config("bootstrap"));
    let h1 = MemoryHandle::new("bootstrap-h1");
    cluster.add_database(h1.clone()).unwrap();
    settle(&cluster);
    assert!(h1.journal().is_empty());
    assert_eq!(
        cluster.get_status(h1.as_ref()).unwrap(),
        ReplicaStatus::Ready
    );
}

// =============================================================================
// FIFO PER REPLICA
// =============================================================================

#[test]
fn test_broadcast_applies_in_enqueue_order() {
    let cluster = ClusterCoordinator::new(test_config("fifo"));
    let h1 = MemoryHandle::new("fifo-h1");
    cluster.add_database(h1.clone()).unwrap();
    settle(&cluster);

    let writes: Vec<String> = (0..10).map(|i| format!("write-{i}")).collect();
    for write in &writes {
        cluster
            .broadcast_action(Arc::new(StatementAction::new(write)))
            .unwrap();
    }
    settle(&cluster);
    assert_eq!(h1.journal(), writes);
}

/// Two replicas each observe the same fanned-out sequence in the same
/// order, independently.
#[test]
fn test_fanout_preserves_order_on_every_member() {
    let cluster = ClusterCoordinator::new(test_config("fanout"));
    let h1 = MemoryHandle::new("fanout-h1");
    let h2 = MemoryHandle::new("fanout-h2");
    cluster.add_database(h1.clone()).unwrap();
    settle(&cluster);
    cluster.add_database(h2.clone()).unwrap();
    settle(&cluster);

    let writes: Vec<String> = (0..8).map(|i| format!("w{i}")).collect();
    for write in &writes {
        cluster
            .broadcast_action(Arc::new(StatementAction::new(write)))
            .unwrap();
    }
    settle(&cluster);

    assert_eq!(h1.journal(), writes);
    // The joiner has its one sync entry first, then the same sequence.
    let journal = h2.journal();
    assert_eq!(journal.first().map(String::as_str), Some("sync:accounts"));
    assert_eq!(&journal[1..], writes.as_slice());
}

// =============================================================================
// WRITES DURING SYNCHRONIZATION
// =============================================================================

/// Writes fanned out while a joiner is still copying queue up behind the
/// sync action and apply afterwards, in order.
#[test]
fn test_writes_during_sync_are_not_lost() {
    let cluster = ClusterCoordinator::new(test_config("during"));
    let h1 = MemoryHandle::new("during-h1");
    h1.put_rows("accounts", vec![row(1)]);
    cluster.add_database(h1.clone()).unwrap();
    settle(&cluster);

    let h2 = MemoryHandle::new("during-h2");
    cluster.add_database(h2.clone()).unwrap();
    // Broadcast immediately, racing the copy.
    for i in 0..3 {
        cluster
            .broadcast_action(Arc::new(StatementAction::new(format!("racing-{i}"))))
            .unwrap();
    }
    settle(&cluster);

    let journal = h2.journal();
    assert_eq!(journal.first().map(String::as_str), Some("sync:accounts"));
    assert_eq!(
        &journal[1..],
        ["racing-0", "racing-1", "racing-2"]
    );
}

// =============================================================================
// EVENTUAL PARITY
// =============================================================================

#[test]
fn test_parity_means_every_queue_is_empty() {
    let cluster = ClusterCoordinator::new(test_config("parity"));
    let h1 = MemoryHandle::new("parity-h1");
    let h2 = MemoryHandle::new("parity-h2");
    cluster.add_database(h1.clone()).unwrap();
    settle(&cluster);
    cluster.add_database(h2.clone()).unwrap();
    for i in 0..20 {
        cluster
            .broadcast_action(Arc::new(StatementAction::new(format!("bulk-{i}"))))
            .unwrap();
    }
    settle(&cluster);

    for replica in cluster.members().members() {
        assert_eq!(replica.status(), ReplicaStatus::Ready);
        assert!(replica.queue().is_empty());
    }
}

// =============================================================================
// FAILED COPY
// =============================================================================

/// A copy failure quarantines the joiner; the template returns to READY
/// untouched.
#[test]
fn test_failed_copy_quarantines_joiner_only() {
    let cluster = ClusterCoordinator::new(test_config("badcopy"));
    let h1 = MemoryHandle::new("badcopy-h1");
    h1.put_rows("accounts", vec![row(1)]);
    cluster.add_database(h1.clone()).unwrap();
    settle(&cluster);

    let h2 = MemoryHandle::new("badcopy-h2");
    h2.break_connection("joiner offline");
    cluster.add_database(h2.clone()).unwrap();

    wait_for_status(&cluster, h2.as_ref(), ReplicaStatus::Quarantined);
    wait_for_status(&cluster, h1.as_ref(), ReplicaStatus::Ready);
    let joiner = cluster.members().member(&h2.settings_key()).unwrap();
    assert_eq!(joiner.quarantine_count(), 1);
    assert!(joiner.last_failure().is_some());
}

/// A repaired joiner goes back through the start sequence and catches up.
#[test]
fn test_quarantined_joiner_recovers_on_restart() {
    let cluster = ClusterCoordinator::with_collaborators(
        ClusterConfig::self_healing("recover")
            .with_rng_seed(7)
            .with_template_wait_ms(1_000)
            .with_required_tables(["accounts"]),
        None,
        None,
        None,
    );
    let h1 = MemoryHandle::new("recover-h1");
    h1.put_rows("accounts", vec![row(1), row(2)]);
    cluster.add_database(h1.clone()).unwrap();
    settle(&cluster);

    let h2 = MemoryHandle::new("recover-h2");
    h2.break_connection("flaky joiner");
    cluster.add_database(h2.clone()).unwrap();
    wait_for_status(&cluster, h2.as_ref(), ReplicaStatus::Quarantined);

    h2.recover();
    assert_eq!(cluster.restart_quarantined().unwrap(), 1);
    settle(&cluster);
    assert_eq!(
        cluster.get_status(h2.as_ref()).unwrap(),
        ReplicaStatus::Ready
    );
    assert_eq!(h2.row_count("accounts"), 2);
}

// =============================================================================
// BACK-PRESSURE
// =============================================================================

/// A full queue rejects the broadcast instead of blocking or silently
/// dropping; draining the member clears the pressure.
#[test]
fn test_full_queue_backpressures_writer() {
    let cluster = ClusterCoordinator::new(
        ClusterConfig::new("pressure")
            .with_rng_seed(7)
            .with_template_wait_ms(1_000)
            .with_queue_capacity(2),
    );
    let h1 = MemoryHandle::new("pressure-h1");
    cluster.add_database(h1.clone()).unwrap();
    settle(&cluster);

    // Freeze the worker so the queue can fill.
    cluster.members().set_paused(h1.as_ref()).unwrap();
    cluster
        .broadcast_action(Arc::new(StatementAction::new("p0")))
        .unwrap();
    cluster
        .broadcast_action(Arc::new(StatementAction::new("p1")))
        .unwrap();
    assert!(matches!(
        cluster.broadcast_action(Arc::new(StatementAction::new("p2"))),
        Err(ClusterError::QueueFull { capacity: 2, .. })
    ));

    // Resume: the accepted writes drain in order.
    cluster.members().set_processing(h1.as_ref()).unwrap();
    settle(&cluster);
    assert_eq!(h1.journal(), vec!["p0", "p1"]);
}
