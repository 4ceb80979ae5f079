//! End-to-end configuration lock scenarios over loopback TCP.

use fbuild_client::{ClientInfo, DaemonClient};
use fbuild_config::DaemonConfig;
use fbuild_integration_tests::TestDaemon;

async fn connect(daemon: &TestDaemon) -> DaemonClient {
    DaemonClient::connect(daemon.addr.as_str(), ClientInfo::default())
        .await
        .expect("client failed to connect")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exclusive_contention_nonblocking_then_retry() {
    let daemon = TestDaemon::start().await;
    let a = connect(&daemon).await;
    let b = connect(&daemon).await;

    let granted = a
        .acquire_lock("/proj1", "env1", "/dev/ttyUSB0", "exclusive", 60.0, "flash")
        .await
        .unwrap();
    assert_eq!(granted["success"], true);
    assert_eq!(granted["lock_state"], "locked_exclusive");

    // B's non-blocking attempt reports the contention details.
    let denied = b
        .try_acquire_lock("/proj1", "env1", "/dev/ttyUSB0", "exclusive", "")
        .await
        .unwrap();
    assert_eq!(denied["success"], false);
    assert_eq!(denied["lock_state"], "locked_exclusive");
    assert_eq!(denied["holder_count"], 1);

    // A releases; B's retry succeeds.
    let released = a.release_lock("/proj1", "env1", "/dev/ttyUSB0").await.unwrap();
    assert_eq!(released["success"], true);
    let retried = b
        .try_acquire_lock("/proj1", "env1", "/dev/ttyUSB0", "exclusive", "")
        .await
        .unwrap();
    assert_eq!(retried["success"], true);

    a.disconnect().await;
    b.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shared_readers_coexist_over_wire() {
    let daemon = TestDaemon::start().await;
    let a = connect(&daemon).await;
    let b = connect(&daemon).await;

    let first = a
        .acquire_lock("/p", "e", "", "shared_read", 60.0, "inspect")
        .await
        .unwrap();
    assert_eq!(first["success"], true);
    let second = b
        .acquire_lock("/p", "e", "", "shared_read", 60.0, "inspect")
        .await
        .unwrap();
    assert_eq!(second["success"], true);

    let status = a.lock_status("/p", "e", "").await.unwrap();
    assert_eq!(status["state"], "locked_shared_read");
    assert_eq!(status["holder_count"], 2);

    a.disconnect().await;
    b.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_lock_janitor_releases_and_old_holder_release_fails() {
    let daemon = TestDaemon::start().await;
    let a = connect(&daemon).await;

    // A tiny timeout makes the lock stale almost immediately.
    let granted = a
        .acquire_lock("/p", "e", "/dev/ttyUSB0", "exclusive", 0.05, "short")
        .await
        .unwrap();
    assert_eq!(granted["success"], true);
    tokio::time::sleep(std::time::Duration::from_millis(120)).await;

    let stale = daemon.context.locks.stale_locks();
    assert_eq!(stale.len(), 1);
    assert_eq!(daemon.context.locks.force_release_stale_locks(), 1);

    // The former holder's explicit release reports failure, not a crash.
    let released = a.release_lock("/p", "e", "/dev/ttyUSB0").await.unwrap();
    assert_eq!(released["success"], false);

    a.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_cascades_lock_release() {
    let daemon = TestDaemon::start().await;
    let a = connect(&daemon).await;
    let b = connect(&daemon).await;

    let granted = a
        .acquire_lock("/p", "e", "", "exclusive", 60.0, "")
        .await
        .unwrap();
    assert_eq!(granted["success"], true);

    a.disconnect().await;
    // Give the server a moment to run cascade cleanup.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let retried = b.try_acquire_lock("/p", "e", "", "exclusive", "").await.unwrap();
    assert_eq!(retried["success"], true, "lock not released on disconnect: {retried}");

    b.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unicode_lock_keys_over_wire() {
    let daemon = TestDaemon::start().await;
    let a = connect(&daemon).await;

    let granted = a
        .acquire_lock("/проект", "环境", "", "exclusive", 60.0, "")
        .await
        .unwrap();
    assert_eq!(granted["success"], true);
    let status = a.lock_status("/проект", "环境", "").await.unwrap();
    assert_eq!(status["is_held"], true);

    a.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_lock_events_broadcast_to_subscribers() {
    let daemon = TestDaemon::start_with(DaemonConfig::default()).await;
    let watcher = connect(&daemon).await;
    let actor = connect(&daemon).await;

    let sub = watcher.subscribe(&["locks"], None).await.unwrap();
    assert_eq!(sub["success"], true);
    let mut broadcasts = watcher.subscribe_broadcasts();

    actor
        .acquire_lock("/p", "e", "", "exclusive", 60.0, "")
        .await
        .unwrap();

    let event = tokio::time::timeout(std::time::Duration::from_secs(2), broadcasts.recv())
        .await
        .expect("no lock broadcast arrived")
        .unwrap();
    assert_eq!(event["event_type"], "lock_acquired");
    assert_eq!(event["data"]["event"], "lock_acquired");

    watcher.disconnect().await;
    actor.disconnect().await;
}
