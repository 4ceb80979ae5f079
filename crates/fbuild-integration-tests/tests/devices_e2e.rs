//! End-to-end device lease and preemption scenarios.

use fbuild_client::{ClientInfo, DaemonClient};
use fbuild_integration_tests::TestDaemon;

async fn connect(daemon: &TestDaemon) -> DaemonClient {
    DaemonClient::connect(daemon.addr.as_str(), ClientInfo::default())
        .await
        .expect("client failed to connect")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_device_list_reports_inventory() {
    let daemon = TestDaemon::start().await;
    let a = connect(&daemon).await;

    let listed = a.list_devices(false).await.unwrap();
    assert_eq!(listed["success"], true);
    assert_eq!(listed["total_devices"], 2);

    a.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exclusive_lease_then_monitor_rules() {
    let daemon = TestDaemon::start().await;
    let a = connect(&daemon).await;
    let b = connect(&daemon).await;

    let lease = a
        .lease_device("usb-001", "exclusive", "flashing", false)
        .await
        .unwrap();
    assert_eq!(lease["success"], true);
    assert_eq!(lease["lease_type"], "exclusive");

    // allows_monitors=false: the monitor attempt is denied.
    let monitor = b.lease_device("usb-001", "monitor", "observe", true).await.unwrap();
    assert_eq!(monitor["success"], false);
    assert_eq!(monitor["has_exclusive"], true);

    // A second exclusive is denied too.
    let second = b
        .lease_device("usb-001", "exclusive", "", true)
        .await
        .unwrap();
    assert_eq!(second["success"], false);

    let released = a
        .release_lease(lease["lease_id"].as_str().unwrap())
        .await
        .unwrap();
    assert_eq!(released["success"], true);

    let monitor = b.lease_device("usb-001", "monitor", "observe", true).await.unwrap();
    assert_eq!(monitor["success"], true);

    a.disconnect().await;
    b.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_preemption_notifies_holder_before_response() {
    let daemon = TestDaemon::start().await;
    let holder = connect(&daemon).await;
    let challenger = connect(&daemon).await;

    // The holder subscribes to device events and takes the device.
    holder.subscribe(&["devices"], None).await.unwrap();
    let mut holder_events = holder.subscribe_broadcasts();
    let lease = holder
        .lease_device("usb-001", "exclusive", "long monitor", true)
        .await
        .unwrap();
    assert_eq!(lease["success"], true);
    // Drain the holder's own lease_acquired broadcast.
    let first = tokio::time::timeout(std::time::Duration::from_secs(2), holder_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first["event_type"], "lease_acquired");

    // An empty reason is refused outright.
    let refused = challenger.preempt_device("usb-001", "   ").await.unwrap();
    assert_eq!(refused["success"], false);
    assert_eq!(refused["message"], "reason is required and must not be empty");

    let response = challenger
        .preempt_device("usb-001", "CI takeover")
        .await
        .unwrap();
    assert_eq!(response["success"], true);
    assert_eq!(response["lease_type"], "exclusive");
    assert!(response["lease_id"].is_string());
    assert_eq!(
        response["preempted_client_id"],
        holder.client_id().as_str()
    );

    // The preempted holder received both the direct notification and the
    // DEVICES broadcast.
    let mut seen_direct = false;
    let mut seen_broadcast = false;
    for _ in 0..2 {
        let event = tokio::time::timeout(std::time::Duration::from_secs(2), holder_events.recv())
            .await
            .expect("expected preemption event")
            .unwrap();
        match event["event_type"].as_str().unwrap() {
            "device_preemption" => {
                assert_eq!(event["data"]["reason"], "CI takeover");
                assert_eq!(
                    event["data"]["preempted_by"],
                    challenger.client_id().as_str()
                );
                seen_direct = true;
            },
            "device_preempted" => {
                assert_eq!(event["data"]["device_id"], "usb-001");
                seen_broadcast = true;
            },
            other => panic!("unexpected event: {other}"),
        }
    }
    assert!(seen_direct, "direct preemption notification missing");
    assert!(seen_broadcast, "device_preempted broadcast missing");

    holder.disconnect().await;
    challenger.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_device_status_unknown_device() {
    let daemon = TestDaemon::start().await;
    let a = connect(&daemon).await;

    let status = a.device_status("usb-999").await.unwrap();
    assert_eq!(status["exists"], false);

    a.disconnect().await;
}
