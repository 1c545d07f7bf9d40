//! Publisher behavior: periodic compact snapshots, event-window clearing,
//! and tolerance of bus failures.

use mb_core::{EventStyle, Mirror, run_publisher};
use mb_test_utils::MemoryBus;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, sleep, timeout};

async fn wait_until<F: Fn() -> bool>(check: F, what: &str) {
    timeout(Duration::from_secs(2), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn event_list(payload: &[u8]) -> serde_json::Value {
    let env: serde_json::Value = serde_json::from_slice(payload).unwrap();
    env["deviceData"][0]["val"].clone()
}

#[tokio::test]
async fn snapshots_are_compact_and_clear_the_event_window() {
    let mirror = Arc::new(Mirror::new());
    mirror.merge([("generic-status".to_owned(), serde_json::json!("WORK"))]);
    mirror.record_event("step-started");

    let bus = MemoryBus::new();
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(run_publisher(
        mirror.clone(),
        bus.clone(),
        "machine_events".to_owned(),
        Duration::from_millis(30),
        stop_rx,
        EventStyle::DeviceList,
    ));

    wait_until(|| bus.published().len() >= 2, "two publish windows").await;
    stop_tx.send(true).unwrap();
    timeout(Duration::from_secs(2), handle)
        .await
        .expect("publisher join")
        .expect("publisher task");

    let published = bus.published();
    let payload = std::str::from_utf8(&published[0].1).unwrap();
    assert!(!payload.contains(' '), "payload not compact: {payload}");
    assert_eq!(event_list(&published[0].1), serde_json::json!(["step-started"]));
    // The window was cleared by the first snapshot.
    assert_eq!(event_list(&published[1].1), serde_json::json!([]));
}

#[tokio::test]
async fn a_failed_publish_spends_the_window_and_the_loop_continues() {
    let mirror = Arc::new(Mirror::new());
    mirror.record_event("lost-with-the-window");

    let bus = MemoryBus::new();
    bus.set_failing(true);
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(run_publisher(
        mirror.clone(),
        bus.clone(),
        "machine_events".to_owned(),
        Duration::from_millis(30),
        stop_rx,
        EventStyle::DeviceList,
    ));

    // Let at least one failing window elapse, then recover.
    wait_until(|| mirror.pending_events() == 0, "failed window to clear events").await;
    bus.set_failing(false);

    wait_until(|| !bus.published().is_empty(), "publish after recovery").await;
    stop_tx.send(true).unwrap();
    timeout(Duration::from_secs(2), handle)
        .await
        .expect("publisher join")
        .expect("publisher task");

    // The event was spent by the failed window, not replayed.
    assert_eq!(event_list(&bus.published()[0].1), serde_json::json!([]));
}
