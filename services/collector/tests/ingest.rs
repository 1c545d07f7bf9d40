//! End-to-end collector behavior: TCP ingest, accumulation, periodic
//! snapshot publish with a joined event string.

use collector::Collector;
use mb_core::EventStyle;
use mb_test_utils::MemoryBus;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{Duration, sleep, timeout};

async fn wait_until<F: Fn() -> bool>(check: F, what: &str) {
    timeout(Duration::from_secs(3), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn envelopes(bus: &MemoryBus) -> Vec<serde_json::Value> {
    bus.published()
        .iter()
        .map(|(_, payload)| serde_json::from_slice(payload).unwrap())
        .collect()
}

fn device_val<'a>(env: &'a serde_json::Value, id: &str) -> Option<&'a serde_json::Value> {
    env["deviceData"]
        .as_array()?
        .iter()
        .find(|f| f["Id"] == id)
        .map(|f| &f["val"])
}

#[tokio::test]
async fn ingested_events_accumulate_deduplicated_into_one_window() {
    let collector = Collector::bind("127.0.0.1:0").await.unwrap();
    let addr = collector.local_addr();
    let mirror = collector.mirror();
    let bus = MemoryBus::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    // Interval far beyond the test horizon: the window under test is
    // snapshotted by hand, without a publisher tick racing the ingest.
    let handle = tokio::spawn(collector.run(
        bus.clone(),
        "machine_events".to_owned(),
        Duration::from_secs(3600),
        shutdown_rx,
    ));

    let mut sink = TcpStream::connect(addr).await.unwrap();
    sink.write_all(
        concat!(
            r#"{"timestamp":"2025-06-05T08:46:10+02:00","event":"status-changed","args":{"generic-status":"WORK"}}"#,
            "\n",
            r#"{"timestamp":"2025-06-05T08:46:11+02:00","event":"step-started","args":{"prj-name":"test-prj","scheme":1,"step":2,"step-data":"status:{stack:0, proc:1}, sheet:{size:3210x2400}"}}"#,
            "\n",
            r#"{"timestamp":"2025-06-05T08:46:12+02:00","event":"step-started","args":{}}"#,
            "\n",
            r#"{"timestamp":"2025-06-05T08:46:13+02:00","event":"alarms-changed","args":{"emg-list":"123,30800012"}}"#,
            "\n",
        )
        .as_bytes(),
    )
    .await
    .unwrap();

    wait_until(
        || mirror.get("emg-list") == Some(serde_json::json!([123, 30_800_012])),
        "records applied",
    )
    .await;

    let env = mirror.snapshot(EventStyle::JoinedField);
    assert_eq!(
        env.event.as_deref(),
        Some("status-changed, step-started, alarms-changed")
    );
    let step_data = env
        .device_data
        .iter()
        .find(|f| f.id == "step-data")
        .expect("step-data in snapshot");
    assert_eq!(
        step_data.val,
        serde_json::json!({
            "status": {"stack": 0, "proc": 1},
            "sheet": {"size": "3210x2400"}
        })
    );
    // The joined style keeps `event` out of deviceData.
    assert!(env.device_data.iter().all(|f| f.id != "event"));
    // The manual snapshot spent the window.
    assert_eq!(mirror.pending_events(), 0);

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(2), handle)
        .await
        .expect("collector join")
        .expect("collector task");
}

#[tokio::test]
async fn snapshots_reach_the_bus_on_the_configured_channel() {
    let collector = Collector::bind("127.0.0.1:0").await.unwrap();
    let addr = collector.local_addr();
    let bus = MemoryBus::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(collector.run(
        bus.clone(),
        "telemetry".to_owned(),
        Duration::from_millis(50),
        shutdown_rx,
    ));

    let mut sink = TcpStream::connect(addr).await.unwrap();
    sink.write_all(
        concat!(
            r#"{"timestamp":"2025-06-05T08:46:10+02:00","event":"status-changed","args":{"generic-status":"WORK"}}"#,
            "\n",
        )
        .as_bytes(),
    )
    .await
    .unwrap();

    wait_until(
        || {
            envelopes(&bus)
                .iter()
                .any(|e| e["event"] == "status-changed")
        },
        "window carrying the event",
    )
    .await;
    wait_until(
        || {
            envelopes(&bus)
                .iter()
                .any(|e| device_val(e, "generic-status") == Some(&serde_json::json!("WORK")))
        },
        "window carrying the merged field",
    )
    .await;
    assert!(bus.published().iter().all(|(ch, _)| ch == "telemetry"));

    shutdown_tx.send(true).unwrap();
    let _ = timeout(Duration::from_secs(2), handle).await;
}

#[tokio::test]
async fn invalid_json_lines_are_skipped() {
    let collector = Collector::bind("127.0.0.1:0").await.unwrap();
    let addr = collector.local_addr();
    let mirror = collector.mirror();
    let bus = MemoryBus::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(collector.run(
        bus.clone(),
        "machine_events".to_owned(),
        Duration::from_secs(3600),
        shutdown_rx,
    ));

    let mut sink = TcpStream::connect(addr).await.unwrap();
    sink.write_all(b"this is not json\n{\"event\":\"recovered\",\"args\":{}}\n")
        .await
        .unwrap();

    wait_until(|| mirror.pending_events() == 1, "valid record after garbage").await;

    shutdown_tx.send(true).unwrap();
    let _ = timeout(Duration::from_secs(2), handle).await;
}
