//! End-to-end dispatcher behavior: one envelope per ingested record.

use dispatcher::Dispatcher;
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

#[tokio::test]
async fn embedded_step_data_record_is_normalized_and_forwarded() {
    let dispatcher = Dispatcher::bind("127.0.0.1:0").await.unwrap();
    let addr = dispatcher.local_addr();
    let bus = MemoryBus::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(dispatcher.run(bus.clone(), "machine_events".to_owned(), shutdown_rx));

    let mut sink = TcpStream::connect(addr).await.unwrap();
    sink.write_all(
        concat!(
            r#"{"timestamp":"2025-06-05T08:46:11+02:00","event":"x","args":{"step-data":"status:{stack:0, proc:1}"}}"#,
            "\n",
        )
        .as_bytes(),
    )
    .await
    .unwrap();

    wait_until(|| !bus.published().is_empty(), "forwarded envelope").await;
    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(2), handle)
        .await
        .expect("dispatcher join")
        .expect("dispatcher task");

    let (channel, payload) = &bus.published()[0];
    assert_eq!(channel, "machine_events");
    let env: serde_json::Value = serde_json::from_slice(payload).unwrap();
    assert_eq!(env["timestamp"], "2025-06-05T06:46:11.000Z");
    assert_eq!(
        env["deviceData"],
        serde_json::json!([
            {"Id": "event", "val": "x"},
            {"Id": "step-data", "val": {"status": {"stack": 0, "proc": 1}}}
        ])
    );
}

#[tokio::test]
async fn each_record_becomes_its_own_envelope() {
    let dispatcher = Dispatcher::bind("127.0.0.1:0").await.unwrap();
    let addr = dispatcher.local_addr();
    let bus = MemoryBus::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(dispatcher.run(bus.clone(), "machine_events".to_owned(), shutdown_rx));

    let mut sink = TcpStream::connect(addr).await.unwrap();
    sink.write_all(
        concat!(
            r#"{"timestamp":"2025-06-05T08:46:11+02:00","event":"a","args":{}}"#,
            "\n",
            "not json at all\n",
            r#"{"timestamp":"2025-06-05T08:46:12+02:00","event":"b","args":{"emg-list":"123,30800012"}}"#,
            "\n",
        )
        .as_bytes(),
    )
    .await
    .unwrap();

    wait_until(|| bus.published().len() == 2, "two envelopes").await;
    shutdown_tx.send(true).unwrap();
    let _ = timeout(Duration::from_secs(2), handle).await;

    let second: serde_json::Value = serde_json::from_slice(&bus.published()[1].1).unwrap();
    assert_eq!(second["deviceData"][0]["val"], "b");
    assert_eq!(
        second["deviceData"][1]["val"],
        serde_json::json!([123, 30_800_012])
    );
}
