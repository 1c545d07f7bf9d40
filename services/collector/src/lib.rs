//! collector: line-delimited-JSON TCP sink that accumulates machine events
//! into a mirror and publishes periodic snapshots.
//!
//! Each newline-terminated line is one JSON object
//! `{timestamp, event, args:{…}}`.  Event names accumulate in the mirror's
//! window (duplicates suppressed) and are emitted as a top-level `event`
//! string joined by `", "`; args merge into the field map with the usual
//! `emg-list` / `step-data` normalization.  Invalid JSON lines are logged
//! and skipped.

use mb_core::envelope::FieldValues;
use mb_core::{Bus, EventRecord, EventStyle, Mirror, run_publisher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{info, warn};

pub struct Collector {
    listener: TcpListener,
    mirror: Arc<Mirror>,
}

impl Collector {
    /// Bind the sink listener (use `"127.0.0.1:0"` to let the OS choose).
    pub async fn bind(addr: &str) -> std::io::Result<Collector> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "sink listening");
        Ok(Collector {
            listener,
            mirror: Arc::new(Mirror::with_fields(initial_fields())),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener
            .local_addr()
            .expect("local_addr always succeeds after bind")
    }

    pub fn mirror(&self) -> Arc<Mirror> {
        self.mirror.clone()
    }

    /// Accept sink connections and publish snapshots until shutdown.
    pub async fn run<B: Bus>(
        self,
        bus: B,
        channel: String,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let publisher = tokio::spawn(run_publisher(
            self.mirror.clone(),
            bus,
            channel,
            interval,
            stop_rx,
            EventStyle::JoinedField,
        ));

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!(%peer, "sink client connected");
                        tokio::spawn(serve_sink(stream, self.mirror.clone()));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        }
        let _ = stop_tx.send(true);
        let _ = publisher.await;
    }
}

/// Read newline-terminated JSON records from one sink client.
async fn serve_sink(stream: TcpStream, mirror: Arc<Mirror>) {
    let peer = stream.peer_addr().ok();
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<EventRecord>(line) {
                    Ok(record) => apply_record(&mirror, &record),
                    Err(e) => warn!(error = %e, line, "invalid json line"),
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
    info!(peer = ?peer, "sink client disconnected");
}

/// Merge one ingest record into the mirror.
pub fn apply_record(mirror: &Mirror, record: &EventRecord) {
    if let Some(event) = &record.event {
        mirror.record_event(event);
    }
    mirror.merge(record.args.iter().map(|(k, v)| (k.clone(), v.clone())));
}

/// The collector's field shape: the monitor's set plus the counters the
/// event sources report.
pub fn initial_fields() -> FieldValues {
    let mut fields = FieldValues::new();
    fields.insert("cut-recipe".to_owned(), serde_json::json!(""));
    fields.insert("emg-list".to_owned(), serde_json::json!([]));
    fields.insert("generic-status".to_owned(), serde_json::json!(""));
    fields.insert("glass-id".to_owned(), serde_json::json!(""));
    fields.insert("glass-type".to_owned(), serde_json::json!(""));
    fields.insert("h-glass".to_owned(), serde_json::json!(0.0));
    fields.insert("machine".to_owned(), serde_json::json!(""));
    fields.insert("piece-taken".to_owned(), serde_json::json!(0));
    fields.insert("prj-name".to_owned(), serde_json::json!(""));
    fields.insert("scheme".to_owned(), serde_json::json!(0));
    fields.insert("schemes-count".to_owned(), serde_json::json!(0));
    fields.insert("speed-override".to_owned(), serde_json::json!(0));
    fields.insert("step".to_owned(), serde_json::json!(0));
    fields.insert("step-data".to_owned(), serde_json::json!({}));
    fields.insert("user-buttons".to_owned(), serde_json::json!(""));
    fields.insert("work-selectors".to_owned(), serde_json::json!(""));
    fields
}
