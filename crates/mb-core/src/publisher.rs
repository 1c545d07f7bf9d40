//! Periodic snapshot publisher task, shared by the monitor and the
//! collector.
//!
//! Every period: snapshot the mirror (which atomically clears the event
//! window), serialize as compact JSON, publish to the bus channel.  Publish
//! failures are logged and skipped; telemetry is best-effort, so a failed
//! publish costs that window's events and nothing else.

use crate::bus::Bus;
use crate::envelope::EventStyle;
use crate::mirror::Mirror;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

pub async fn run_publisher<B: Bus>(
    mirror: Arc<Mirror>,
    mut bus: B,
    channel: String,
    period: Duration,
    mut stop: watch::Receiver<bool>,
    style: EventStyle,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => {
                if *stop.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(period) => {
                let payload = mirror.snapshot(style).to_compact_json();
                debug!(bytes = payload.len(), "publishing snapshot");
                if let Err(e) = bus.publish(&channel, payload).await {
                    warn!(error = %e, "bus publish failed, window skipped");
                }
            }
        }
    }
}
