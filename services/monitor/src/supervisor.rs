//! Session supervisor.
//!
//! Per session: INIT → AUTHENTICATING → CONNECTING → RUNNING → DRAINING →
//! INIT.  The listener owns the socket once the subscription is active; the
//! supervisor performs the setup reads and the subscribe before spawning it,
//! so the socket never has two readers.  On any fatal listener error both
//! tasks are joined, then a backoff sleep (interruptible by shutdown)
//! precedes the next attempt.  No data is buffered across reconnects.

use crate::config::MonitorConfig;
use crate::link::{EXTRA_FIELDS, Link, LinkConfig, LinkError};
use crate::listener::run_listener;
use mb_core::envelope::FieldValues;
use mb_core::{Bus, EventStyle, Mirror, run_publisher};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Run the reconnecting supervision loop until shutdown is signalled.
pub async fn run<B>(cfg: &MonitorConfig, bus: B, mut shutdown: watch::Receiver<bool>)
where
    B: Bus + Clone,
{
    let mirror = Arc::new(Mirror::with_fields(initial_fields()));
    loop {
        if *shutdown.borrow() {
            return;
        }
        match run_session(cfg, &mirror, bus.clone(), shutdown.clone()).await {
            Ok(SessionEnd::Shutdown) => {
                info!("shutdown signalled, draining done");
                return;
            }
            Ok(SessionEnd::Fatal(e)) => {
                error!(error = %e, "session failed, reconnecting");
            }
            Err(e) => {
                error!(error = %e, "session setup failed, retrying");
            }
        }
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(cfg.timing.restart_time()) => {}
        }
    }
}

enum SessionEnd {
    Shutdown,
    Fatal(LinkError),
}

async fn run_session<B>(
    cfg: &MonitorConfig,
    mirror: &Arc<Mirror>,
    bus: B,
    mut shutdown: watch::Receiver<bool>,
) -> Result<SessionEnd, LinkError>
where
    B: Bus,
{
    let link_cfg = LinkConfig {
        host: cfg.machine.host.clone(),
        control_port: cfg.machine.conn_port,
        machine: cfg.machine.name.clone(),
        client_name: cfg.client_name.clone(),
    };
    let mut link = Link::establish(&link_cfg).await?;

    initialize_fields(&mut link, mirror).await;
    link.subscribe_to_status_changes().await?;
    info!("subscribed to status changes");

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut listener = tokio::spawn(run_listener(
        link,
        mirror.clone(),
        stop_rx.clone(),
        cfg.timing.conncheck_period(),
    ));
    let publisher = tokio::spawn(run_publisher(
        mirror.clone(),
        bus,
        cfg.bus.channel.clone(),
        cfg.timing.publish_period(),
        stop_rx,
        EventStyle::DeviceList,
    ));

    let outcome = tokio::select! {
        biased;
        _ = shutdown.changed() => None,
        res = &mut listener => Some(res),
    };

    // DRAINING: stop both tasks and join them before the socket goes away.
    let _ = stop_tx.send(true);
    let end = match outcome {
        None => {
            let _ = listener.await;
            SessionEnd::Shutdown
        }
        Some(Ok(Ok(()))) => SessionEnd::Shutdown,
        Some(Ok(Err(e))) => SessionEnd::Fatal(e),
        Some(Err(join_err)) => {
            SessionEnd::Fatal(LinkError::Protocol(format!("listener panicked: {join_err}")))
        }
    };
    let _ = publisher.await;
    Ok(end)
}

/// Populate the mirror with the status snapshot and the additional data
/// fields.  Failures here are logged, not fatal: the subscription still
/// delivers the state as it changes.
async fn initialize_fields(link: &mut Link, mirror: &Mirror) {
    match link.read_status().await {
        Ok(fields) => mirror.merge_wire(&fields),
        Err(e) => warn!(error = %e, "initial status read failed"),
    }
    match link.read(&EXTRA_FIELDS).await {
        Ok(fields) => mirror.merge_wire(&fields),
        Err(e) => warn!(error = %e, "initial data read failed"),
    }
}

/// The machine's known field shape, so every snapshot is fully populated
/// even before the first status read answers.
pub fn initial_fields() -> FieldValues {
    let mut fields = FieldValues::new();
    fields.insert("cut-recipe".to_owned(), serde_json::json!(""));
    fields.insert("generic-status".to_owned(), serde_json::json!(""));
    fields.insert("glass-id".to_owned(), serde_json::json!(""));
    fields.insert("glass-type".to_owned(), serde_json::json!(""));
    fields.insert("h-glass".to_owned(), serde_json::json!(0.0));
    fields.insert("machine".to_owned(), serde_json::json!(""));
    fields.insert("prj-name".to_owned(), serde_json::json!(""));
    fields.insert("scheme".to_owned(), serde_json::json!(0));
    fields.insert("schemes-count".to_owned(), serde_json::json!(0));
    fields.insert("step-data".to_owned(), serde_json::json!({}));
    fields.insert("user-buttons".to_owned(), serde_json::json!(""));
    fields.insert("work-selectors".to_owned(), serde_json::json!(""));
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_fields_cover_the_advertised_shape() {
        let fields = initial_fields();
        for key in [
            "generic-status",
            "cut-recipe",
            "glass-id",
            "glass-type",
            "h-glass",
            "machine",
            "prj-name",
            "scheme",
            "schemes-count",
            "step-data",
            "user-buttons",
            "work-selectors",
        ] {
            assert!(fields.contains_key(key), "missing {key}");
        }
        assert_eq!(fields["scheme"], serde_json::json!(0));
        assert_eq!(fields["step-data"], serde_json::json!({}));
    }
}
