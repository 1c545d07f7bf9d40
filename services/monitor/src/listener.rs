//! Notification listener: the sole socket reader once the status
//! subscription is active.
//!
//! Merges `news` deltas and `event` pushes into the mirror.  A receive
//! timeout triggers a liveness probe (`$status` read) whose result is merged
//! like any other snapshot; a probe failure escalates to reconnect by
//! returning the error.

use crate::link::{Link, LinkError, Received};
use mb_core::Mirror;
use mb_protocol::{FieldMap, Message, Value};
use serde_json::Value as Json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Run until the stop flag is set (`Ok`) or the link fails (`Err`).
pub async fn run_listener(
    mut link: Link,
    mirror: Arc<Mirror>,
    mut stop: watch::Receiver<bool>,
    window: Duration,
) -> Result<(), LinkError> {
    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => {
                if *stop.borrow() {
                    return Ok(());
                }
            }
            received = link.receive_all(window) => match received? {
                Received::Timeout => {
                    debug!("receive window elapsed, probing machine status");
                    let status = link.read_status().await?;
                    mirror.merge_wire(&status);
                }
                Received::Messages(msgs) => {
                    for msg in msgs {
                        apply_push(&mirror, &msg);
                    }
                }
            }
        }
    }
}

/// Merge one server push into the mirror.
pub fn apply_push(mirror: &Mirror, msg: &Message) {
    match msg.verb() {
        Some("news") => {
            debug!(fields = msg.body.len(), "news");
            mirror.merge_wire(&msg.body);
        }
        Some("event") => {
            if let Some(name) = msg.body.get("event").and_then(Value::as_str) {
                debug!(event = name, "event");
                mirror.record_event(name);
            }
            // The server variants disagree on the event payload shape:
            // either flat fields beside `event`, or an `args` sub-map.
            let mut rest = FieldMap::new();
            for (key, value) in &msg.body {
                if key == "event" {
                    continue;
                }
                if key == "args" {
                    if let Value::Object(obj) = value {
                        mirror.merge(obj.iter().map(|(outer, inner)| {
                            let sub: Json = Json::Object(
                                inner
                                    .iter()
                                    .map(|(k, s)| (k.clone(), s.to_json()))
                                    .collect(),
                            );
                            (outer.clone(), sub)
                        }));
                    }
                    continue;
                }
                rest.insert(key.clone(), value.clone());
            }
            mirror.merge_wire(&rest);
        }
        other => {
            warn!(verb = ?other, "unhandled server message");
        }
    }
}
