//! The state mirror: an insertion-ordered field map shadowing the machine's
//! advertised fields, plus an ordered set of event names accumulated since
//! the last publish.
//!
//! Shared by a listener (writer) and a publisher (reader + clear); one
//! mutex, short critical sections, no nested locks.

use crate::envelope::{DeviceField, Envelope, EventStyle, FieldValues, now_utc_millis};
use crate::normalize::normalize_field;
use mb_protocol::FieldMap;
use serde_json::Value as Json;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct MirrorState {
    fields: FieldValues,
    events: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Mirror {
    inner: Mutex<MirrorState>,
}

impl Mirror {
    pub fn new() -> Mirror {
        Mirror::default()
    }

    /// A mirror pre-populated with the machine's known field set, so every
    /// snapshot carries the full shape even before the first status read.
    pub fn with_fields(initial: FieldValues) -> Mirror {
        Mirror {
            inner: Mutex::new(MirrorState {
                fields: initial,
                events: Vec::new(),
            }),
        }
    }

    /// Merge fields last-writer-wins, applying per-key normalization.
    pub fn merge<I>(&self, fields: I)
    where
        I: IntoIterator<Item = (String, Json)>,
    {
        let mut state = self.inner.lock().expect("mirror lock");
        for (key, value) in fields {
            let value = normalize_field(&key, value);
            state.fields.insert(key, value);
        }
    }

    /// Merge a wire-protocol field map (status read replies, news pushes).
    pub fn merge_wire(&self, fields: &FieldMap) {
        self.merge(fields.iter().map(|(k, v)| (k.clone(), v.to_json())));
    }

    /// Record an event name; duplicates within the current publish window
    /// are suppressed.  Returns whether the name was new.
    pub fn record_event(&self, name: &str) -> bool {
        let mut state = self.inner.lock().expect("mirror lock");
        if state.events.iter().any(|e| e == name) {
            return false;
        }
        state.events.push(name.to_owned());
        true
    }

    /// Number of events accumulated in the current window.
    pub fn pending_events(&self) -> usize {
        self.inner.lock().expect("mirror lock").events.len()
    }

    /// Build a snapshot envelope and clear the event window, atomically.
    ///
    /// The clear happens here rather than after a successful publish: a
    /// failed publish costs one window's events, never duplicates them.
    pub fn snapshot(&self, style: EventStyle) -> Envelope {
        let mut state = self.inner.lock().expect("mirror lock");
        let events = std::mem::take(&mut state.events);

        let mut device_data = Vec::with_capacity(state.fields.len() + 1);
        if style == EventStyle::DeviceList {
            device_data.push(DeviceField {
                id: "event".to_owned(),
                val: Json::Array(events.iter().map(|e| Json::String(e.clone())).collect()),
            });
        }
        for (key, val) in &state.fields {
            device_data.push(DeviceField {
                id: key.clone(),
                val: val.clone(),
            });
        }

        Envelope {
            timestamp: now_utc_millis(),
            event: match style {
                EventStyle::JoinedField => Some(events.join(", ")),
                EventStyle::DeviceList => None,
            },
            device_data,
        }
    }

    /// Current value of one field (test and probe support).
    pub fn get(&self, key: &str) -> Option<Json> {
        self.inner.lock().expect("mirror lock").fields.get(key).cloned()
    }
}
