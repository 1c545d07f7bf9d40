//! The downstream envelope: `{timestamp, deviceData:[{Id,val},…]}`.
//!
//! `deviceData` preserves the insertion order of the source map.  Timestamps
//! are RFC3339 UTC with millisecond precision and a trailing `Z`.

use crate::normalize::normalize_field;
use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// How the accumulated event names appear in the envelope.  The two bus
/// consumers grew different expectations, so both shapes are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStyle {
    /// `deviceData` leads with `{Id:"event", val:[…]}` (monitor consumer).
    DeviceList,
    /// Top-level `event` field joined by `", "` (collector consumer).
    JoinedField,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceField {
    #[serde(rename = "Id")]
    pub id: String,
    pub val: Json,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(rename = "deviceData")]
    pub device_data: Vec<DeviceField>,
}

/// One ingest record: a line-delimited JSON object from a machine-side
/// event source.
#[derive(Debug, Clone, Deserialize)]
pub struct EventRecord {
    pub timestamp: Option<String>,
    pub event: Option<String>,
    #[serde(default)]
    pub args: serde_json::Map<String, Json>,
}

impl Envelope {
    /// Build an envelope from an ordered field map, stamped with the
    /// current wall clock.
    pub fn from_fields<'a, I>(fields: I) -> Envelope
    where
        I: IntoIterator<Item = (&'a String, &'a Json)>,
    {
        Envelope {
            timestamp: now_utc_millis(),
            event: None,
            device_data: fields
                .into_iter()
                .map(|(key, val)| DeviceField {
                    id: key.clone(),
                    val: val.clone(),
                })
                .collect(),
        }
    }

    /// Normalize one ingest record: the source timestamp converted to UTC,
    /// the event name first in `deviceData`, then the normalized args.
    pub fn from_event_record(record: &EventRecord) -> Envelope {
        let timestamp = record
            .timestamp
            .as_deref()
            .map(to_utc_millis)
            .unwrap_or_default();
        let mut device_data = Vec::with_capacity(record.args.len() + 1);
        if let Some(event) = &record.event {
            device_data.push(DeviceField {
                id: "event".to_owned(),
                val: Json::String(event.clone()),
            });
        }
        for (key, val) in &record.args {
            device_data.push(DeviceField {
                id: key.clone(),
                val: normalize_field(key, val.clone()),
            });
        }
        Envelope {
            timestamp,
            event: None,
            device_data,
        }
    }

    /// Serialize as compact JSON (no whitespace).
    pub fn to_compact_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("envelope serialization cannot fail")
    }
}

/// The current wall clock as RFC3339 UTC with millisecond precision,
/// e.g. `2025-06-05T06:46:11.000Z`.
pub fn now_utc_millis() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Convert an RFC3339 timestamp with any offset to UTC milliseconds.
/// An unparseable timestamp is passed through untouched.
fn to_utc_millis(raw: &str) -> String {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => ts
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::Millis, true),
        Err(e) => {
            tracing::warn!(timestamp = raw, error = %e, "unparseable source timestamp");
            raw.to_owned()
        }
    }
}

/// Convenience for building the field maps the mirror and envelope share.
pub type FieldValues = IndexMap<String, Json>;
