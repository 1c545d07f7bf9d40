//! Field-specific normalization applied at mirror ingress and envelope
//! egress.
//!
//! Two machine fields arrive as strings but carry structure: `emg-list` is a
//! comma-separated list of alarm codes, and `step-data` is an embedded-object
//! literal.  Both ingest paths and the wire path share these rules.

use mb_protocol::parse_embedded;
use serde_json::Value as Json;

/// Parse a comma-separated string of integers.  Returns `None` when any
/// element fails to parse; the caller keeps the original string.
pub fn csv_to_int_array(csv: &str) -> Option<Vec<i64>> {
    csv.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| t.parse::<i64>().ok())
        .collect()
}

/// Apply per-key normalization to a field value.
pub fn normalize_field(key: &str, value: Json) -> Json {
    match (key, &value) {
        ("emg-list", Json::String(s)) => match csv_to_int_array(s) {
            Some(codes) => serde_json::json!(codes),
            None => value,
        },
        // A quoted wire literal decodes to a list of digit strings.
        ("emg-list", Json::Array(items)) => {
            let codes: Option<Vec<i64>> = items
                .iter()
                .map(|i| i.as_str().and_then(|s| s.trim().parse::<i64>().ok()))
                .collect();
            match codes {
                Some(codes) => serde_json::json!(codes),
                None => value,
            }
        }
        ("step-data", Json::String(s)) if s.contains('{') && s.contains('}') => {
            let obj = parse_embedded(s);
            let mut outer = serde_json::Map::new();
            for (k, inner) in &obj {
                let mut sub = serde_json::Map::new();
                for (ik, scalar) in inner {
                    sub.insert(ik.clone(), scalar.to_json());
                }
                outer.insert(k.clone(), Json::Object(sub));
            }
            Json::Object(outer)
        }
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emg_list_string_becomes_int_array() {
        assert_eq!(
            normalize_field("emg-list", serde_json::json!("123,30800012")),
            serde_json::json!([123, 30_800_012])
        );
    }

    #[test]
    fn emg_list_with_bad_element_stays_a_string() {
        assert_eq!(
            normalize_field("emg-list", serde_json::json!("123,abc")),
            serde_json::json!("123,abc")
        );
    }

    #[test]
    fn emg_list_digit_string_array_becomes_int_array() {
        assert_eq!(
            normalize_field("emg-list", serde_json::json!(["123", "30800012"])),
            serde_json::json!([123, 30_800_012])
        );
        // A proper int array passes through untouched.
        assert_eq!(
            normalize_field("emg-list", serde_json::json!([123, 456])),
            serde_json::json!([123, 456])
        );
    }

    #[test]
    fn step_data_string_is_parsed() {
        assert_eq!(
            normalize_field("step-data", serde_json::json!("status:{stack:0, proc:1}")),
            serde_json::json!({"status": {"stack": 0, "proc": 1}})
        );
    }

    #[test]
    fn other_fields_pass_through() {
        assert_eq!(
            normalize_field("scheme", serde_json::json!(3)),
            serde_json::json!(3)
        );
        assert_eq!(
            normalize_field("step-data", serde_json::json!({"already": {}})),
            serde_json::json!({"already": {}})
        );
    }
}
