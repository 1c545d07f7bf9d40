//! Messages: a header dictionary plus an optional body dictionary.
//!
//! Reserved header keys: `id` (sender-assigned, monotonic per connection),
//! `rep-to` (id of the request being answered), `msg` (verb), `ret`
//! (truthy ⇒ error; its value or the `msg` field carries the description).

use crate::ProtocolError;
use crate::frame::{FRAME_BODY, FRAME_END, FRAME_START};
use crate::value::Value;
use indexmap::IndexMap;

/// An insertion-ordered field dictionary.
pub type FieldMap = IndexMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub header: FieldMap,
    pub body: FieldMap,
}

impl Message {
    pub fn new() -> Message {
        Message::default()
    }

    /// Build a message from `(key, value)` pairs.
    pub fn with_header<I>(fields: I) -> Message
    where
        I: IntoIterator<Item = (&'static str, Value)>,
    {
        Message {
            header: fields
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v))
                .collect(),
            body: FieldMap::new(),
        }
    }

    pub fn with_body(mut self, body: FieldMap) -> Message {
        self.body = body;
        self
    }

    pub fn id(&self) -> Option<i64> {
        self.header.get("id").and_then(Value::as_int)
    }

    pub fn rep_to(&self) -> Option<i64> {
        self.header.get("rep-to").and_then(Value::as_int)
    }

    /// The message verb (`connect`, `news`, `event`, `notify`, `ping`, …).
    pub fn verb(&self) -> Option<&str> {
        self.header.get("msg").and_then(Value::as_str)
    }

    pub fn is_reply(&self) -> bool {
        self.header.contains_key("rep-to")
    }

    /// A truthy `ret` header marks the message as an error reply.
    pub fn is_error(&self) -> bool {
        self.header.get("ret").is_some_and(Value::is_truthy)
    }

    /// Human-readable description of an error reply: the `ret` value when it
    /// is a string, otherwise the `msg` field.
    pub fn error_text(&self) -> String {
        if let Some(Value::Str(s)) = self.header.get("ret") {
            if !s.is_empty() {
                return s.clone();
            }
        }
        self.verb().unwrap_or("unspecified remote error").to_owned()
    }

    /// Encode as one wire frame: `0x01 header [0x02 body] 0x03`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.push(FRAME_START);
        out.extend_from_slice(encode_fields(&self.header).as_bytes());
        if !self.body.is_empty() {
            out.push(FRAME_BODY);
            out.extend_from_slice(encode_fields(&self.body).as_bytes());
        }
        out.push(FRAME_END);
        out
    }

    /// Decode the contents of one frame (the bytes between `0x01` and
    /// `0x03`, with the optional `0x02` header/body separator).
    pub fn from_frame(frame: &[u8]) -> Result<Message, ProtocolError> {
        match frame.iter().position(|&b| b == FRAME_BODY) {
            Some(split) => Ok(Message {
                header: decode_fields(&frame[..split])?,
                body: decode_fields(&frame[split + 1..])?,
            }),
            None => Ok(Message {
                header: decode_fields(frame)?,
                body: FieldMap::new(),
            }),
        }
    }
}

fn encode_fields(fields: &FieldMap) -> String {
    let mut parts = Vec::with_capacity(fields.len());
    for (key, value) in fields {
        match value.encode(key) {
            Some(literal) => parts.push(format!("{key}={literal}")),
            None => parts.push(key.clone()),
        }
    }
    parts.join(";")
}

fn decode_fields(payload: &[u8]) -> Result<FieldMap, ProtocolError> {
    let text = std::str::from_utf8(payload)?;
    let mut out = FieldMap::new();
    for field in split_fields(text) {
        match field.split_once('=') {
            Some((key, literal)) => {
                out.insert(key.to_owned(), Value::parse(literal));
            }
            None => {
                out.insert(field.to_owned(), Value::Null);
            }
        }
    }
    Ok(out)
}

/// Split on `;`, but not inside a double-quoted literal.
fn split_fields(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in text.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::parse_payload;

    fn round_trip(msg: &Message) -> Message {
        let wire = msg.encode();
        let mut parsed = parse_payload(&wire).expect("decode");
        assert_eq!(parsed.len(), 1, "expected exactly one message");
        parsed.remove(0)
    }

    #[test]
    fn header_only_round_trip() {
        let msg = Message::with_header([("id", Value::Int(3)), ("msg", Value::Str("ping".to_owned()))]);
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn header_and_body_round_trip() {
        let mut body = FieldMap::new();
        body.insert("sender".to_owned(), Value::Str("client".to_owned()));
        body.insert("auth-lvl".to_owned(), Value::Int(0));
        body.insert("auth-key".to_owned(), Value::Int(0x55));
        let msg = Message::with_header([
            ("id", Value::Int(1)),
            ("rep-to", Value::Int(7)),
            ("msg", Value::Str("connect".to_owned())),
        ])
        .with_body(body);
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn null_fields_encode_as_bare_keys() {
        let mut body = FieldMap::new();
        body.insert("$status".to_owned(), Value::Null);
        body.insert("prj-name".to_owned(), Value::Null);
        let msg = Message::with_header([("id", Value::Int(2))]).with_body(body);
        let wire = msg.encode();
        let text = String::from_utf8(wire[1..wire.len() - 1].to_vec()).unwrap();
        assert!(text.ends_with("$status;prj-name"));
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn quoted_string_round_trip_restores_value() {
        let mut body = FieldMap::new();
        body.insert("note".to_owned(), Value::Str("a b;c=d".to_owned()));
        let msg = Message::with_header([("id", Value::Int(9))]).with_body(body);
        // The separators inside the quoted literal must not split fields.
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn auth_key_on_the_wire_is_hex() {
        let mut body = FieldMap::new();
        body.insert("auth-key".to_owned(), Value::Int(0xAB));
        let msg = Message::with_header([("id", Value::Int(1))]).with_body(body);
        let wire = msg.encode();
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(text.contains("auth-key=0xAB"), "wire was: {text}");
    }

    #[test]
    fn error_reply_detection() {
        let ok = Message::with_header([("rep-to", Value::Int(1))]);
        assert!(!ok.is_error());
        let bare = Message::with_header([("ret", Value::Null)]);
        assert!(!bare.is_error());
        let err = Message::with_header([
            ("ret", Value::Int(1)),
            ("msg", Value::Str("denied".to_owned())),
        ]);
        assert!(err.is_error());
        assert_eq!(err.error_text(), "denied");
    }

    #[test]
    fn ret_string_carries_the_description() {
        let err = Message::with_header([("ret", Value::Str("bad machine".to_owned()))]);
        assert!(err.is_error());
        assert_eq!(err.error_text(), "bad machine");
    }

    #[test]
    fn list_values_round_trip() {
        let mut body = FieldMap::new();
        body.insert("emg-list".to_owned(), Value::IntList(vec![123, 30_800_012]));
        body.insert(
            "names".to_owned(),
            Value::StrList(vec!["aa".to_owned(), "bb".to_owned()]),
        );
        let msg = Message::with_header([("id", Value::Int(4))]).with_body(body);
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn object_values_round_trip() {
        let v = Value::parse("\"status:{stack:0 proc:1}, sheet:{size:3210x2400}\"");
        let mut body = FieldMap::new();
        body.insert("step-data".to_owned(), v);
        let msg = Message::with_header([("msg", Value::Str("news".to_owned()))]).with_body(body);
        assert_eq!(round_trip(&msg), msg);
    }
}
