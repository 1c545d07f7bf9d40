//! Dynamically typed field values.
//!
//! The protocol carries no type tags; the receiver infers the type from the
//! literal.  Decoding order: quoted string (which may hold an embedded
//! object or a string list), comma-separated list, `0x` hex integer,
//! integer, float, plain string.

use indexmap::IndexMap;

/// An embedded object: `outerKey → { innerKey → scalar }`.
pub type EmbeddedObject = IndexMap<String, IndexMap<String, Scalar>>;

/// A field value as carried on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A bare key with no `=`.
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    IntList(Vec<i64>),
    StrList(Vec<String>),
    /// The brace-delimited mini-format used inside string-valued fields
    /// such as `step-data`.
    Object(EmbeddedObject),
}

/// A scalar inside an embedded-object body.  A bare token (no `:`)
/// decodes as `Flag`, which serializes to JSON `true`.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Str(String),
    Flag,
}

impl Value {
    /// Decode a field literal into a typed value.
    pub fn parse(literal: &str) -> Value {
        let s = literal.trim();
        if s.starts_with('"') && s.ends_with('"') {
            // A string; no numeric conversion attempted.
            let inner = s.trim_matches('"');
            if inner.contains('{') && inner.contains('}') {
                return Value::Object(parse_embedded(inner));
            }
            if inner.contains(',') {
                return Value::StrList(split_csv(inner));
            }
            return Value::Str(inner.to_owned());
        }
        if s.contains(',') {
            let items = split_csv(s);
            let ints: Result<Vec<i64>, _> = items.iter().map(|i| i.parse::<i64>()).collect();
            return match ints {
                Ok(ints) => Value::IntList(ints),
                Err(_) => Value::StrList(items),
            };
        }
        if let Some(hex) = s.strip_prefix("0x") {
            return match i64::from_str_radix(hex, 16) {
                Ok(n) => Value::Int(n),
                Err(_) => Value::Str(s.to_owned()),
            };
        }
        if let Ok(n) = s.parse::<i64>() {
            return Value::Int(n);
        }
        if let Ok(f) = s.parse::<f64>() {
            return Value::Float(f);
        }
        Value::Str(s.to_owned())
    }

    /// Encode the value as a field literal.  `key` participates because two
    /// fields have key-specific encodings: `message` is always quoted and
    /// `auth-key` integers are rendered as `0x` uppercase hex.
    ///
    /// Returns `None` for `Null`, which encodes as the bare key.
    pub fn encode(&self, key: &str) -> Option<String> {
        let literal = match self {
            Value::Null => return None,
            Value::Str(s) => {
                if needs_quoting(s) || key == "message" {
                    format!("\"{s}\"")
                } else {
                    s.clone()
                }
            }
            Value::Int(n) => {
                if key == "auth-key" {
                    format!("0x{n:X}")
                } else {
                    n.to_string()
                }
            }
            Value::Float(f) => render_float(*f),
            Value::IntList(v) => v
                .iter()
                .map(i64::to_string)
                .collect::<Vec<_>>()
                .join(","),
            Value::StrList(v) => {
                let joined = v.join(",");
                if needs_quoting(&joined) {
                    format!("\"{joined}\"")
                } else {
                    joined
                }
            }
            Value::Object(obj) => format!("\"{}\"", render_embedded(obj)),
        };
        if key == "message" && !literal.starts_with('"') {
            return Some(format!("\"{literal}\""));
        }
        Some(literal)
    }

    /// Truthiness in the protocol's sense: the `ret` header field marks an
    /// error whenever its value is "truthy" (non-zero, non-empty).
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::IntList(v) => !v.is_empty(),
            Value::StrList(v) => !v.is_empty(),
            Value::Object(o) => !o.is_empty(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Convert to a JSON value for the downstream envelope.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::{Number, Value as Json, json};
        match self {
            Value::Null => Json::Null,
            Value::Int(n) => json!(n),
            Value::Float(f) => Number::from_f64(*f).map_or(Json::Null, Json::Number),
            Value::Str(s) => json!(s),
            Value::IntList(v) => json!(v),
            Value::StrList(v) => json!(v),
            Value::Object(obj) => {
                let mut outer = serde_json::Map::new();
                for (key, inner) in obj {
                    let mut sub = serde_json::Map::new();
                    for (k, scalar) in inner {
                        sub.insert(k.clone(), scalar.to_json());
                    }
                    outer.insert(key.clone(), Json::Object(sub));
                }
                Json::Object(outer)
            }
        }
    }
}

impl Scalar {
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::{Number, Value as Json, json};
        match self {
            Scalar::Int(n) => json!(n),
            Scalar::Float(f) => Number::from_f64(*f).map_or(Json::Null, Json::Number),
            Scalar::Str(s) => json!(s),
            Scalar::Flag => json!(true),
        }
    }
}

/// Parse the embedded-object mini-grammar: repeated `key:{ body }` clauses,
/// where a body is a `[,\s]+`-separated token list and each token is either
/// `sub:val` (int, then float, then string) or a bare flag.  Text outside
/// the clauses and unmatched braces are ignored.
pub fn parse_embedded(s: &str) -> EmbeddedObject {
    let mut out = EmbeddedObject::new();
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if !is_word_char(chars[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < chars.len() && is_word_char(chars[i]) {
            i += 1;
        }
        let key: String = chars[start..i].iter().collect();

        let mut j = i;
        while j < chars.len() && chars[j].is_whitespace() {
            j += 1;
        }
        if j >= chars.len() || chars[j] != ':' {
            continue;
        }
        j += 1;
        while j < chars.len() && chars[j].is_whitespace() {
            j += 1;
        }
        if j >= chars.len() || chars[j] != '{' {
            continue;
        }
        j += 1;
        let body_start = j;
        while j < chars.len() && chars[j] != '}' {
            j += 1;
        }
        if j >= chars.len() {
            // Unmatched open brace; nothing more to find.
            break;
        }
        let body: String = chars[body_start..j].iter().collect();
        if !body.trim().is_empty() {
            out.insert(key, parse_object_body(&body));
        }
        i = j + 1;
    }
    out
}

fn parse_object_body(body: &str) -> IndexMap<String, Scalar> {
    let mut sub = IndexMap::new();
    for token in body
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
    {
        match token.split_once(':') {
            Some((k, v)) => {
                let scalar = if let Ok(n) = v.parse::<i64>() {
                    Scalar::Int(n)
                } else if let Ok(f) = v.parse::<f64>() {
                    Scalar::Float(f)
                } else {
                    Scalar::Str(v.to_owned())
                };
                sub.insert(k.to_owned(), scalar);
            }
            None => {
                sub.insert(token.to_owned(), Scalar::Flag);
            }
        }
    }
    sub
}

fn render_embedded(obj: &EmbeddedObject) -> String {
    let mut clauses = Vec::with_capacity(obj.len());
    for (key, inner) in obj {
        if inner.is_empty() {
            continue;
        }
        let tokens: Vec<String> = inner
            .iter()
            .map(|(k, s)| match s {
                Scalar::Int(n) => format!("{k}:{n}"),
                Scalar::Float(f) => format!("{k}:{}", render_float(*f)),
                Scalar::Str(v) => format!("{k}:{v}"),
                Scalar::Flag => k.clone(),
            })
            .collect();
        clauses.push(format!("{key}:{{{}}}", tokens.join(" ")));
    }
    clauses.join(", ")
}

/// A whole float renders with one decimal so it decodes back as a float.
fn render_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 {
        format!("{f:.1}")
    } else {
        f.to_string()
    }
}

fn needs_quoting(s: &str) -> bool {
    s.chars()
        .any(|c| c.is_whitespace() || c == ',' || c == ';' || c == '=')
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn split_csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect()
}
