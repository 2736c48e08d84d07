//! The encoder: converts a value graph into a transmissible payload
//!
//! One depth-first pass. Every container keeps a per-type-tag record of
//! already-seen identities together with the path at which each was first
//! encountered; a re-encounter emits a back-reference string instead of
//! re-encoding the subtree, which is what makes shared references and cycles
//! survive the trip.

use std::collections::HashMap;

use bytes::Bytes;
use serde_json::{json, Value as JsonValue};

use crate::error::CodecError;
use crate::value::{StreamHandle, Value};

/// The reserved marker character that introduces a back-reference path
pub const MARKER: char = '~';

/// The escape for a literal marker inside string values and path keys
const SAFE: &str = "\\x7e";
const SAFE_ESCAPED: &str = "\\\\x7e";

/// A dried argument list: the text plus ordered side-lists of raw payloads.
///
/// Buffers and streams are preserved by reference via their side-list index;
/// the text only carries tagged indices.
#[derive(Debug, Default)]
pub struct DriedPayload {
    pub text: String,
    pub buffers: Vec<Bytes>,
    pub streams: Vec<StreamHandle>,
}

/// Escape a string so a literal marker can never be read as a back-reference
pub(crate) fn escape_text(text: &str) -> String {
    if !text.contains(MARKER) && !text.contains(SAFE) {
        return text.to_string();
    }
    text.replace(SAFE, SAFE_ESCAPED).replace(MARKER, SAFE)
}

/// Inverse of [`escape_text`]
pub(crate) fn unescape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix(SAFE_ESCAPED) {
            out.push_str(SAFE);
            rest = stripped;
        } else if let Some(stripped) = rest.strip_prefix(SAFE) {
            out.push(MARKER);
            rest = stripped;
        } else {
            let ch = rest.chars().next().unwrap_or_default();
            out.push(ch);
            rest = &rest[ch.len_utf8()..];
        }
    }
    out
}

/// Dry a single root value
pub fn dry_value(root: &Value) -> Result<DriedPayload, CodecError> {
    let mut encoder = Encoder::default();
    let tree = encoder.encode(root, &mut Vec::new());
    Ok(DriedPayload {
        text: serde_json::to_string(&tree)?,
        buffers: encoder.buffers,
        streams: encoder.streams,
    })
}

/// Dry an argument list; the root of the payload is the list itself
pub fn dry(values: &[Value]) -> Result<DriedPayload, CodecError> {
    dry_value(&Value::array(values.to_vec()))
}

#[derive(Default)]
struct Encoder {
    // (type tag, identity) -> ready-made back-reference string
    seen: HashMap<(String, (usize, usize)), String>,
    buffers: Vec<Bytes>,
    streams: Vec<StreamHandle>,
}

impl Encoder {
    fn encode(&mut self, value: &Value, path: &mut Vec<String>) -> JsonValue {
        if let Some((tag, ptr)) = value.identity() {
            let key = (tag.to_string(), ptr);
            if let Some(backref) = self.seen.get(&key) {
                return JsonValue::String(backref.clone());
            }
            self.seen
                .insert(key, format!("{}{}", MARKER, path.join(&MARKER.to_string())));
        }

        match value {
            Value::Null => JsonValue::Null,
            Value::Bool(v) => JsonValue::Bool(*v),
            Value::Int(v) => json!(v),
            Value::Float(v) => {
                if v.is_finite() {
                    json!(v)
                } else if v.is_nan() {
                    // The minimal writer emits null for untagged non-finites
                    JsonValue::Null
                } else if *v > 0.0 {
                    json!({"dry": "+Infinity"})
                } else {
                    json!({"dry": "-Infinity"})
                }
            }
            Value::Text(v) => JsonValue::String(escape_text(v)),
            Value::Date(v) => JsonValue::String(
                v.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            ),
            Value::Regex(v) => json!({"dry": "regexp", "value": v.literal()}),
            Value::Buffer(v) => {
                let index = self.buffers.len();
                self.buffers.push(v.clone());
                json!({"dry": "buffer", "index": index})
            }
            Value::Stream(v) => {
                let index = self.streams.len();
                self.streams.push(v.clone());
                json!({"dry": "stream", "index": index})
            }
            Value::Array(items) => {
                let items = items.borrow();
                let mut out = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    path.push(escape_text(&index.to_string()));
                    out.push(self.encode(item, path));
                    path.pop();
                }
                JsonValue::Array(out)
            }
            Value::Object(map) => {
                let map = map.borrow();
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, item) in map.iter() {
                    path.push(escape_text(key));
                    out.insert(key.clone(), self.encode(item, path));
                    path.pop();
                }
                JsonValue::Object(out)
            }
            Value::Custom(custom) => {
                let drypath: Vec<String> = path.clone();
                let carried = custom.to_dry();
                path.push("value".to_string());
                let carried = self.encode(&carried, path);
                path.pop();
                json!({
                    "dry": "toDry",
                    "path": custom.dry_name(),
                    "drypath": drypath,
                    "value": carried,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_round_trip() {
        for s in ["plain", "a~b", "\\x7e", "~\\x7e~", "end~", "\\\\x7e"] {
            let escaped = escape_text(s);
            assert!(!escaped.contains(MARKER), "{:?} still has marker", escaped);
            assert_eq!(unescape_text(&escaped), s);
        }
    }

    #[test]
    fn scalars_dry_to_plain_json() {
        let payload = dry(&[Value::Int(5), Value::from("hi"), Value::Null]).unwrap();
        assert_eq!(payload.text, r#"[5,"hi",null]"#);
        assert!(payload.buffers.is_empty());
        assert!(payload.streams.is_empty());
    }

    #[test]
    fn shared_object_emits_backref() {
        let shared = Value::object();
        shared.set("n", Value::Int(1));
        let root = Value::object();
        root.set("a", shared.clone());
        root.set("b", shared);

        let payload = dry(&[root]).unwrap();
        // First sight at 0.a, second sight backrefs it
        assert!(payload.text.contains(r#""b":"~0~a""#), "{}", payload.text);
    }

    #[test]
    fn cycle_emits_backref_to_self() {
        let root = Value::object();
        root.set("me", root.clone());
        let payload = dry(&[root]).unwrap();
        assert!(payload.text.contains(r#""me":"~0""#), "{}", payload.text);
    }

    #[test]
    fn buffers_and_streams_go_to_side_lists() {
        let buffer = Value::Buffer(Bytes::from_static(b"abc"));
        let stream = Value::Stream(StreamHandle::from_bytes(Bytes::from_static(b"xyz")));
        let payload = dry(&[buffer, stream]).unwrap();
        assert_eq!(payload.buffers.len(), 1);
        assert_eq!(payload.streams.len(), 1);
        assert!(payload.text.contains(r#""dry":"buffer""#));
        assert!(payload.text.contains(r#""dry":"stream""#));
    }

    #[test]
    fn infinities_are_tagged_and_nan_is_null() {
        let payload = dry(&[
            Value::Float(f64::INFINITY),
            Value::Float(f64::NEG_INFINITY),
            Value::Float(f64::NAN),
        ])
        .unwrap();
        assert!(payload.text.contains(r#""dry":"+Infinity""#));
        assert!(payload.text.contains(r#""dry":"-Infinity""#));
        assert!(payload.text.ends_with("null]"));
    }
}
