//! The decoder: reverses [`dry`](crate::dry::dry)
//!
//! Two passes. The first parses the text into the result tree, leaving
//! placeholders where back-references occurred (the referenced object may not
//! exist yet) and stashing custom-type reconstructions by their declared
//! paths without inserting them. The second resolves every placeholder
//! against the in-progress tree and patches the custom-type results in.

use std::collections::HashMap;

use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;

use crate::dry::{unescape_text, DriedPayload, MARKER};
use crate::error::CodecError;
use crate::registry::DryRegistry;
use crate::value::{ArrayRef, ObjectRef, RegexValue, StreamHandle, Value};

static ISO_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d*)?Z$").unwrap()
});

/// Undry a payload back into its root value
pub fn undry_value(
    text: &str,
    buffers: &[Bytes],
    streams: &[StreamHandle],
    registry: &DryRegistry,
) -> Result<Value, CodecError> {
    let raw: JsonValue = serde_json::from_str(text)?;
    let mut decoder = Decoder {
        buffers,
        streams,
        fixups: Vec::new(),
        sites: Vec::new(),
    };

    let root = match decoder.convert(&raw, &mut Vec::new())? {
        Converted::Value(value) => value,
        // The root cannot reference itself by path before it exists
        Converted::Backref(path) => return Err(CodecError::BadBackref { path }),
    };

    // Run the reconstruction hooks; unknown names degrade to the carried
    // value unchanged rather than failing the decode.
    let mut undried: HashMap<String, Value> = HashMap::new();
    for site in &decoder.sites {
        let carried = site.wrapper.get("value").unwrap_or(Value::Null);
        let value = match registry.hook(&site.name) {
            Some(hook) => hook(carried),
            None => {
                tracing::debug!(name = %site.name, "no undry hook registered, keeping raw value");
                carried
            }
        };
        undried.insert(site.path.clone(), value);
    }

    // Resolve placeholders against the in-progress tree
    let mut memo: HashMap<String, Value> = HashMap::new();
    for fixup in &decoder.fixups {
        let value = if let Some(value) = undried.get(&fixup.path) {
            value.clone()
        } else if let Some(value) = memo.get(&fixup.path) {
            value.clone()
        } else {
            let value = walk_path(&root, &fixup.path)?;
            memo.insert(fixup.path.clone(), value.clone());
            value
        };
        match &fixup.site {
            Site::ArrayItem(items, index) => items.borrow_mut()[*index] = value,
            Site::ObjectEntry(map, key) => {
                map.borrow_mut().insert(key.clone(), value);
            }
        }
    }

    // Patch custom-type results in, deepest declared path first so nested
    // reconstructions land inside the wrappers of enclosing ones
    for site in decoder.sites.iter().rev() {
        if site.drypath.is_empty() {
            continue;
        }
        if let Some(value) = undried.get(&site.path) {
            set_path(&root, &site.drypath, value.clone());
        }
    }

    // A custom-typed root is returned directly rather than the envelope
    for site in &decoder.sites {
        if site.drypath.is_empty() {
            if let Some(value) = undried.remove(&site.path) {
                return Ok(value);
            }
        }
    }

    Ok(root)
}

/// Undry a payload whose root is an argument list
pub fn undry_args(
    payload: &DriedPayload,
    registry: &DryRegistry,
) -> Result<Vec<Value>, CodecError> {
    undry_list(&payload.text, &payload.buffers, &payload.streams, registry)
}

/// Undry text plus side lists whose root is an argument list
pub fn undry_list(
    text: &str,
    buffers: &[Bytes],
    streams: &[StreamHandle],
    registry: &DryRegistry,
) -> Result<Vec<Value>, CodecError> {
    match undry_value(text, buffers, streams, registry)? {
        Value::Array(items) => Ok(items.borrow().clone()),
        other => Ok(vec![other]),
    }
}

enum Converted {
    Value(Value),
    /// A back-reference, path without the leading marker
    Backref(String),
}

enum Site {
    ArrayItem(ArrayRef, usize),
    ObjectEntry(ObjectRef, String),
}

struct Fixup {
    site: Site,
    path: String,
}

struct UndrySite {
    /// Joined first-seen path, as back-references spell it
    path: String,
    /// Declared patch location, escaped segments
    drypath: Vec<String>,
    /// Registered type name
    name: String,
    /// Wrapper object still holding the carried value
    wrapper: Value,
}

struct Decoder<'a> {
    buffers: &'a [Bytes],
    streams: &'a [StreamHandle],
    fixups: Vec<Fixup>,
    sites: Vec<UndrySite>,
}

impl Decoder<'_> {
    fn convert(
        &mut self,
        raw: &JsonValue,
        path: &mut Vec<String>,
    ) -> Result<Converted, CodecError> {
        let value = match raw {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(v) => Value::Bool(*v),
            JsonValue::Number(n) => {
                if let Some(v) = n.as_i64() {
                    Value::Int(v)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            JsonValue::String(s) => {
                if let Some(stripped) = s.strip_prefix(MARKER) {
                    return Ok(Converted::Backref(stripped.to_string()));
                }
                if ISO_DATE.is_match(s) {
                    if let Ok(date) = chrono::DateTime::parse_from_rfc3339(s) {
                        return Ok(Converted::Value(Value::Date(
                            date.with_timezone(&chrono::Utc),
                        )));
                    }
                }
                Value::Text(unescape_text(s))
            }
            JsonValue::Array(items) => {
                let array = Value::array(Vec::with_capacity(items.len()));
                let Value::Array(slots) = &array else { unreachable!() };
                for (index, item) in items.iter().enumerate() {
                    path.push(item_key(index));
                    let converted = self.convert(item, path)?;
                    path.pop();
                    match converted {
                        Converted::Value(value) => slots.borrow_mut().push(value),
                        Converted::Backref(target) => {
                            slots.borrow_mut().push(Value::Null);
                            self.fixups.push(Fixup {
                                site: Site::ArrayItem(slots.clone(), index),
                                path: target,
                            });
                        }
                    }
                }
                array
            }
            JsonValue::Object(map) => return self.convert_object(map, path),
        };
        Ok(Converted::Value(value))
    }

    fn convert_object(
        &mut self,
        map: &serde_json::Map<String, JsonValue>,
        path: &mut Vec<String>,
    ) -> Result<Converted, CodecError> {
        match map.get("dry").and_then(JsonValue::as_str) {
            Some("+Infinity") => return Ok(Converted::Value(Value::Float(f64::INFINITY))),
            Some("-Infinity") => return Ok(Converted::Value(Value::Float(f64::NEG_INFINITY))),
            Some("regexp") => {
                let literal = map
                    .get("value")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| CodecError::MalformedTag("regexp without value".into()))?;
                let regex = RegexValue::from_literal(literal).ok_or_else(|| {
                    CodecError::MalformedTag(format!("bad regexp literal {:?}", literal))
                })?;
                return Ok(Converted::Value(Value::Regex(regex)));
            }
            Some("buffer") => {
                let index = tag_index(map)?;
                let buffer = self.buffers.get(index).ok_or(CodecError::MissingBuffer {
                    index,
                    len: self.buffers.len(),
                })?;
                return Ok(Converted::Value(Value::Buffer(buffer.clone())));
            }
            Some("stream") => {
                let index = tag_index(map)?;
                let stream = self.streams.get(index).ok_or(CodecError::MissingStream {
                    index,
                    len: self.streams.len(),
                })?;
                return Ok(Converted::Value(Value::Stream(stream.clone())));
            }
            Some("toDry") => {
                let name = map
                    .get("path")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| CodecError::MalformedTag("toDry without path".into()))?
                    .to_string();
                let drypath: Vec<String> = map
                    .get("drypath")
                    .and_then(JsonValue::as_array)
                    .map(|segments| {
                        segments
                            .iter()
                            .filter_map(JsonValue::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();

                // The wrapper stays in the tree until the patch pass so that
                // paths running through the carried value still resolve
                let wrapper = Value::object();
                let Value::Object(slots) = &wrapper else { unreachable!() };
                if let Some(carried) = map.get("value") {
                    path.push("value".to_string());
                    let converted = self.convert(carried, path)?;
                    path.pop();
                    match converted {
                        Converted::Value(value) => {
                            slots.borrow_mut().insert("value".to_string(), value);
                        }
                        Converted::Backref(target) => {
                            slots.borrow_mut().insert("value".to_string(), Value::Null);
                            self.fixups.push(Fixup {
                                site: Site::ObjectEntry(slots.clone(), "value".to_string()),
                                path: target,
                            });
                        }
                    }
                }
                self.sites.push(UndrySite {
                    path: path.join("~"),
                    drypath,
                    name,
                    wrapper: wrapper.clone(),
                });
                return Ok(Converted::Value(wrapper));
            }
            _ => {}
        }

        let object = Value::object();
        let Value::Object(slots) = &object else { unreachable!() };
        for (key, item) in map.iter() {
            path.push(crate::dry::escape_text(key));
            let converted = self.convert(item, path)?;
            path.pop();
            match converted {
                Converted::Value(value) => {
                    slots.borrow_mut().insert(key.clone(), value);
                }
                Converted::Backref(target) => {
                    slots.borrow_mut().insert(key.clone(), Value::Null);
                    self.fixups.push(Fixup {
                        site: Site::ObjectEntry(slots.clone(), key.clone()),
                        path: target,
                    });
                }
            }
        }
        Ok(Converted::Value(object))
    }
}

fn item_key(index: usize) -> String {
    index.to_string()
}

fn tag_index(map: &serde_json::Map<String, JsonValue>) -> Result<usize, CodecError> {
    map.get("index")
        .and_then(JsonValue::as_u64)
        .map(|n| n as usize)
        .ok_or_else(|| CodecError::MalformedTag("side-list tag without index".into()))
}

/// Walk a joined back-reference path against the in-progress tree
fn walk_path(root: &Value, path: &str) -> Result<Value, CodecError> {
    if path.is_empty() {
        return Ok(root.clone());
    }
    let mut current = root.clone();
    for segment in path.split(MARKER) {
        let key = unescape_text(segment);
        let next = match &current {
            Value::Object(map) => map.borrow().get(&key).cloned(),
            Value::Array(items) => key
                .parse::<usize>()
                .ok()
                .and_then(|index| items.borrow().get(index).cloned()),
            _ => None,
        };
        current = next.ok_or_else(|| CodecError::BadBackref {
            path: path.to_string(),
        })?;
    }
    Ok(current)
}

/// Set a value at an escaped-segment path, creating missing intermediates
fn set_path(root: &Value, segments: &[String], value: Value) {
    if segments.is_empty() {
        return;
    }
    let mut current = root.clone();
    for segment in &segments[..segments.len() - 1] {
        let key = unescape_text(segment);
        let next = match &current {
            Value::Object(map) => {
                let existing = map.borrow().get(&key).cloned();
                match existing {
                    Some(Value::Object(inner)) => Some(Value::Object(inner)),
                    Some(Value::Array(inner)) => Some(Value::Array(inner)),
                    _ => {
                        let fresh = Value::object();
                        map.borrow_mut().insert(key.clone(), fresh.clone());
                        Some(fresh)
                    }
                }
            }
            Value::Array(items) => key
                .parse::<usize>()
                .ok()
                .and_then(|index| items.borrow().get(index).cloned()),
            _ => None,
        };
        match next {
            Some(next) => current = next,
            None => return,
        }
    }
    let last = unescape_text(&segments[segments.len() - 1]);
    match &current {
        Value::Object(map) => {
            map.borrow_mut().insert(last, value);
        }
        Value::Array(items) => {
            if let Ok(index) = last.parse::<usize>() {
                let mut items = items.borrow_mut();
                if index < items.len() {
                    items[index] = value;
                }
            }
        }
        _ => {}
    }
}
