//! The value graph model the codec operates on
//!
//! Containers are reference counted so that shared references and cycles can
//! be expressed and preserved across the process boundary. Identity (as used
//! by the encoder's seen-maps) is pointer identity of the shared allocation,
//! never structural equality.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::rc::Rc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;

/// A shared, mutable array of values
pub type ArrayRef = Rc<RefCell<Vec<Value>>>;

/// A shared, mutable string-keyed map of values
pub type ObjectRef = Rc<RefCell<BTreeMap<String, Value>>>;

/// A custom type that knows how to convert itself into a plain value tree.
///
/// The declared name selects the reconstruction hook in the receiving side's
/// [`DryRegistry`](crate::DryRegistry).
pub trait DryType {
    /// Registry name identifying the reconstruction hook
    fn dry_name(&self) -> &str;

    /// The carried value the hook will be invoked with
    fn to_dry(&self) -> Value;
}

/// A regular-expression value, carried as source text plus flags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegexValue {
    pub source: String,
    pub flags: String,
}

impl RegexValue {
    pub fn new(source: impl Into<String>, flags: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            flags: flags.into(),
        }
    }

    /// The `/source/flags` literal form used on the wire
    pub fn literal(&self) -> String {
        format!("/{}/{}", self.source, self.flags)
    }

    /// Parse a `/source/flags` literal
    pub fn from_literal(literal: &str) -> Option<Self> {
        let rest = literal.strip_prefix('/')?;
        let split = rest.rfind('/')?;
        Some(Self {
            source: rest[..split].to_string(),
            flags: rest[split + 1..].to_string(),
        })
    }
}

enum StreamInner {
    /// A readable source waiting to be shipped
    Source(Pin<Box<dyn AsyncRead>>),
    /// A fully received stream, buffered on arrival
    Buffered(Bytes),
    /// The source was handed to the side channel
    Taken,
}

/// A handle to a continuous byte channel.
///
/// On the sending side a handle wraps any [`AsyncRead`] source; the side
/// channel drains it until end. On the receiving side the handle holds the
/// bytes that were received before readiness was signalled.
#[derive(Clone)]
pub struct StreamHandle {
    inner: Rc<RefCell<StreamInner>>,
}

impl StreamHandle {
    pub fn from_reader(reader: impl AsyncRead + 'static) -> Self {
        Self {
            inner: Rc::new(RefCell::new(StreamInner::Source(Box::pin(reader)))),
        }
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        Self {
            inner: Rc::new(RefCell::new(StreamInner::Buffered(bytes))),
        }
    }

    /// Take the readable source out of the handle, leaving it spent
    pub fn take_reader(&self) -> Option<Pin<Box<dyn AsyncRead>>> {
        let mut inner = self.inner.borrow_mut();
        match std::mem::replace(&mut *inner, StreamInner::Taken) {
            StreamInner::Source(reader) => Some(reader),
            other => {
                *inner = other;
                None
            }
        }
    }

    /// The received bytes, if this handle was buffered on arrival
    pub fn bytes(&self) -> Option<Bytes> {
        match &*self.inner.borrow() {
            StreamInner::Buffered(bytes) => Some(bytes.clone()),
            _ => None,
        }
    }

    pub(crate) fn ptr_id(&self) -> usize {
        Rc::as_ptr(&self.inner) as *const u8 as usize
    }

    /// Whether two handles refer to the same underlying channel
    pub fn same_stream(a: &StreamHandle, b: &StreamHandle) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.borrow() {
            StreamInner::Source(_) => "source",
            StreamInner::Buffered(b) => return write!(f, "StreamHandle(buffered, {} bytes)", b.len()),
            StreamInner::Taken => "taken",
        };
        write!(f, "StreamHandle({})", state)
    }
}

/// A value reachable from a call's argument list
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(DateTime<Utc>),
    Regex(RegexValue),
    Buffer(Bytes),
    Stream(StreamHandle),
    Array(ArrayRef),
    Object(ObjectRef),
    Custom(Rc<dyn DryType>),
}

impl Value {
    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn object() -> Value {
        Value::Object(Rc::new(RefCell::new(BTreeMap::new())))
    }

    pub fn custom(value: impl DryType + 'static) -> Value {
        Value::Custom(Rc::new(value))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Look up a key on an object value
    pub fn get(&self, key: &str) -> Option<Value> {
        match self {
            Value::Object(map) => map.borrow().get(key).cloned(),
            _ => None,
        }
    }

    /// Set a key on an object value; no-op on anything else
    pub fn set(&self, key: impl Into<String>, value: Value) {
        if let Value::Object(map) = self {
            map.borrow_mut().insert(key.into(), value);
        }
    }

    /// Index into an array value
    pub fn at(&self, index: usize) -> Option<Value> {
        match self {
            Value::Array(items) => items.borrow().get(index).cloned(),
            _ => None,
        }
    }

    /// Pointer identity used by the encoder's seen-maps, with the nominal
    /// type tag the identity is bucketed under.
    ///
    /// Buffers carry their length too: a `Bytes` slice shares its parent's
    /// storage, so a bare start pointer would alias a prefix slice with the
    /// whole buffer.
    pub(crate) fn identity(&self) -> Option<(&str, (usize, usize))> {
        match self {
            Value::Array(items) => Some(("Array", (Rc::as_ptr(items) as *const u8 as usize, 0))),
            Value::Object(map) => Some(("Object", (Rc::as_ptr(map) as *const u8 as usize, 0))),
            Value::Buffer(bytes) => Some(("Buffer", (bytes.as_ptr() as usize, bytes.len()))),
            Value::Stream(stream) => Some(("Stream", (stream.ptr_id(), 0))),
            Value::Custom(custom) => {
                Some((custom.dry_name(), (Rc::as_ptr(custom) as *const u8 as usize, 0)))
            }
            _ => None,
        }
    }

    /// Whether two values are the same shared allocation
    pub fn same_object(a: &Value, b: &Value) -> bool {
        match (a.identity(), b.identity()) {
            (Some((ta, pa)), Some((tb, pb))) => ta == tb && pa == pb,
            _ => false,
        }
    }

    /// Structural equality over finite, acyclic values.
    ///
    /// Streams compare by identity; custom values compare by name and dried
    /// form. Calling this on a cyclic graph will not terminate.
    pub fn deep_eq(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Int(x), Value::Int(y)) => x == y,
            (Value::Float(x), Value::Float(y)) => x == y || (x.is_nan() && y.is_nan()),
            (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => {
                *x as f64 == *y
            }
            (Value::Text(x), Value::Text(y)) => x == y,
            (Value::Date(x), Value::Date(y)) => x == y,
            (Value::Regex(x), Value::Regex(y)) => x == y,
            (Value::Buffer(x), Value::Buffer(y)) => x == y,
            (Value::Stream(x), Value::Stream(y)) => StreamHandle::same_stream(x, y),
            (Value::Array(x), Value::Array(y)) => {
                let (x, y) = (x.borrow(), y.borrow());
                x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| Value::deep_eq(a, b))
            }
            (Value::Object(x), Value::Object(y)) => {
                let (x, y) = (x.borrow(), y.borrow());
                x.len() == y.len()
                    && x.iter().zip(y.iter()).all(|((ka, va), (kb, vb))| {
                        ka == kb && Value::deep_eq(va, vb)
                    })
            }
            (Value::Custom(x), Value::Custom(y)) => {
                x.dry_name() == y.dry_name() && Value::deep_eq(&x.to_dry(), &y.to_dry())
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(v) => write!(f, "Bool({})", v),
            Value::Int(v) => write!(f, "Int({})", v),
            Value::Float(v) => write!(f, "Float({})", v),
            Value::Text(v) => write!(f, "Text({:?})", v),
            Value::Date(v) => write!(f, "Date({})", v),
            Value::Regex(v) => write!(f, "Regex({})", v.literal()),
            Value::Buffer(v) => write!(f, "Buffer({} bytes)", v.len()),
            Value::Stream(v) => write!(f, "{:?}", v),
            Value::Array(v) => match v.try_borrow() {
                Ok(items) => f.debug_list().entries(items.iter()).finish(),
                Err(_) => write!(f, "Array(<borrowed>)"),
            },
            Value::Object(v) => match v.try_borrow() {
                Ok(map) => f.debug_map().entries(map.iter()).finish(),
                Err(_) => write!(f, "Object(<borrowed>)"),
            },
            Value::Custom(v) => write!(f, "Custom({})", v.dry_name()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Buffer(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Date(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_tracks_shared_allocations() {
        let a = Value::array(vec![Value::Int(1)]);
        let b = a.clone();
        let c = Value::array(vec![Value::Int(1)]);

        assert!(Value::same_object(&a, &b));
        assert!(!Value::same_object(&a, &c));
        assert!(Value::deep_eq(&a, &c));
    }

    #[test]
    fn regex_literal_round_trip() {
        let re = RegexValue::new("a/b+", "gi");
        let parsed = RegexValue::from_literal(&re.literal()).unwrap();
        assert_eq!(re, parsed);
        assert!(RegexValue::from_literal("no-slashes").is_none());
    }

    #[test]
    fn object_accessors() {
        let obj = Value::object();
        obj.set("x", Value::Int(4));
        assert_eq!(obj.get("x").unwrap().as_i64(), Some(4));
        assert!(obj.get("y").is_none());
    }

    #[test]
    fn deep_eq_mixed_numbers() {
        assert!(Value::deep_eq(&Value::Int(3), &Value::Float(3.0)));
        assert!(!Value::deep_eq(&Value::Int(3), &Value::Float(3.5)));
    }
}
