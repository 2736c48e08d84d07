//! Registry of custom dry types and their reconstruction hooks

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::value::{DryType, Value};

/// Reconstruction hook: raw carried value in, reconstructed value out
pub type UndryFn = Rc<dyn Fn(Value) -> Value>;

/// Maps declared type names to reconstruction hooks.
///
/// An unregistered name is not an error on decode; the raw carried value is
/// returned unchanged.
#[derive(Clone)]
pub struct DryRegistry {
    hooks: HashMap<String, UndryFn>,
}

impl DryRegistry {
    /// An empty registry, without even the built-in error wrapper
    pub fn empty() -> Self {
        Self {
            hooks: HashMap::new(),
        }
    }

    /// A registry holding the built-in [`RemoteError`] wrapper
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(RemoteError::DRY_NAME, |carried| {
            Value::custom(RemoteError {
                message: carried
                    .get("message")
                    .and_then(|m| m.as_str().map(str::to_string))
                    .unwrap_or_default(),
                stack: carried
                    .get("stack")
                    .and_then(|s| s.as_str().map(str::to_string)),
            })
        });
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        hook: impl Fn(Value) -> Value + 'static,
    ) {
        self.hooks.insert(name.into(), Rc::new(hook));
    }

    pub fn hook(&self, name: &str) -> Option<&UndryFn> {
        self.hooks.get(name)
    }
}

impl Default for DryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A generic reconstructed error crossing the process boundary.
///
/// Preserves message text and stack trace but not the original error type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub message: String,
    pub stack: Option<String>,
}

impl RemoteError {
    pub const DRY_NAME: &'static str = "ForkError";

    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: Some(stack.into()),
        }
    }
}

impl DryType for RemoteError {
    fn dry_name(&self) -> &str {
        Self::DRY_NAME
    }

    fn to_dry(&self) -> Value {
        let carried = Value::object();
        carried.set("message", Value::Text(self.message.clone()));
        match &self.stack {
            Some(stack) => carried.set("stack", Value::Text(stack.clone())),
            None => carried.set("stack", Value::Null),
        }
        carried
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RemoteError {}

/// Extract a [`RemoteError`] from a decoded value, if it is error-shaped
pub fn as_remote_error(value: &Value) -> Option<RemoteError> {
    match value {
        Value::Custom(custom) if custom.dry_name() == RemoteError::DRY_NAME => {
            let carried = custom.to_dry();
            Some(RemoteError {
                message: carried
                    .get("message")
                    .and_then(|m| m.as_str().map(str::to_string))
                    .unwrap_or_default(),
                stack: carried
                    .get("stack")
                    .and_then(|s| s.as_str().map(str::to_string)),
            })
        }
        _ => None,
    }
}
