//! Host-side values exchanged with the sandbox.
//!
//! A [`HostValue`] is anything the host can hand to the guest by handle:
//! primitives, shared objects, host functions and wrapped guest closures.
//! Objects and functions are reference types; cloning a `HostValue` clones
//! the reference, never the object.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::closure::ClosureRef;

/// Shared, mutable host object.
pub type ObjectRef = Arc<ObjectCell>;

/// Interior-mutable slot behind an [`ObjectRef`].
///
/// The bridge is driven from one thread at a time, so a poisoned lock only
/// means an earlier panic; the object is still handed out.
#[derive(Debug)]
pub struct ObjectCell(RwLock<HostObject>);

impl ObjectCell {
    /// Wrap an object.
    pub fn new(obj: HostObject) -> Self {
        Self(RwLock::new(obj))
    }

    /// Shared access.
    pub fn read(&self) -> RwLockReadGuard<'_, HostObject> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive access. Must not be held across a read of the same object.
    pub fn write(&self) -> RwLockWriteGuard<'_, HostObject> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A value living on the host side of the bridge.
#[derive(Clone, Debug, Default)]
pub enum HostValue {
    /// The `undefined` constant
    #[default]
    Undefined,
    /// The `null` constant
    Null,
    /// Boolean primitive
    Bool(bool),
    /// Number primitive
    Number(f64),
    /// String primitive
    String(String),
    /// Reference to a host object
    Object(ObjectRef),
    /// Host-implemented function
    Function(Arc<HostFunction>),
    /// Guest closure wrapped for host invocation
    Closure(ClosureRef),
}

/// Plain host object: a class tag, named properties and indexed elements.
#[derive(Debug, Default)]
pub struct HostObject {
    class: String,
    properties: BTreeMap<String, HostValue>,
    elements: Vec<HostValue>,
}

/// Function created on the host, e.g. from source text.
#[derive(Debug)]
pub struct HostFunction {
    /// Function name (empty for anonymous functions)
    pub name: String,
    /// Body source text
    pub source: String,
}

impl HostObject {
    /// Create an empty object of the given class.
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            ..Default::default()
        }
    }

    /// Class name used for `instanceof` checks.
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Read a named property.
    pub fn get(&self, key: &str) -> Option<&HostValue> {
        self.properties.get(key)
    }

    /// Write a named property.
    pub fn set(&mut self, key: impl Into<String>, value: HostValue) {
        self.properties.insert(key.into(), value);
    }

    /// Iterate named properties in key order.
    pub fn properties(&self) -> impl Iterator<Item = (&str, &HostValue)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Indexed elements (arrays only).
    pub fn elements(&self) -> &[HostValue] {
        &self.elements
    }

    /// Mutable indexed elements.
    pub fn elements_mut(&mut self) -> &mut Vec<HostValue> {
        &mut self.elements
    }

    /// Whether this is an array object.
    pub fn is_array(&self) -> bool {
        self.class == "Array"
    }
}

impl HostValue {
    /// Wrap a string.
    pub fn string(s: impl Into<String>) -> Self {
        HostValue::String(s.into())
    }

    /// Create a fresh empty object of the given class.
    pub fn object(class: impl Into<String>) -> Self {
        HostValue::Object(Arc::new(ObjectCell::new(HostObject::new(class))))
    }

    /// Create an object of the given class with initial properties.
    pub fn object_with<K, I>(class: impl Into<String>, props: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, HostValue)>,
    {
        let mut obj = HostObject::new(class);
        for (k, v) in props {
            obj.set(k, v);
        }
        HostValue::Object(Arc::new(ObjectCell::new(obj)))
    }

    /// Create an array object.
    pub fn array(items: Vec<HostValue>) -> Self {
        let mut obj = HostObject::new("Array");
        obj.elements = items;
        HostValue::Object(Arc::new(ObjectCell::new(obj)))
    }

    /// Create an error object with `name`, `message` and `stack` properties.
    pub fn error(name: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let stack = format!("{}: {}\n    at <host>", name, message);
        HostValue::object_with(
            "Error",
            [
                ("name", HostValue::string(name)),
                ("message", HostValue::String(message)),
                ("stack", HostValue::String(stack)),
            ],
        )
    }

    /// Shorthand for a `TypeError`.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::error("TypeError", message)
    }

    /// Coarse type name, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Undefined => "undefined",
            HostValue::Null => "null",
            HostValue::Bool(_) => "boolean",
            HostValue::Number(_) => "number",
            HostValue::String(_) => "string",
            HostValue::Object(_) => "object",
            HostValue::Function(_) | HostValue::Closure(_) => "function",
        }
    }

    /// `undefined` or `null`.
    pub fn is_nullish(&self) -> bool {
        matches!(self, HostValue::Undefined | HostValue::Null)
    }

    /// Callable values.
    pub fn is_function(&self) -> bool {
        matches!(self, HostValue::Function(_) | HostValue::Closure(_))
    }

    /// Number payload, if this is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            HostValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// String payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Object reference, if this is an object.
    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            HostValue::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Guest closure, if this wraps one.
    pub fn as_closure(&self) -> Option<&ClosureRef> {
        match self {
            HostValue::Closure(c) => Some(c),
            _ => None,
        }
    }

    /// Class of an object value.
    pub fn class_name(&self) -> Option<String> {
        self.as_object().map(|o| o.read().class().to_string())
    }

    /// Read a named property of an object value (missing reads as `undefined`).
    pub fn property(&self, key: &str) -> HostValue {
        self.as_object()
            .and_then(|o| o.read().get(key).cloned())
            .unwrap_or_default()
    }

    /// Truthiness in the host's sense.
    pub fn truthy(&self) -> bool {
        match self {
            HostValue::Undefined | HostValue::Null => false,
            HostValue::Bool(b) => *b,
            HostValue::Number(n) => *n != 0.0 && !n.is_nan(),
            HostValue::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// Convert to a property key string.
    pub fn to_property_key(&self) -> String {
        match self {
            HostValue::String(s) => s.clone(),
            other => other.to_display_string(),
        }
    }

    /// Text as the console would print it: strings raw, everything else debug-formatted.
    pub fn to_display_string(&self) -> String {
        match self {
            HostValue::String(s) => s.clone(),
            other => other.debug_string(),
        }
    }

    /// Developer-facing rendering of any value.
    pub fn debug_string(&self) -> String {
        match self {
            HostValue::Undefined => "undefined".into(),
            HostValue::Null => "null".into(),
            HostValue::Bool(b) => b.to_string(),
            HostValue::Number(n) => format_number(*n),
            HostValue::String(s) => format!("\"{}\"", s),
            HostValue::Function(f) if !f.name.is_empty() => format!("Function({})", f.name),
            HostValue::Function(_) | HostValue::Closure(_) => "Function".into(),
            HostValue::Object(o) => {
                let obj = o.read();
                if obj.is_array() {
                    let parts: Vec<String> = obj.elements.iter().map(|v| v.debug_string()).collect();
                    return format!("[{}]", parts.join(", "));
                }
                if obj.class() == "Object" {
                    drop(obj);
                    return match self.to_json() {
                        Some(json) => format!("Object({})", json),
                        None => "Object".into(),
                    };
                }
                match obj.class() {
                    "Error" => format!(
                        "{}: {}\n{}",
                        obj.get("name").map(|v| v.to_display_string()).unwrap_or_else(|| "Error".into()),
                        obj.get("message").map(|v| v.to_display_string()).unwrap_or_default(),
                        obj.get("stack").map(|v| v.to_display_string()).unwrap_or_default(),
                    ),
                    class => class.to_string(),
                }
            }
        }
    }

    /// Build a host value from parsed JSON.
    pub fn from_json(json: serde_json::Value) -> Self {
        use serde_json::Value;
        match json {
            Value::Null => HostValue::Null,
            Value::Bool(b) => HostValue::Bool(b),
            Value::Number(n) => HostValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => HostValue::String(s),
            Value::Array(items) => HostValue::array(items.into_iter().map(Self::from_json).collect()),
            Value::Object(map) => HostValue::object_with(
                "Object",
                map.into_iter().map(|(k, v)| (k, Self::from_json(v))),
            ),
        }
    }

    /// Serialise to JSON. Functions and `undefined` have no JSON form.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        use serde_json::Value;
        match self {
            HostValue::Undefined | HostValue::Function(_) | HostValue::Closure(_) => None,
            HostValue::Null => Some(Value::Null),
            HostValue::Bool(b) => Some(Value::Bool(*b)),
            HostValue::Number(n) => Some(
                serde_json::Number::from_f64(*n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            ),
            HostValue::String(s) => Some(Value::String(s.clone())),
            HostValue::Object(o) => {
                let obj = o.read();
                if obj.is_array() {
                    return Some(Value::Array(
                        obj.elements
                            .iter()
                            .map(|v| v.to_json().unwrap_or(Value::Null))
                            .collect(),
                    ));
                }
                let map = obj
                    .properties
                    .iter()
                    .filter_map(|(k, v)| v.to_json().map(|j| (k.clone(), j)))
                    .collect();
                Some(Value::Object(map))
            }
        }
    }
}

/// SameValue equality: primitives by value (NaN equals NaN), references by identity.
impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HostValue::Undefined, HostValue::Undefined) | (HostValue::Null, HostValue::Null) => true,
            (HostValue::Bool(a), HostValue::Bool(b)) => a == b,
            (HostValue::Number(a), HostValue::Number(b)) => (a.is_nan() && b.is_nan()) || a == b,
            (HostValue::String(a), HostValue::String(b)) => a == b,
            (HostValue::Object(a), HostValue::Object(b)) => Arc::ptr_eq(a, b),
            (HostValue::Function(a), HostValue::Function(b)) => Arc::ptr_eq(a, b),
            (HostValue::Closure(a), HostValue::Closure(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        HostValue::Number(n)
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Bool(b)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::string(s)
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        HostValue::String(s)
    }
}

/// Format a number the way the host prints it (`1` not `1.0`, `NaN`, `Infinity`).
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".into()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity".into() } else { "-Infinity".into() }
    } else if n == 0.0 {
        "0".into()
    } else {
        n.to_string()
    }
}
