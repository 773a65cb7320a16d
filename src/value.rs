//! Payload values carried by events and flags.
//!
//! Values are owned trees (scalars, lists, string-keyed maps) so that copying
//! a payload on publish is an ordinary deep clone. The one exception is
//! [`Value::Shared`], which wraps an application object behind an `Arc`;
//! copying it goes through [`SharedPayload::deep_copy`], which may fail.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a shared payload refuses to be deep-copied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("payload of type '{type_name}' cannot be copied: {reason}")]
pub struct PayloadCopyError {
    /// Type name reported by the payload.
    pub type_name: String,
    /// Why the copy failed.
    pub reason: String,
}

/// An application object published by reference.
///
/// Implementors decide how (and whether) they can be deep-copied. When
/// `deep_copy` fails the publishing event falls back to aliasing.
pub trait SharedPayload: fmt::Debug + Send + Sync + 'static {
    /// Human-readable type name, used in logs and type errors.
    fn type_name(&self) -> &'static str;

    /// Produce an independent copy of this payload.
    fn deep_copy(&self) -> Result<Arc<dyn SharedPayload>, PayloadCopyError>;

    /// Downcasting support.
    fn as_any(&self) -> &dyn Any;
}

/// Type tags used by flag schemas and declared event data types.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Null,
    Bool,
    Int,
    Float,
    String,
    List,
    Map,
    Shared,
}

impl ValueType {
    /// Returns a human-readable type name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::List => "list",
            Self::Map => "map",
            Self::Shared => "shared",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A payload value.
///
/// # Examples
///
/// ```
/// use eventcore::Value;
///
/// let v = Value::map([("state", Value::from("ready")), ("n", Value::from(3))]);
/// assert_eq!(v.get("state").and_then(Value::as_str), Some("ready"));
/// assert_eq!(v.get("n").and_then(Value::as_int), Some(3));
/// ```
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    #[serde(skip)]
    Shared(Arc<dyn SharedPayload>),
}

impl Value {
    /// Builds a map value from key/value pairs.
    pub fn map<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// Builds a list value.
    pub fn list<V: Into<Value>>(items: impl IntoIterator<Item = V>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }

    /// Wraps an application object.
    pub fn shared<P: SharedPayload>(payload: P) -> Self {
        Self::Shared(Arc::new(payload))
    }

    /// The type tag of this value.
    #[must_use]
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Null => ValueType::Null,
            Self::Bool(_) => ValueType::Bool,
            Self::Int(_) => ValueType::Int,
            Self::Float(_) => ValueType::Float,
            Self::String(_) => ValueType::String,
            Self::List(_) => ValueType::List,
            Self::Map(_) => ValueType::Map,
            Self::Shared(_) => ValueType::Shared,
        }
    }

    /// Human-readable type name; shared payloads report their own name.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Shared(p) => p.type_name(),
            other => other.value_type().name(),
        }
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(v) => Some(v),
            _ => None,
        }
    }

    pub const fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(v) => Some(v),
            _ => None,
        }
    }

    /// Looks up `key` when this value is a map.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Downcasts a shared payload to its concrete type.
    pub fn as_shared<T: 'static>(&self) -> Option<&T> {
        match self {
            Self::Shared(p) => p.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Produces a structurally equal value that shares nothing with `self`.
    ///
    /// Plain values always copy; a shared payload delegates to
    /// [`SharedPayload::deep_copy`].
    pub fn deep_copy(&self) -> Result<Value, PayloadCopyError> {
        match self {
            Self::List(items) => items
                .iter()
                .map(Value::deep_copy)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
            Self::Map(entries) => entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), v.deep_copy()?)))
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Self::Map),
            Self::Shared(p) => p.deep_copy().map(Self::Shared),
            other => Ok(other.clone()),
        }
    }

    /// True if any part of this value is a [`Value::Shared`] payload.
    #[must_use]
    pub fn has_shared(&self) -> bool {
        match self {
            Self::Shared(_) => true,
            Self::List(items) => items.iter().any(Value::has_shared),
            Self::Map(entries) => entries.values().any(Value::has_shared),
            _ => false,
        }
    }

    /// True if `other` is the very same shared object (not just equal).
    #[must_use]
    pub fn shares_with(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Shared(a), Self::Shared(b)) => Arc::ptr_eq(a, b),
            (Self::List(a), Self::List(b)) => a.iter().zip(b).any(|(x, y)| x.shares_with(y)),
            (Self::Map(a), Self::Map(b)) => a
                .iter()
                .any(|(k, v)| b.get(k).is_some_and(|w| v.shares_with(w))),
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Shared(a), Self::Shared(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v:?}"),
            Self::List(v) => write!(f, "list[{}]", v.len()),
            Self::Map(v) => write!(f, "map[{}]", v.len()),
            Self::Shared(p) => write!(f, "shared<{}>", p.type_name()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Self::Map(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            serde_json::Value::Object(entries) => {
                Self::Map(entries.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct Frame {
        pixels: Mutex<Vec<u8>>,
    }

    impl SharedPayload for Frame {
        fn type_name(&self) -> &'static str {
            "Frame"
        }

        fn deep_copy(&self) -> Result<Arc<dyn SharedPayload>, PayloadCopyError> {
            let pixels = self.pixels.lock().map_err(|_| PayloadCopyError {
                type_name: "Frame".to_string(),
                reason: "poisoned".to_string(),
            })?;
            Ok(Arc::new(Frame {
                pixels: Mutex::new(pixels.clone()),
            }))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_value_types() {
        assert_eq!(Value::Null.value_type(), ValueType::Null);
        assert_eq!(Value::from(true).value_type(), ValueType::Bool);
        assert_eq!(Value::from(3).value_type(), ValueType::Int);
        assert_eq!(Value::from(3.5).value_type(), ValueType::Float);
        assert_eq!(Value::from("x").value_type(), ValueType::String);
        assert_eq!(Value::list([1, 2]).value_type(), ValueType::List);
        assert_eq!(Value::map([("k", 1)]).value_type(), ValueType::Map);
    }

    #[test]
    fn test_int_reads_as_float() {
        assert_eq!(Value::Int(42).as_float(), Some(42.0));
        assert!(Value::Float(1.0).as_int().is_none());
    }

    #[test]
    fn test_deep_copy_of_plain_tree_is_equal() {
        let v = Value::map([("k", Value::list(["a", "b"]))]);
        let copy = v.deep_copy().unwrap();
        assert_eq!(v, copy);
        assert!(!v.shares_with(&copy));
    }

    #[test]
    fn test_deep_copy_of_shared_payload_detaches() {
        let v = Value::shared(Frame {
            pixels: Mutex::new(vec![1, 2]),
        });
        let copy = v.deep_copy().unwrap();
        assert!(!v.shares_with(&copy));

        v.as_shared::<Frame>().unwrap().pixels.lock().unwrap().push(3);
        assert_eq!(*copy.as_shared::<Frame>().unwrap().pixels.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_shared_equality_is_identity() {
        let v = Value::shared(Frame {
            pixels: Mutex::new(vec![]),
        });
        let alias = v.clone();
        assert_eq!(v, alias);
        assert_ne!(v, v.deep_copy().unwrap());
        assert_eq!(v.type_name(), "Frame");
    }

    #[test]
    fn test_from_json() {
        let v: Value = serde_json::json!({"v": 1, "tags": ["a"], "ok": true, "x": 0.5}).into();
        assert_eq!(v.get("v"), Some(&Value::Int(1)));
        assert_eq!(v.get("tags"), Some(&Value::list(["a"])));
        assert_eq!(v.get("ok"), Some(&Value::Bool(true)));
        assert_eq!(v.get("x"), Some(&Value::Float(0.5)));
    }

    #[test]
    fn test_value_serialization() {
        let val = Value::map([("state", "ready")]);
        let json = serde_json::to_string(&val).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(val, back);
    }

    #[test]
    fn test_value_display() {
        assert_eq!(format!("{}", Value::Bool(true)), "true");
        assert_eq!(format!("{}", Value::String("hi".into())), "\"hi\"");
        assert_eq!(format!("{}", Value::list([1, 2, 3])), "list[3]");
        assert_eq!(format!("{}", Value::Null), "null");
    }
}
