//! Typed flags attached to an event's payload at publish time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::value::{Value, ValueType};

/// Flag values supplied with a publish, keyed by flag id.
pub type Flags = BTreeMap<String, Value>;

/// Schema entry for one flag of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flag {
    id: String,
    accepted: Vec<ValueType>,
}

impl Flag {
    /// A flag accepting a single type.
    #[must_use]
    pub fn new(id: impl Into<String>, accepted: ValueType) -> Self {
        Self {
            id: id.into(),
            accepted: vec![accepted],
        }
    }

    /// A flag accepting any of several types.
    pub fn any_of(
        id: impl Into<String>,
        accepted: impl IntoIterator<Item = ValueType>,
    ) -> Result<Self, ValidationError> {
        let id = id.into();
        let mut accepted: Vec<ValueType> = accepted.into_iter().collect();
        accepted.sort_unstable();
        accepted.dedup();
        if accepted.is_empty() {
            return Err(ValidationError::EmptyFlagTypes { flag: id });
        }
        Ok(Self { id, accepted })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn accepted(&self) -> &[ValueType] {
        &self.accepted
    }

    #[must_use]
    pub fn accepts(&self, value: &Value) -> bool {
        self.accepted.contains(&value.value_type())
    }

    /// `"string | list"` style description for error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        self.accepted
            .iter()
            .map(|t| t.name())
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

/// Shorthand for building a [`Flags`] map.
pub fn flags<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Flags
where
    K: Into<String>,
    V: Into<Value>,
{
    entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}
