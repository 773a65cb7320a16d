//! Predicates decide whether a published `(flags, data)` pair matches.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::flag::Flags;
use crate::value::Value;

type PredicateFn = dyn Fn(&Flags, &Value) -> bool + Send + Sync;

/// A pure function over `(flags, data)`.
///
/// Cheap to clone; clones share the same closure.
#[derive(Clone)]
pub struct Predicate(Arc<PredicateFn>);

impl Predicate {
    /// Wraps an arbitrary closure.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Flags, &Value) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Matches everything.
    #[must_use]
    pub fn always() -> Self {
        Self::new(|_, _| true)
    }

    /// Evaluates the predicate.
    #[must_use]
    pub fn test(&self, flags: &Flags, data: &Value) -> bool {
        (self.0)(flags, data)
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Predicate(..)")
    }
}

/// Absence of a predicate means "always true". A panicking predicate
/// rejects the publish.
pub(crate) fn accepts(predicate: Option<&Predicate>, flags: &Flags, data: &Value) -> bool {
    let Some(p) = predicate else {
        return true;
    };
    panic::catch_unwind(AssertUnwindSafe(|| p.test(flags, data))).unwrap_or_else(|_| {
        tracing::error!("predicate panicked; treating the publish as no match");
        false
    })
}

/// Flag `key` equals `expected`.
pub fn flag_equals(key: impl Into<String>, expected: impl Into<Value>) -> Predicate {
    let key = key.into();
    let expected = expected.into();
    Predicate::new(move |flags, _| flags.get(&key) == Some(&expected))
}

/// Flag `key` equals one of `values`.
pub fn flag_in<V: Into<Value>>(key: impl Into<String>, values: impl IntoIterator<Item = V>) -> Predicate {
    let key = key.into();
    let values: Vec<Value> = values.into_iter().map(Into::into).collect();
    Predicate::new(move |flags, _| flags.get(&key).is_some_and(|v| values.contains(v)))
}

/// Flag `key` is a list containing `needle`, or a scalar equal to it.
pub fn flag_contains(key: impl Into<String>, needle: impl Into<Value>) -> Predicate {
    let key = key.into();
    let needle = needle.into();
    Predicate::new(move |flags, _| match flags.get(&key) {
        None => false,
        Some(Value::List(items)) => items.contains(&needle),
        Some(v) => *v == needle,
    })
}

/// Data equals `expected`.
pub fn data_equals(expected: impl Into<Value>) -> Predicate {
    let expected = expected.into();
    Predicate::new(move |_, data| *data == expected)
}

/// Data is a map whose `key` equals `expected`.
pub fn data_key_equals(key: impl Into<String>, expected: impl Into<Value>) -> Predicate {
    let key = key.into();
    let expected = expected.into();
    Predicate::new(move |_, data| data.get(&key) == Some(&expected))
}

/// Data is a map whose `key` equals one of `values`. False for non-map data.
pub fn data_key_in<V: Into<Value>>(key: impl Into<String>, values: impl IntoIterator<Item = V>) -> Predicate {
    let key = key.into();
    let values: Vec<Value> = values.into_iter().map(Into::into).collect();
    Predicate::new(move |_, data| data.get(&key).is_some_and(|v| values.contains(v)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flag::flags;

    #[test]
    fn test_flag_equals() {
        let p = flag_equals("level", "high");
        assert!(p.test(&flags([("level", "high")]), &Value::Null));
        assert!(!p.test(&flags([("level", "low")]), &Value::Null));
        assert!(!p.test(&Flags::new(), &Value::Null));
    }

    #[test]
    fn test_flag_in() {
        let p = flag_in("level", ["warn", "error"]);
        assert!(p.test(&flags([("level", "warn")]), &Value::Null));
        assert!(!p.test(&flags([("level", "info")]), &Value::Null));
    }

    #[test]
    fn test_flag_contains_single_and_list() {
        let admin = flag_contains("roles", "admin");
        let staff = flag_contains("roles", "staff");
        assert!(admin.test(&flags([("roles", "admin")]), &Value::Null));

        let list = flags([("roles", Value::list(["user", "staff"]))]);
        assert!(staff.test(&list, &Value::Null));
        assert!(!admin.test(&list, &Value::Null));
    }

    #[test]
    fn test_data_key_in_requires_map() {
        let p = data_key_in("k", ["a", "b"]);
        assert!(!p.test(&Flags::new(), &Value::from("not-a-map")));
        assert!(p.test(&Flags::new(), &Value::map([("k", "a")])));
    }

    #[test]
    fn test_data_equals_and_key_equals() {
        let data = Value::map([("state", "ready")]);
        assert!(data_equals(data.clone()).test(&Flags::new(), &data));
        assert!(data_key_equals("state", "ready").test(&Flags::new(), &data));
        assert!(!data_key_equals("state", "busy").test(&Flags::new(), &data));
    }

    #[test]
    fn test_missing_predicate_accepts() {
        assert!(accepts(None, &Flags::new(), &Value::Null));
        let never = Predicate::new(|_, _| false);
        assert!(!accepts(Some(&never), &Flags::new(), &Value::Null));
    }

    #[test]
    fn test_panicking_predicate_rejects() {
        let broken = Predicate::new(|_, _| panic!("bad predicate"));
        assert!(!accepts(Some(&broken), &Flags::new(), &Value::Null));
    }
}
