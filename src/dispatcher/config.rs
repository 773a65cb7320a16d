use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EventResult, ValidationError};

/// Dispatcher configuration.
///
/// Durations are written as fractional seconds in JSON. Missing fields take
/// their default.
///
/// ```
/// use std::time::Duration;
/// use eventcore::DispatcherConfig;
///
/// let cfg = DispatcherConfig::from_json_str(r#"{"default_history_age": 2.5}"#).unwrap();
/// assert_eq!(cfg.default_history_age, Duration::from_millis(2500));
/// assert_eq!(cfg.callback_workers, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Threads running `Concurrent` callbacks.
    pub callback_workers: usize,
    /// Maximum queued callbacks before falling back to inline execution.
    pub callback_queue_capacity: usize,
    /// History retention for events that do not set their own.
    #[serde(with = "secs")]
    pub default_history_age: Duration,
    /// How long subscribers keep their matches for stale lookups.
    #[serde(with = "secs")]
    pub default_match_retention: Duration,
    /// Waiter queue capacity for `Subscriber::wait`; 0 is unbounded.
    pub default_queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            callback_workers: 2,
            callback_queue_capacity: 1024,
            default_history_age: Duration::from_secs(10),
            default_match_retention: Duration::from_secs(10),
            default_queue_capacity: 1,
        }
    }
}

impl DispatcherConfig {
    pub fn from_json_str(json: &str) -> EventResult<Self> {
        serde_json::from_str(json).map_err(|e| {
            ValidationError::InvalidConfig {
                reason: e.to_string(),
            }
            .into()
        })
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> EventResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("{}: {e}", path.display()),
        })?;
        Self::from_json_str(&raw)
    }

    pub fn to_json_string(&self) -> EventResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            ValidationError::InvalidConfig {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

mod secs {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(de::Error::custom(format!(
                "duration must be a non-negative number of seconds, got {secs}"
            )));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = DispatcherConfig::default();
        assert_eq!(cfg.default_history_age, Duration::from_secs(10));
        assert_eq!(cfg.default_match_retention, Duration::from_secs(10));
        assert_eq!(cfg.default_queue_capacity, 1);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg = DispatcherConfig::from_json_str(r#"{"callback_workers": 4}"#).unwrap();
        assert_eq!(cfg.callback_workers, 4);
        assert_eq!(cfg.callback_queue_capacity, 1024);
    }

    #[test]
    fn test_negative_duration_rejected() {
        let err = DispatcherConfig::from_json_str(r#"{"default_history_age": -1}"#).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_json_roundtrip() {
        let cfg = DispatcherConfig {
            default_history_age: Duration::from_millis(1500),
            ..DispatcherConfig::default()
        };
        let json = cfg.to_json_string().unwrap();
        assert_eq!(DispatcherConfig::from_json_str(&json).unwrap(), cfg);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"default_queue_capacity": 0, "default_match_retention": 0.25}}"#).unwrap();
        let cfg = DispatcherConfig::from_json_file(file.path()).unwrap();
        assert_eq!(cfg.default_queue_capacity, 0);
        assert_eq!(cfg.default_match_retention, Duration::from_millis(250));

        assert!(DispatcherConfig::from_json_file("/nonexistent/eventcore.json").is_err());
    }
}
