//! Error types for eventcore.
//!
//! All errors are strongly typed using thiserror. Validation errors are raised
//! synchronously by the call that caused them; nothing is silently dropped.
//! Timeouts are not errors: waits report them through `WaitOutcome`.

use thiserror::Error;

/// Validation errors caused by incorrect use of the engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Invalid event id '{id}': {reason}")]
    InvalidEventId {
        id: String,
        reason: String,
    },

    #[error("Event id '{id}' is already registered")]
    DuplicateEventId {
        id: String,
    },

    #[error("Flag '{flag}' is declared more than once on event '{event}'")]
    DuplicateFlag {
        event: String,
        flag: String,
    },

    #[error("Flag '{flag}' must accept at least one type")]
    EmptyFlagTypes {
        flag: String,
    },

    #[error("Invalid flag '{flag}' for event '{event}'")]
    UnknownFlag {
        event: String,
        flag: String,
    },

    #[error("Flag '{flag}' is expected to be of type {expected}, but got {actual} instead")]
    FlagTypeMismatch {
        flag: String,
        expected: String,
        actual: String,
    },

    #[error("Data for event '{event}' is expected to be of type {expected}, but got {actual} instead")]
    DataTypeMismatch {
        event: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid glob pattern '{pattern}': {reason}")]
    InvalidPattern {
        pattern: String,
        reason: String,
    },

    #[error("max_rate must be > 0, got {value}")]
    InvalidMaxRate {
        value: f64,
    },

    #[error("Subscriber '{subscriber}' needs at least one member")]
    EmptyMembers {
        subscriber: String,
    },

    #[error("Invalid dispatcher configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Execution errors raised while the engine is running.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Dispatcher has been dropped")]
    DispatcherGone,

    #[error("Failed to spawn thread '{name}': {message}")]
    SpawnFailed {
        name: String,
        message: String,
    },

    #[error("Callback queue is full (capacity {capacity})")]
    QueueFull {
        capacity: usize,
    },

    #[error("Lock poisoned: {what}")]
    LockPoisoned {
        what: String,
    },
}

/// Top-level error type for eventcore.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EventError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),
}

impl EventError {
    /// Creates a lock-poisoned execution error.
    #[must_use]
    pub fn poisoned(what: impl Into<String>) -> Self {
        Self::Execution(ExecutionError::LockPoisoned { what: what.into() })
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }
}

/// Result type alias for eventcore operations.
pub type EventResult<T> = Result<T, EventError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_type_mismatch_message() {
        let err = ValidationError::FlagTypeMismatch {
            flag: "level".to_string(),
            expected: "string".to_string(),
            actual: "int".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("level"));
        assert!(msg.contains("string"));
        assert!(msg.contains("int"));
    }

    #[test]
    fn test_duplicate_event_id_message() {
        let err = ValidationError::DuplicateEventId { id: "robot:ready".to_string() };
        assert!(format!("{err}").contains("robot:ready"));
    }

    #[test]
    fn test_event_error_from_validation() {
        let err: EventError = ValidationError::InvalidMaxRate { value: 0.0 }.into();
        assert!(err.is_validation());
        assert!(!err.is_execution());
    }

    #[test]
    fn test_event_error_from_execution() {
        let err: EventError = ExecutionError::QueueFull { capacity: 8 }.into();
        assert!(err.is_execution());
        assert!(format!("{err}").contains("capacity 8"));
    }

    #[test]
    fn test_poisoned_helper() {
        let err = EventError::poisoned("registry");
        let EventError::Execution(ExecutionError::LockPoisoned { what }) = err else {
            panic!("expected LockPoisoned");
        };
        assert_eq!(what, "registry");
    }
}
