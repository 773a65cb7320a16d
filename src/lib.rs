//! # eventcore - in-process publish/subscribe event engine
//!
//! eventcore lets independent parts of a concurrent application observe and
//! react to asynchronous facts ("this value changed", "this condition became
//! true") without polling or direct coupling.
//!
//! ## Core Concepts
//!
//! - **Event**: a typed, named value cell with a short-term history
//! - **Subscriber**: an AND/OR condition over events and other subscribers,
//!   or a glob pattern over event ids (present and future)
//! - **Dispatcher**: routes each publish to the subscribers watching it and
//!   replays recent history ("stale window") at registration
//! - **Listener**: runs a callback on a background thread for every match,
//!   with optional rate limiting
//! - **Expr**: compiles nested AND/OR expressions into subscriber trees
//!
//! ## Usage
//!
//! ```rust
//! use std::time::Duration;
//! use eventcore::{flags, Dispatcher, Event, Flag, ValueType, flag_equals};
//!
//! let dispatcher = Dispatcher::new();
//! let level = Event::builder(&dispatcher)
//!     .id("level")
//!     .data_type(ValueType::Int)
//!     .flag(Flag::new("unit", ValueType::String))
//!     .build()?;
//!
//! level.set(42, flags([("unit", "mm")]))?;
//!
//! // A fact from the last second satisfies the wait immediately.
//! let outcome = level.wait(
//!     Some(flag_equals("unit", "mm")),
//!     Some(Duration::from_millis(10)),
//!     Some(Duration::from_secs(1)),
//! )?;
//! assert!(outcome.is_matched());
//! # Ok::<(), eventcore::EventError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Payloads and schemas
pub mod error;
pub mod flag;
pub mod glob;
pub mod predicate;
pub mod value;

// Engine
pub mod dispatcher;
pub mod event;
pub mod expr;
pub mod listener;
pub mod runtime;
pub mod subscriber;

// Re-export primary types at crate root for convenience
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{EventError, EventResult, ExecutionError, ValidationError};
pub use event::{Event, EventBuilder, EventContainer, EventKey, HistoryEntry};
pub use expr::{compile, wait_for_events, CompileOptions, Expr};
pub use flag::{flags, Flag, Flags};
pub use glob::GlobPattern;
pub use listener::{ListenOptions, Listener};
pub use predicate::{
    data_equals, data_key_equals, data_key_in, flag_contains, flag_equals, flag_in, Predicate,
};
pub use runtime::CallbackPolicy;
pub use subscriber::{
    Cause, Combinator, EntryPayload, MatchCallback, MatchData, MatchEntry, MatchNode, MatchStream,
    MemberSpec, Subscriber, SubscriberBuilder, SubscriberId, SubscriberMatch, TimeoutCallback,
    WaitOutcome,
};
pub use value::{PayloadCopyError, SharedPayload, Value, ValueType};
