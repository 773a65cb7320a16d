//! AND/OR expressions over events, patterns and subscribers.
//!
//! An [`Expr`] compiles into a tree of subscribers: each `And`/`Or` node
//! becomes a subscriber whose members are its leaves and compiled
//! sub-expressions. Subscribers created by the compiler are owned by their
//! parent and stopped with [`Subscriber::stop_tree`]; subscribers supplied by
//! the caller are only referenced.
//!
//! ```
//! use std::time::Duration;
//! use eventcore::{any_of, wait_for_events, Dispatcher, Event, Flags};
//!
//! let dispatcher = Dispatcher::new();
//! let done = Event::builder(&dispatcher).id("done").build().unwrap();
//! let failed = Event::builder(&dispatcher).id("failed").build().unwrap();
//! done.set(1, Flags::new()).unwrap();
//!
//! let outcome = wait_for_events(
//!     &dispatcher,
//!     any_of![&done, &failed],
//!     Some(Duration::from_millis(100)),
//!     Some(Duration::from_secs(1)),
//! )
//! .unwrap();
//! assert!(outcome.is_matched());
//! ```

use std::time::Duration;

use crate::dispatcher::Dispatcher;
use crate::error::{EventResult, ValidationError};
use crate::event::Event;
use crate::predicate::Predicate;
use crate::subscriber::{Combinator, MemberSpec, Subscriber, WaitOutcome};

/// A boolean expression over members.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Holds when every operand holds.
    And(Vec<Expr>),
    /// Holds when any operand holds.
    Or(Vec<Expr>),
    /// An event, pattern or existing subscriber.
    Leaf(MemberSpec),
}

impl Expr {
    /// `And` over operands of one type.
    pub fn and<E: Into<Expr>>(items: impl IntoIterator<Item = E>) -> Self {
        Self::And(items.into_iter().map(Into::into).collect())
    }

    /// `Or` over operands of one type.
    pub fn or<E: Into<Expr>>(items: impl IntoIterator<Item = E>) -> Self {
        Self::Or(items.into_iter().map(Into::into).collect())
    }
}

impl From<MemberSpec> for Expr {
    fn from(spec: MemberSpec) -> Self {
        Self::Leaf(spec)
    }
}

impl From<&Event> for Expr {
    fn from(e: &Event) -> Self {
        Self::Leaf(e.into())
    }
}

impl From<Event> for Expr {
    fn from(e: Event) -> Self {
        Self::Leaf(e.into())
    }
}

impl From<(&Event, Predicate)> for Expr {
    fn from(pair: (&Event, Predicate)) -> Self {
        Self::Leaf(pair.into())
    }
}

impl From<&Subscriber> for Expr {
    fn from(s: &Subscriber) -> Self {
        Self::Leaf(s.into())
    }
}

impl From<Subscriber> for Expr {
    fn from(s: Subscriber) -> Self {
        Self::Leaf(s.into())
    }
}

impl From<&str> for Expr {
    fn from(glob: &str) -> Self {
        Self::Leaf(glob.into())
    }
}

impl From<(&str, Predicate)> for Expr {
    fn from(pair: (&str, Predicate)) -> Self {
        Self::Leaf(pair.into())
    }
}

/// `Expr::And` over heterogeneous operands.
#[macro_export]
macro_rules! all_of {
    ($($item:expr),+ $(,)?) => {
        $crate::Expr::And(vec![$($crate::Expr::from($item)),+])
    };
}

/// `Expr::Or` over heterogeneous operands.
#[macro_export]
macro_rules! any_of {
    ($($item:expr),+ $(,)?) => {
        $crate::Expr::Or(vec![$($crate::Expr::from($item)),+])
    };
}

/// Settings applied to every subscriber of a compiled tree.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Each subscriber fires at most once.
    pub once: bool,
    /// Replay window applied at every node.
    pub stale_window: Option<Duration>,
    /// Name of the root subscriber.
    pub name: Option<String>,
}

/// Compiles `expr` and registers the root subscriber.
///
/// A bare leaf compiles to a one-member AND subscriber.
pub fn compile(dispatcher: &Dispatcher, expr: Expr, options: &CompileOptions) -> EventResult<Subscriber> {
    let root = compile_detached(dispatcher, expr, options)?;
    if let Err(e) = dispatcher.add_subscriber(&root) {
        root.stop_tree();
        return Err(e);
    }
    Ok(root)
}

/// Compiles `expr`; children are registered, the root is not.
pub(crate) fn compile_detached(
    dispatcher: &Dispatcher,
    expr: Expr,
    options: &CompileOptions,
) -> EventResult<Subscriber> {
    let (combinator, operands) = match expr {
        Expr::And(items) => (Combinator::And, items),
        Expr::Or(items) => (Combinator::Or, items),
        leaf @ Expr::Leaf(_) => (Combinator::And, vec![leaf]),
    };
    if operands.is_empty() {
        return Err(ValidationError::EmptyMembers {
            subscriber: options.name.clone().unwrap_or_else(|| combinator.to_string()),
        }
        .into());
    }

    let mut builder = Subscriber::builder(dispatcher)
        .combinator(combinator)
        .once(options.once)
        .stale_window(options.stale_window);
    if let Some(name) = &options.name {
        builder = builder.name(name.clone());
    }

    let child_options = CompileOptions {
        name: None,
        ..options.clone()
    };
    let mut compiled: Vec<Subscriber> = Vec::new();
    for operand in operands {
        match operand {
            Expr::Leaf(spec) => builder = builder.member(spec),
            nested => match compile(dispatcher, nested, &child_options) {
                Ok(child) => {
                    compiled.push(child.clone());
                    builder = builder.owned_member(child);
                }
                Err(e) => {
                    compiled.iter().for_each(Subscriber::stop_tree);
                    return Err(e);
                }
            },
        }
    }

    builder.build_detached().map_err(|e| {
        compiled.iter().for_each(Subscriber::stop_tree);
        e
    })
}

/// Stops a compiled tree when dropped.
struct TreeGuard<'a>(&'a Subscriber);

impl Drop for TreeGuard<'_> {
    fn drop(&mut self) {
        self.0.stop_tree();
    }
}

/// Blocks until `expr` holds once, then tears the compiled tree down.
///
/// With `stale_window`, facts that occurred up to that long ago count. The
/// tree is stopped on every exit path, including timeouts and errors.
pub fn wait_for_events(
    dispatcher: &Dispatcher,
    expr: Expr,
    timeout: Option<Duration>,
    stale_window: Option<Duration>,
) -> EventResult<WaitOutcome> {
    let options = CompileOptions {
        once: true,
        stale_window,
        name: None,
    };
    let root = compile_detached(dispatcher, expr, &options)?;
    let _guard = TreeGuard(&root);

    let stream = root.stream(1);
    dispatcher.add_subscriber(&root)?;
    let outcome = stream.recv_timeout(timeout);
    tracing::debug!(
        root = %root.name(),
        matched = outcome.is_matched(),
        timed_out = outcome.is_timeout(),
        "wait_for_events finished"
    );
    Ok(outcome)
}
