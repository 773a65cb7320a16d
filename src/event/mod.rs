//! Events: typed, named, observable value cells with short-term history.
//!
//! Publishing (`Event::set`) validates the payload against the declared
//! schema, records it in history, and synchronously offers it to every
//! subscriber watching the event. Publishes on one event are serialized;
//! publishes on different events run in parallel up to the dispatcher lock.

mod container;
mod history;

pub use container::EventContainer;
pub use history::HistoryEntry;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dispatcher::{Dispatcher, DispatcherInner};
use crate::error::{EventError, EventResult, ExecutionError, ValidationError};
use crate::flag::{Flag, Flags};
use crate::listener::{ListenOptions, Listener};
use crate::predicate::Predicate;
use crate::subscriber::{MatchCallback, MemberSpec, Subscriber, SubscriberMatch, WaitOutcome};
use crate::value::{Value, ValueType};

use history::History;

/// Process-unique identity of an event instance.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventKey(Uuid);

impl EventKey {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventKey {
    fn default() -> Self {
        Self::new()
    }
}

/// Checks one `:`-separated id: every segment non-empty `[A-Za-z0-9_]+`.
pub(crate) fn validate_id(id: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidEventId {
        id: id.to_string(),
        reason: reason.to_string(),
    };
    if id.is_empty() {
        return Err(invalid("id cannot be empty"));
    }
    for segment in id.split(':') {
        if segment.is_empty() {
            return Err(invalid("empty segment"));
        }
        if !segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(invalid("only letters, digits and '_' are allowed"));
        }
    }
    Ok(())
}

fn generated_id() -> String {
    format!("ev_{}", Uuid::new_v4().simple())
}

pub(crate) struct EventInner {
    key: EventKey,
    id: String,
    uid: String,
    data_type: Option<ValueType>,
    flags: BTreeMap<String, Flag>,
    copy_on_set: AtomicBool,
    publish_lock: Mutex<()>,
    state: Mutex<History>,
    dispatcher: Weak<DispatcherInner>,
}

impl Drop for EventInner {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.retire_event(self.key);
        }
    }
}

/// Handle to an event. Clones refer to the same event.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("uid", &self.inner.uid)
            .field("data_type", &self.inner.data_type)
            .field("flags", &self.inner.flags.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Event {}

impl Event {
    /// Starts building an event registered with `dispatcher`.
    #[must_use]
    pub fn builder(dispatcher: &Dispatcher) -> EventBuilder {
        EventBuilder::new(dispatcher)
    }

    pub(crate) fn from_inner(inner: Arc<EventInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<EventInner> {
        Arc::downgrade(&self.inner)
    }

    #[must_use]
    pub fn key(&self) -> EventKey {
        self.inner.key
    }

    /// Local id (without namespace).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Globally unique id, `parent:id` inside a container.
    #[must_use]
    pub fn uid(&self) -> &str {
        &self.inner.uid
    }

    #[must_use]
    pub fn data_type(&self) -> Option<ValueType> {
        self.inner.data_type
    }

    /// Declared flag schema.
    pub fn flags(&self) -> impl Iterator<Item = &Flag> {
        self.inner.flags.values()
    }

    /// False once a payload failed to copy and the event switched to aliasing.
    #[must_use]
    pub fn copies_on_set(&self) -> bool {
        self.inner.copy_on_set.load(Ordering::Acquire)
    }

    /// The owning dispatcher, if it is still alive.
    #[must_use]
    pub fn dispatcher(&self) -> Option<Dispatcher> {
        self.inner.dispatcher.upgrade().map(Dispatcher::from_inner)
    }

    fn require_dispatcher(&self) -> EventResult<Arc<DispatcherInner>> {
        self.inner
            .dispatcher
            .upgrade()
            .ok_or(EventError::Execution(ExecutionError::DispatcherGone))
    }

    fn state(&self) -> MutexGuard<'_, History> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes `data` with `flags`.
    ///
    /// Validates first; nothing is recorded or dispatched on error. Returns
    /// after every subscriber of this event has been offered the publish and
    /// inline callbacks have run.
    pub fn set(&self, data: impl Into<Value>, flags: Flags) -> EventResult<()> {
        let data = data.into();
        self.validate(&flags, &data)?;
        let data = self.detach(data);

        let publish = self
            .inner
            .publish_lock
            .lock()
            .map_err(|_| EventError::poisoned(format!("publish lock of '{}'", self.inner.uid)))?;

        let at = Instant::now();
        let entry = HistoryEntry {
            at,
            recorded_at: Utc::now(),
            flags,
            data,
        };
        // Recorded before the registry lock: a stale-window subscriber
        // registering in between sees this fact twice (prefill and live).
        self.state().record(entry.clone());

        let dispatcher = self.inner.dispatcher.upgrade();
        let deferred = match &dispatcher {
            Some(d) => d.publish(self, &entry),
            None => return Ok(()),
        };
        drop(publish);

        if let Some(d) = dispatcher {
            d.run_deferred(deferred);
        }
        Ok(())
    }

    /// Publishes a null payload with no flags.
    pub fn trigger(&self) -> EventResult<()> {
        self.set(Value::Null, Flags::new())
    }

    fn validate(&self, flags: &Flags, data: &Value) -> Result<(), ValidationError> {
        for (name, value) in flags {
            let Some(flag) = self.inner.flags.get(name) else {
                return Err(ValidationError::UnknownFlag {
                    event: self.inner.uid.clone(),
                    flag: name.clone(),
                });
            };
            if !flag.accepts(value) {
                return Err(ValidationError::FlagTypeMismatch {
                    flag: name.clone(),
                    expected: flag.describe(),
                    actual: value.type_name().to_string(),
                });
            }
        }
        if let Some(expected) = self.inner.data_type {
            if !data.is_null() && data.value_type() != expected {
                return Err(ValidationError::DataTypeMismatch {
                    event: self.inner.uid.clone(),
                    expected: expected.name().to_string(),
                    actual: data.type_name().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Owned plain values are already private; only shared payloads need a copy.
    fn detach(&self, data: Value) -> Value {
        if !data.has_shared() || !self.copies_on_set() {
            return data;
        }
        match data.deep_copy() {
            Ok(copy) => copy,
            Err(e) => {
                if self.inner.copy_on_set.swap(false, Ordering::AcqRel) {
                    tracing::warn!(
                        event = %self.inner.uid,
                        error = %e,
                        "payload cannot be copied; storing references from now on"
                    );
                }
                data
            }
        }
    }

    /// The most recently published value (`Null` before the first publish).
    ///
    /// With `copy`, shared payloads are deep-copied; a payload that refuses to
    /// copy is returned by reference.
    #[must_use]
    pub fn get_data(&self, copy: bool) -> Value {
        let current = self.state().current().clone();
        if !copy || !current.has_shared() {
            return current;
        }
        current.deep_copy().unwrap_or_else(|e| {
            tracing::warn!(event = %self.inner.uid, error = %e, "returning shared payload by reference");
            current
        })
    }

    /// Newest publish within `window` accepted by `predicate`.
    #[must_use]
    pub fn first_match_in_window(
        &self,
        predicate: Option<&Predicate>,
        window: Duration,
    ) -> Option<HistoryEntry> {
        self.first_match_at(predicate, window, Instant::now())
    }

    pub(crate) fn first_match_at(
        &self,
        predicate: Option<&Predicate>,
        window: Duration,
        now: Instant,
    ) -> Option<HistoryEntry> {
        self.state().newest_match(predicate, window, now).cloned()
    }

    #[must_use]
    pub fn has_match_in_window(&self, predicate: Option<&Predicate>, window: Duration) -> bool {
        self.first_match_in_window(predicate, window).is_some()
    }

    /// Retained history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<HistoryEntry> {
        let mut state = self.state();
        state.prune(Instant::now());
        state.entries().cloned().collect()
    }

    #[must_use]
    pub fn history_len(&self) -> usize {
        let mut state = self.state();
        state.prune(Instant::now());
        state.len()
    }

    #[must_use]
    pub fn max_history_age(&self) -> Duration {
        self.state().max_age()
    }

    /// Prunes history as if the current time were `now`.
    pub fn prune_history_at(&self, now: Instant) {
        self.state().prune(now);
    }

    /// Grows the history age so a stale window of `window` can be served.
    pub(crate) fn ensure_history_age(&self, window: Duration) {
        let mut state = self.state();
        if window > state.max_age() {
            tracing::debug!(
                event = %self.inner.uid,
                from_ms = state.max_age().as_millis() as u64,
                to_ms = window.as_millis() as u64,
                "extending history age"
            );
            state.set_max_age(window);
        }
    }

    /// Blocks until a publish accepted by `predicate` happens.
    ///
    /// With `stale_window`, a matching publish from the last `stale_window`
    /// satisfies the wait immediately.
    pub fn wait(
        &self,
        predicate: Option<Predicate>,
        timeout: Option<Duration>,
        stale_window: Option<Duration>,
    ) -> EventResult<WaitOutcome> {
        let dispatcher = Dispatcher::from_inner(self.require_dispatcher()?);
        let subscriber = Subscriber::builder(&dispatcher)
            .name(format!("{}_wait", self.inner.uid))
            .member(MemberSpec::Event(self.clone(), predicate))
            .once(true)
            .stale_window(stale_window)
            .build_detached()?;

        let stream = subscriber.stream(1);
        dispatcher.add_subscriber(&subscriber)?;
        let outcome = stream.recv_timeout(timeout);
        drop(stream);
        subscriber.stop();
        Ok(outcome)
    }

    /// Runs `callback` on a listener thread for every accepted publish.
    ///
    /// The returned [`Listener`] stops when dropped.
    pub fn on<F>(&self, callback: F, options: ListenOptions) -> EventResult<Listener>
    where
        F: Fn(&SubscriberMatch) + Send + Sync + 'static,
    {
        let dispatcher = Dispatcher::from_inner(self.require_dispatcher()?);
        let target = Subscriber::builder(&dispatcher)
            .name(format!("{}_listener", self.inner.uid))
            .member(MemberSpec::Event(self.clone(), options.predicate.clone()))
            .once(options.once)
            .stale_window(options.stale_window)
            .build_detached()?;
        let callback: MatchCallback = Arc::new(callback);
        Listener::start(&dispatcher, target, true, callback, options)
    }
}

/// Builder for [`Event`].
#[derive(Debug)]
pub struct EventBuilder {
    dispatcher: Dispatcher,
    id: Option<String>,
    namespace: Option<String>,
    container: Option<Arc<container::ContainerInner>>,
    data_type: Option<ValueType>,
    flags: Vec<Flag>,
    copy_on_set: bool,
    max_history_age: Option<Duration>,
}

impl EventBuilder {
    fn new(dispatcher: &Dispatcher) -> Self {
        Self {
            dispatcher: dispatcher.clone(),
            id: None,
            namespace: None,
            container: None,
            data_type: None,
            flags: Vec::new(),
            copy_on_set: true,
            max_history_age: None,
        }
    }

    /// Local id; generated when omitted.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Declared payload type; `Null` is always accepted.
    #[must_use]
    pub fn data_type(mut self, data_type: ValueType) -> Self {
        self.data_type = Some(data_type);
        self
    }

    #[must_use]
    pub fn flag(mut self, flag: Flag) -> Self {
        self.flags.push(flag);
        self
    }

    #[must_use]
    pub fn flags(mut self, flags: impl IntoIterator<Item = Flag>) -> Self {
        self.flags.extend(flags);
        self
    }

    /// Whether shared payloads are deep-copied on publish (default true).
    #[must_use]
    pub fn copy_on_set(mut self, copy: bool) -> Self {
        self.copy_on_set = copy;
        self
    }

    #[must_use]
    pub fn max_history_age(mut self, age: Duration) -> Self {
        self.max_history_age = Some(age);
        self
    }

    pub(crate) fn within(mut self, container: Arc<container::ContainerInner>) -> Self {
        self.namespace = Some(container.id().to_string());
        self.container = Some(container);
        self
    }

    /// Validates the schema, registers the event and returns it.
    pub fn build(self) -> EventResult<Event> {
        let id = self.id.unwrap_or_else(generated_id);
        validate_id(&id)?;
        let uid = match &self.namespace {
            Some(ns) => format!("{ns}:{id}"),
            None => id.clone(),
        };

        let mut flags = BTreeMap::new();
        for flag in self.flags {
            if flags.contains_key(flag.id()) {
                return Err(ValidationError::DuplicateFlag {
                    event: uid,
                    flag: flag.id().to_string(),
                }
                .into());
            }
            flags.insert(flag.id().to_string(), flag);
        }

        let config = self.dispatcher.config();
        let max_age = self.max_history_age.unwrap_or(config.default_history_age);
        let event = Event {
            inner: Arc::new(EventInner {
                key: EventKey::new(),
                id: id.clone(),
                uid,
                data_type: self.data_type,
                flags,
                copy_on_set: AtomicBool::new(self.copy_on_set),
                publish_lock: Mutex::new(()),
                state: Mutex::new(History::new(max_age)),
                dispatcher: self.dispatcher.downgrade(),
            }),
        };

        self.dispatcher.add_event(&event)?;
        if let Some(container) = self.container {
            container.track(id, &event)?;
        }
        tracing::debug!(event = %event.uid(), "event registered");
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flag::flags;
    use crate::predicate::flag_equals;
    use crate::value::{PayloadCopyError, SharedPayload};
    use std::any::Any;

    #[test]
    fn test_validate_id() {
        assert!(validate_id("robot_ready").is_ok());
        assert!(validate_id("device:7:heartbeat").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("a::b").is_err());
        assert!(validate_id("bad-id").is_err());
        assert!(validate_id("sp ace").is_err());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let d = Dispatcher::new();
        let a = Event::builder(&d).build().unwrap();
        let b = Event::builder(&d).build().unwrap();
        assert_ne!(a.uid(), b.uid());
        assert!(a.uid().starts_with("ev_"));
    }

    #[test]
    fn test_duplicate_flag_rejected() {
        let d = Dispatcher::new();
        let err = Event::builder(&d)
            .id("dup")
            .flag(Flag::new("level", ValueType::String))
            .flag(Flag::new("level", ValueType::Int))
            .build()
            .unwrap_err();
        assert!(matches!(err, EventError::Validation(ValidationError::DuplicateFlag { .. })));
    }

    #[test]
    fn test_set_validates_before_recording() {
        let d = Dispatcher::new();
        let e = Event::builder(&d)
            .id("typed")
            .data_type(ValueType::Int)
            .flag(Flag::new("level", ValueType::String))
            .build()
            .unwrap();

        let err = e.set(1, flags([("level", 123)])).unwrap_err();
        assert!(matches!(
            err,
            EventError::Validation(ValidationError::FlagTypeMismatch { .. })
        ));
        let err = e.set(1, flags([("unknown", "x")])).unwrap_err();
        assert!(matches!(err, EventError::Validation(ValidationError::UnknownFlag { .. })));
        let err = e.set("nope", Flags::new()).unwrap_err();
        assert!(matches!(
            err,
            EventError::Validation(ValidationError::DataTypeMismatch { .. })
        ));
        assert_eq!(e.history_len(), 0);

        // Null bypasses the data type check; missing flags are fine.
        e.set(Value::Null, Flags::new()).unwrap();
        e.set(5, flags([("level", "high")])).unwrap();
        assert_eq!(e.history_len(), 2);
        assert_eq!(e.get_data(false), Value::from(5));
    }

    #[test]
    fn test_first_match_in_window() {
        let d = Dispatcher::new();
        let e = Event::builder(&d)
            .id("lvl")
            .flag(Flag::new("level", ValueType::String))
            .build()
            .unwrap();
        e.set(1, flags([("level", "x")])).unwrap();
        e.set(2, flags([("level", "x")])).unwrap();
        e.set(3, flags([("level", "z")])).unwrap();

        let hit = e
            .first_match_in_window(Some(&flag_equals("level", "x")), Duration::from_secs(1))
            .unwrap();
        assert_eq!(hit.data, Value::from(2));
        assert!(!e.has_match_in_window(Some(&flag_equals("level", "q")), Duration::from_secs(1)));
    }

    #[test]
    fn test_history_is_ordered_and_prunable() {
        let d = Dispatcher::new();
        let e = Event::builder(&d)
            .id("hist")
            .max_history_age(Duration::from_millis(200))
            .build()
            .unwrap();
        for i in 0..5 {
            e.set(i, Flags::new()).unwrap();
        }
        let history = e.history();
        assert!(history.windows(2).all(|w| w[0].at <= w[1].at));
        e.prune_history_at(Instant::now() + Duration::from_secs(1));
        assert_eq!(e.history_len(), 0);
        assert_eq!(e.get_data(false), Value::from(4));
    }

    #[test]
    fn test_history_reads_drop_expired_entries() {
        let d = Dispatcher::new();
        let e = Event::builder(&d)
            .id("short")
            .max_history_age(Duration::from_millis(30))
            .build()
            .unwrap();
        e.set(1, Flags::new()).unwrap();
        e.set(2, Flags::new()).unwrap();
        assert_eq!(e.history_len(), 2);

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(e.history_len(), 0);
        assert!(e.history().is_empty());
        assert_eq!(e.get_data(false), Value::from(2));
    }

    #[derive(Debug)]
    struct Opaque;

    impl SharedPayload for Opaque {
        fn type_name(&self) -> &'static str {
            "Opaque"
        }

        fn deep_copy(&self) -> Result<Arc<dyn SharedPayload>, PayloadCopyError> {
            Err(PayloadCopyError {
                type_name: "Opaque".to_string(),
                reason: "holds a device handle".to_string(),
            })
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_uncopyable_payload_falls_back_to_aliasing() {
        let d = Dispatcher::new();
        let e = Event::builder(&d).id("opaque").build().unwrap();
        assert!(e.copies_on_set());

        let payload = Value::shared(Opaque);
        e.set(payload.clone(), Flags::new()).unwrap();
        assert!(!e.copies_on_set());
        assert!(e.get_data(true).shares_with(&payload));
    }

    #[test]
    fn test_ensure_history_age_only_grows() {
        let d = Dispatcher::new();
        let e = Event::builder(&d)
            .id("grow")
            .max_history_age(Duration::from_secs(1))
            .build()
            .unwrap();
        e.ensure_history_age(Duration::from_secs(30));
        assert_eq!(e.max_history_age(), Duration::from_secs(30));
        e.ensure_history_age(Duration::from_secs(5));
        assert_eq!(e.max_history_age(), Duration::from_secs(30));
    }
}
