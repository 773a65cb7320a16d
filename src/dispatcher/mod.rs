//! Routing of publishes to subscribers.
//!
//! The dispatcher keeps a registry of live events and subscribers behind a
//! single lock. A publish takes the lock, offers the payload to every
//! subscriber of the event, propagates fired matches up to parent
//! subscribers, and releases the lock before any user callback runs.
//!
//! Lock order: event publish lock, registry, subscriber state, then the leaf
//! locks (event history, waiter queues, retired events).

mod config;
mod snapshot;

pub use config::DispatcherConfig;

pub(crate) use snapshot::snapshot_match;

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Instant;

use crate::error::{EventError, EventResult, ExecutionError, ValidationError};
use crate::event::{Event, EventInner, EventKey, HistoryEntry};
use crate::runtime::{CallbackPolicy, CallbackPool, Job};
use crate::subscriber::{MatchCallback, Subscriber, SubscriberId, SubscriberMatch};

/// A callback collected during a dispatch pass.
pub(crate) struct PendingCallback {
    pub(crate) callback: MatchCallback,
    pub(crate) policy: CallbackPolicy,
    pub(crate) matched: Arc<SubscriberMatch>,
}

/// Work produced under the registry lock and finished after it is released.
#[derive(Default)]
pub(crate) struct Deferred {
    pub(crate) callbacks: Vec<PendingCallback>,
    /// One-shot subscribers that fired and must be deregistered.
    pub(crate) finished: Vec<SubscriberId>,
}

struct EventSlot {
    uid: String,
    handle: Weak<EventInner>,
}

#[derive(Default)]
struct Registry {
    events: HashMap<EventKey, EventSlot>,
    uids: HashMap<String, EventKey>,
    subscribers: HashMap<SubscriberId, Subscriber>,
    by_event: HashMap<EventKey, Vec<SubscriberId>>,
    /// Child subscriber -> subscribers that have it as a member.
    parents: HashMap<SubscriberId, Vec<SubscriberId>>,
    patterns: Vec<SubscriberId>,
}

fn push_unique(list: &mut Vec<SubscriberId>, id: SubscriberId) {
    if !list.contains(&id) {
        list.push(id);
    }
}

fn remove_from<K: Hash + Eq>(map: &mut HashMap<K, Vec<SubscriberId>>, keys: &[K], id: SubscriberId) {
    for key in keys {
        if let Some(list) = map.get_mut(key) {
            list.retain(|x| *x != id);
            if list.is_empty() {
                map.remove(key);
            }
        }
    }
}

impl Registry {
    fn unregister(&mut self, id: SubscriberId) {
        let Some(sub) = self.subscribers.remove(&id) else {
            return;
        };
        let (keys, children): (Vec<EventKey>, Vec<SubscriberId>) = {
            let core = sub.core();
            (
                core.members.iter().filter_map(|m| m.node.event_key()).collect(),
                core.members.iter().filter_map(|m| m.node.subscriber_id()).collect(),
            )
        };
        remove_from(&mut self.by_event, &keys, id);
        remove_from(&mut self.parents, &children, id);
        self.patterns.retain(|x| *x != id);
        tracing::debug!(subscriber = %sub.name(), "subscriber deregistered");
    }

    /// Offers `matched` from `sub` to every parent, recursively.
    fn propagate(&self, sub: &Subscriber, matched: &Arc<SubscriberMatch>, fx: &mut Deferred) {
        let Some(parents) = self.parents.get(&sub.id()) else {
            return;
        };
        for pid in parents.clone() {
            let Some(parent) = self.subscribers.get(&pid) else {
                continue;
            };
            if let Some(m) = parent.offer_child(sub.id(), matched, fx) {
                self.propagate(parent, &m, fx);
            }
        }
    }

    fn finish(&mut self, fx: &mut Deferred) {
        for id in std::mem::take(&mut fx.finished) {
            self.unregister(id);
        }
    }
}

pub(crate) struct DispatcherInner {
    config: DispatcherConfig,
    registry: Mutex<Registry>,
    retired_events: Mutex<Vec<EventKey>>,
    pool: OnceLock<Option<CallbackPool>>,
}

impl DispatcherInner {
    /// Locks the registry. A poisoned lock is recovered: registry updates
    /// never run user code half way.
    fn registry(&self) -> MutexGuard<'_, Registry> {
        let mut reg = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        self.purge_retired(&mut reg);
        reg
    }

    /// Forgets events whose last handle was dropped.
    fn purge_retired(&self, reg: &mut Registry) {
        let keys = std::mem::take(&mut *self.retired_events.lock().unwrap_or_else(PoisonError::into_inner));
        for key in keys {
            if let Some(slot) = reg.events.remove(&key) {
                if reg.uids.get(&slot.uid) == Some(&key) {
                    reg.uids.remove(&slot.uid);
                }
                tracing::debug!(event = %slot.uid, "event retired");
            }
            for id in reg.by_event.remove(&key).unwrap_or_default() {
                if let Some(sub) = reg.subscribers.get(&id) {
                    if sub.is_pattern() {
                        sub.detach_event(key);
                    }
                }
            }
        }
    }

    /// Called from `EventInner::drop`; must not take the registry lock.
    pub(crate) fn retire_event(&self, key: EventKey) {
        self.retired_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(key);
    }

    fn add_event(&self, event: &Event) -> EventResult<Deferred> {
        let mut fx = Deferred::default();
        let mut reg = self.registry();
        let key = event.key();
        if reg.events.contains_key(&key) {
            return Ok(fx);
        }
        if let Some(existing) = reg.uids.get(event.uid()) {
            let live = reg
                .events
                .get(existing)
                .is_some_and(|slot| slot.handle.strong_count() > 0);
            if live {
                return Err(ValidationError::DuplicateEventId {
                    id: event.uid().to_string(),
                }
                .into());
            }
        }
        reg.uids.insert(event.uid().to_string(), key);
        reg.events.insert(
            key,
            EventSlot {
                uid: event.uid().to_string(),
                handle: event.downgrade(),
            },
        );

        // Late binding: existing pattern subscribers pick up the new event.
        let now = Instant::now();
        for pid in reg.patterns.clone() {
            let Some(ps) = reg.subscribers.get(&pid).cloned() else {
                continue;
            };
            if !ps.pattern().is_some_and(|g| g.matches(event.uid())) {
                continue;
            }
            push_unique(reg.by_event.entry(key).or_default(), pid);
            if let Some(m) = ps.attach_event(event, now, &mut fx) {
                reg.propagate(&ps, &m, &mut fx);
            }
        }
        reg.finish(&mut fx);
        Ok(fx)
    }

    fn add_subscriber(&self, sub: &Subscriber) -> EventResult<Deferred> {
        let mut fx = Deferred::default();
        if sub.is_aborted() {
            return Ok(fx);
        }
        let mut reg = self.registry();
        let id = sub.id();
        if reg.subscribers.contains_key(&id) {
            return Ok(fx);
        }
        reg.subscribers.insert(id, sub.clone());
        let now = Instant::now();

        if let Some(glob) = sub.pattern() {
            reg.patterns.push(id);
            let mut events: Vec<Event> = reg
                .events
                .values()
                .filter(|slot| glob.matches(&slot.uid))
                .filter_map(|slot| slot.handle.upgrade().map(Event::from_inner))
                .collect();
            events.sort_by(|a, b| a.uid().cmp(b.uid()));
            for event in events {
                push_unique(reg.by_event.entry(event.key()).or_default(), id);
                if let Some(m) = sub.attach_event(&event, now, &mut fx) {
                    reg.propagate(sub, &m, &mut fx);
                }
            }
        } else {
            let members = sub.members();
            for node in &members {
                if let Some(key) = node.event_key() {
                    push_unique(reg.by_event.entry(key).or_default(), id);
                }
                if let Some(child) = node.subscriber_id() {
                    push_unique(reg.parents.entry(child).or_default(), id);
                }
            }
            if let Some(m) = sub.prefill(now, &mut fx) {
                reg.propagate(sub, &m, &mut fx);
            }
        }
        tracing::debug!(subscriber = %sub.name(), pattern = sub.is_pattern(), "subscriber registered");
        reg.finish(&mut fx);
        Ok(fx)
    }

    pub(crate) fn remove_subscriber(&self, id: SubscriberId) {
        self.registry().unregister(id);
    }

    /// Offers a publish to every subscriber of `event`. The caller holds the
    /// event's publish lock.
    pub(crate) fn publish(&self, event: &Event, entry: &HistoryEntry) -> Deferred {
        let mut fx = Deferred::default();
        let mut reg = self.registry();
        let key = event.key();
        let Some(ids) = reg.by_event.get(&key).cloned() else {
            return fx;
        };
        for id in ids {
            let Some(sub) = reg.subscribers.get(&id) else {
                continue;
            };
            if let Some(m) = sub.offer_event(key, entry, &mut fx) {
                reg.propagate(sub, &m, &mut fx);
            }
        }
        reg.finish(&mut fx);
        fx
    }

    fn pool(&self) -> Option<&CallbackPool> {
        self.pool
            .get_or_init(|| {
                match CallbackPool::start(self.config.callback_workers, self.config.callback_queue_capacity) {
                    Ok(pool) => Some(pool),
                    Err(e) => {
                        tracing::error!(error = %e, "callback pool unavailable; running callbacks inline");
                        None
                    }
                }
            })
            .as_ref()
    }

    /// Runs `job` on the callback pool, or inline when the pool is
    /// saturated or unavailable.
    fn submit(&self, job: Job) {
        let Some(pool) = self.pool() else {
            job();
            return;
        };
        if let Err((job, e)) = pool.try_submit(job) {
            tracing::warn!(error = %e, "callback pool saturated; running callback inline");
            job();
        }
    }

    /// Runs callbacks collected under the lock.
    pub(crate) fn run_deferred(&self, deferred: Deferred) {
        for pending in deferred.callbacks {
            let PendingCallback {
                callback,
                policy,
                matched,
            } = pending;
            match policy {
                CallbackPolicy::Concurrent => self.submit(Box::new(move || callback(&*matched))),
                CallbackPolicy::Inline => callback(&*matched),
            }
        }
    }
}

/// Handle to the routing engine. Clones share the same registry.
///
/// Events and subscribers hold weak references back to the dispatcher; once
/// every `Dispatcher` handle is dropped, publishes still record history but
/// reach no subscriber.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DispatcherConfig::default())
    }

    #[must_use]
    pub fn with_config(config: DispatcherConfig) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                config,
                registry: Mutex::new(Registry::default()),
                retired_events: Mutex::new(Vec::new()),
                pool: OnceLock::new(),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<DispatcherInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn require(weak: &Weak<DispatcherInner>) -> EventResult<Self> {
        weak.upgrade()
            .map(Self::from_inner)
            .ok_or(EventError::Execution(ExecutionError::DispatcherGone))
    }

    pub(crate) fn downgrade(&self) -> Weak<DispatcherInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn submit(&self, job: Job) {
        self.inner.submit(job);
    }

    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Registers `event`. Idempotent for the same event; a different live
    /// event with the same uid is rejected.
    pub fn add_event(&self, event: &Event) -> EventResult<()> {
        let deferred = self.inner.add_event(event)?;
        self.inner.run_deferred(deferred);
        Ok(())
    }

    /// Registers `subscriber`, attaching pattern events and replaying the
    /// stale window. Idempotent; a stopped subscriber is ignored.
    pub fn add_subscriber(&self, subscriber: &Subscriber) -> EventResult<()> {
        let deferred = self.inner.add_subscriber(subscriber)?;
        self.inner.run_deferred(deferred);
        Ok(())
    }

    /// Live event with the given uid.
    #[must_use]
    pub fn event(&self, uid: &str) -> Option<Event> {
        let reg = self.inner.registry();
        let key = reg.uids.get(uid)?;
        reg.events
            .get(key)
            .and_then(|slot| slot.handle.upgrade())
            .map(Event::from_inner)
    }

    /// Uids of live events, sorted.
    #[must_use]
    pub fn event_uids(&self) -> Vec<String> {
        let reg = self.inner.registry();
        let mut uids: Vec<String> = reg
            .events
            .values()
            .filter(|slot| slot.handle.strong_count() > 0)
            .map(|slot| slot.uid.clone())
            .collect();
        uids.sort();
        uids
    }

    #[must_use]
    pub fn event_count(&self) -> usize {
        self.event_uids().len()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.registry().subscribers.len()
    }

    #[must_use]
    pub fn pattern_count(&self) -> usize {
        self.inner.registry().patterns.len()
    }

    /// Number of registered subscribers watching `event` directly.
    #[must_use]
    pub fn subscribers_of(&self, event: &Event) -> usize {
        self.inner
            .registry()
            .by_event
            .get(&event.key())
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flag::Flags;
    use crate::predicate::Predicate;
    use crate::subscriber::{Combinator, MatchData};
    use crate::value::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_duplicate_uid_rejected_while_live() {
        let d = Dispatcher::new();
        let first = Event::builder(&d).id("robot_ready").build().unwrap();
        let err = Event::builder(&d).id("robot_ready").build().unwrap_err();
        assert!(matches!(
            err,
            EventError::Validation(ValidationError::DuplicateEventId { .. })
        ));

        drop(first);
        let again = Event::builder(&d).id("robot_ready").build();
        assert!(again.is_ok());
    }

    #[test]
    fn test_add_event_is_idempotent() {
        let d = Dispatcher::new();
        let e = Event::builder(&d).id("e").build().unwrap();
        d.add_event(&e).unwrap();
        assert_eq!(d.event_count(), 1);
        assert_eq!(d.event("e"), Some(e));
        assert!(d.event("missing").is_none());
    }

    #[test]
    fn test_dropped_event_is_forgotten() {
        let d = Dispatcher::new();
        let e = Event::builder(&d).id("temp").build().unwrap();
        assert_eq!(d.event_uids(), vec!["temp".to_string()]);
        drop(e);
        assert!(d.event_uids().is_empty());
    }

    #[test]
    fn test_nested_subscriber_propagates() {
        let d = Dispatcher::new();
        let a = Event::builder(&d).id("a").build().unwrap();
        let b = Event::builder(&d).id("b").build().unwrap();
        let c = Event::builder(&d).id("c").build().unwrap();
        let inner = Subscriber::builder(&d)
            .name("inner")
            .members([&a, &b])
            .combinator(Combinator::Or)
            .build()
            .unwrap();
        let outer = Subscriber::builder(&d)
            .name("outer")
            .member(&inner)
            .member(&c)
            .build()
            .unwrap();
        let stream = outer.stream(0);

        c.set(3, Flags::new()).unwrap();
        assert!(stream.try_recv().is_none());
        b.set(2, Flags::new()).unwrap();

        let m = stream.try_recv().unwrap().into_match().unwrap();
        assert_eq!(m.data().value_of("c"), Some(&Value::from(3)));
        assert_eq!(m.data().get("inner"), Some(&MatchData::Value(Value::from(2))));
        assert!(m.contains_subscriber(inner.id()));
    }

    #[test]
    fn test_inline_callbacks_run_before_set_returns() {
        let d = Dispatcher::new();
        let e = Event::builder(&d).id("e").build().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let _s = Subscriber::builder(&d)
            .member(&e)
            .callback_policy(CallbackPolicy::Inline)
            .callback(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap();
        e.set(1, Flags::new()).unwrap();
        e.set(2, Flags::new()).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_callback_may_reenter_dispatcher() {
        let d = Dispatcher::new();
        let a = Event::builder(&d).id("a").build().unwrap();
        let b = Event::builder(&d).id("b").build().unwrap();
        let b2 = b.clone();
        let _relay = Subscriber::builder(&d)
            .member(&a)
            .callback_policy(CallbackPolicy::Inline)
            .callback(move |m| {
                let _ = b2.set(m.data().as_value().cloned().unwrap_or_default(), Flags::new());
            })
            .build()
            .unwrap();
        a.set(42, Flags::new()).unwrap();
        assert_eq!(b.get_data(false), Value::from(42));
    }

    #[test]
    fn test_concurrent_callbacks_run_on_pool() {
        let d = Dispatcher::new();
        let e = Event::builder(&d).id("e").build().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let _s = Subscriber::builder(&d)
            .member(&e)
            .callback(move |_| {
                let name = std::thread::current().name().map(str::to_string);
                let _ = tx.send(name);
            })
            .build()
            .unwrap();
        e.set(1, Flags::new()).unwrap();
        let name = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap_or_default();
        assert!(name.starts_with("eventcore-callback"));
    }

    #[test]
    fn test_panicking_predicate_does_not_break_dispatch() {
        let d = Dispatcher::new();
        let bad = Event::builder(&d).id("bad").build().unwrap();
        let good = Event::builder(&d).id("good").build().unwrap();
        let broken = Subscriber::builder(&d)
            .member((&bad, Predicate::new(|_, _| panic!("broken predicate"))))
            .build()
            .unwrap();
        let watcher = Subscriber::builder(&d).member(&good).build().unwrap();
        let broken_stream = broken.stream(0);
        let stream = watcher.stream(0);

        let setter = {
            let bad = bad.clone();
            std::thread::spawn(move || bad.set(1, Flags::new()))
        };
        assert!(setter.join().unwrap().is_ok());
        assert!(broken_stream.try_recv().is_none());

        good.set(2, Flags::new()).unwrap();
        assert!(stream.try_recv().unwrap().is_matched());
        assert!(Event::builder(&d).id("fresh").build().is_ok());
    }

    #[test]
    fn test_poisoned_registry_is_recovered() {
        let d = Dispatcher::new();
        let e = Event::builder(&d).id("e").build().unwrap();
        let inner = Arc::clone(&d.inner);
        let _ = std::thread::spawn(move || {
            let _guard = inner.registry.lock();
            panic!("poison the registry");
        })
        .join();
        assert!(d.inner.registry.is_poisoned());

        let s = Subscriber::builder(&d).member(&e).build().unwrap();
        let stream = s.stream(0);
        e.set(1, Flags::new()).unwrap();
        assert!(stream.try_recv().unwrap().is_matched());
        assert_eq!(d.event_count(), 1);
    }
}
