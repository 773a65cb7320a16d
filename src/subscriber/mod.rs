//! Subscribers: composite conditions over events and other subscribers.
//!
//! A subscriber has an ordered list of members. Each member is an event
//! (optionally filtered by a predicate) or another subscriber. The subscriber
//! fires when all members (AND) or any member (OR) are satisfied, producing a
//! [`SubscriberMatch`] that is delivered to waiters, callbacks and parent
//! subscribers.
//!
//! Pattern subscribers have no explicit members: every event whose uid matches
//! their glob, now or later, is attached as an OR member.

mod matching;
mod stream;

pub use matching::{Cause, EntryPayload, MatchData, MatchEntry, MatchNode, SubscriberMatch};
pub use stream::{MatchStream, WaitOutcome};

pub(crate) use stream::{Delivery, WaiterSlot};

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dispatcher::{Deferred, Dispatcher, DispatcherInner, PendingCallback};
use crate::error::{EventResult, ValidationError};
use crate::event::{Event, EventInner, EventKey, HistoryEntry};
use crate::glob::GlobPattern;
use crate::listener::{ListenOptions, Listener};
use crate::predicate::{self, Predicate};
use crate::runtime::CallbackPolicy;

/// Process-unique identity of a subscriber.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// How member satisfaction combines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combinator {
    /// Every member must be satisfied.
    #[default]
    And,
    /// Any one member suffices.
    Or,
}

impl fmt::Display for Combinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And => f.write_str("AND"),
            Self::Or => f.write_str("OR"),
        }
    }
}

/// Callback invoked with each match.
pub type MatchCallback = Arc<dyn Fn(&SubscriberMatch) + Send + Sync>;

/// Callback invoked when a wait times out.
pub type TimeoutCallback = Arc<dyn Fn() + Send + Sync>;

/// Describes one member when building a subscriber.
#[derive(Debug, Clone)]
pub enum MemberSpec {
    /// An event, optionally filtered.
    Event(Event, Option<Predicate>),
    /// Every event whose uid matches the glob, through an owned pattern
    /// subscriber.
    Pattern(String, Option<Predicate>),
    /// Another subscriber.
    Subscriber(Subscriber),
}

impl From<&Event> for MemberSpec {
    fn from(e: &Event) -> Self {
        Self::Event(e.clone(), None)
    }
}

impl From<Event> for MemberSpec {
    fn from(e: Event) -> Self {
        Self::Event(e, None)
    }
}

impl From<(&Event, Predicate)> for MemberSpec {
    fn from((e, p): (&Event, Predicate)) -> Self {
        Self::Event(e.clone(), Some(p))
    }
}

impl From<&Subscriber> for MemberSpec {
    fn from(s: &Subscriber) -> Self {
        Self::Subscriber(s.clone())
    }
}

impl From<Subscriber> for MemberSpec {
    fn from(s: Subscriber) -> Self {
        Self::Subscriber(s)
    }
}

impl From<&str> for MemberSpec {
    fn from(glob: &str) -> Self {
        Self::Pattern(glob.to_string(), None)
    }
}

impl From<(&str, Predicate)> for MemberSpec {
    fn from((glob, p): (&str, Predicate)) -> Self {
        Self::Pattern(glob.to_string(), Some(p))
    }
}

pub(crate) enum MemberTarget {
    Event(Event),
    /// Pattern attachment; does not keep the event alive.
    Attached(Weak<EventInner>),
    Subscriber(Subscriber),
}

impl MemberTarget {
    pub(crate) fn event(&self) -> Option<Event> {
        match self {
            Self::Event(e) => Some(e.clone()),
            Self::Attached(w) => w.upgrade().map(Event::from_inner),
            Self::Subscriber(_) => None,
        }
    }
}

pub(crate) struct Member {
    pub(crate) node: MatchNode,
    pub(crate) target: MemberTarget,
    pub(crate) predicate: Option<Predicate>,
    /// `Some` once the position is satisfied.
    pub(crate) state: Option<EntryPayload>,
}

pub(crate) struct Core {
    pub(crate) members: Vec<Member>,
}

impl Core {
    pub(crate) fn is_satisfied(&self, combinator: Combinator) -> bool {
        if self.members.is_empty() {
            return false;
        }
        match combinator {
            Combinator::And => self.members.iter().all(|m| m.state.is_some()),
            Combinator::Or => self.members.iter().any(|m| m.state.is_some()),
        }
    }

    fn reset(&mut self) {
        for member in &mut self.members {
            member.state = None;
        }
    }
}

pub(crate) fn history_payload(entry: HistoryEntry) -> EntryPayload {
    EntryPayload::Event {
        flags: entry.flags,
        data: entry.data,
        at: entry.at,
        recorded_at: entry.recorded_at,
    }
}

pub(crate) struct PatternSpec {
    pub(crate) glob: GlobPattern,
    pub(crate) predicate: Option<Predicate>,
}

pub(crate) struct SubscriberInner {
    id: SubscriberId,
    name: String,
    combinator: Combinator,
    pattern: Option<PatternSpec>,
    once: bool,
    timeout: Option<Duration>,
    stale_window: Option<Duration>,
    save_matches: bool,
    match_retention: Duration,
    queue_capacity: usize,
    callback_policy: CallbackPolicy,
    dispatcher: Weak<DispatcherInner>,
    owned_children: Vec<Subscriber>,
    core: Mutex<Core>,
    recent: Mutex<VecDeque<Arc<SubscriberMatch>>>,
    waiters: Mutex<Vec<WaiterSlot>>,
    next_waiter: AtomicU64,
    callbacks: Mutex<Vec<(MatchCallback, CallbackPolicy)>>,
    timeout_callbacks: Mutex<Vec<TimeoutCallback>>,
    aborted: AtomicBool,
    stopped: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a subscriber. Clones refer to the same subscriber.
#[derive(Clone)]
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("name", &self.inner.name)
            .field("combinator", &self.inner.combinator)
            .field("pattern", &self.inner.pattern.as_ref().map(|p| p.glob.as_str()))
            .field("once", &self.inner.once)
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Subscriber {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Subscriber {}

impl Subscriber {
    /// Starts building a subscriber registered with `dispatcher`.
    #[must_use]
    pub fn builder(dispatcher: &Dispatcher) -> SubscriberBuilder {
        SubscriberBuilder::new(dispatcher, None)
    }

    /// Starts building a pattern subscriber over every event matching `glob`.
    #[must_use]
    pub fn pattern_builder(dispatcher: &Dispatcher, glob: impl Into<String>) -> SubscriberBuilder {
        SubscriberBuilder::new(dispatcher, Some(glob.into()))
    }

    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.inner.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn combinator(&self) -> Combinator {
        self.inner.combinator
    }

    #[must_use]
    pub fn pattern(&self) -> Option<&GlobPattern> {
        self.inner.pattern.as_ref().map(|p| &p.glob)
    }

    #[must_use]
    pub fn is_pattern(&self) -> bool {
        self.inner.pattern.is_some()
    }

    #[must_use]
    pub fn is_once(&self) -> bool {
        self.inner.once
    }

    #[must_use]
    pub fn stale_window(&self) -> Option<Duration> {
        self.inner.stale_window
    }

    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.inner.queue_capacity
    }

    /// True after `stop()` or after a one-shot subscriber fired.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    /// Subscribers created on this subscriber's behalf (pattern members,
    /// compiled sub-expressions).
    #[must_use]
    pub fn owned_children(&self) -> &[Subscriber] {
        &self.inner.owned_children
    }

    /// Current members, in position order.
    #[must_use]
    pub fn members(&self) -> Vec<MatchNode> {
        lock(&self.inner.core).members.iter().map(|m| m.node.clone()).collect()
    }

    pub(crate) fn node(&self) -> MatchNode {
        MatchNode::Subscriber {
            id: self.inner.id,
            name: self.inner.name.clone(),
        }
    }

    pub(crate) fn pattern_spec(&self) -> Option<&PatternSpec> {
        self.inner.pattern.as_ref()
    }

    pub(crate) fn core(&self) -> MutexGuard<'_, Core> {
        lock(&self.inner.core)
    }

    /// Retained matches, oldest first.
    #[must_use]
    pub fn recent_matches(&self) -> Vec<Arc<SubscriberMatch>> {
        lock(&self.inner.recent).iter().cloned().collect()
    }

    /// Newest retained match produced within `window`.
    #[must_use]
    pub fn latest_match_within(&self, window: Duration) -> Option<Arc<SubscriberMatch>> {
        self.latest_match_at(window, Instant::now())
    }

    pub(crate) fn latest_match_at(&self, window: Duration, now: Instant) -> Option<Arc<SubscriberMatch>> {
        if window.is_zero() {
            return None;
        }
        let cutoff = now.checked_sub(window);
        lock(&self.inner.recent)
            .iter()
            .rev()
            .take_while(|m| cutoff.map_or(true, |c| m.time() >= c))
            .next()
            .cloned()
    }

    /// Registers a callback run with every match, using the subscriber's
    /// callback policy.
    pub fn on_finished<F>(&self, callback: F)
    where
        F: Fn(&SubscriberMatch) + Send + Sync + 'static,
    {
        lock(&self.inner.callbacks).push((Arc::new(callback), self.inner.callback_policy));
    }

    /// Registers a callback run when a wait on this subscriber times out.
    pub fn on_timeout<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock(&self.inner.timeout_callbacks).push(Arc::new(callback));
    }

    pub(crate) fn notify_timeout(&self) {
        let callbacks: Vec<TimeoutCallback> = lock(&self.inner.timeout_callbacks).clone();
        tracing::debug!(subscriber = %self.inner.name, callbacks = callbacks.len(), "wait timed out");
        for cb in callbacks {
            cb();
        }
    }

    /// Opens a persistent queue of this subscriber's matches.
    ///
    /// `capacity == 0` is unbounded; otherwise the oldest queued match is
    /// discarded when the queue is full.
    #[must_use]
    pub fn stream(&self, capacity: usize) -> MatchStream {
        let id = self.inner.next_waiter.fetch_add(1, Ordering::Relaxed);
        let slot = WaiterSlot::new(id, capacity);
        let rx = slot.receiver();
        {
            let mut waiters = lock(&self.inner.waiters);
            if self.is_aborted() {
                slot.push(Delivery::Stop);
            }
            waiters.push(slot);
        }
        MatchStream::new(self.clone(), id, rx)
    }

    pub(crate) fn remove_waiter(&self, slot_id: u64) {
        lock(&self.inner.waiters).retain(|s| s.id != slot_id);
    }

    /// Blocks until the next match.
    ///
    /// `timeout` and `stale_window` fall back to the subscriber's own
    /// settings. With a stale window, a match produced within that window
    /// returns immediately. Timeout callbacks run before `Timeout` is
    /// returned.
    pub fn wait(&self, timeout: Option<Duration>, stale_window: Option<Duration>) -> WaitOutcome {
        let timeout = timeout.or(self.inner.timeout);
        if let Some(window) = stale_window.or(self.inner.stale_window) {
            if let Some(m) = self.latest_match_within(window) {
                return WaitOutcome::Matched(m);
            }
        }

        let stream = self.stream(self.inner.queue_capacity);
        let outcome = stream.recv_timeout(timeout);
        drop(stream);
        if outcome.is_timeout() {
            self.notify_timeout();
        }
        outcome
    }

    /// Runs `callback` on a listener thread for every match.
    pub fn on<F>(&self, callback: F, options: ListenOptions) -> EventResult<Listener>
    where
        F: Fn(&SubscriberMatch) + Send + Sync + 'static,
    {
        let dispatcher = Dispatcher::require(&self.inner.dispatcher)?;
        let callback: MatchCallback = Arc::new(callback);
        Listener::start(&dispatcher, self.clone(), false, callback, options)
    }

    /// Deregisters the subscriber and wakes every waiter with `Aborted`.
    /// Idempotent.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.aborted.store(true, Ordering::Release);
        if let Some(dispatcher) = self.inner.dispatcher.upgrade() {
            dispatcher.remove_subscriber(self.inner.id);
        }
        for slot in lock(&self.inner.waiters).iter() {
            slot.push(Delivery::Stop);
        }
        tracing::debug!(subscriber = %self.inner.name, "subscriber stopped");
    }

    /// Stops this subscriber and, depth-first, every owned child.
    pub fn stop_tree(&self) {
        let mut seen = HashSet::new();
        self.stop_tree_inner(&mut seen);
    }

    fn stop_tree_inner(&self, seen: &mut HashSet<SubscriberId>) {
        if !seen.insert(self.inner.id) {
            return;
        }
        for child in &self.inner.owned_children {
            child.stop_tree_inner(seen);
        }
        self.stop();
    }

    /// Offers a publish of event `key`. Called under the registry lock.
    pub(crate) fn offer_event(
        &self,
        key: EventKey,
        entry: &HistoryEntry,
        fx: &mut Deferred,
    ) -> Option<Arc<SubscriberMatch>> {
        if self.is_aborted() {
            return None;
        }
        let mut core = self.core();
        for pos in 0..core.members.len() {
            let member = &mut core.members[pos];
            if member.state.is_some() || member.node.event_key() != Some(key) {
                continue;
            }
            if !predicate::accepts(member.predicate.as_ref(), &entry.flags, &entry.data) {
                continue;
            }
            member.state = Some(history_payload(entry.clone()));
            if core.is_satisfied(self.inner.combinator) {
                return Some(self.fire(&mut core, fx));
            }
        }
        None
    }

    /// Offers a match of member subscriber `child`. Called under the
    /// registry lock.
    pub(crate) fn offer_child(
        &self,
        child: SubscriberId,
        matched: &Arc<SubscriberMatch>,
        fx: &mut Deferred,
    ) -> Option<Arc<SubscriberMatch>> {
        if self.is_aborted() {
            return None;
        }
        let mut core = self.core();
        for pos in 0..core.members.len() {
            let member = &mut core.members[pos];
            if member.state.is_some() || member.node.subscriber_id() != Some(child) {
                continue;
            }
            member.state = Some(EntryPayload::Nested(Arc::clone(matched)));
            if core.is_satisfied(self.inner.combinator) {
                return Some(self.fire(&mut core, fx));
            }
        }
        None
    }

    /// Satisfies members from facts within the stale window. Called once at
    /// registration, under the registry lock.
    pub(crate) fn prefill(&self, now: Instant, fx: &mut Deferred) -> Option<Arc<SubscriberMatch>> {
        let window = self.inner.stale_window.filter(|w| !w.is_zero())?;
        if self.is_aborted() {
            return None;
        }
        let mut core = self.core();
        for member in &mut core.members {
            if member.state.is_some() {
                continue;
            }
            member.state = match &member.target {
                MemberTarget::Subscriber(child) => {
                    crate::dispatcher::snapshot_match(child, window, now).map(EntryPayload::Nested)
                }
                target => target.event().and_then(|event| {
                    event.ensure_history_age(window);
                    event
                        .first_match_at(member.predicate.as_ref(), window, now)
                        .map(history_payload)
                }),
            };
        }

        if self.inner.combinator == Combinator::Or {
            // Report the most recent fact only.
            let newest = core
                .members
                .iter()
                .enumerate()
                .filter_map(|(i, m)| m.state.as_ref().map(|s| (i, s.time())))
                .max_by_key(|(_, t)| *t)
                .map(|(i, _)| i);
            for (i, member) in core.members.iter_mut().enumerate() {
                if Some(i) != newest {
                    member.state = None;
                }
            }
        }

        if core.is_satisfied(self.inner.combinator) {
            tracing::debug!(subscriber = %self.inner.name, "satisfied from stale history");
            return Some(self.fire(&mut core, fx));
        }
        None
    }

    /// Attaches `event` to a pattern subscriber and replays its stale window.
    pub(crate) fn attach_event(
        &self,
        event: &Event,
        now: Instant,
        fx: &mut Deferred,
    ) -> Option<Arc<SubscriberMatch>> {
        let pattern = self.inner.pattern.as_ref()?;
        let mut core = self.core();
        if core.members.iter().any(|m| m.node.event_key() == Some(event.key())) {
            return None;
        }
        core.members.push(Member {
            node: MatchNode::Event {
                key: event.key(),
                uid: event.uid().to_string(),
            },
            target: MemberTarget::Attached(event.downgrade()),
            predicate: pattern.predicate.clone(),
            state: None,
        });
        tracing::debug!(subscriber = %self.inner.name, event = %event.uid(), "pattern attached event");

        if self.is_aborted() {
            return None;
        }
        let window = self.inner.stale_window.filter(|w| !w.is_zero())?;
        event.ensure_history_age(window);
        let hit = event.first_match_at(pattern.predicate.as_ref(), window, now)?;
        if let Some(last) = core.members.last_mut() {
            last.state = Some(history_payload(hit));
        }
        if core.is_satisfied(self.inner.combinator) {
            return Some(self.fire(&mut core, fx));
        }
        None
    }

    pub(crate) fn detach_event(&self, key: EventKey) {
        self.core().members.retain(|m| m.node.event_key() != Some(key));
    }

    fn fire(&self, core: &mut Core, fx: &mut Deferred) -> Arc<SubscriberMatch> {
        let inner = &self.inner;
        let entries = core
            .members
            .iter()
            .enumerate()
            .filter_map(|(i, m)| m.state.clone().map(|p| MatchEntry::new(i, m.node.clone(), p)))
            .collect();
        let now = Instant::now();
        let matched = Arc::new(SubscriberMatch::assemble(
            inner.id,
            &inner.name,
            inner.combinator,
            core.members.len(),
            entries,
            now,
        ));

        if inner.once {
            inner.aborted.store(true, Ordering::Release);
            fx.finished.push(inner.id);
        } else {
            core.reset();
        }

        if inner.save_matches {
            let mut recent = lock(&inner.recent);
            recent.push_back(Arc::clone(&matched));
            if let Some(cutoff) = now.checked_sub(inner.match_retention) {
                while recent.front().is_some_and(|m| m.time() < cutoff) {
                    recent.pop_front();
                }
            }
        }

        for slot in lock(&inner.waiters).iter() {
            slot.push(Delivery::Match(Arc::clone(&matched)));
        }
        for (callback, policy) in lock(&inner.callbacks).iter() {
            fx.callbacks.push(PendingCallback {
                callback: Arc::clone(callback),
                policy: *policy,
                matched: Arc::clone(&matched),
            });
        }

        tracing::debug!(
            subscriber = %inner.name,
            combinator = %inner.combinator,
            causes = ?matched.cause_uids(),
            "subscriber fired"
        );
        matched
    }
}

/// Builder for [`Subscriber`].
pub struct SubscriberBuilder {
    dispatcher: Dispatcher,
    name: Option<String>,
    pattern: Option<String>,
    pattern_predicate: Option<Predicate>,
    members: Vec<MemberSpec>,
    owned: Vec<Subscriber>,
    combinator: Combinator,
    once: bool,
    timeout: Option<Duration>,
    stale_window: Option<Duration>,
    callbacks: Vec<MatchCallback>,
    timeout_callbacks: Vec<TimeoutCallback>,
    callback_policy: CallbackPolicy,
    save_matches: bool,
    match_retention: Option<Duration>,
    queue_capacity: Option<usize>,
}

impl fmt::Debug for SubscriberBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberBuilder")
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .field("members", &self.members.len())
            .field("combinator", &self.combinator)
            .field("once", &self.once)
            .finish_non_exhaustive()
    }
}

impl SubscriberBuilder {
    fn new(dispatcher: &Dispatcher, pattern: Option<String>) -> Self {
        let combinator = if pattern.is_some() {
            Combinator::Or
        } else {
            Combinator::And
        };
        Self {
            dispatcher: dispatcher.clone(),
            name: None,
            pattern,
            pattern_predicate: None,
            members: Vec::new(),
            owned: Vec::new(),
            combinator,
            once: false,
            timeout: None,
            stale_window: None,
            callbacks: Vec::new(),
            timeout_callbacks: Vec::new(),
            callback_policy: CallbackPolicy::default(),
            save_matches: true,
            match_retention: None,
            queue_capacity: None,
        }
    }

    /// Display name; generated when omitted.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn member(mut self, member: impl Into<MemberSpec>) -> Self {
        self.members.push(member.into());
        self
    }

    #[must_use]
    pub fn members<M: Into<MemberSpec>>(mut self, members: impl IntoIterator<Item = M>) -> Self {
        self.members.extend(members.into_iter().map(Into::into));
        self
    }

    pub(crate) fn owned_member(mut self, child: Subscriber) -> Self {
        self.members.push(MemberSpec::Subscriber(child.clone()));
        self.owned.push(child);
        self
    }

    /// Filters attached events of a pattern subscriber.
    #[must_use]
    pub fn predicate(mut self, predicate: Predicate) -> Self {
        self.pattern_predicate = Some(predicate);
        self
    }

    /// Ignored for pattern subscribers, which are always OR.
    #[must_use]
    pub fn combinator(mut self, combinator: Combinator) -> Self {
        if self.pattern.is_none() {
            self.combinator = combinator;
        }
        self
    }

    /// Fire at most once, then deregister.
    #[must_use]
    pub fn once(mut self, once: bool) -> Self {
        self.once = once;
        self
    }

    /// Default timeout for `wait`.
    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Accept facts up to this old when registering.
    #[must_use]
    pub fn stale_window(mut self, window: Option<Duration>) -> Self {
        self.stale_window = window;
        self
    }

    #[must_use]
    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&SubscriberMatch) + Send + Sync + 'static,
    {
        self.callbacks.push(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn on_timeout<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timeout_callbacks.push(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn callback_policy(mut self, policy: CallbackPolicy) -> Self {
        self.callback_policy = policy;
        self
    }

    /// Whether matches are retained for stale lookups (default true).
    #[must_use]
    pub fn save_matches(mut self, save: bool) -> Self {
        self.save_matches = save;
        self
    }

    #[must_use]
    pub fn match_retention(mut self, retention: Duration) -> Self {
        self.match_retention = Some(retention);
        self
    }

    /// Capacity of the queue used by `wait`; 0 is unbounded.
    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Builds and registers the subscriber.
    pub fn build(self) -> EventResult<Subscriber> {
        let dispatcher = self.dispatcher.clone();
        let subscriber = self.build_detached()?;
        dispatcher.add_subscriber(&subscriber)?;
        Ok(subscriber)
    }

    /// Builds without registering; owned pattern children are registered.
    pub(crate) fn build_detached(self) -> EventResult<Subscriber> {
        let name = self
            .name
            .unwrap_or_else(|| format!("sub_{}", Uuid::new_v4().simple()));

        let pattern = match self.pattern {
            Some(raw) => {
                if !self.members.is_empty() {
                    return Err(ValidationError::InvalidPattern {
                        pattern: raw,
                        reason: "pattern subscribers take no explicit members".to_string(),
                    }
                    .into());
                }
                Some(PatternSpec {
                    glob: GlobPattern::new(raw)?,
                    predicate: self.pattern_predicate,
                })
            }
            None => {
                if self.members.is_empty() {
                    return Err(ValidationError::EmptyMembers { subscriber: name }.into());
                }
                None
            }
        };

        // Compile every glob before creating any child.
        for spec in &self.members {
            if let MemberSpec::Pattern(glob, _) = spec {
                GlobPattern::new(glob.as_str())?;
            }
        }

        let mut owned = self.owned;
        let mut members = Vec::with_capacity(self.members.len());
        for spec in self.members {
            let member = match spec {
                MemberSpec::Event(event, predicate) => Member {
                    node: MatchNode::Event {
                        key: event.key(),
                        uid: event.uid().to_string(),
                    },
                    target: MemberTarget::Event(event),
                    predicate,
                    state: None,
                },
                MemberSpec::Subscriber(child) => Member {
                    node: child.node(),
                    target: MemberTarget::Subscriber(child),
                    predicate: None,
                    state: None,
                },
                MemberSpec::Pattern(glob, predicate) => {
                    let mut builder = Subscriber::pattern_builder(&self.dispatcher, glob.as_str())
                        .name(glob)
                        .once(self.once)
                        .stale_window(self.stale_window);
                    if let Some(p) = predicate {
                        builder = builder.predicate(p);
                    }
                    let child = match builder.build() {
                        Ok(child) => child,
                        Err(e) => {
                            for c in &owned {
                                c.stop_tree();
                            }
                            return Err(e);
                        }
                    };
                    owned.push(child.clone());
                    Member {
                        node: child.node(),
                        target: MemberTarget::Subscriber(child),
                        predicate: None,
                        state: None,
                    }
                }
            };
            members.push(member);
        }

        let config = self.dispatcher.config();
        let callbacks = self
            .callbacks
            .into_iter()
            .map(|cb| (cb, self.callback_policy))
            .collect();

        Ok(Subscriber {
            inner: Arc::new(SubscriberInner {
                id: SubscriberId::new(),
                name,
                combinator: self.combinator,
                pattern,
                once: self.once,
                timeout: self.timeout,
                stale_window: self.stale_window,
                save_matches: self.save_matches,
                match_retention: self.match_retention.unwrap_or(config.default_match_retention),
                queue_capacity: self.queue_capacity.unwrap_or(config.default_queue_capacity),
                callback_policy: self.callback_policy,
                dispatcher: self.dispatcher.downgrade(),
                owned_children: owned,
                core: Mutex::new(Core { members }),
                recent: Mutex::new(VecDeque::new()),
                waiters: Mutex::new(Vec::new()),
                next_waiter: AtomicU64::new(0),
                callbacks: Mutex::new(callbacks),
                timeout_callbacks: Mutex::new(self.timeout_callbacks),
                aborted: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        })
    }
}
