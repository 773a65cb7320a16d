//! Match records produced when a subscriber fires.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::event::EventKey;
use crate::flag::Flags;
use crate::glob::GlobPattern;
use crate::value::Value;

use super::{Combinator, SubscriberId};

/// Identity of one member of a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MatchNode {
    /// A concrete event.
    Event { key: EventKey, uid: String },
    /// A nested subscriber.
    Subscriber { id: SubscriberId, name: String },
}

impl MatchNode {
    /// Event uid or subscriber name.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Event { uid, .. } => uid,
            Self::Subscriber { name, .. } => name,
        }
    }

    #[must_use]
    pub const fn event_key(&self) -> Option<EventKey> {
        match self {
            Self::Event { key, .. } => Some(*key),
            Self::Subscriber { .. } => None,
        }
    }

    #[must_use]
    pub const fn subscriber_id(&self) -> Option<SubscriberId> {
        match self {
            Self::Subscriber { id, .. } => Some(*id),
            Self::Event { .. } => None,
        }
    }
}

impl fmt::Display for MatchNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What satisfied a member position.
#[derive(Debug, Clone)]
pub enum EntryPayload {
    /// A publish of the member event.
    Event {
        flags: Flags,
        data: Value,
        at: Instant,
        recorded_at: DateTime<Utc>,
    },
    /// A match of the member subscriber.
    Nested(Arc<SubscriberMatch>),
}

impl EntryPayload {
    /// When the underlying fact happened.
    #[must_use]
    pub fn time(&self) -> Instant {
        match self {
            Self::Event { at, .. } => *at,
            Self::Nested(m) => m.time(),
        }
    }
}

/// One satisfied member position inside a match.
#[derive(Debug, Clone)]
pub struct MatchEntry {
    position: usize,
    node: MatchNode,
    payload: EntryPayload,
}

impl MatchEntry {
    pub(crate) fn new(position: usize, node: MatchNode, payload: EntryPayload) -> Self {
        Self {
            position,
            node,
            payload,
        }
    }

    /// Member position inside the subscriber.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.position
    }

    #[must_use]
    pub fn node(&self) -> &MatchNode {
        &self.node
    }

    #[must_use]
    pub fn payload(&self) -> &EntryPayload {
        &self.payload
    }

    /// The nested match when this member is a subscriber.
    #[must_use]
    pub fn nested(&self) -> Option<&Arc<SubscriberMatch>> {
        match &self.payload {
            EntryPayload::Nested(m) => Some(m),
            EntryPayload::Event { .. } => None,
        }
    }

    /// Flags of the publish, or of the nested match's primary cause.
    #[must_use]
    pub fn flags(&self) -> Option<&Flags> {
        match &self.payload {
            EntryPayload::Event { flags, .. } => Some(flags),
            EntryPayload::Nested(m) => m.flags(),
        }
    }

    /// Payload of this member, recursing into nested matches.
    #[must_use]
    pub fn data(&self) -> MatchData {
        match &self.payload {
            EntryPayload::Event { data, .. } => MatchData::Value(data.clone()),
            EntryPayload::Nested(m) => m.data(),
        }
    }
}

/// Data reported by a match.
///
/// Single-member subscribers and OR subscribers report the primary member's
/// data directly; multi-member AND subscribers report one entry per member.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchData {
    Value(Value),
    Keyed(Vec<(MatchNode, MatchData)>),
}

impl MatchData {
    #[must_use]
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Keyed(_) => None,
        }
    }

    /// Entry for the member labelled `label` (event uid or subscriber name).
    #[must_use]
    pub fn get(&self, label: &str) -> Option<&MatchData> {
        match self {
            Self::Keyed(entries) => entries
                .iter()
                .find(|(node, _)| node.label() == label)
                .map(|(_, d)| d),
            Self::Value(_) => None,
        }
    }

    /// Shorthand for `get(label)?.as_value()`.
    #[must_use]
    pub fn value_of(&self, label: &str) -> Option<&Value> {
        self.get(label).and_then(MatchData::as_value)
    }
}

/// A leaf publish that contributed to a match.
#[derive(Debug, Clone, Copy)]
pub struct Cause<'a> {
    pub event: &'a MatchNode,
    pub flags: &'a Flags,
    pub data: &'a Value,
    pub at: Instant,
}

/// Record of one firing of a subscriber.
///
/// Shared as `Arc<SubscriberMatch>` between waiters, callbacks and parent
/// subscribers; immutable once built.
#[derive(Debug, Clone)]
pub struct SubscriberMatch {
    time: Instant,
    recorded_at: DateTime<Utc>,
    subscriber: SubscriberId,
    subscriber_name: String,
    combinator: Combinator,
    member_count: usize,
    entries: Vec<MatchEntry>,
    matched: Vec<usize>,
}

impl SubscriberMatch {
    /// `entries` must be the finished positions in ascending order.
    pub(crate) fn assemble(
        subscriber: SubscriberId,
        subscriber_name: &str,
        combinator: Combinator,
        member_count: usize,
        entries: Vec<MatchEntry>,
        time: Instant,
    ) -> Self {
        let matched = match combinator {
            Combinator::And => entries.iter().map(MatchEntry::position).collect(),
            Combinator::Or => entries.first().map(MatchEntry::position).into_iter().collect(),
        };
        Self {
            time,
            recorded_at: Utc::now(),
            subscriber,
            subscriber_name: subscriber_name.to_string(),
            combinator,
            member_count,
            entries,
            matched,
        }
    }

    #[must_use]
    pub const fn time(&self) -> Instant {
        self.time
    }

    #[must_use]
    pub const fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }

    #[must_use]
    pub const fn subscriber_id(&self) -> SubscriberId {
        self.subscriber
    }

    #[must_use]
    pub fn subscriber_name(&self) -> &str {
        &self.subscriber_name
    }

    #[must_use]
    pub const fn combinator(&self) -> Combinator {
        self.combinator
    }

    /// All satisfied positions, ascending.
    #[must_use]
    pub fn entries(&self) -> &[MatchEntry] {
        &self.entries
    }

    /// Entry for member `position`, if it was satisfied.
    #[must_use]
    pub fn entry(&self, position: usize) -> Option<&MatchEntry> {
        self.entries.iter().find(|e| e.position == position)
    }

    /// Positions that constitute the match: every member for AND, the first
    /// satisfied member for OR.
    #[must_use]
    pub fn matched_positions(&self) -> &[usize] {
        &self.matched
    }

    /// The entry that defines this match (first matched position).
    #[must_use]
    pub fn primary(&self) -> Option<&MatchEntry> {
        self.matched.first().and_then(|p| self.entry(*p))
    }

    #[must_use]
    pub fn data(&self) -> MatchData {
        if self.member_count <= 1 || self.combinator == Combinator::Or {
            return self
                .primary()
                .map_or(MatchData::Value(Value::Null), MatchEntry::data);
        }
        MatchData::Keyed(
            self.entries
                .iter()
                .map(|e| (e.node.clone(), e.data()))
                .collect(),
        )
    }

    /// Flags of the primary cause.
    #[must_use]
    pub fn flags(&self) -> Option<&Flags> {
        self.primary().and_then(MatchEntry::flags)
    }

    /// Every leaf publish contributing to this match, depth-first.
    #[must_use]
    pub fn causes(&self) -> Vec<Cause<'_>> {
        let mut out = Vec::new();
        self.collect_causes(&mut out);
        out
    }

    fn collect_causes<'a>(&'a self, out: &mut Vec<Cause<'a>>) {
        for entry in &self.entries {
            match &entry.payload {
                EntryPayload::Event { flags, data, at, .. } => out.push(Cause {
                    event: &entry.node,
                    flags,
                    data,
                    at: *at,
                }),
                EntryPayload::Nested(m) => m.collect_causes(out),
            }
        }
    }

    /// Uids of the leaf events that caused this match.
    #[must_use]
    pub fn cause_uids(&self) -> Vec<&str> {
        self.causes().iter().map(|c| c.event.label()).collect()
    }

    /// True if some leaf cause has a uid matching `pattern`.
    #[must_use]
    pub fn caused_by(&self, pattern: &GlobPattern) -> bool {
        self.causes().iter().any(|c| pattern.matches(c.event.label()))
    }

    /// The match produced by subscriber `id` inside this tree, if any.
    #[must_use]
    pub fn group_match(&self, id: SubscriberId) -> Option<&SubscriberMatch> {
        if self.subscriber == id {
            return Some(self);
        }
        self.entries
            .iter()
            .filter_map(MatchEntry::nested)
            .find_map(|m| m.group_match(id))
    }

    /// True if subscriber `id` took part in this match.
    #[must_use]
    pub fn contains_subscriber(&self, id: SubscriberId) -> bool {
        self.group_match(id).is_some()
    }
}
