//! Read-only reconstruction of a subscriber match from recent facts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::subscriber::{
    history_payload, Combinator, EntryPayload, MatchEntry, MemberTarget, Subscriber, SubscriberMatch,
};

/// A match `sub` could have produced within `window` of `now`.
///
/// Prefers a match the subscriber actually produced; otherwise rebuilds one
/// from member history. AND needs every position, OR takes the newest fact.
/// Nothing is mutated except history ages, which grow to cover `window`.
pub(crate) fn snapshot_match(
    sub: &Subscriber,
    window: Duration,
    now: Instant,
) -> Option<Arc<SubscriberMatch>> {
    if let Some(m) = sub.latest_match_at(window, now) {
        return Some(m);
    }

    let core = sub.core();
    let mut found = Vec::with_capacity(core.members.len());
    for (pos, member) in core.members.iter().enumerate() {
        let payload = match &member.target {
            MemberTarget::Subscriber(child) => {
                snapshot_match(child, window, now).map(EntryPayload::Nested)
            }
            target => target.event().and_then(|event| {
                event.ensure_history_age(window);
                event
                    .first_match_at(member.predicate.as_ref(), window, now)
                    .map(history_payload)
            }),
        };
        match payload {
            Some(p) => found.push(MatchEntry::new(pos, member.node.clone(), p)),
            None if sub.combinator() == Combinator::And => return None,
            None => {}
        }
    }

    let entries = match sub.combinator() {
        Combinator::And => found,
        Combinator::Or => {
            let newest = found.into_iter().max_by_key(|e| e.payload().time())?;
            vec![newest]
        }
    };
    if entries.is_empty() {
        return None;
    }
    Some(Arc::new(SubscriberMatch::assemble(
        sub.id(),
        sub.name(),
        sub.combinator(),
        core.members.len(),
        entries,
        now,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::event::Event;
    use crate::flag::Flags;
    use crate::subscriber::MatchData;
    use crate::value::Value;

    #[test]
    fn test_and_snapshot_needs_every_member() {
        let d = Dispatcher::new();
        let a = Event::builder(&d).id("a").build().unwrap();
        let b = Event::builder(&d).id("b").build().unwrap();
        let s = Subscriber::builder(&d).members([&a, &b]).build().unwrap();

        a.set(1, Flags::new()).unwrap();
        assert!(snapshot_match(&s, Duration::from_secs(1), Instant::now()).is_none());

        // Fires live; the snapshot then reuses the produced match.
        b.set(2, Flags::new()).unwrap();
        let m = snapshot_match(&s, Duration::from_secs(1), Instant::now()).unwrap();
        assert_eq!(m.data().value_of("b"), Some(&Value::from(2)));
    }

    #[test]
    fn test_or_snapshot_picks_newest() {
        let d = Dispatcher::new();
        let a = Event::builder(&d).id("a").build().unwrap();
        let b = Event::builder(&d).id("b").build().unwrap();
        // Built after the publishes, so it has no matches of its own.
        b.set("older", Flags::new()).unwrap();
        a.set("newer", Flags::new()).unwrap();
        let s = Subscriber::builder(&d)
            .members([&a, &b])
            .combinator(Combinator::Or)
            .build()
            .unwrap();

        let m = snapshot_match(&s, Duration::from_secs(1), Instant::now()).unwrap();
        assert_eq!(m.matched_positions(), &[0]);
        assert_eq!(m.data(), MatchData::Value(Value::from("newer")));
    }

    #[test]
    fn test_snapshot_extends_history_age() {
        let d = Dispatcher::new();
        let a = Event::builder(&d)
            .id("a")
            .max_history_age(Duration::from_secs(1))
            .build()
            .unwrap();
        let s = Subscriber::builder(&d).member(&a).build().unwrap();
        let _ = snapshot_match(&s, Duration::from_secs(60), Instant::now());
        assert_eq!(a.max_history_age(), Duration::from_secs(60));
    }
}
