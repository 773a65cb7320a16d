//! Bounded-time publish history of an event.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::flag::Flags;
use crate::predicate::{self, Predicate};
use crate::value::Value;

/// One recorded publish.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    /// Monotonic publish time; drives windows and pruning.
    pub at: Instant,
    /// Wall-clock publish time, for reporting.
    pub recorded_at: DateTime<Utc>,
    pub flags: Flags,
    pub data: Value,
}

#[derive(Debug)]
pub(crate) struct History {
    current: Value,
    entries: VecDeque<HistoryEntry>,
    max_age: Duration,
}

impl History {
    pub(crate) fn new(max_age: Duration) -> Self {
        Self {
            current: Value::Null,
            entries: VecDeque::new(),
            max_age,
        }
    }

    pub(crate) fn current(&self) -> &Value {
        &self.current
    }

    pub(crate) fn max_age(&self) -> Duration {
        self.max_age
    }

    pub(crate) fn set_max_age(&mut self, max_age: Duration) {
        self.max_age = max_age;
    }

    /// Appends a publish. Entries arrive in nondecreasing `at` order because
    /// the owning event serializes publishes.
    pub(crate) fn record(&mut self, entry: HistoryEntry) {
        let now = entry.at;
        self.current = entry.data.clone();
        self.entries.push_back(entry);
        self.prune(now);
    }

    /// Drops entries older than `max_age` relative to `now`.
    pub(crate) fn prune(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.max_age) else {
            return;
        };
        while self.entries.front().is_some_and(|e| e.at < cutoff) {
            self.entries.pop_front();
        }
    }

    /// Newest entry within `window` of `now` accepted by `predicate`.
    pub(crate) fn newest_match(
        &mut self,
        predicate: Option<&Predicate>,
        window: Duration,
        now: Instant,
    ) -> Option<&HistoryEntry> {
        if window.is_zero() {
            return None;
        }
        self.prune(now);
        let cutoff = now.checked_sub(window);
        self.entries
            .iter()
            .rev()
            .take_while(|e| cutoff.map_or(true, |c| e.at >= c))
            .find(|e| predicate::accepts(predicate, &e.flags, &e.data))
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flag::flags;
    use crate::predicate::flag_equals;

    fn entry(at: Instant, level: &str, n: i64) -> HistoryEntry {
        HistoryEntry {
            at,
            recorded_at: Utc::now(),
            flags: flags([("level", level)]),
            data: Value::from(n),
        }
    }

    #[test]
    fn test_record_updates_current() {
        let mut h = History::new(Duration::from_secs(10));
        h.record(entry(Instant::now(), "a", 1));
        assert_eq!(h.current(), &Value::from(1));
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn test_prune_removes_exactly_the_stale_entries() {
        let base = Instant::now();
        let mut h = History::new(Duration::from_millis(100));
        h.record(entry(base, "a", 1));
        h.record(entry(base + Duration::from_millis(50), "a", 2));
        h.record(entry(base + Duration::from_millis(120), "a", 3));

        // cutoff = 20ms: only the first entry is older.
        h.prune(base + Duration::from_millis(120));
        let kept: Vec<i64> = h.entries().filter_map(|e| e.data.as_int()).collect();
        assert_eq!(kept, vec![2, 3]);

        h.prune(base + Duration::from_secs(10));
        assert_eq!(h.len(), 0);
        // The current value survives pruning.
        assert_eq!(h.current(), &Value::from(3));
    }

    #[test]
    fn test_newest_match_scans_newest_first() {
        let base = Instant::now();
        let mut h = History::new(Duration::from_secs(10));
        h.record(entry(base, "x", 1));
        h.record(entry(base + Duration::from_millis(1), "x", 2));
        h.record(entry(base + Duration::from_millis(2), "z", 3));

        let pred = flag_equals("level", "x");
        let hit = h
            .newest_match(Some(&pred), Duration::from_secs(1), base + Duration::from_millis(3))
            .unwrap();
        assert_eq!(hit.data, Value::from(2));
    }

    #[test]
    fn test_newest_match_stops_at_window_cutoff() {
        let base = Instant::now();
        let mut h = History::new(Duration::from_secs(10));
        h.record(entry(base, "x", 1));

        let now = base + Duration::from_millis(500);
        assert!(h.newest_match(None, Duration::from_millis(100), now).is_none());
        assert!(h.newest_match(None, Duration::from_secs(1), now).is_some());
        assert!(h.newest_match(None, Duration::ZERO, now).is_none());
    }
}
