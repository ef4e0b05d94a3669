//! Vector clocks and causal value resolution.
//!
//! A [`VectorClock`] tracks, per stable client identifier, a monotonic
//! logical counter and the wall-clock time it was last advanced. Comparing
//! two clocks tells the coordinator whether one write strictly happened
//! after another, or whether the two are concurrent and must be surfaced
//! to the client as siblings.
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Keep at most this many client entries per clock.
const MAX_ENTRIES: usize = 10;

/// Drop entries whose timestamp is older than this, in seconds.
const MAX_ENTRY_AGE_SECS: i64 = 3600;

/// One client's contribution to a [`VectorClock`]: a counter plus the
/// wall-clock time it was last bumped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockEntry {
    pub counter: u64,
    pub timestamp: i64,
}

/// A mapping from client id to `(counter, timestamp)`, used to detect
/// causal dominance and concurrency between writes to the same key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    entries: HashMap<String, ClockEntry>,
}

impl VectorClock {
    /// An empty clock, dominated by nothing and dominating nothing but itself.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance `id`'s counter by one and stamp it with the current time.
    pub fn increment(&mut self, id: &str) -> &mut Self {
        let now = chrono::Utc::now().timestamp();
        let entry = self.entries.entry(id.to_string()).or_insert(ClockEntry {
            counter: 0,
            timestamp: now,
        });
        entry.counter += 1;
        entry.timestamp = now;
        self
    }

    /// True if `self` has seen every id in `other` with a counter at least
    /// as large, and `self` does not have fewer ids than `other`. This is
    /// the dominance test used for conflict detection: if `a.descends_from(b)`
    /// and not `b.descends_from(a)`, `a` strictly dominates `b`.
    pub fn descends_from(&self, other: &VectorClock) -> bool {
        if self.entries.len() < other.entries.len() {
            return false;
        }
        other.entries.iter().all(|(id, other_entry)| {
            self.entries
                .get(id)
                .is_some_and(|mine| mine.counter >= other_entry.counter)
        })
    }

    /// Pointwise max of counters; ties on the counter take the later
    /// timestamp; the id set is the union of both clocks. Commutative,
    /// associative, and idempotent.
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.entries.clone();
        for (id, other_entry) in &other.entries {
            merged
                .entry(id.clone())
                .and_modify(|mine| {
                    if other_entry.counter > mine.counter {
                        *mine = *other_entry;
                    } else if other_entry.counter == mine.counter
                        && other_entry.timestamp > mine.timestamp
                    {
                        mine.timestamp = other_entry.timestamp;
                    }
                })
                .or_insert(*other_entry);
        }
        VectorClock { entries: merged }
    }

    /// Keep at most [`MAX_ENTRIES`] entries, dropping anything older than
    /// [`MAX_ENTRY_AGE_SECS`] first. Bounds clock growth in a long-running
    /// cluster where many distinct client ids write the same key over time.
    pub fn prune(&mut self) {
        let now = chrono::Utc::now().timestamp();
        self.entries
            .retain(|_, entry| now - entry.timestamp <= MAX_ENTRY_AGE_SECS);
        if self.entries.len() > MAX_ENTRIES {
            let mut by_recency: Vec<(String, ClockEntry)> =
                self.entries.drain().collect();
            by_recency.sort_by_key(|(_, e)| std::cmp::Reverse(e.timestamp));
            by_recency.truncate(MAX_ENTRIES);
            self.entries = by_recency.into_iter().collect();
        }
    }

    /// Number of ids tracked by this clock. Exposed for tests and logging.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn counter(&self, id: &str) -> u64 {
        self.entries.get(id).map(|e| e.counter).unwrap_or(0)
    }
}

/// The payload half of a stored key: either a live user value, a tombstone
/// left by a DELETE, or a set of concurrent sibling values surfaced to the
/// client because neither write causally dominated the other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Present(JsonValue),
    Tombstone,
    Siblings(Vec<JsonValue>),
}

impl Value {
    /// A tombstone read is treated as absent by callers checking for a value.
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Value::Tombstone)
    }

    fn into_sibling_list(self) -> Vec<JsonValue> {
        match self {
            Value::Present(v) => vec![v],
            Value::Siblings(vs) => vs,
            Value::Tombstone => vec![],
        }
    }
}

/// A stored value: the vector clock that produced it, paired with its payload.
pub type Stamped = (VectorClock, Value);

/// Resolve two (clock, value) pairs per §4.1:
/// - identical clocks: keep either (they're the same write);
/// - one clock strictly dominates: keep the dominant pair;
/// - concurrent: merge the clocks, and fold the two values with `joiner`.
pub fn resolve(
    a: Stamped,
    b: Stamped,
    joiner: impl FnOnce(Value, Value) -> Value,
) -> Stamped {
    let (clock_a, val_a) = a;
    let (clock_b, val_b) = b;
    if clock_a == clock_b {
        return (clock_a, val_a);
    }
    let a_dominates = clock_a.descends_from(&clock_b);
    let b_dominates = clock_b.descends_from(&clock_a);
    match (a_dominates, b_dominates) {
        (true, false) => (clock_a, val_a),
        (false, true) => (clock_b, val_b),
        _ => {
            let merged = clock_a.merge(&clock_b);
            (merged, joiner(val_a, val_b))
        }
    }
}

/// Fold [`resolve`] across a non-empty list of (clock, value) pairs using the
/// sibling-extending joiner. Returns `None` for an empty list — callers
/// always have at least one replica result by construction.
pub fn resolve_list(mut values: Vec<Stamped>) -> Option<Stamped> {
    let first = values.pop()?;
    Some(
        values
            .into_iter()
            .fold(first, |acc, next| resolve(acc, next, extend_siblings)),
    )
}

/// The default joiner: list-typed values are already-siblinged sets and are
/// concatenated; scalar values are wrapped into a singleton list first;
/// tombstones contribute nothing (a deleted replica isn't a sibling of a
/// value that's still live elsewhere).
pub fn extend_siblings(a: Value, b: Value) -> Value {
    let mut siblings = a.into_sibling_list();
    siblings.extend(b.into_sibling_list());
    Value::Siblings(siblings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_is_monotonic() {
        let mut clock = VectorClock::new();
        clock.increment("a");
        let first = clock.counter("a");
        clock.increment("a");
        assert!(clock.counter("a") > first);
    }

    #[test]
    fn self_descends_from_self() {
        let mut clock = VectorClock::new();
        clock.increment("a");
        assert!(clock.descends_from(&clock.clone()));
    }

    #[test]
    fn increment_strictly_dominates_parent() {
        let mut a = VectorClock::new();
        a.increment("x");
        let mut b = a.clone();
        b.increment("x");
        assert!(b.descends_from(&a));
        assert!(!a.descends_from(&b));
    }

    #[test]
    fn merge_is_commutative() {
        let mut a = VectorClock::new();
        a.increment("a");
        let mut b = VectorClock::new();
        b.increment("b");
        assert_eq!(a.merge(&b), b.merge(&a));
    }

    #[test]
    fn merge_is_associative() {
        let mut a = VectorClock::new();
        a.increment("a");
        let mut b = VectorClock::new();
        b.increment("b");
        let mut c = VectorClock::new();
        c.increment("c");
        assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
    }

    #[test]
    fn merge_is_idempotent() {
        let mut a = VectorClock::new();
        a.increment("a");
        assert_eq!(a.merge(&a), a);
    }

    #[test]
    fn concurrent_writes_produce_siblings() {
        let mut a = VectorClock::new();
        a.increment("x");
        let mut b = VectorClock::new();
        b.increment("y");
        let (_, value) = resolve(
            (a, Value::Present(serde_json::json!("v1"))),
            (b, Value::Present(serde_json::json!("v2"))),
            extend_siblings,
        );
        match value {
            Value::Siblings(vs) => assert_eq!(vs.len(), 2),
            other => panic!("expected siblings, got {other:?}"),
        }
    }

    #[test]
    fn dominant_write_wins_outright() {
        let mut a = VectorClock::new();
        a.increment("x");
        let mut b = a.clone();
        b.increment("x");
        let (clock, value) = resolve(
            (a, Value::Present(serde_json::json!("v1"))),
            (b.clone(), Value::Present(serde_json::json!("v2"))),
            extend_siblings,
        );
        assert_eq!(clock, b);
        assert_eq!(value, Value::Present(serde_json::json!("v2")));
    }

    #[test]
    fn resolve_list_folds_across_multiple_concurrent_writers() {
        let mut a = VectorClock::new();
        a.increment("x");
        let mut b = VectorClock::new();
        b.increment("y");
        let mut c = VectorClock::new();
        c.increment("z");
        let resolved = resolve_list(vec![
            (a, Value::Present(serde_json::json!("v1"))),
            (b, Value::Present(serde_json::json!("v2"))),
            (c, Value::Present(serde_json::json!("v3"))),
        ])
        .unwrap();
        match resolved.1 {
            Value::Siblings(vs) => assert_eq!(vs.len(), 3),
            other => panic!("expected 3 siblings, got {other:?}"),
        }
    }

    #[test]
    fn prune_drops_entries_past_max_age() {
        let mut clock = VectorClock::new();
        clock.increment("stale");
        clock
            .entries
            .get_mut("stale")
            .unwrap()
            .timestamp -= MAX_ENTRY_AGE_SECS + 1;
        clock.prune();
        assert_eq!(clock.counter("stale"), 0);
    }

    #[test]
    fn prune_caps_entry_count() {
        let mut clock = VectorClock::new();
        for i in 0..(MAX_ENTRIES + 5) {
            clock.increment(&format!("client-{i}"));
        }
        clock.prune();
        assert_eq!(clock.len(), MAX_ENTRIES);
    }
}
