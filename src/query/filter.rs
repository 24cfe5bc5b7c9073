// # Delta Filters
//
// Declarative match conditions over deltas, shared by the query engine, the
// subscription hub, and federation push/pull filters. The predicate clause
// is local-only and never crosses the wire.

use crate::common::Timestamp;
use crate::delta::Delta;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Inclusive timestamp range. Open bounds are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampRange {
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
}

impl TimestampRange {
    pub fn new(start: Option<Timestamp>, end: Option<Timestamp>) -> Self {
        Self { start, end }
    }

    pub fn since(start: Timestamp) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    pub fn until(end: Timestamp) -> Self {
        Self {
            start: None,
            end: Some(end),
        }
    }

    pub fn contains(&self, timestamp: Timestamp) -> bool {
        self.start.map_or(true, |s| timestamp >= s) && self.end.map_or(true, |e| timestamp <= e)
    }
}

/// Named ad-hoc predicate.
///
/// The name participates in equality and debug output so filters carrying
/// closures stay comparable and loggable; the closure itself does not.
#[derive(Clone)]
pub struct DeltaPredicate {
    name: String,
    f: Arc<dyn Fn(&Delta) -> bool + Send + Sync>,
}

impl DeltaPredicate {
    pub fn new<N, F>(name: N, f: F) -> Self
    where
        N: Into<String>,
        F: Fn(&Delta) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Arc::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn test(&self, delta: &Delta) -> bool {
        (self.f)(delta)
    }
}

impl fmt::Debug for DeltaPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeltaPredicate")
            .field("name", &self.name)
            .finish()
    }
}

// Predicates compare by name: two filters carrying closures registered
// under the same name are considered interchangeable.
impl PartialEq for DeltaPredicate {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

/// Filter over the delta log.
///
/// Fields combine conjunctively; within a field, values combine
/// disjunctively. `include_negated` defaults to `false`: effectively
/// negated deltas are excluded unless explicitly requested.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<HashSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<HashSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub systems: Option<HashSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_ids: Option<HashSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_contexts: Option<HashSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_range: Option<TimestampRange>,
    #[serde(default)]
    pub include_negated: bool,
    /// Ad-hoc predicate, applied last. Local-only: skipped by serde, so a
    /// filter shipped to a federation peer loses this clause.
    #[serde(skip)]
    pub predicate: Option<DeltaPredicate>,
}

impl DeltaFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.ids.get_or_insert_with(HashSet::new).insert(id.into());
        self
    }

    pub fn with_author<S: Into<String>>(mut self, author: S) -> Self {
        self.authors
            .get_or_insert_with(HashSet::new)
            .insert(author.into());
        self
    }

    pub fn with_system<S: Into<String>>(mut self, system: S) -> Self {
        self.systems
            .get_or_insert_with(HashSet::new)
            .insert(system.into());
        self
    }

    pub fn with_target_id<S: Into<String>>(mut self, target_id: S) -> Self {
        self.target_ids
            .get_or_insert_with(HashSet::new)
            .insert(target_id.into());
        self
    }

    pub fn with_target_context<S: Into<String>>(mut self, context: S) -> Self {
        self.target_contexts
            .get_or_insert_with(HashSet::new)
            .insert(context.into());
        self
    }

    pub fn with_timestamp_range(mut self, range: TimestampRange) -> Self {
        self.timestamp_range = Some(range);
        self
    }

    pub fn include_negated(mut self, include: bool) -> Self {
        self.include_negated = include;
        self
    }

    pub fn with_predicate<N, F>(mut self, name: N, f: F) -> Self
    where
        N: Into<String>,
        F: Fn(&Delta) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(DeltaPredicate::new(name, f));
        self
    }

    /// True when any of the five indexable fields is present.
    pub fn has_indexed_fields(&self) -> bool {
        self.authors.is_some()
            || self.systems.is_some()
            || self.target_ids.is_some()
            || self.target_contexts.is_some()
            || self.timestamp_range.is_some()
    }

    /// Residue match: every clause except negation exclusion, which needs
    /// log-wide knowledge and lives in the engine.
    pub fn matches(&self, delta: &Delta) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&delta.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&delta.author) {
                return false;
            }
        }
        if let Some(systems) = &self.systems {
            if !systems.contains(&delta.system) {
                return false;
            }
        }
        if let Some(target_ids) = &self.target_ids {
            let hit = delta
                .pointers
                .iter()
                .filter_map(|p| p.target.reference_id())
                .any(|id| target_ids.contains(id));
            if !hit {
                return false;
            }
        }
        if let Some(contexts) = &self.target_contexts {
            let hit = delta
                .pointers
                .iter()
                .filter_map(|p| p.target_context.as_deref())
                .any(|c| contexts.contains(c));
            if !hit {
                return false;
            }
        }
        if let Some(range) = &self.timestamp_range {
            if !range.contains(delta.timestamp) {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate.test(delta) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{DeltaBuilder, Pointer};

    fn sample() -> Delta {
        DeltaBuilder::new("alice", "sys-a")
            .with_id("d-1")
            .with_timestamp(1500)
            .pointer(Pointer::reference_in("named", "e1", "name"))
            .pointer(Pointer::primitive("name", "Alice"))
            .build()
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(DeltaFilter::new().matches(&sample()));
    }

    #[test]
    fn test_fields_are_conjunctive() {
        let filter = DeltaFilter::new().with_author("alice").with_system("sys-b");
        assert!(!filter.matches(&sample()));

        let filter = DeltaFilter::new().with_author("alice").with_system("sys-a");
        assert!(filter.matches(&sample()));
    }

    #[test]
    fn test_values_within_field_are_disjunctive() {
        let filter = DeltaFilter::new().with_author("bob").with_author("alice");
        assert!(filter.matches(&sample()));
    }

    #[test]
    fn test_target_clauses() {
        assert!(DeltaFilter::new().with_target_id("e1").matches(&sample()));
        assert!(!DeltaFilter::new().with_target_id("e2").matches(&sample()));
        assert!(DeltaFilter::new()
            .with_target_context("name")
            .matches(&sample()));
        assert!(!DeltaFilter::new()
            .with_target_context("age")
            .matches(&sample()));
    }

    #[test]
    fn test_timestamp_range() {
        let range = TimestampRange::new(Some(1000), Some(2000));
        assert!(range.contains(1000));
        assert!(range.contains(2000));
        assert!(!range.contains(999));
        assert!(!range.contains(2001));

        assert!(TimestampRange::since(1000).contains(u64::MAX));
        assert!(TimestampRange::until(2000).contains(1));
    }

    #[test]
    fn test_predicate_runs_last() {
        let filter = DeltaFilter::new()
            .with_author("alice")
            .with_predicate("two-pointers", |d: &Delta| d.pointers.len() == 2);
        assert!(filter.matches(&sample()));

        let filter = DeltaFilter::new().with_predicate("no-pointers", |d: &Delta| {
            d.pointers.is_empty()
        });
        assert!(!filter.matches(&sample()));
    }

    #[test]
    fn test_predicate_is_not_serialized() {
        let filter = DeltaFilter::new()
            .with_author("alice")
            .with_predicate("local-only", |_| true);
        let json = serde_json::to_string(&filter).unwrap();
        let back: DeltaFilter = serde_json::from_str(&json).unwrap();
        assert!(back.predicate.is_none());
        assert!(back.authors.is_some());
    }

    #[test]
    fn test_has_indexed_fields() {
        assert!(!DeltaFilter::new().has_indexed_fields());
        assert!(!DeltaFilter::new().with_id("d-1").has_indexed_fields());
        assert!(DeltaFilter::new().with_author("a").has_indexed_fields());
        assert!(DeltaFilter::new()
            .with_timestamp_range(TimestampRange::since(1))
            .has_indexed_fields());
    }
}
