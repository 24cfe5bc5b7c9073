// # Secondary Index Set
//
// Five indexes maintained in tandem on every put (and teardown removal):
//
// - `by_target_id`: entity id -> delta ids with at least one pointer at it
// - `by_target_context`: context name -> delta ids carrying that context
// - `by_author`: author -> delta ids
// - `by_system`: system -> delta ids
// - `by_timestamp`: sorted `(timestamp, delta id)` pairs for range scans
//
// The query planner entry point is [`IndexSet::candidate_ids`]: `None`
// means no indexed field appears in the filter and the caller must full
// scan; otherwise it returns the intersection of per-field candidate sets
// (union within a field, intersection across fields), starting from the
// smallest set.

use crate::common::{DeltaId, Timestamp};
use crate::delta::Delta;
use crate::query::DeltaFilter;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// Observability counters for the index set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub deltas_indexed: u64,
    pub deltas_removed: u64,
    pub planner_hits: u64,
    pub planner_full_scans: u64,
}

/// The five secondary indexes over the delta log.
///
/// Holds delta ids only; the log owns the deltas themselves. When indexing
/// is disabled the set accepts inserts as no-ops and the planner always
/// answers `None`.
pub struct IndexSet {
    enabled: bool,
    by_target_id: DashMap<String, HashSet<DeltaId>>,
    by_target_context: DashMap<String, HashSet<DeltaId>>,
    by_author: DashMap<String, HashSet<DeltaId>>,
    by_system: DashMap<String, HashSet<DeltaId>>,
    by_timestamp: RwLock<BTreeSet<(Timestamp, DeltaId)>>,
    indexed: AtomicU64,
    removed: AtomicU64,
    planner_hits: AtomicU64,
    planner_full_scans: AtomicU64,
}

impl IndexSet {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            by_target_id: DashMap::new(),
            by_target_context: DashMap::new(),
            by_author: DashMap::new(),
            by_system: DashMap::new(),
            by_timestamp: RwLock::new(BTreeSet::new()),
            indexed: AtomicU64::new(0),
            removed: AtomicU64::new(0),
            planner_hits: AtomicU64::new(0),
            planner_full_scans: AtomicU64::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Index a freshly persisted delta across all five indexes.
    pub fn insert(&self, delta: &Delta) {
        if !self.enabled {
            return;
        }

        self.by_author
            .entry(delta.author.clone())
            .or_default()
            .insert(delta.id.clone());
        self.by_system
            .entry(delta.system.clone())
            .or_default()
            .insert(delta.id.clone());

        for pointer in &delta.pointers {
            if let Some(target_id) = pointer.target.reference_id() {
                self.by_target_id
                    .entry(target_id.to_string())
                    .or_default()
                    .insert(delta.id.clone());
            }
            if let Some(context) = &pointer.target_context {
                self.by_target_context
                    .entry(context.clone())
                    .or_default()
                    .insert(delta.id.clone());
            }
        }

        self.by_timestamp
            .write()
            .insert((delta.timestamp, delta.id.clone()));
        self.indexed.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove a delta from all indexes (teardown only; the log itself is
    /// append-only).
    pub fn remove(&self, delta: &Delta) {
        if !self.enabled {
            return;
        }

        remove_from(&self.by_author, &delta.author, &delta.id);
        remove_from(&self.by_system, &delta.system, &delta.id);
        for pointer in &delta.pointers {
            if let Some(target_id) = pointer.target.reference_id() {
                remove_from(&self.by_target_id, target_id, &delta.id);
            }
            if let Some(context) = &pointer.target_context {
                remove_from(&self.by_target_context, context, &delta.id);
            }
        }
        self.by_timestamp
            .write()
            .remove(&(delta.timestamp, delta.id.clone()));
        self.removed.fetch_add(1, Ordering::Relaxed);
    }

    /// Delta ids referencing `entity_id`.
    pub fn deltas_for_entity(&self, entity_id: &str) -> HashSet<DeltaId> {
        self.by_target_id
            .get(entity_id)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Delta ids carrying `target_context`.
    pub fn deltas_for_context(&self, context: &str) -> HashSet<DeltaId> {
        self.by_target_context
            .get(context)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn deltas_for_author(&self, author: &str) -> HashSet<DeltaId> {
        self.by_author
            .get(author)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn deltas_for_system(&self, system: &str) -> HashSet<DeltaId> {
        self.by_system
            .get(system)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Delta ids within an inclusive timestamp range.
    pub fn deltas_in_range(&self, start: Option<Timestamp>, end: Option<Timestamp>) -> HashSet<DeltaId> {
        let start = start.unwrap_or(0);
        let guard = self.by_timestamp.read();
        guard
            .range((start, String::new())..)
            .take_while(|(ts, _)| end.map_or(true, |e| *ts <= e))
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Query planner: candidate delta ids for `filter`.
    ///
    /// `None` means no indexed field appears (or indexing is disabled) and
    /// the caller must full-scan. An empty set is a definitive answer: no
    /// delta can match.
    pub fn candidate_ids(&self, filter: &DeltaFilter) -> Option<HashSet<DeltaId>> {
        if !self.enabled || !filter.has_indexed_fields() {
            self.planner_full_scans.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let mut per_field: Vec<HashSet<DeltaId>> = Vec::new();

        if let Some(authors) = &filter.authors {
            per_field.push(union_of(authors.iter().map(|a| self.deltas_for_author(a))));
        }
        if let Some(systems) = &filter.systems {
            per_field.push(union_of(systems.iter().map(|s| self.deltas_for_system(s))));
        }
        if let Some(target_ids) = &filter.target_ids {
            per_field.push(union_of(
                target_ids.iter().map(|t| self.deltas_for_entity(t)),
            ));
        }
        if let Some(contexts) = &filter.target_contexts {
            per_field.push(union_of(
                contexts.iter().map(|c| self.deltas_for_context(c)),
            ));
        }
        if let Some(range) = &filter.timestamp_range {
            per_field.push(self.deltas_in_range(range.start, range.end));
        }

        // Intersect starting from the smallest set.
        per_field.sort_by_key(|set| set.len());
        let mut iter = per_field.into_iter();
        let mut candidates = iter.next()?;
        for set in iter {
            candidates.retain(|id| set.contains(id));
            if candidates.is_empty() {
                break;
            }
        }

        self.planner_hits.fetch_add(1, Ordering::Relaxed);
        Some(candidates)
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            deltas_indexed: self.indexed.load(Ordering::Relaxed),
            deltas_removed: self.removed.load(Ordering::Relaxed),
            planner_hits: self.planner_hits.load(Ordering::Relaxed),
            planner_full_scans: self.planner_full_scans.load(Ordering::Relaxed),
        }
    }
}

fn remove_from(index: &DashMap<String, HashSet<DeltaId>>, key: &str, id: &str) {
    if let Some(mut entry) = index.get_mut(key) {
        entry.remove(id);
        let now_empty = entry.is_empty();
        drop(entry);
        if now_empty {
            index.remove_if(key, |_, set| set.is_empty());
        }
    }
}

fn union_of<I: IntoIterator<Item = HashSet<DeltaId>>>(sets: I) -> HashSet<DeltaId> {
    let mut union = HashSet::new();
    for set in sets {
        union.extend(set);
    }
    union
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{DeltaBuilder, Pointer};
    use crate::query::TimestampRange;

    fn sample(id: &str, ts: u64, author: &str, entity: &str) -> Delta {
        DeltaBuilder::new(author, "sys-a")
            .with_id(id)
            .with_timestamp(ts)
            .pointer(Pointer::reference_in("named", entity, "name"))
            .pointer(Pointer::primitive("name", "x"))
            .build()
    }

    fn populated() -> IndexSet {
        let indexes = IndexSet::new(true);
        indexes.insert(&sample("d-1", 1000, "alice", "e1"));
        indexes.insert(&sample("d-2", 2000, "alice", "e2"));
        indexes.insert(&sample("d-3", 3000, "bob", "e1"));
        indexes
    }

    #[test]
    fn test_every_populated_index_contains_new_delta() {
        let indexes = IndexSet::new(true);
        let delta = sample("d-1", 1000, "alice", "e1");
        indexes.insert(&delta);

        assert!(indexes.deltas_for_author("alice").contains("d-1"));
        assert!(indexes.deltas_for_system("sys-a").contains("d-1"));
        assert!(indexes.deltas_for_entity("e1").contains("d-1"));
        assert!(indexes.deltas_for_context("name").contains("d-1"));
        assert!(indexes
            .deltas_in_range(Some(1000), Some(1000))
            .contains("d-1"));
    }

    #[test]
    fn test_planner_none_without_indexed_fields() {
        let indexes = populated();
        assert!(indexes.candidate_ids(&DeltaFilter::new()).is_none());
        assert!(indexes
            .candidate_ids(&DeltaFilter::new().with_id("d-1"))
            .is_none());
        assert_eq!(indexes.stats().planner_full_scans, 2);
    }

    #[test]
    fn test_planner_union_within_field() {
        let indexes = populated();
        let candidates = indexes
            .candidate_ids(&DeltaFilter::new().with_author("alice").with_author("bob"))
            .unwrap();
        assert_eq!(candidates.len(), 3);
    }

    #[test]
    fn test_planner_intersection_across_fields() {
        let indexes = populated();
        let candidates = indexes
            .candidate_ids(
                &DeltaFilter::new()
                    .with_author("alice")
                    .with_target_id("e1"),
            )
            .unwrap();
        assert_eq!(candidates, HashSet::from(["d-1".to_string()]));
    }

    #[test]
    fn test_planner_empty_intersection_is_definitive() {
        let indexes = populated();
        let candidates = indexes
            .candidate_ids(&DeltaFilter::new().with_author("bob").with_target_id("e2"))
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_timestamp_range_candidates() {
        let indexes = populated();
        let candidates = indexes
            .candidate_ids(
                &DeltaFilter::new().with_timestamp_range(TimestampRange::new(
                    Some(1500),
                    Some(2500),
                )),
            )
            .unwrap();
        assert_eq!(candidates, HashSet::from(["d-2".to_string()]));
    }

    #[test]
    fn test_remove_clears_all_indexes() {
        let indexes = populated();
        let delta = sample("d-1", 1000, "alice", "e1");
        indexes.remove(&delta);

        assert!(!indexes.deltas_for_author("alice").contains("d-1"));
        assert!(!indexes.deltas_for_entity("e1").contains("d-1"));
        assert!(indexes.deltas_in_range(Some(0), Some(1500)).is_empty());
        assert_eq!(indexes.stats().deltas_removed, 1);
    }

    #[test]
    fn test_disabled_indexes_answer_none() {
        let indexes = IndexSet::new(false);
        indexes.insert(&sample("d-1", 1000, "alice", "e1"));
        assert!(indexes.deltas_for_author("alice").is_empty());
        assert!(indexes
            .candidate_ids(&DeltaFilter::new().with_author("alice"))
            .is_none());
    }
}
