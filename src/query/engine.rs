// # Query Evaluation
//
// Evaluates a [`DeltaFilter`] against the log: planner candidates when an
// indexed field is present, full scan otherwise, then residue filtering and
// negation exclusion.

use crate::common::{now_millis, CancellationToken, Timestamp};
use crate::delta::Delta;
use crate::index::IndexSet;
use crate::negation::effective_negations;
use crate::query::DeltaFilter;
use crate::storage::StorageAdapter;
use crate::Result;
use std::collections::HashSet;
use std::sync::Arc;

/// Filtered reads over a storage adapter plus its index set.
pub struct QueryEngine {
    storage: Arc<dyn StorageAdapter>,
    indexes: Arc<IndexSet>,
}

impl QueryEngine {
    pub fn new(storage: Arc<dyn StorageAdapter>, indexes: Arc<IndexSet>) -> Self {
        Self { storage, indexes }
    }

    /// Evaluate `filter` against the log as it stands now. Deltas
    /// timestamped in the future stay invisible until their time arrives.
    pub async fn query(&self, filter: &DeltaFilter) -> Result<Vec<Delta>> {
        self.query_at(filter, None, None).await
    }

    /// Evaluate `filter` as of a timestamp (now, when `None`). Deltas
    /// newer than the cutoff are invisible, and the negation exclusion is
    /// computed at the same cutoff.
    pub async fn query_at(
        &self,
        filter: &DeltaFilter,
        as_of: Option<Timestamp>,
        cancel: Option<CancellationToken>,
    ) -> Result<Vec<Delta>> {
        let cutoff = as_of.unwrap_or_else(now_millis);
        let candidates = self
            .load_candidates(filter, cancel.clone())
            .await?;

        let negated: HashSet<String> = if filter.include_negated {
            HashSet::new()
        } else {
            // Negation status needs log-wide knowledge; a candidate set is
            // not enough because negators rarely match the filter.
            let log = self.storage.scan_all(cancel.clone()).await?;
            effective_negations(&log, Some(cutoff))
        };

        let mut results = Vec::new();
        for delta in candidates {
            if let Some(token) = &cancel {
                token.check()?;
            }
            if delta.timestamp > cutoff {
                continue;
            }
            if !filter.include_negated && negated.contains(&delta.id) {
                continue;
            }
            if filter.matches(&delta) {
                results.push(delta);
            }
        }
        Ok(results)
    }

    /// The effectively negated id set at `as_of`.
    pub async fn negated_ids(
        &self,
        as_of: Option<Timestamp>,
        cancel: Option<CancellationToken>,
    ) -> Result<HashSet<String>> {
        let log = self.storage.scan_all(cancel).await?;
        Ok(effective_negations(&log, as_of))
    }

    async fn load_candidates(
        &self,
        filter: &DeltaFilter,
        cancel: Option<CancellationToken>,
    ) -> Result<Vec<Delta>> {
        match self.indexes.candidate_ids(filter) {
            Some(ids) => {
                let ids: Vec<String> = ids.into_iter().collect();
                self.storage.multi_get(&ids).await
            }
            None => self.storage.scan_all(cancel).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{DeltaBuilder, Pointer};
    use crate::query::TimestampRange;
    use crate::storage::MemoryStorage;

    async fn engine_with(deltas: Vec<Delta>) -> QueryEngine {
        let storage = Arc::new(MemoryStorage::new());
        let indexes = Arc::new(IndexSet::new(true));
        for delta in &deltas {
            storage.put(delta).await.unwrap();
            indexes.insert(delta);
        }
        QueryEngine::new(storage, indexes)
    }

    fn named(id: &str, ts: u64, author: &str, entity: &str, name: &str) -> Delta {
        DeltaBuilder::new(author, "sys-a")
            .with_id(id)
            .with_timestamp(ts)
            .pointer(Pointer::reference_in("named", entity, "name"))
            .pointer(Pointer::primitive("name", name))
            .build()
    }

    fn negation(id: &str, ts: u64, target: &str) -> Delta {
        DeltaBuilder::new("bob", "sys-a")
            .with_id(id)
            .with_timestamp(ts)
            .negates(target)
            .build()
    }

    #[tokio::test]
    async fn test_query_by_author_uses_candidates() {
        let engine = engine_with(vec![
            named("d-1", 1000, "alice", "e1", "Alice"),
            named("d-2", 2000, "bob", "e2", "Bob"),
        ])
        .await;

        let results = engine
            .query(&DeltaFilter::new().with_author("alice"))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "d-1");
    }

    #[tokio::test]
    async fn test_query_without_indexed_fields_full_scans() {
        let engine = engine_with(vec![
            named("d-1", 1000, "alice", "e1", "Alice"),
            named("d-2", 2000, "bob", "e2", "Bob"),
        ])
        .await;

        let results = engine
            .query(&DeltaFilter::new().with_id("d-2"))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "d-2");
    }

    #[tokio::test]
    async fn test_negated_excluded_by_default() {
        let engine = engine_with(vec![
            named("d-1", 1000, "alice", "e1", "Alice"),
            negation("n-1", 2000, "d-1"),
        ])
        .await;

        let results = engine
            .query(&DeltaFilter::new().with_target_id("e1"))
            .await
            .unwrap();
        assert!(results.is_empty());

        let included = engine
            .query(
                &DeltaFilter::new()
                    .with_target_id("e1")
                    .include_negated(true),
            )
            .await
            .unwrap();
        assert_eq!(included.len(), 1);
    }

    #[tokio::test]
    async fn test_double_negation_restores_visibility() {
        let engine = engine_with(vec![
            named("d-1", 1000, "alice", "e1", "Alice"),
            negation("n-1", 2000, "d-1"),
            negation("n-2", 3000, "n-1"),
        ])
        .await;

        let results = engine
            .query(&DeltaFilter::new().with_target_id("e1"))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "d-1");
    }

    #[tokio::test]
    async fn test_query_at_hides_future_and_gates_negation() {
        let engine = engine_with(vec![
            named("d-1", 1000, "alice", "e1", "Alice"),
            negation("n-1", 2000, "d-1"),
        ])
        .await;

        // At t=1500 the negation does not yet exist.
        let at_1500 = engine
            .query_at(&DeltaFilter::new().with_target_id("e1"), Some(1500), None)
            .await
            .unwrap();
        assert_eq!(at_1500.len(), 1);

        // At t=2500 the negation is in force.
        let at_2500 = engine
            .query_at(&DeltaFilter::new().with_target_id("e1"), Some(2500), None)
            .await
            .unwrap();
        assert!(at_2500.is_empty());
    }

    #[tokio::test]
    async fn test_future_deltas_hidden_from_default_query() {
        let future_ts = now_millis() + 3_600_000;
        let engine = engine_with(vec![
            named("d-now", 1000, "alice", "e1", "Alice"),
            named("d-future", future_ts, "alice", "e1", "Later"),
        ])
        .await;

        let results = engine
            .query(&DeltaFilter::new().with_target_id("e1"))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "d-now");

        // Explicitly querying at the future time reveals it.
        let at_future = engine
            .query_at(
                &DeltaFilter::new().with_target_id("e1"),
                Some(future_ts),
                None,
            )
            .await
            .unwrap();
        assert_eq!(at_future.len(), 2);
    }

    #[tokio::test]
    async fn test_range_and_predicate_compose() {
        let engine = engine_with(vec![
            named("d-1", 1000, "alice", "e1", "Alice"),
            named("d-2", 2000, "alice", "e1", "Alicia"),
            named("d-3", 3000, "alice", "e1", "Alyce"),
        ])
        .await;

        let results = engine
            .query(
                &DeltaFilter::new()
                    .with_timestamp_range(TimestampRange::new(Some(1500), Some(3500)))
                    .with_predicate("name-starts-ali", |d: &Delta| {
                        d.pointers.iter().any(|p| {
                            matches!(&p.target,
                                crate::delta::PointerTarget::Primitive(v)
                                    if v.as_str().is_some_and(|s| s.starts_with("Ali")))
                        })
                    }),
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "d-2");
    }

    #[tokio::test]
    async fn test_cancellation_propagates() {
        let engine = engine_with(vec![named("d-1", 1000, "alice", "e1", "Alice")]).await;
        let token = CancellationToken::new();
        token.cancel();
        let result = engine
            .query_at(&DeltaFilter::new(), None, Some(token))
            .await;
        assert!(matches!(result, Err(crate::RhizomeError::Cancelled)));
    }
}
