// # Time Travel
//
// Thin facade over the negation resolver and the projector: historical
// projections, log snapshots, per-entity timelines, sampled replays, and
// point-to-point comparisons. Deltas are immutable, so history is always
// reconstructible from the log alone.

use crate::common::{CancellationToken, LogSnapshot, Timestamp};
use crate::delta::Delta;
use crate::negation::effective_negations;
use crate::query::TimestampRange;
use crate::schema::SchemaRegistry;
use crate::storage::StorageAdapter;
use crate::view::hyperview::{HyperView, Projector};
use crate::{Result, RhizomeError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Default cap on replay samples.
pub const DEFAULT_MAX_SNAPSHOTS: usize = 50;

/// One sampled frame of a replay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayFrame {
    pub timestamp: Timestamp,
    pub view: HyperView,
}

/// Property-level difference between two projections of the same entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewComparison {
    pub entity_id: String,
    pub earlier: Timestamp,
    pub later: Timestamp,
    /// Union of property names, with per-side delta counts.
    pub properties: BTreeMap<String, (usize, usize)>,
    /// Later total minus earlier total.
    pub delta_count_change: i64,
}

/// Historical read facade.
pub struct TimeTravel {
    storage: Arc<dyn StorageAdapter>,
    registry: Arc<SchemaRegistry>,
    projector: Arc<Projector>,
}

impl TimeTravel {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        registry: Arc<SchemaRegistry>,
        projector: Arc<Projector>,
    ) -> Self {
        Self {
            storage,
            registry,
            projector,
        }
    }

    /// Project `entity` under the registered schema as the log stood at
    /// `ts`.
    pub async fn query_at(
        &self,
        entity_id: &str,
        schema_id: &str,
        ts: Timestamp,
    ) -> Result<HyperView> {
        let schema = self
            .registry
            .get(schema_id)
            .ok_or_else(|| RhizomeError::SchemaNotFound(schema_id.to_string()))?;
        self.projector
            .project(entity_id, &schema, Some(ts), None)
            .await
    }

    /// Delta and negation counts at `ts`.
    pub async fn snapshot(&self, ts: Timestamp) -> Result<LogSnapshot> {
        let log = self.storage.scan_all(None).await?;
        let delta_count = log.iter().filter(|d| d.timestamp <= ts).count();
        let negated_count = effective_negations(&log, Some(ts)).len();
        Ok(LogSnapshot {
            timestamp: ts,
            delta_count,
            negated_count,
        })
    }

    /// Sorted distinct timestamps of deltas referencing `entity_id`.
    pub async fn timeline(&self, entity_id: &str) -> Result<Vec<Timestamp>> {
        let log = self.storage.scan_all(None).await?;
        let mut timestamps: Vec<Timestamp> = log
            .iter()
            .filter(|d| d.references_entity(entity_id))
            .map(|d| d.timestamp)
            .collect();
        timestamps.sort_unstable();
        timestamps.dedup();
        Ok(timestamps)
    }

    /// Project the entity at sampled points of its timeline within
    /// `range`. When the timeline has more than `max_snapshots` points it
    /// is strided evenly, always keeping the final point.
    pub async fn replay(
        &self,
        entity_id: &str,
        schema_id: &str,
        range: TimestampRange,
        max_snapshots: usize,
        cancel: Option<CancellationToken>,
    ) -> Result<Vec<ReplayFrame>> {
        let timeline: Vec<Timestamp> = self
            .timeline(entity_id)
            .await?
            .into_iter()
            .filter(|ts| range.contains(*ts))
            .collect();
        let samples = sample_timeline(&timeline, max_snapshots.max(1));

        let schema = self
            .registry
            .get(schema_id)
            .ok_or_else(|| RhizomeError::SchemaNotFound(schema_id.to_string()))?;

        let mut frames = Vec::with_capacity(samples.len());
        for ts in samples {
            if let Some(token) = &cancel {
                token.check()?;
            }
            let view = self
                .projector
                .project(entity_id, &schema, Some(ts), cancel.clone())
                .await?;
            frames.push(ReplayFrame {
                timestamp: ts,
                view,
            });
        }
        Ok(frames)
    }

    /// All deltas writing `property` of `entity_id`, sorted by timestamp.
    /// Includes negated deltas: this is history, not current state.
    pub async fn track_changes(&self, entity_id: &str, property: &str) -> Result<Vec<Delta>> {
        let log = self.storage.scan_all(None).await?;
        let mut changes: Vec<Delta> = log
            .into_iter()
            .filter(|d| {
                d.pointers.iter().any(|p| {
                    p.target.reference_id() == Some(entity_id)
                        && p.target_context.as_deref() == Some(property)
                })
            })
            .collect();
        changes.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
        Ok(changes)
    }

    /// Compare projections of the entity at two points in time.
    pub async fn compare(
        &self,
        entity_id: &str,
        schema_id: &str,
        t1: Timestamp,
        t2: Timestamp,
    ) -> Result<ViewComparison> {
        let (earlier, later) = if t1 <= t2 { (t1, t2) } else { (t2, t1) };
        let before = self.query_at(entity_id, schema_id, earlier).await?;
        let after = self.query_at(entity_id, schema_id, later).await?;

        let mut properties: BTreeMap<String, (usize, usize)> = BTreeMap::new();
        for (name, deltas) in &before.properties {
            properties.entry(name.clone()).or_insert((0, 0)).0 = deltas.len();
        }
        for (name, deltas) in &after.properties {
            properties.entry(name.clone()).or_insert((0, 0)).1 = deltas.len();
        }

        Ok(ViewComparison {
            entity_id: entity_id.to_string(),
            earlier,
            later,
            delta_count_change: after.delta_count() as i64 - before.delta_count() as i64,
            properties,
        })
    }

    /// Earliest delta referencing `entity_id`, if any.
    pub async fn origin(&self, entity_id: &str) -> Result<Option<Delta>> {
        let log = self.storage.scan_all(None).await?;
        Ok(log
            .into_iter()
            .filter(|d| d.references_entity(entity_id))
            .min_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id))))
    }
}

/// Evenly stride an over-long timeline down to `max` samples, always
/// keeping the last point.
fn sample_timeline(timeline: &[Timestamp], max: usize) -> Vec<Timestamp> {
    if timeline.len() <= max {
        return timeline.to_vec();
    }
    let stride = timeline.len().div_ceil(max);
    let mut samples: Vec<Timestamp> = timeline.iter().step_by(stride).copied().collect();
    let last = *timeline.last().expect("non-empty timeline");
    if samples.last() != Some(&last) {
        samples.push(last);
    }
    samples
}
