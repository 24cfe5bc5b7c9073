// # HyperView Projection
//
// Builds the per-entity bundle of deltas a HyperSchema describes. The
// projector snapshots the log once at entry (deltas are immutable, so a
// snapshot is always coherent), computes the effective negation set at the
// requested time, then walks the snapshot:
//
// 1. the schema's selector places each visible delta under zero or more
//    properties;
// 2. transformation rules matching a pointer's `local_context` replace
//    reference targets with recursive sub-projections, guarded against
//    self-reference (`target.id != entity_id`).
//
// Primitive targets and primitive-typed rules short-circuit: no nesting.
// The projector is a pure function of its inputs; two calls over the same
// log, schema, and timestamp produce structurally identical output.

use crate::common::{now_millis, CancellationToken, EntityId, Timestamp};
use crate::delta::{Delta, Pointer, PointerTarget, PrimitiveValue, DEFAULT_PROPERTY};
use crate::index::IndexSet;
use crate::negation::effective_negations;
use crate::schema::{HyperSchema, SchemaRef, SchemaRegistry, SelectorDecision};
use crate::storage::StorageAdapter;
use crate::{Result, RhizomeError};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

// ============================================================================
// Projected Types
// ============================================================================

/// A pointer target inside a HyperView. Mirrors
/// [`PointerTarget`](crate::delta::PointerTarget) with a third form: a
/// reference rewritten into the nested projection of the referenced entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProjectedTarget {
    View(Box<HyperView>),
    Reference { id: EntityId },
    Primitive(PrimitiveValue),
}

impl ProjectedTarget {
    pub fn as_view(&self) -> Option<&HyperView> {
        match self {
            ProjectedTarget::View(view) => Some(view),
            _ => None,
        }
    }

    pub fn as_primitive(&self) -> Option<&PrimitiveValue> {
        match self {
            ProjectedTarget::Primitive(value) => Some(value),
            _ => None,
        }
    }

    /// Entity id for plain references and nested views alike.
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            ProjectedTarget::Reference { id } => Some(id),
            ProjectedTarget::View(view) => Some(&view.id),
            ProjectedTarget::Primitive(_) => None,
        }
    }
}

impl From<&PointerTarget> for ProjectedTarget {
    fn from(target: &PointerTarget) -> Self {
        match target {
            PointerTarget::Reference(r) => ProjectedTarget::Reference { id: r.id.clone() },
            PointerTarget::Primitive(v) => ProjectedTarget::Primitive(v.clone()),
        }
    }
}

/// A pointer as it appears inside a HyperView.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectedPointer {
    pub local_context: String,
    pub target: ProjectedTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_context: Option<String>,
}

impl From<&Pointer> for ProjectedPointer {
    fn from(pointer: &Pointer) -> Self {
        Self {
            local_context: pointer.local_context.clone(),
            target: (&pointer.target).into(),
            target_context: pointer.target_context.clone(),
        }
    }
}

/// A delta as organized inside a HyperView: same identity and metadata,
/// but pointer targets may have been rewritten into nested views.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectedDelta {
    pub id: String,
    pub timestamp: Timestamp,
    pub author: String,
    pub system: String,
    pub pointers: Vec<ProjectedPointer>,
}

impl ProjectedDelta {
    /// Primitive value of the first pointer with this `local_context`.
    pub fn pointer_value(&self, local_context: &str) -> Option<&PrimitiveValue> {
        self.pointers
            .iter()
            .find(|p| p.local_context == local_context)
            .and_then(|p| p.target.as_primitive())
    }

    /// First nested view among this delta's pointers.
    pub fn nested_view(&self) -> Option<&HyperView> {
        self.pointers.iter().find_map(|p| p.target.as_view())
    }
}

impl From<&Delta> for ProjectedDelta {
    fn from(delta: &Delta) -> Self {
        Self {
            id: delta.id.clone(),
            timestamp: delta.timestamp,
            author: delta.author.clone(),
            system: delta.system.clone(),
            pointers: delta.pointers.iter().map(Into::into).collect(),
        }
    }
}

/// Per-entity projection: `{ id, property -> [deltas] }`.
///
/// The property map is sorted so identical inputs always render
/// identically.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HyperView {
    pub id: EntityId,
    pub properties: BTreeMap<String, Vec<ProjectedDelta>>,
}

impl HyperView {
    pub fn new<I: Into<EntityId>>(id: I) -> Self {
        Self {
            id: id.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn property(&self, name: &str) -> &[ProjectedDelta] {
        self.properties.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn property_names(&self) -> Vec<&str> {
        self.properties.keys().map(String::as_str).collect()
    }

    /// Total delta entries across all properties (a delta placed under two
    /// properties counts twice).
    pub fn delta_count(&self) -> usize {
        self.properties.values().map(Vec::len).sum()
    }

    fn place(&mut self, property: String, delta: ProjectedDelta) {
        self.properties.entry(property).or_default().push(delta);
    }
}

// ============================================================================
// Projector
// ============================================================================

/// Builds HyperViews from the log, the index set, and the schema registry.
pub struct Projector {
    storage: Arc<dyn StorageAdapter>,
    indexes: Arc<IndexSet>,
    registry: Arc<SchemaRegistry>,
}

impl Projector {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        indexes: Arc<IndexSet>,
        registry: Arc<SchemaRegistry>,
    ) -> Self {
        Self {
            storage,
            indexes,
            registry,
        }
    }

    /// Project `entity_id` under `schema` as of `as_of` (now when
    /// `None`). Deltas timestamped past the cutoff are invisible, so a
    /// future-dated delta never shows up in a default projection.
    pub async fn project(
        &self,
        entity_id: &str,
        schema: &HyperSchema,
        as_of: Option<Timestamp>,
        cancel: Option<CancellationToken>,
    ) -> Result<HyperView> {
        let cutoff = as_of.unwrap_or_else(now_millis);
        let log = self.load_log(schema, cancel.clone()).await?;
        let negated = effective_negations(&log, Some(cutoff));
        self.project_from_log(&log, &negated, entity_id, schema, cutoff, &cancel)
    }

    /// Project under a schema registered by id.
    pub async fn project_by_id(
        &self,
        entity_id: &str,
        schema_id: &str,
        as_of: Option<Timestamp>,
        cancel: Option<CancellationToken>,
    ) -> Result<HyperView> {
        let schema = self
            .registry
            .get(schema_id)
            .ok_or_else(|| RhizomeError::SchemaNotFound(schema_id.to_string()))?;
        self.project(entity_id, &schema, as_of, cancel).await
    }

    // A root projection with an entity-scoped selector could be served
    // from the target-id index alone, but transformation rules need
    // arbitrary other entities' deltas, so the snapshot covers the whole
    // log. The index still prunes the per-entity walk below.
    async fn load_log(
        &self,
        _schema: &HyperSchema,
        cancel: Option<CancellationToken>,
    ) -> Result<Vec<Delta>> {
        self.storage.scan_all(cancel).await
    }

    fn project_from_log(
        &self,
        log: &[Delta],
        negated: &HashSet<String>,
        entity_id: &str,
        schema: &HyperSchema,
        as_of: Timestamp,
        cancel: &Option<CancellationToken>,
    ) -> Result<HyperView> {
        let mut view = HyperView::new(entity_id);
        let entity_scoped = schema.selector.is_entity_scoped();
        let candidate_ids = (entity_scoped && self.indexes.enabled())
            .then(|| self.indexes.deltas_for_entity(entity_id));

        for delta in log {
            if let Some(token) = cancel {
                token.check()?;
            }
            if delta.timestamp > as_of {
                continue;
            }
            if negated.contains(&delta.id) {
                continue;
            }
            if entity_scoped {
                // Entity-scoped selectors can only match referencing deltas.
                match &candidate_ids {
                    Some(ids) if !ids.contains(&delta.id) => continue,
                    None if !delta.references_entity(entity_id) => continue,
                    _ => {}
                }
            }

            let properties = match schema.selector.select(entity_id, delta) {
                SelectorDecision::Exclude => continue,
                SelectorDecision::IncludeDefault => vec![DEFAULT_PROPERTY.to_string()],
                SelectorDecision::IncludeAs(names) => names,
            };
            if properties.is_empty() {
                continue;
            }

            let projected = self.transform(log, negated, entity_id, schema, as_of, cancel, delta)?;
            for property in properties {
                view.place(property, projected.clone());
            }
        }

        Ok(view)
    }

    /// Rewrite a delta's pointers, recursing into referenced entities
    /// where a transformation rule applies.
    #[allow(clippy::too_many_arguments)]
    fn transform(
        &self,
        log: &[Delta],
        negated: &HashSet<String>,
        entity_id: &str,
        schema: &HyperSchema,
        as_of: Timestamp,
        cancel: &Option<CancellationToken>,
        delta: &Delta,
    ) -> Result<ProjectedDelta> {
        let mut projected = ProjectedDelta::from(delta);

        for (idx, pointer) in delta.pointers.iter().enumerate() {
            let Some(rule) = schema.transformations.get(&pointer.local_context) else {
                continue;
            };
            if let Some(predicate) = &rule.predicate {
                if !predicate.test(pointer, delta) {
                    continue;
                }
            }
            let Some(target_id) = pointer.target.reference_id() else {
                continue;
            };
            if target_id == entity_id {
                continue;
            }

            let sub_schema = match &rule.schema {
                SchemaRef::Primitive => continue,
                SchemaRef::Inline(inner) => Arc::clone(inner),
                SchemaRef::Id(id) => self
                    .registry
                    .get(id)
                    .ok_or_else(|| RhizomeError::SchemaNotFound(id.clone()))?,
            };

            let nested =
                self.project_from_log(log, negated, target_id, &sub_schema, as_of, cancel)?;
            projected.pointers[idx].target = ProjectedTarget::View(Box::new(nested));
        }

        Ok(projected)
    }
}
