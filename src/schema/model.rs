// # Schema Model
//
// Selectors are a small sum type with the common "select by target
// context" case inlined; arbitrary host logic goes through the named
// predicate variant. Naming the closure keeps schemas fingerprintable and
// debuggable.

use crate::common::{EntityId, SchemaId};
use crate::delta::{Delta, Pointer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Selectors
// ============================================================================

/// What a selector says about one `(entity, delta)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorDecision {
    /// The delta does not belong to this entity's projection.
    Exclude,
    /// Include under the `"_default"` property.
    IncludeDefault,
    /// Include under each named property.
    IncludeAs(Vec<String>),
}

pub type SelectorFn = Arc<dyn Fn(&str, &Delta) -> SelectorDecision + Send + Sync>;

/// Pure selection function of `(entity_id, delta)`.
#[derive(Clone)]
pub enum DeltaSelector {
    /// The standard selector: include any delta with a pointer at the
    /// entity carrying a `target_context`, placed under every named
    /// context it carries. A delta pointing at the entity without any
    /// `target_context` is excluded here (it stays indexed and queryable
    /// by filter, just orphaned from the standard projection).
    ByTargetContext,
    /// Include deltas referencing the entity, always under this fixed
    /// property list.
    ByProperties(Vec<String>),
    /// Arbitrary host logic under a stable name.
    ByPredicate { name: String, f: SelectorFn },
}

impl DeltaSelector {
    pub fn by_predicate<N, F>(name: N, f: F) -> Self
    where
        N: Into<String>,
        F: Fn(&str, &Delta) -> SelectorDecision + Send + Sync + 'static,
    {
        DeltaSelector::ByPredicate {
            name: name.into(),
            f: Arc::new(f),
        }
    }

    pub fn select(&self, entity_id: &str, delta: &Delta) -> SelectorDecision {
        match self {
            DeltaSelector::ByTargetContext => {
                let contexts: Vec<String> = delta
                    .target_contexts_for(entity_id)
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                if contexts.is_empty() {
                    SelectorDecision::Exclude
                } else {
                    SelectorDecision::IncludeAs(contexts)
                }
            }
            DeltaSelector::ByProperties(properties) => {
                if delta.references_entity(entity_id) {
                    SelectorDecision::IncludeAs(properties.clone())
                } else {
                    SelectorDecision::Exclude
                }
            }
            DeltaSelector::ByPredicate { f, .. } => f(entity_id, delta),
        }
    }

    /// Stable identity token used by fingerprinting.
    pub fn identity(&self) -> String {
        match self {
            DeltaSelector::ByTargetContext => "by_target_context".to_string(),
            DeltaSelector::ByProperties(properties) => {
                format!("by_properties[{}]", properties.join(","))
            }
            DeltaSelector::ByPredicate { name, .. } => format!("by_predicate:{name}"),
        }
    }

    /// True when selection is scoped to deltas referencing the entity,
    /// letting the projector prune via the target-id index.
    pub fn is_entity_scoped(&self) -> bool {
        matches!(
            self,
            DeltaSelector::ByTargetContext | DeltaSelector::ByProperties(_)
        )
    }
}

impl fmt::Debug for DeltaSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeltaSelector({})", self.identity())
    }
}

impl Default for DeltaSelector {
    fn default() -> Self {
        DeltaSelector::ByTargetContext
    }
}

// ============================================================================
// Transformation Rules
// ============================================================================

/// Reference to the schema a transformation projects its target under.
#[derive(Clone)]
pub enum SchemaRef {
    /// Dereferenced through the registry at projection time.
    Id(SchemaId),
    /// Inline sub-schema.
    Inline(Arc<HyperSchema>),
    /// Primitive-typed terminal: never recursed into.
    Primitive,
}

impl fmt::Debug for SchemaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaRef::Id(id) => write!(f, "SchemaRef::Id({id})"),
            SchemaRef::Inline(schema) => write!(f, "SchemaRef::Inline({})", schema.id),
            SchemaRef::Primitive => write!(f, "SchemaRef::Primitive"),
        }
    }
}

pub type TransformPredicateFn = Arc<dyn Fn(&Pointer, &Delta) -> bool + Send + Sync>;

/// Named predicate gating a transformation rule.
#[derive(Clone)]
pub struct TransformPredicate {
    name: String,
    f: TransformPredicateFn,
}

impl TransformPredicate {
    pub fn new<N, F>(name: N, f: F) -> Self
    where
        N: Into<String>,
        F: Fn(&Pointer, &Delta) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Arc::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn test(&self, pointer: &Pointer, delta: &Delta) -> bool {
        (self.f)(pointer, delta)
    }
}

impl fmt::Debug for TransformPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransformPredicate({})", self.name)
    }
}

/// One transformation: pointers whose `local_context` matches the rule's
/// key have reference targets replaced by a nested projection under the
/// referenced schema, when the optional predicate passes.
#[derive(Debug, Clone)]
pub struct TransformationRule {
    pub schema: SchemaRef,
    pub predicate: Option<TransformPredicate>,
}

impl TransformationRule {
    pub fn to_schema<S: Into<SchemaId>>(schema_id: S) -> Self {
        Self {
            schema: SchemaRef::Id(schema_id.into()),
            predicate: None,
        }
    }

    pub fn inline(schema: HyperSchema) -> Self {
        Self {
            schema: SchemaRef::Inline(Arc::new(schema)),
            predicate: None,
        }
    }

    pub fn primitive() -> Self {
        Self {
            schema: SchemaRef::Primitive,
            predicate: None,
        }
    }

    pub fn with_predicate(mut self, predicate: TransformPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }
}

// ============================================================================
// HyperSchema
// ============================================================================

/// Selection + transformation recipe projecting the delta log into
/// per-entity HyperViews.
#[derive(Debug, Clone)]
pub struct HyperSchema {
    pub id: SchemaId,
    pub name: String,
    pub selector: DeltaSelector,
    /// Keyed by pointer `local_context`. Sorted map so iteration order and
    /// fingerprints are position-independent.
    pub transformations: BTreeMap<String, TransformationRule>,
}

impl HyperSchema {
    /// New schema with the standard target-context selector.
    pub fn new<I: Into<SchemaId>, N: Into<String>>(id: I, name: N) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            selector: DeltaSelector::ByTargetContext,
            transformations: BTreeMap::new(),
        }
    }

    pub fn with_selector(mut self, selector: DeltaSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_transformation<K: Into<String>>(
        mut self,
        local_context: K,
        rule: TransformationRule,
    ) -> Self {
        self.transformations.insert(local_context.into(), rule);
        self
    }

    /// Schema ids this schema references, directly or through inline
    /// sub-schemas.
    pub fn referenced_schema_ids(&self) -> Vec<SchemaId> {
        let mut ids = Vec::new();
        collect_referenced(self, &mut ids);
        ids
    }
}

fn collect_referenced(schema: &HyperSchema, ids: &mut Vec<SchemaId>) {
    for rule in schema.transformations.values() {
        match &rule.schema {
            SchemaRef::Id(id) => {
                if !ids.contains(id) {
                    ids.push(id.clone());
                }
            }
            SchemaRef::Inline(inner) => collect_referenced(inner, ids),
            SchemaRef::Primitive => {}
        }
    }
}
