// # Delta and Pointer Types
//
// Wire format (JSON):
//
// ```json
// {
//   "id": "d-1",
//   "timestamp": 1700000000000,
//   "author": "alice",
//   "system": "sys-a",
//   "pointers": [
//     { "local_context": "named", "target": { "id": "e1" }, "target_context": "name" },
//     { "local_context": "name", "target": "Alice" }
//   ]
// }
// ```
//
// A pointer target is either an entity reference (`{ "id": ... }`) or a bare
// JSON scalar (string, finite number, boolean).

use crate::common::{now_millis, DeltaId, EntityId, Timestamp};
use crate::delta::NEGATES_CONTEXT;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Pointer Targets
// ============================================================================

/// A pointer target referencing a domain entity by identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityReference {
    pub id: EntityId,
}

/// A primitive pointer payload: string, finite number, or boolean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimitiveValue {
    String(String),
    Number(f64),
    Boolean(bool),
}

impl PrimitiveValue {
    /// Numeric payload, if this primitive is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            PrimitiveValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PrimitiveValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Render as a `serde_json::Value`, the form Views expose.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            PrimitiveValue::String(s) => serde_json::Value::String(s.clone()),
            PrimitiveValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            PrimitiveValue::Boolean(b) => serde_json::Value::Bool(*b),
        }
    }
}

impl From<&str> for PrimitiveValue {
    fn from(s: &str) -> Self {
        PrimitiveValue::String(s.to_string())
    }
}

impl From<String> for PrimitiveValue {
    fn from(s: String) -> Self {
        PrimitiveValue::String(s)
    }
}

impl From<f64> for PrimitiveValue {
    fn from(n: f64) -> Self {
        PrimitiveValue::Number(n)
    }
}

impl From<i64> for PrimitiveValue {
    fn from(n: i64) -> Self {
        PrimitiveValue::Number(n as f64)
    }
}

impl From<i32> for PrimitiveValue {
    fn from(n: i32) -> Self {
        PrimitiveValue::Number(n as f64)
    }
}

impl From<bool> for PrimitiveValue {
    fn from(b: bool) -> Self {
        PrimitiveValue::Boolean(b)
    }
}

/// Either an entity reference or a primitive payload.
///
/// References must precede primitives in the untagged order so that
/// `{ "id": ... }` never parses as a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointerTarget {
    Reference(EntityReference),
    Primitive(PrimitiveValue),
}

impl PointerTarget {
    pub fn reference<S: Into<EntityId>>(id: S) -> Self {
        PointerTarget::Reference(EntityReference { id: id.into() })
    }

    pub fn primitive<P: Into<PrimitiveValue>>(value: P) -> Self {
        PointerTarget::Primitive(value.into())
    }

    /// Entity id, if this target is a reference.
    pub fn reference_id(&self) -> Option<&str> {
        match self {
            PointerTarget::Reference(r) => Some(&r.id),
            PointerTarget::Primitive(_) => None,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, PointerTarget::Reference(_))
    }
}

// ============================================================================
// Pointers
// ============================================================================

/// One element of a delta's pointer list.
///
/// `local_context` names the role this delta plays toward the target.
/// `target_context`, when present, is the property under which this delta
/// appears when the target entity is projected. A pointer may omit
/// `target_context`; the delta is then still relevant to its target entity
/// (and still indexed) but unassigned to any named property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pointer {
    pub local_context: String,
    pub target: PointerTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_context: Option<String>,
}

impl Pointer {
    /// Reference pointer without a target property.
    pub fn reference<L, E>(local_context: L, id: E) -> Self
    where
        L: Into<String>,
        E: Into<EntityId>,
    {
        Self {
            local_context: local_context.into(),
            target: PointerTarget::reference(id),
            target_context: None,
        }
    }

    /// Reference pointer assigned to a property on the target entity.
    pub fn reference_in<L, E, C>(local_context: L, id: E, target_context: C) -> Self
    where
        L: Into<String>,
        E: Into<EntityId>,
        C: Into<String>,
    {
        Self {
            local_context: local_context.into(),
            target: PointerTarget::reference(id),
            target_context: Some(target_context.into()),
        }
    }

    /// Primitive-valued pointer.
    pub fn primitive<L, P>(local_context: L, value: P) -> Self
    where
        L: Into<String>,
        P: Into<PrimitiveValue>,
    {
        Self {
            local_context: local_context.into(),
            target: PointerTarget::primitive(value),
            target_context: None,
        }
    }

    /// True when this pointer is a negation edge at `delta_id`.
    pub fn negates(&self, delta_id: &str) -> bool {
        self.local_context == NEGATES_CONTEXT && self.target.reference_id() == Some(delta_id)
    }
}

// ============================================================================
// Deltas
// ============================================================================

/// An immutable, timestamped, authored assertion.
///
/// Deltas are created once, never mutated, never physically deleted. Every
/// field is fixed at persist time; logical removal happens only via
/// negation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub id: DeltaId,
    pub timestamp: Timestamp,
    pub author: String,
    pub system: String,
    pub pointers: Vec<Pointer>,
}

impl Delta {
    /// True when any pointer references `entity_id`.
    pub fn references_entity(&self, entity_id: &str) -> bool {
        self.pointers
            .iter()
            .any(|p| p.target.reference_id() == Some(entity_id))
    }

    /// Entity ids referenced by this delta's pointers, in pointer order.
    pub fn referenced_entities(&self) -> Vec<&str> {
        self.pointers
            .iter()
            .filter_map(|p| p.target.reference_id())
            .collect()
    }

    /// Distinct `target_context` names carried against `entity_id`, in
    /// pointer order.
    pub fn target_contexts_for(&self, entity_id: &str) -> Vec<&str> {
        let mut contexts: Vec<&str> = Vec::new();
        for pointer in &self.pointers {
            if pointer.target.reference_id() != Some(entity_id) {
                continue;
            }
            if let Some(context) = pointer.target_context.as_deref() {
                if !contexts.contains(&context) {
                    contexts.push(context);
                }
            }
        }
        contexts
    }

    /// Ids of deltas this delta negates (usually zero or one).
    pub fn negated_delta_ids(&self) -> Vec<&str> {
        self.pointers
            .iter()
            .filter(|p| p.local_context == NEGATES_CONTEXT)
            .filter_map(|p| p.target.reference_id())
            .collect()
    }

    pub fn is_negation(&self) -> bool {
        !self.negated_delta_ids().is_empty()
    }
}

/// Fluent constructor for deltas.
///
/// ```
/// use rhizomedb::delta::DeltaBuilder;
///
/// let delta = DeltaBuilder::new("alice", "sys-a")
///     .set_property("e1", "name", "Alice")
///     .build();
/// assert!(delta.references_entity("e1"));
/// ```
#[derive(Debug, Clone)]
pub struct DeltaBuilder {
    id: Option<DeltaId>,
    timestamp: Option<Timestamp>,
    author: String,
    system: String,
    pointers: Vec<Pointer>,
}

impl DeltaBuilder {
    pub fn new<A: Into<String>, S: Into<String>>(author: A, system: S) -> Self {
        Self {
            id: None,
            timestamp: None,
            author: author.into(),
            system: system.into(),
            pointers: Vec::new(),
        }
    }

    pub fn with_id<I: Into<DeltaId>>(mut self, id: I) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn pointer(mut self, pointer: Pointer) -> Self {
        self.pointers.push(pointer);
        self
    }

    /// Assert `entity.property = value` in the standard two-pointer shape:
    /// one reference pointer at the entity under `property`, one primitive
    /// pointer carrying the value.
    pub fn set_property<E, P, V>(self, entity_id: E, property: P, value: V) -> Self
    where
        E: Into<EntityId>,
        P: Into<String> + Clone,
        V: Into<PrimitiveValue>,
    {
        let property = property.into();
        self.pointer(Pointer::reference_in(
            format!("{property}d"),
            entity_id,
            property.clone(),
        ))
        .pointer(Pointer::primitive(property, value))
    }

    /// Link `entity.property -> other entity` (both sides referenced).
    pub fn link<E, P, T, C>(self, entity_id: E, property: P, target_id: T, reverse: C) -> Self
    where
        E: Into<EntityId>,
        P: Into<String>,
        T: Into<EntityId>,
        C: Into<String>,
    {
        let property = property.into();
        self.pointer(Pointer::reference_in("subject", entity_id, property.clone()))
            .pointer(Pointer::reference_in(property, target_id, reverse))
    }

    /// Add a negation pointer at `delta_id`.
    pub fn negates<D: Into<DeltaId>>(self, delta_id: D) -> Self {
        self.pointer(Pointer::reference(NEGATES_CONTEXT, delta_id))
    }

    pub fn build(self) -> Delta {
        Delta {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            timestamp: self.timestamp.unwrap_or_else(now_millis),
            author: self.author,
            system: self.system,
            pointers: self.pointers,
        }
    }
}
