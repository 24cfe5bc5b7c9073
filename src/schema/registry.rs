// # Schema Registry
//
// Stores HyperSchemas by id and answers the projector's sub-schema
// lookups. With validation enabled, registration statically checks the
// transformation graph for cycles (a selector-independent DFS); a cycle
// raises `CircularSchema` and leaves the registry unchanged.
//
// Re-registering an id with different content bumps a monotonic version
// counter, which the materialized-view cache uses alongside fingerprints
// to spot outdated entries.

use crate::common::SchemaId;
use crate::schema::fingerprint::schema_fingerprint;
use crate::schema::model::{HyperSchema, SchemaRef};
use crate::{Result, RhizomeError};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

struct RegisteredSchema {
    schema: Arc<HyperSchema>,
    fingerprint: String,
    version: u64,
}

/// Shared registry of HyperSchemas.
pub struct SchemaRegistry {
    validate_on_register: bool,
    inner: RwLock<HashMap<SchemaId, RegisteredSchema>>,
}

impl SchemaRegistry {
    pub fn new(validate_on_register: bool) -> Self {
        Self {
            validate_on_register,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) a schema.
    ///
    /// With validation enabled, the transformation graph formed by the
    /// already-registered schemas plus this candidate must be a DAG.
    /// References to ids not yet registered are allowed here and fail at
    /// projection time instead.
    pub fn register(&self, schema: HyperSchema) -> Result<()> {
        let mut inner = self.inner.write();

        if self.validate_on_register {
            check_acyclic(&schema, &inner)?;
        }

        let fingerprint = schema_fingerprint(&schema);
        let version = match inner.get(&schema.id) {
            Some(existing) if existing.fingerprint == fingerprint => existing.version,
            Some(existing) => existing.version + 1,
            None => 1,
        };
        inner.insert(
            schema.id.clone(),
            RegisteredSchema {
                schema: Arc::new(schema),
                fingerprint,
                version,
            },
        );
        Ok(())
    }

    /// Register a set of schemas in dependency order.
    pub fn register_all(&self, schemas: Vec<HyperSchema>) -> Result<()> {
        for schema in topo_sort(schemas)? {
            self.register(schema)?;
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<HyperSchema>> {
        self.inner.read().get(id).map(|r| Arc::clone(&r.schema))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().contains_key(id)
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.inner.write().remove(id).is_some()
    }

    pub fn fingerprint(&self, id: &str) -> Option<String> {
        self.inner.read().get(id).map(|r| r.fingerprint.clone())
    }

    pub fn version(&self, id: &str) -> Option<u64> {
        self.inner.read().get(id).map(|r| r.version)
    }

    /// Force a version bump without content change (cache-busting hook).
    pub fn bump_version(&self, id: &str) -> Result<u64> {
        let mut inner = self.inner.write();
        let entry = inner
            .get_mut(id)
            .ok_or_else(|| RhizomeError::SchemaNotFound(id.to_string()))?;
        entry.version += 1;
        Ok(entry.version)
    }

    /// Ids of registered schemas whose transformations reference `id`.
    pub fn dependents_of(&self, id: &str) -> Vec<SchemaId> {
        let inner = self.inner.read();
        let mut dependents: Vec<SchemaId> = inner
            .iter()
            .filter(|(_, r)| {
                r.schema
                    .referenced_schema_ids()
                    .iter()
                    .any(|rid| rid.as_str() == id)
            })
            .map(|(schema_id, _)| schema_id.clone())
            .collect();
        dependents.sort();
        dependents
    }

    pub fn schema_ids(&self) -> Vec<SchemaId> {
        let mut ids: Vec<SchemaId> = self.inner.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// DFS over id-references, rejecting self-reference and cycles reachable
/// from `candidate`. Unregistered ids terminate their branch.
fn check_acyclic(
    candidate: &HyperSchema,
    registered: &HashMap<SchemaId, RegisteredSchema>,
) -> Result<()> {
    let mut stack: Vec<SchemaId> = vec![candidate.id.clone()];
    let mut on_path: HashSet<SchemaId> = stack.iter().cloned().collect();
    walk(candidate, registered, &mut stack, &mut on_path)
}

fn walk(
    schema: &HyperSchema,
    registered: &HashMap<SchemaId, RegisteredSchema>,
    stack: &mut Vec<SchemaId>,
    on_path: &mut HashSet<SchemaId>,
) -> Result<()> {
    for rule in schema.transformations.values() {
        match &rule.schema {
            SchemaRef::Primitive => {}
            SchemaRef::Inline(inner) => walk(inner, registered, stack, on_path)?,
            SchemaRef::Id(id) => {
                if on_path.contains(id) {
                    stack.push(id.clone());
                    return Err(RhizomeError::CircularSchema(stack.join(" -> ")));
                }
                if let Some(next) = registered.get(id) {
                    stack.push(id.clone());
                    on_path.insert(id.clone());
                    walk(&next.schema, registered, stack, on_path)?;
                    on_path.remove(id);
                    stack.pop();
                }
            }
        }
    }
    Ok(())
}

/// Topologically sort schemas so every schema follows the ones it
/// references within the set. Cycles inside the set are rejected.
pub fn topo_sort(schemas: Vec<HyperSchema>) -> Result<Vec<HyperSchema>> {
    let ids: HashSet<SchemaId> = schemas.iter().map(|s| s.id.clone()).collect();
    let mut remaining: Vec<HyperSchema> = schemas;
    let mut ordered: Vec<HyperSchema> = Vec::with_capacity(remaining.len());
    let mut placed: HashSet<SchemaId> = HashSet::new();

    while !remaining.is_empty() {
        let ready: Vec<usize> = remaining
            .iter()
            .enumerate()
            .filter(|(_, schema)| {
                schema
                    .referenced_schema_ids()
                    .iter()
                    .all(|dep| !ids.contains(dep) || placed.contains(dep) || *dep == schema.id)
            })
            .map(|(i, _)| i)
            .collect();

        if ready.is_empty() {
            let stuck: Vec<SchemaId> = remaining.iter().map(|s| s.id.clone()).collect();
            return Err(RhizomeError::CircularSchema(stuck.join(", ")));
        }

        // Drain back-to-front so indices stay valid.
        for idx in ready.into_iter().rev() {
            let schema = remaining.remove(idx);
            placed.insert(schema.id.clone());
            ordered.push(schema);
        }
    }

    Ok(ordered)
}
