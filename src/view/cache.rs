// # Materialized View Cache
//
// Bounded LRU of HyperViews keyed by `(entity_id, schema_id)`. Each entry
// remembers the fingerprint and version of the schema it was built under;
// [`ViewCache::get_or_rebuild`] treats an entry as outdated when the
// schema is gone from the registry (orphan), its current fingerprint
// differs, or its current version exceeds the stored one, and rebuilds
// through the projector in those cases.

use crate::common::{now_millis, CancellationToken, EntityId, SchemaId, Timestamp};
use crate::schema::SchemaRegistry;
use crate::view::hyperview::{HyperView, Projector};
use crate::{Result, RhizomeError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Default number of cached views.
pub const DEFAULT_CACHE_SIZE: usize = 1000;

/// A cached HyperView plus the schema metadata it was built under.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaterializedHyperView {
    pub view: HyperView,
    pub schema_id: SchemaId,
    pub schema_fingerprint: String,
    pub schema_version: Option<u64>,
    pub last_updated: Timestamp,
    pub delta_count: usize,
}

/// Cache observability counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub size: usize,
    pub capacity: usize,
}

type CacheKey = (EntityId, SchemaId);

#[derive(Default)]
struct CacheInner {
    entries: HashMap<CacheKey, MaterializedHyperView>,
    // Oldest first; touched keys move to the back.
    lru: VecDeque<CacheKey>,
}

/// Bounded LRU of materialized HyperViews.
pub struct ViewCache {
    capacity: usize,
    inner: RwLock<CacheInner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

impl ViewCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(CacheInner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Cached entry, regardless of freshness. Touches LRU order.
    pub fn get(&self, entity_id: &str, schema_id: &str) -> Option<MaterializedHyperView> {
        let key = (entity_id.to_string(), schema_id.to_string());
        let mut inner = self.inner.write();
        let entry = inner.entries.get(&key).cloned();
        if entry.is_some() {
            touch(&mut inner.lru, &key);
        }
        entry
    }

    /// Insert (or replace) an entry, evicting the least recently used
    /// entry on overflow.
    pub fn insert(&self, entry: MaterializedHyperView) {
        let key = (entry.view.id.clone(), entry.schema_id.clone());
        let mut inner = self.inner.write();

        if inner.entries.insert(key.clone(), entry).is_none() {
            while inner.entries.len() > self.capacity {
                if let Some(oldest) = inner.lru.pop_front() {
                    if inner.entries.remove(&oldest).is_some() {
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                        debug!(entity = %oldest.0, schema = %oldest.1, "evicted cached view");
                    }
                } else {
                    break;
                }
            }
        }
        touch(&mut inner.lru, &key);
    }

    /// Fresh view for `(entity_id, schema_id)`: cache hit when the stored
    /// fingerprint and version still match the registry, projector rebuild
    /// otherwise.
    pub async fn get_or_rebuild(
        &self,
        entity_id: &str,
        schema_id: &str,
        projector: &Projector,
        registry: &SchemaRegistry,
        cancel: Option<CancellationToken>,
    ) -> Result<MaterializedHyperView> {
        if let Some(entry) = self.get(entity_id, schema_id) {
            if !self.is_outdated(&entry, registry) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let schema = registry
            .get(schema_id)
            .ok_or_else(|| RhizomeError::SchemaNotFound(schema_id.to_string()))?;
        let view = projector.project(entity_id, &schema, None, cancel).await?;
        let entry = MaterializedHyperView {
            delta_count: view.delta_count(),
            schema_id: schema_id.to_string(),
            schema_fingerprint: registry.fingerprint(schema_id).unwrap_or_default(),
            schema_version: registry.version(schema_id),
            last_updated: now_millis(),
            view,
        };
        self.insert(entry.clone());
        Ok(entry)
    }

    /// Outdated when the schema is an orphan, its fingerprint drifted, or
    /// its version moved past the stored one.
    pub fn is_outdated(&self, entry: &MaterializedHyperView, registry: &SchemaRegistry) -> bool {
        let Some(current_fingerprint) = registry.fingerprint(&entry.schema_id) else {
            return true;
        };
        if current_fingerprint != entry.schema_fingerprint {
            return true;
        }
        match (registry.version(&entry.schema_id), entry.schema_version) {
            (Some(current), Some(stored)) => current > stored,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Drop every cached view of `entity_id` (any schema).
    pub fn invalidate_entity(&self, entity_id: &str) {
        let mut inner = self.inner.write();
        let keys: Vec<CacheKey> = inner
            .entries
            .keys()
            .filter(|(entity, _)| entity == entity_id)
            .cloned()
            .collect();
        for key in keys {
            inner.entries.remove(&key);
            inner.lru.retain(|k| k != &key);
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop every cached view built under `schema_id`.
    pub fn invalidate_schema(&self, schema_id: &str) {
        let mut inner = self.inner.write();
        let keys: Vec<CacheKey> = inner
            .entries
            .keys()
            .filter(|(_, schema)| schema == schema_id)
            .cloned()
            .collect();
        for key in keys {
            inner.entries.remove(&key);
            inner.lru.retain(|k| k != &key);
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.lru.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            size: self.len(),
            capacity: self.capacity,
        }
    }
}

fn touch(lru: &mut VecDeque<CacheKey>, key: &CacheKey) {
    lru.retain(|k| k != key);
    lru.push_back(key.clone());
}
