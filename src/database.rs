// # Database Facade
//
// Wires the storage adapter, index set, schema registry, view cache,
// subscription hub, and the federation broadcast channel into one handle.
//
// Write path: validate -> storage put (duplicate ids short-circuit) ->
// index -> invalidate touched cached views -> offer to subscriptions ->
// broadcast to federation. Writes serialize through an async write gate;
// reads run concurrently against immutable deltas.

use crate::common::{CancellationToken, Timestamp};
use crate::config::{DatabaseConfig, StorageKind};
use crate::delta::{validate_delta, Delta, DeltaBuilder};
use crate::index::{IndexSet, IndexStats};
use crate::query::{DeltaFilter, QueryEngine};
use crate::schema::{HyperSchema, SchemaRegistry};
use crate::storage::{DiskStorage, MemoryStorage, StorageAdapter};
use crate::subscription::{
    SubscriptionConfig, SubscriptionHub, SubscriptionId, SubscriptionStats,
};
use crate::timetravel::TimeTravel;
use crate::view::cache::{CacheStats, MaterializedHyperView, ViewCache};
use crate::view::hyperview::{HyperView, Projector};
use crate::view::resolver::{resolve_view, View, ViewSchema};
use crate::{Result, RhizomeError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

/// Capacity of the federation broadcast channel.
const BROADCAST_CAPACITY: usize = 1024;

/// Aggregated observability counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub system_id: String,
    pub delta_count: usize,
    pub index: IndexStats,
    pub cache: CacheStats,
    pub subscriptions: usize,
    pub schemas: usize,
}

struct DbInner {
    config: DatabaseConfig,
    system_id: String,
    storage: Arc<dyn StorageAdapter>,
    indexes: Arc<IndexSet>,
    registry: Arc<SchemaRegistry>,
    cache: Arc<ViewCache>,
    hub: Arc<SubscriptionHub>,
    projector: Arc<Projector>,
    engine: QueryEngine,
    write_gate: Mutex<()>,
    broadcast: broadcast::Sender<Delta>,
}

/// Cheaply cloneable handle to one rhizomedb instance.
#[derive(Clone)]
pub struct RhizomeDb {
    inner: Arc<DbInner>,
}

impl RhizomeDb {
    /// Open an instance per `config`. Disk-backed instances rebuild the
    /// in-memory index set from the persisted log.
    pub async fn open(config: DatabaseConfig) -> Result<Self> {
        config.validate()?;
        let system_id = config.resolved_system_id();

        let storage: Arc<dyn StorageAdapter> = match config.storage {
            StorageKind::Memory => Arc::new(MemoryStorage::new()),
            StorageKind::Disk => {
                let path = config
                    .storage_path
                    .as_ref()
                    .expect("validated: disk storage has a path");
                Arc::new(DiskStorage::open(path)?)
            }
        };

        let indexes = Arc::new(IndexSet::new(config.enable_indexing));
        let registry = Arc::new(SchemaRegistry::new(config.validate_schemas));
        let cache = Arc::new(ViewCache::new(config.cache_size));
        let hub = Arc::new(SubscriptionHub::new());
        let projector = Arc::new(Projector::new(
            Arc::clone(&storage),
            Arc::clone(&indexes),
            Arc::clone(&registry),
        ));
        let engine = QueryEngine::new(Arc::clone(&storage), Arc::clone(&indexes));
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);

        let db = Self {
            inner: Arc::new(DbInner {
                config,
                system_id,
                storage,
                indexes,
                registry,
                cache,
                hub,
                projector,
                engine,
                write_gate: Mutex::new(()),
                broadcast,
            }),
        };

        db.rebuild_indexes().await?;
        info!(system = %db.inner.system_id, "rhizomedb instance opened");
        Ok(db)
    }

    async fn rebuild_indexes(&self) -> Result<()> {
        if !self.inner.indexes.enabled() {
            return Ok(());
        }
        let log = self.inner.storage.scan_all(None).await?;
        for delta in &log {
            self.inner.indexes.insert(delta);
        }
        Ok(())
    }

    pub fn system_id(&self) -> &str {
        &self.inner.system_id
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Persist a locally authored delta.
    pub async fn persist(&self, delta: Delta) -> Result<bool> {
        self.persist_inner(delta, true).await
    }

    /// Persist a delta received from a federation peer. Broadcast to the
    /// other links only when `federation.auto_broadcast` is set.
    pub async fn persist_remote(&self, delta: Delta) -> Result<bool> {
        let rebroadcast = self.inner.config.federation.auto_broadcast;
        self.persist_inner(delta, rebroadcast).await
    }

    async fn persist_inner(&self, delta: Delta, broadcast: bool) -> Result<bool> {
        validate_delta(&delta)?;

        let _gate = self.inner.write_gate.lock().await;
        if !self.inner.storage.put(&delta).await? {
            // Idempotent: the id is already in the log.
            return Ok(false);
        }
        self.inner.indexes.insert(&delta);
        self.invalidate_touched_views(&delta).await;

        for (subscription, error) in self.inner.hub.offer(&delta) {
            warn!(%subscription, delta = %delta.id, %error, "subscription overflow");
        }
        if broadcast {
            // No receivers is fine; federation may not be attached.
            let _ = self.inner.broadcast.send(delta);
        }
        Ok(true)
    }

    /// Drop cached views the new delta can affect: views of every entity
    /// it references, and, for negations, views of the entities the
    /// negated deltas reference.
    async fn invalidate_touched_views(&self, delta: &Delta) {
        for entity in delta.referenced_entities() {
            self.inner.cache.invalidate_entity(entity);
        }
        for negated_id in delta.negated_delta_ids() {
            if let Ok(Some(negated)) = self.inner.storage.get(negated_id).await {
                for entity in negated.referenced_entities() {
                    self.inner.cache.invalidate_entity(entity);
                }
            }
        }
    }

    /// Builder pre-stamped with this instance's system id.
    pub fn delta<A: Into<String>>(&self, author: A) -> DeltaBuilder {
        DeltaBuilder::new(author, self.inner.system_id.clone())
    }

    // ------------------------------------------------------------------
    // Read paths
    // ------------------------------------------------------------------

    pub async fn get_delta(&self, id: &str) -> Result<Option<Delta>> {
        self.inner.storage.get(id).await
    }

    pub async fn delta_count(&self) -> Result<usize> {
        self.inner.storage.len().await
    }

    pub async fn query(&self, filter: &DeltaFilter) -> Result<Vec<Delta>> {
        self.inner.engine.query(filter).await
    }

    pub async fn query_at(
        &self,
        filter: &DeltaFilter,
        as_of: Timestamp,
        cancel: Option<CancellationToken>,
    ) -> Result<Vec<Delta>> {
        self.inner.engine.query_at(filter, Some(as_of), cancel).await
    }

    /// Project an entity under a registered schema, bypassing the cache.
    pub async fn project(&self, entity_id: &str, schema_id: &str) -> Result<HyperView> {
        self.inner
            .projector
            .project_by_id(entity_id, schema_id, None, None)
            .await
    }

    /// Project under an ad-hoc schema instance.
    pub async fn project_with(&self, entity_id: &str, schema: &HyperSchema) -> Result<HyperView> {
        self.inner.projector.project(entity_id, schema, None, None).await
    }

    /// Cached projection with staleness detection.
    pub async fn project_cached(
        &self,
        entity_id: &str,
        schema_id: &str,
    ) -> Result<MaterializedHyperView> {
        self.inner
            .cache
            .get_or_rebuild(
                entity_id,
                schema_id,
                &self.inner.projector,
                &self.inner.registry,
                None,
            )
            .await
    }

    /// Flat, conflict-resolved view of an entity.
    pub async fn resolve_view(
        &self,
        entity_id: &str,
        schema_id: &str,
        view_schema: &ViewSchema,
    ) -> Result<View> {
        let hyperview = self.project(entity_id, schema_id).await?;
        Ok(resolve_view(&hyperview, view_schema))
    }

    /// Historical read facade.
    pub fn time_travel(&self) -> TimeTravel {
        TimeTravel::new(
            Arc::clone(&self.inner.storage),
            Arc::clone(&self.inner.registry),
            Arc::clone(&self.inner.projector),
        )
    }

    // ------------------------------------------------------------------
    // Schemas, subscriptions, federation wiring
    // ------------------------------------------------------------------

    pub fn register_schema(&self, schema: HyperSchema) -> Result<()> {
        self.inner.registry.register(schema)
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.inner.registry
    }

    pub fn subscribe<F>(
        &self,
        filter: DeltaFilter,
        config: SubscriptionConfig,
        handler: F,
    ) -> SubscriptionId
    where
        F: Fn(&Delta) -> Result<()> + Send + Sync + 'static,
    {
        self.inner.hub.subscribe(filter, config, handler)
    }

    pub fn unsubscribe(&self, id: &str) -> bool {
        self.inner.hub.unsubscribe(id)
    }

    pub fn subscription_stats(&self, id: &str) -> Option<SubscriptionStats> {
        self.inner.hub.stats(id)
    }

    pub fn hub(&self) -> &Arc<SubscriptionHub> {
        &self.inner.hub
    }

    /// Stream of locally persisted deltas; the federation peer forwards
    /// these to its links.
    pub fn subscribe_broadcast(&self) -> broadcast::Receiver<Delta> {
        self.inner.broadcast.subscribe()
    }

    pub fn storage(&self) -> &Arc<dyn StorageAdapter> {
        &self.inner.storage
    }

    pub fn cache(&self) -> &Arc<ViewCache> {
        &self.inner.cache
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub async fn stats(&self) -> Result<DatabaseStats> {
        Ok(DatabaseStats {
            system_id: self.inner.system_id.clone(),
            delta_count: self.inner.storage.len().await?,
            index: self.inner.indexes.stats(),
            cache: self.inner.cache.stats(),
            subscriptions: self.inner.hub.subscription_count(),
            schemas: self.inner.registry.len(),
        })
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.storage.close().await
    }
}

impl std::fmt::Debug for RhizomeDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RhizomeDb")
            .field("system_id", &self.inner.system_id)
            .finish()
    }
}
