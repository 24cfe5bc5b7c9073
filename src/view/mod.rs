// # HyperViews and Views
//
// Read-side projections of the delta log:
//
// - **HyperView** ([`hyperview`]): per-entity bundle of deltas keyed by
//   property, built by the projector under a HyperSchema. Referenced
//   entities may be recursively transformed into nested HyperViews.
// - **Materialized view cache** ([`cache`]): bounded LRU of HyperViews
//   keyed by `(entity, schema)`, invalidated by schema-fingerprint drift.
// - **View** ([`resolver`]): flat, conflict-resolved projection of a
//   HyperView under a ViewSchema.
//
// HyperViews are derived objects. They embed copies of the deltas they
// organize and never outlive the log they were built from.

pub mod cache;
pub mod hyperview;
pub mod resolver;

pub use cache::{CacheStats, MaterializedHyperView, ViewCache};
pub use hyperview::{HyperView, ProjectedDelta, ProjectedPointer, ProjectedTarget, Projector};
pub use resolver::{
    resolve_view, ExtractStrategy, PropertyRule, ResolutionStrategy, View, ViewSchema,
};
