// # HyperSchemas
//
// A HyperSchema is a selection + transformation recipe: a selector decides
// which deltas belong to an entity's projection and under which properties,
// and transformation rules (keyed by pointer `local_context`) recursively
// project referenced entities under other schemas.
//
// Schemas shape reads only. Registration never constrains writes, and the
// registry's optional DAG validation guards the *schema* graph; no DAG is
// enforced on the data.

pub mod bootstrap;
pub mod fingerprint;
pub mod model;
pub mod registry;

pub use bootstrap::{compile_schema, meta_schema, META_SCHEMA_ID};
pub use fingerprint::schema_fingerprint;
pub use model::{
    DeltaSelector, HyperSchema, SchemaRef, SelectorDecision, TransformPredicate,
    TransformationRule,
};
pub use registry::{topo_sort, SchemaRegistry};
