// # Delta Model
//
// The unit of data in rhizomedb: an immutable, timestamped, authored
// assertion carrying a list of typed pointers. Pointers either reference
// other domain entities by identifier or carry primitive values. Domain
// entities have no stored row; they exist only as the set of deltas that
// point at them.
//
// ## Negation
//
// Logical removal happens only via negation: a delta with a pointer whose
// `local_context` is [`NEGATES_CONTEXT`] and whose reference target id
// equals another delta's id negates that delta. Negations are themselves
// deltas and may themselves be negated; effective status is computed by the
// negation resolver, never stored.

pub mod model;
pub mod validator;

pub use model::{
    Delta, DeltaBuilder, EntityReference, Pointer, PointerTarget, PrimitiveValue,
};
pub use validator::validate_delta;

/// The `local_context` that marks a pointer as a negation edge.
pub const NEGATES_CONTEXT: &str = "negates";

/// Property name used when a selector answers `IncludeDefault`.
pub const DEFAULT_PROPERTY: &str = "_default";
