// # Query Engine
//
// Filtered reads over the delta log. A [`DeltaFilter`] combines fields
// conjunctively; values within one field combine disjunctively. The engine
// asks the index planner for candidate ids, falls back to a full scan when
// no indexed field is present, then applies residue filters: explicit ids,
// the ad-hoc predicate, and negation exclusion.
//
// Result order is unspecified; callers sort when they need an order.

pub mod engine;
pub mod filter;

pub use engine::QueryEngine;
pub use filter::{DeltaFilter, DeltaPredicate, TimestampRange};
