// RhizomeDB - Local-first, append-only, delta-oriented database
// Core library module

pub mod common;
pub mod config;
pub mod database;
pub mod delta;
pub mod error;
pub mod federation;
pub mod index;
pub mod negation;
pub mod query;
pub mod schema;
pub mod storage;
pub mod subscription;
pub mod timetravel;
pub mod view;

pub use config::{DatabaseConfig, StorageKind};
pub use database::{DatabaseStats, RhizomeDb};
pub use delta::{Delta, DeltaBuilder, Pointer, PointerTarget, PrimitiveValue};
pub use error::{Result, RhizomeError};
pub use query::{DeltaFilter, TimestampRange};
pub use schema::{DeltaSelector, HyperSchema, SelectorDecision, TransformationRule};
pub use view::{HyperView, MaterializedHyperView, View, ViewSchema};

/// Crate version, surfaced in logs and stats.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
