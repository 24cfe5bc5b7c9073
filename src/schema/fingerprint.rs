// # Schema Fingerprints
//
// Stable content hash over a schema's selector identity and its
// transformation graph, used by the materialized-view cache to detect
// entries built under a schema that has since changed. Transformation keys
// come from a sorted map, so the fingerprint is independent of insertion
// order; inline sub-schemas hash recursively.

use crate::schema::model::{HyperSchema, SchemaRef};
use sha2::{Digest, Sha256};

/// Deterministic content hash of a schema, hex-encoded.
pub fn schema_fingerprint(schema: &HyperSchema) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_form(schema).as_bytes());
    format!("{:x}", hasher.finalize())
}

fn canonical_form(schema: &HyperSchema) -> String {
    let mut canon = format!("selector={}", schema.selector.identity());
    for (local_context, rule) in &schema.transformations {
        canon.push_str(";t:");
        canon.push_str(local_context);
        canon.push('=');
        match &rule.schema {
            SchemaRef::Id(id) => {
                canon.push_str("id:");
                canon.push_str(id);
            }
            SchemaRef::Inline(inner) => {
                canon.push_str("inline:");
                canon.push_str(&schema_fingerprint(inner));
            }
            SchemaRef::Primitive => canon.push_str("primitive"),
        }
        if let Some(predicate) = &rule.predicate {
            canon.push('?');
            canon.push_str(predicate.name());
        }
    }
    canon
}
