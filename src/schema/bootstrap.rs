// # Bootstrap Meta-Schema
//
// Schemas can themselves be represented as deltas and discovered at
// runtime from the log. The meta-schema below is transformation-free, so
// the projector can apply it directly without recursing into itself; the
// compiler then turns the resulting HyperView of schema-describing deltas
// into an in-memory [`HyperSchema`].
//
// Conventions for schema-describing deltas (all standard target-context
// placement against the schema entity):
//
// - property `schema_name`: primitive pointer `schema_name` carries the
//   human-readable name.
// - property `property`: primitive pointer `property` declares one
//   selectable property name.
// - property `transformation`: primitive pointer `context` names the
//   pointer `local_context`, reference pointer `schema` names the
//   sub-schema entity to project it under.

use crate::schema::model::{DeltaSelector, HyperSchema, TransformationRule};
use crate::view::hyperview::HyperView;
use crate::{Result, RhizomeError};

/// Well-known id of the bootstrap meta-schema.
pub const META_SCHEMA_ID: &str = "$schema";

/// The transformation-free schema describing schemas.
pub fn meta_schema() -> HyperSchema {
    HyperSchema::new(META_SCHEMA_ID, "Schema").with_selector(DeltaSelector::ByTargetContext)
}

/// Compile a HyperView of schema-describing deltas (projected under the
/// meta-schema) into an in-memory schema descriptor.
pub fn compile_schema(view: &HyperView) -> Result<HyperSchema> {
    let name = view
        .property("schema_name")
        .iter()
        .max_by_key(|d| (d.timestamp, d.id.clone()))
        .and_then(|d| d.pointer_value("schema_name"))
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| {
            RhizomeError::InvalidState(format!(
                "entity {} carries no schema_name delta",
                view.id
            ))
        })?;

    let mut schema = HyperSchema::new(view.id.clone(), name);

    let mut properties: Vec<String> = view
        .property("property")
        .iter()
        .filter_map(|d| d.pointer_value("property"))
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    properties.sort();
    properties.dedup();
    if !properties.is_empty() {
        schema = schema.with_selector(DeltaSelector::ByProperties(properties));
    }

    for delta in view.property("transformation") {
        let context = delta
            .pointer_value("context")
            .and_then(|v| v.as_str().map(str::to_string));
        let target_schema = delta
            .pointers
            .iter()
            .find(|p| p.local_context == "schema")
            .and_then(|p| p.target.entity_id().map(str::to_string));
        if let (Some(context), Some(target_schema)) = (context, target_schema) {
            schema = schema.with_transformation(context, TransformationRule::to_schema(target_schema));
        }
    }

    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::DeltaBuilder;
    use crate::index::IndexSet;
    use crate::schema::registry::SchemaRegistry;
    use crate::storage::{MemoryStorage, StorageAdapter};
    use crate::view::hyperview::Projector;
    use std::sync::Arc;

    #[test]
    fn test_meta_schema_has_no_transformations() {
        let meta = meta_schema();
        assert_eq!(meta.id, META_SCHEMA_ID);
        assert!(meta.transformations.is_empty());
    }

    #[tokio::test]
    async fn test_compile_schema_from_deltas() {
        let storage = Arc::new(MemoryStorage::new());
        let indexes = Arc::new(IndexSet::new(true));
        let registry = Arc::new(SchemaRegistry::new(false));

        let deltas = vec![
            DeltaBuilder::new("admin", "sys-a")
                .with_id("s-1")
                .with_timestamp(1000)
                .set_property("schema:post", "schema_name", "Post")
                .build(),
            DeltaBuilder::new("admin", "sys-a")
                .with_id("s-2")
                .with_timestamp(1100)
                .set_property("schema:post", "property", "title")
                .build(),
            DeltaBuilder::new("admin", "sys-a")
                .with_id("s-3")
                .with_timestamp(1200)
                .set_property("schema:post", "property", "author")
                .build(),
            DeltaBuilder::new("admin", "sys-a")
                .with_id("s-4")
                .with_timestamp(1300)
                .pointer(crate::delta::Pointer::reference_in(
                    "described",
                    "schema:post",
                    "transformation",
                ))
                .pointer(crate::delta::Pointer::primitive("context", "author"))
                .pointer(crate::delta::Pointer::reference("schema", "schema:person"))
                .build(),
        ];
        for delta in &deltas {
            storage.put(delta).await.unwrap();
            indexes.insert(delta);
        }

        let projector = Projector::new(storage, indexes, registry);
        let view = projector
            .project("schema:post", &meta_schema(), None, None)
            .await
            .unwrap();

        let compiled = compile_schema(&view).unwrap();
        assert_eq!(compiled.id, "schema:post");
        assert_eq!(compiled.name, "Post");
        assert!(matches!(
            &compiled.selector,
            DeltaSelector::ByProperties(props) if props == &vec!["author".to_string(), "title".to_string()]
        ));
        assert!(compiled.transformations.contains_key("author"));
    }

    #[test]
    fn test_compile_requires_name() {
        let view = HyperView::new("schema:empty");
        assert!(compile_schema(&view).is_err());
    }
}
