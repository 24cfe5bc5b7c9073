// # View Resolution
//
// Collapses a HyperView into a flat View by applying a per-property
// conflict-resolution strategy to the competing deltas, then extracting a
// value from the winner. Numeric aggregates short-circuit extraction and
// return the aggregate directly. Resolution is pure and idempotent: the
// same HyperView and ViewSchema always produce the same View.

use crate::common::EntityId;
use crate::view::hyperview::{HyperView, ProjectedDelta};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Strategies
// ============================================================================

pub type ResolverFn = Arc<dyn Fn(&[ProjectedDelta]) -> Option<usize> + Send + Sync>;
pub type ExtractorFn = Arc<dyn Fn(&ProjectedDelta) -> serde_json::Value + Send + Sync>;

/// Picks the winning delta (or the whole list) for one property.
#[derive(Clone)]
pub enum ResolutionStrategy {
    /// Highest timestamp wins; delta id breaks ties.
    MostRecent,
    /// Lowest timestamp wins.
    FirstWrite,
    /// First author in the priority list with any delta wins (most recent
    /// among theirs); falls back to `MostRecent` when none is present.
    TrustedAuthors(Vec<String>),
    /// Same, keyed by originating system.
    TrustedSystems(Vec<String>),
    /// Largest group of deltas with pairwise-equal pointer sets wins; the
    /// group's most recent delta represents it.
    Majority,
    /// Minimum over numeric pointer targets. Short-circuits extraction.
    Min,
    /// Maximum over numeric pointer targets. Short-circuits extraction.
    Max,
    /// Mean over numeric pointer targets. Short-circuits extraction.
    Mean,
    /// No conflict resolution: every delta's extraction, as an array.
    AllValues,
    /// Named host resolver returning the winning index.
    Custom { name: String, f: ResolverFn },
}

impl ResolutionStrategy {
    pub fn custom<N, F>(name: N, f: F) -> Self
    where
        N: Into<String>,
        F: Fn(&[ProjectedDelta]) -> Option<usize> + Send + Sync + 'static,
    {
        ResolutionStrategy::Custom {
            name: name.into(),
            f: Arc::new(f),
        }
    }
}

impl fmt::Debug for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionStrategy::MostRecent => write!(f, "MostRecent"),
            ResolutionStrategy::FirstWrite => write!(f, "FirstWrite"),
            ResolutionStrategy::TrustedAuthors(list) => write!(f, "TrustedAuthors({list:?})"),
            ResolutionStrategy::TrustedSystems(list) => write!(f, "TrustedSystems({list:?})"),
            ResolutionStrategy::Majority => write!(f, "Majority"),
            ResolutionStrategy::Min => write!(f, "Min"),
            ResolutionStrategy::Max => write!(f, "Max"),
            ResolutionStrategy::Mean => write!(f, "Mean"),
            ResolutionStrategy::AllValues => write!(f, "AllValues"),
            ResolutionStrategy::Custom { name, .. } => write!(f, "Custom({name})"),
        }
    }
}

/// Turns the winning delta into the View's property value.
#[derive(Clone)]
pub enum ExtractStrategy {
    /// Value of the first pointer with this `local_context`: primitives as
    /// their scalar, references as `{ "id": ... }`, nested views as their
    /// JSON form.
    PointerValue(String),
    /// The winning delta's timestamp.
    TimestampOf,
    /// Named host extractor.
    Custom { name: String, f: ExtractorFn },
}

impl ExtractStrategy {
    pub fn pointer<S: Into<String>>(local_context: S) -> Self {
        ExtractStrategy::PointerValue(local_context.into())
    }

    pub fn custom<N, F>(name: N, f: F) -> Self
    where
        N: Into<String>,
        F: Fn(&ProjectedDelta) -> serde_json::Value + Send + Sync + 'static,
    {
        ExtractStrategy::Custom {
            name: name.into(),
            f: Arc::new(f),
        }
    }

    fn extract(&self, delta: &ProjectedDelta) -> serde_json::Value {
        match self {
            ExtractStrategy::PointerValue(context) => delta
                .pointers
                .iter()
                .find(|p| &p.local_context == context)
                .map(|p| serde_json::to_value(&p.target).unwrap_or(serde_json::Value::Null))
                .unwrap_or(serde_json::Value::Null),
            ExtractStrategy::TimestampOf => serde_json::Value::from(delta.timestamp),
            ExtractStrategy::Custom { f, .. } => f(delta),
        }
    }
}

impl fmt::Debug for ExtractStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractStrategy::PointerValue(ctx) => write!(f, "PointerValue({ctx})"),
            ExtractStrategy::TimestampOf => write!(f, "TimestampOf"),
            ExtractStrategy::Custom { name, .. } => write!(f, "Custom({name})"),
        }
    }
}

// ============================================================================
// ViewSchema and View
// ============================================================================

/// One output property of a ViewSchema.
#[derive(Debug, Clone)]
pub struct PropertyRule {
    pub source_property: String,
    pub extract: ExtractStrategy,
    pub resolve: ResolutionStrategy,
}

impl PropertyRule {
    pub fn new<S: Into<String>>(
        source_property: S,
        extract: ExtractStrategy,
        resolve: ResolutionStrategy,
    ) -> Self {
        Self {
            source_property: source_property.into(),
            extract,
            resolve,
        }
    }
}

/// Output property -> rule map collapsing a HyperView into a View.
#[derive(Debug, Clone, Default)]
pub struct ViewSchema {
    pub properties: BTreeMap<String, PropertyRule>,
}

impl ViewSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_property<S: Into<String>>(mut self, output: S, rule: PropertyRule) -> Self {
        self.properties.insert(output.into(), rule);
        self
    }
}

/// Flat, conflict-resolved projection. Properties with no contributing
/// deltas are omitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct View {
    pub id: EntityId,
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl View {
    pub fn property(&self, name: &str) -> Option<&serde_json::Value> {
        self.properties.get(name)
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Apply `schema` to `hyperview`, producing a flat View.
pub fn resolve_view(hyperview: &HyperView, schema: &ViewSchema) -> View {
    let mut view = View {
        id: hyperview.id.clone(),
        properties: BTreeMap::new(),
    };

    for (output, rule) in &schema.properties {
        let deltas = hyperview.property(&rule.source_property);
        if deltas.is_empty() {
            continue;
        }
        if let Some(value) = resolve_property(deltas, rule) {
            view.properties.insert(output.clone(), value);
        }
    }

    view
}

fn resolve_property(deltas: &[ProjectedDelta], rule: &PropertyRule) -> Option<serde_json::Value> {
    match &rule.resolve {
        ResolutionStrategy::MostRecent => pick(deltas, most_recent(deltas), rule),
        ResolutionStrategy::FirstWrite => pick(deltas, first_write(deltas), rule),
        ResolutionStrategy::TrustedAuthors(priority) => {
            let winner = trusted(deltas, priority, |d| &d.author).or_else(|| most_recent(deltas));
            pick(deltas, winner, rule)
        }
        ResolutionStrategy::TrustedSystems(priority) => {
            let winner = trusted(deltas, priority, |d| &d.system).or_else(|| most_recent(deltas));
            pick(deltas, winner, rule)
        }
        ResolutionStrategy::Majority => pick(deltas, majority(deltas), rule),
        ResolutionStrategy::Min => numeric_aggregate(deltas, |values| {
            values.iter().copied().fold(f64::INFINITY, f64::min)
        }),
        ResolutionStrategy::Max => numeric_aggregate(deltas, |values| {
            values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
        }),
        ResolutionStrategy::Mean => numeric_aggregate(deltas, |values| {
            values.iter().sum::<f64>() / values.len() as f64
        }),
        ResolutionStrategy::AllValues => Some(serde_json::Value::Array(
            deltas.iter().map(|d| rule.extract.extract(d)).collect(),
        )),
        ResolutionStrategy::Custom { f, .. } => pick(deltas, f(deltas), rule),
    }
}

fn pick(
    deltas: &[ProjectedDelta],
    winner: Option<usize>,
    rule: &PropertyRule,
) -> Option<serde_json::Value> {
    winner.and_then(|idx| deltas.get(idx)).map(|d| rule.extract.extract(d))
}

fn most_recent(deltas: &[ProjectedDelta]) -> Option<usize> {
    deltas
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)))
        .map(|(idx, _)| idx)
}

fn first_write(deltas: &[ProjectedDelta]) -> Option<usize> {
    deltas
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)))
        .map(|(idx, _)| idx)
}

fn trusted<'a, F>(deltas: &'a [ProjectedDelta], priority: &[String], key: F) -> Option<usize>
where
    F: Fn(&'a ProjectedDelta) -> &'a String,
{
    for trusted_key in priority {
        let candidates: Vec<usize> = deltas
            .iter()
            .enumerate()
            .filter(|&(_, d)| key(d) == trusted_key)
            .map(|(idx, _)| idx)
            .collect();
        if let Some(winner) = candidates
            .into_iter()
            .max_by_key(|&idx| (deltas[idx].timestamp, deltas[idx].id.clone()))
        {
            return Some(winner);
        }
    }
    None
}

/// Group by pointer-set equality (order-insensitive), largest group wins,
/// represented by its most recent member.
fn majority(deltas: &[ProjectedDelta]) -> Option<usize> {
    let pointer_sets_equal = |a: &ProjectedDelta, b: &ProjectedDelta| {
        a.pointers.len() == b.pointers.len()
            && a.pointers.iter().all(|p| b.pointers.contains(p))
    };

    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (idx, delta) in deltas.iter().enumerate() {
        match groups
            .iter_mut()
            .find(|g| pointer_sets_equal(&deltas[g[0]], delta))
        {
            Some(group) => group.push(idx),
            None => groups.push(vec![idx]),
        }
    }

    groups
        .into_iter()
        .max_by_key(|g| {
            let newest = g
                .iter()
                .map(|&idx| (deltas[idx].timestamp, deltas[idx].id.clone()))
                .max();
            (g.len(), newest)
        })
        .and_then(|group| {
            group
                .into_iter()
                .max_by_key(|&idx| (deltas[idx].timestamp, deltas[idx].id.clone()))
        })
}

fn numeric_aggregate<F>(deltas: &[ProjectedDelta], combine: F) -> Option<serde_json::Value>
where
    F: Fn(&[f64]) -> f64,
{
    let values: Vec<f64> = deltas
        .iter()
        .flat_map(|d| d.pointers.iter())
        .filter_map(|p| p.target.as_primitive())
        .filter_map(|v| v.as_number())
        .collect();
    if values.is_empty() {
        return None;
    }
    serde_json::Number::from_f64(combine(&values)).map(serde_json::Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{DeltaBuilder, Pointer};

    fn projected(id: &str, ts: u64, author: &str, system: &str, name: &str) -> ProjectedDelta {
        (&DeltaBuilder::new(author, system)
            .with_id(id)
            .with_timestamp(ts)
            .pointer(Pointer::reference_in("named", "e1", "name"))
            .pointer(Pointer::primitive("name", name))
            .build())
            .into()
    }

    fn aged(id: &str, ts: u64, age: f64) -> ProjectedDelta {
        (&DeltaBuilder::new("alice", "sys-a")
            .with_id(id)
            .with_timestamp(ts)
            .pointer(Pointer::reference_in("aged", "e1", "age"))
            .pointer(Pointer::primitive("age", age))
            .build())
            .into()
    }

    fn hyperview_with(property: &str, deltas: Vec<ProjectedDelta>) -> HyperView {
        let mut view = HyperView::new("e1");
        view.properties.insert(property.to_string(), deltas);
        view
    }

    fn name_schema(resolve: ResolutionStrategy) -> ViewSchema {
        ViewSchema::new().with_property(
            "name",
            PropertyRule::new("name", ExtractStrategy::pointer("name"), resolve),
        )
    }

    #[test]
    fn test_most_recent_wins() {
        let view = hyperview_with(
            "name",
            vec![
                projected("d-1", 1000, "alice", "sys-a", "Old"),
                projected("d-2", 2000, "alice", "sys-a", "New"),
            ],
        );
        let resolved = resolve_view(&view, &name_schema(ResolutionStrategy::MostRecent));
        assert_eq!(resolved.property("name"), Some(&serde_json::json!("New")));
    }

    #[test]
    fn test_first_write_wins() {
        let view = hyperview_with(
            "name",
            vec![
                projected("d-2", 2000, "alice", "sys-a", "New"),
                projected("d-1", 1000, "alice", "sys-a", "Old"),
            ],
        );
        let resolved = resolve_view(&view, &name_schema(ResolutionStrategy::FirstWrite));
        assert_eq!(resolved.property("name"), Some(&serde_json::json!("Old")));
    }

    #[test]
    fn test_trusted_authors_priority_and_fallback() {
        let deltas = vec![
            projected("d-1", 3000, "mallory", "sys-a", "Wrong"),
            projected("d-2", 1000, "alice", "sys-a", "Right"),
        ];
        let view = hyperview_with("name", deltas.clone());
        let resolved = resolve_view(
            &view,
            &name_schema(ResolutionStrategy::TrustedAuthors(vec![
                "bob".to_string(),
                "alice".to_string(),
            ])),
        );
        assert_eq!(resolved.property("name"), Some(&serde_json::json!("Right")));

        // No trusted author present: falls back to most recent.
        let resolved = resolve_view(
            &view,
            &name_schema(ResolutionStrategy::TrustedAuthors(vec!["carol".to_string()])),
        );
        assert_eq!(resolved.property("name"), Some(&serde_json::json!("Wrong")));
    }

    #[test]
    fn test_trusted_systems() {
        let view = hyperview_with(
            "name",
            vec![
                projected("d-1", 3000, "x", "sys-b", "FromB"),
                projected("d-2", 1000, "y", "sys-a", "FromA"),
            ],
        );
        let resolved = resolve_view(
            &view,
            &name_schema(ResolutionStrategy::TrustedSystems(vec!["sys-a".to_string()])),
        );
        assert_eq!(resolved.property("name"), Some(&serde_json::json!("FromA")));
    }

    #[test]
    fn test_majority_by_pointer_set() {
        let view = hyperview_with(
            "name",
            vec![
                projected("d-1", 1000, "a", "s", "Alice"),
                projected("d-2", 2000, "b", "s", "Alice"),
                projected("d-3", 3000, "c", "s", "Mallory"),
            ],
        );
        let resolved = resolve_view(&view, &name_schema(ResolutionStrategy::Majority));
        assert_eq!(resolved.property("name"), Some(&serde_json::json!("Alice")));
    }

    #[test]
    fn test_numeric_aggregates_short_circuit_extraction() {
        let view = hyperview_with("age", vec![aged("d-1", 1, 30.0), aged("d-2", 2, 40.0)]);
        // Extraction deliberately points at a context that does not exist;
        // aggregates must not consult it.
        let schema = |resolve| {
            ViewSchema::new().with_property(
                "age",
                PropertyRule::new("age", ExtractStrategy::pointer("missing"), resolve),
            )
        };

        let min = resolve_view(&view, &schema(ResolutionStrategy::Min));
        assert_eq!(min.property("age"), Some(&serde_json::json!(30.0)));
        let max = resolve_view(&view, &schema(ResolutionStrategy::Max));
        assert_eq!(max.property("age"), Some(&serde_json::json!(40.0)));
        let mean = resolve_view(&view, &schema(ResolutionStrategy::Mean));
        assert_eq!(mean.property("age"), Some(&serde_json::json!(35.0)));
    }

    #[test]
    fn test_all_values_passthrough() {
        let view = hyperview_with(
            "name",
            vec![
                projected("d-1", 1000, "a", "s", "One"),
                projected("d-2", 2000, "a", "s", "Two"),
            ],
        );
        let resolved = resolve_view(&view, &name_schema(ResolutionStrategy::AllValues));
        assert_eq!(
            resolved.property("name"),
            Some(&serde_json::json!(["One", "Two"]))
        );
    }

    #[test]
    fn test_custom_resolver_and_extractor() {
        let view = hyperview_with(
            "name",
            vec![
                projected("d-1", 1000, "a", "s", "One"),
                projected("d-2", 2000, "a", "s", "Two"),
            ],
        );
        let schema = ViewSchema::new().with_property(
            "picked_by",
            PropertyRule::new(
                "name",
                ExtractStrategy::custom("author-of", |d| serde_json::json!(d.author)),
                ResolutionStrategy::custom("always-first", |_| Some(0)),
            ),
        );
        let resolved = resolve_view(&view, &schema);
        assert_eq!(resolved.property("picked_by"), Some(&serde_json::json!("a")));
    }

    #[test]
    fn test_empty_property_omitted_and_idempotent() {
        let view = hyperview_with("name", vec![]);
        let schema = name_schema(ResolutionStrategy::MostRecent);
        let first = resolve_view(&view, &schema);
        assert!(first.property("name").is_none());
        assert_eq!(first, resolve_view(&view, &schema));
    }

    #[test]
    fn test_missing_pointer_extracts_null() {
        let view = hyperview_with("name", vec![projected("d-1", 1000, "a", "s", "One")]);
        let schema = ViewSchema::new().with_property(
            "name",
            PropertyRule::new(
                "name",
                ExtractStrategy::pointer("nonexistent"),
                ResolutionStrategy::MostRecent,
            ),
        );
        let resolved = resolve_view(&view, &schema);
        assert_eq!(resolved.property("name"), Some(&serde_json::Value::Null));
    }
}
