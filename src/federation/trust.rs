// # Trust Policies
//
// Inbound deltas are verified against the link's trust policy before they
// touch the local log. A policy may list trusted authors, list trusted
// systems, and carry a named host predicate; every present clause must
// pass. Policies combine by AND. Violations produce the reason string
// answered in `delta_nack`.

use crate::delta::Delta;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

pub type TrustPredicateFn = Arc<dyn Fn(&Delta) -> bool + Send + Sync>;

/// Named host predicate clause.
#[derive(Clone)]
pub struct TrustPredicate {
    name: String,
    f: TrustPredicateFn,
}

impl TrustPredicate {
    pub fn new<N, F>(name: N, f: F) -> Self
    where
        N: Into<String>,
        F: Fn(&Delta) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Arc::new(f),
        }
    }
}

impl fmt::Debug for TrustPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrustPredicate({})", self.name)
    }
}

/// Conjunctive trust clauses over inbound deltas.
///
/// An empty policy accepts everything.
#[derive(Debug, Clone, Default)]
pub struct TrustPolicy {
    trusted_authors: Option<HashSet<String>>,
    trusted_systems: Option<HashSet<String>>,
    predicate: Option<TrustPredicate>,
    combined_with: Vec<TrustPolicy>,
}

impl TrustPolicy {
    /// Policy with no clauses; accepts every delta.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Restrict to a set of trusted authors.
    pub fn authors<I, S>(authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::default().with_authors(authors)
    }

    /// Restrict to a set of trusted systems.
    pub fn systems<I, S>(systems: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::default().with_systems(systems)
    }

    pub fn with_authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trusted_authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_systems<I, S>(mut self, systems: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trusted_systems = Some(systems.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_predicate<N, F>(mut self, name: N, f: F) -> Self
    where
        N: Into<String>,
        F: Fn(&Delta) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(TrustPredicate::new(name, f));
        self
    }

    /// Combine with another policy; both must accept.
    pub fn and(mut self, other: TrustPolicy) -> Self {
        self.combined_with.push(other);
        self
    }

    /// Verify a delta, returning the rejection reason on failure.
    pub fn verify(&self, delta: &Delta) -> std::result::Result<(), String> {
        if let Some(authors) = &self.trusted_authors {
            if !authors.contains(&delta.author) {
                return Err(format!("author {} is not trusted", delta.author));
            }
        }
        if let Some(systems) = &self.trusted_systems {
            if !systems.contains(&delta.system) {
                return Err(format!("system {} is not trusted", delta.system));
            }
        }
        if let Some(predicate) = &self.predicate {
            if !(predicate.f)(delta) {
                return Err(format!("predicate {} rejected delta", predicate.name));
            }
        }
        for policy in &self.combined_with {
            policy.verify(delta)?;
        }
        Ok(())
    }
}
