// # Negation Resolver
//
// Computes the set of delta ids whose effective status is "negated" at a
// point in time. A delta is negated iff at least one negating delta points
// at it whose own effective status is not negated; a negation that is
// itself negated stops counting, so an even chain re-asserts the original
// (double negation).
//
// The resolver is a pure function over a slice of deltas. It never touches
// storage; callers hand it the log (or the `timestamp <= as_of` slice of
// it) and get back the negated id set.

use crate::common::{now_millis, DeltaId, Timestamp};
use crate::delta::Delta;
use std::collections::{HashMap, HashSet};

/// Upper bound on fixed-point iterations, guarding against pathological
/// negation chains and cycles in the data.
pub const MAX_NEGATION_ROUNDS: usize = 100;

/// Ids of deltas effectively negated at `as_of` (or now, when `None`).
///
/// Deltas with `timestamp > as_of` are invisible: they neither count as
/// negators nor can they be negated. A future-dated negation therefore
/// takes effect only once its nominal time arrives, and time-travel
/// queries get their gating for free.
pub fn effective_negations<'a, I>(deltas: I, as_of: Option<Timestamp>) -> HashSet<DeltaId>
where
    I: IntoIterator<Item = &'a Delta>,
{
    let cutoff = as_of.unwrap_or_else(now_millis);

    // target id -> ids of deltas negating it, restricted to the time slice.
    let mut incoming: HashMap<&str, Vec<&str>> = HashMap::new();
    for delta in deltas {
        if delta.timestamp > cutoff {
            continue;
        }
        for target in delta.negated_delta_ids() {
            incoming.entry(target).or_default().push(&delta.id);
        }
    }

    if incoming.is_empty() {
        return HashSet::new();
    }

    let mut negated: HashSet<&str> = HashSet::new();
    for _ in 0..MAX_NEGATION_ROUNDS {
        let mut changed = false;
        for (target, negators) in &incoming {
            let live_negator = negators.iter().any(|n| !negated.contains(n));
            if live_negator {
                changed |= negated.insert(*target);
            } else {
                changed |= negated.remove(*target);
            }
        }
        if !changed {
            break;
        }
    }

    negated.into_iter().map(str::to_string).collect()
}
