// # Common Types and Helpers
//
// Shared types used across all rhizomedb modules: identifiers, wall-clock
// helpers, and the cooperative cancellation token checked by every
// long-running operation (scans, projections, federation sync).

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

// ============================================================================
// Type Aliases - Shared Identifiers
// ============================================================================

/// Opaque delta identifier, globally unique.
pub type DeltaId = String;

/// Domain entity identifier. Entities have no stored row; they exist only as
/// the set of deltas that point at them.
pub type EntityId = String;

/// HyperSchema identifier.
pub type SchemaId = String;

/// Millisecond-resolution epoch timestamp.
pub type Timestamp = u64;

// ============================================================================
// Wall Clock
// ============================================================================

/// Current wall-clock time as milliseconds since the Unix epoch.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation signal.
///
/// Cloneable handle over a shared flag. Long-running operations check
/// [`CancellationToken::is_cancelled`] at loop boundaries and abandon
/// promptly, returning [`crate::RhizomeError::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to every clone of this token.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Return `Err(Cancelled)` if this token has been cancelled.
    pub fn check(&self) -> crate::Result<()> {
        if self.is_cancelled() {
            Err(crate::RhizomeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// Snapshot Counters
// ============================================================================

/// Point-in-time accounting of the delta log, produced by the time-travel
/// engine and surfaced by database stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSnapshot {
    /// Timestamp the snapshot was taken at.
    pub timestamp: Timestamp,
    /// Number of deltas with `timestamp <= snapshot.timestamp`.
    pub delta_count: usize,
    /// Number of effectively negated deltas at that time.
    pub negated_count: usize,
}
