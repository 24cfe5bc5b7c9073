// # Storage Adapter
//
// Persistence seam for the delta log. The engine talks to storage through
// the [`StorageAdapter`] trait only; the on-disk key-value backend is an
// external collaborator behind a get/put/scan surface.
//
// Two reference implementations:
//
// - [`MemoryStorage`]: insertion-ordered list + id map, scan yields in
//   insertion order.
// - [`DiskStorage`]: ordered on-disk KV (sled) with five key families,
//   chronological scans over the `T:` family, resumable by cursor key.
//
// Writes are idempotent on delta id: re-putting an already-persisted id is
// a no-op that reports `false`.

pub mod disk;
pub mod memory;

pub use disk::DiskStorage;
pub use memory::MemoryStorage;

use crate::common::CancellationToken;
use crate::delta::Delta;
use crate::Result;
use async_trait::async_trait;

/// Default page size for [`StorageAdapter::scan`].
pub const DEFAULT_SCAN_PAGE: usize = 1024;

/// Options for a resumable scan over the delta log.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Opaque cursor from a previous [`ScanPage::next_cursor`]; `None`
    /// starts from the beginning.
    pub cursor: Option<String>,
    /// Maximum deltas to return in this page.
    pub limit: Option<usize>,
    /// Cooperative cancellation, checked between deltas.
    pub cancel: Option<CancellationToken>,
}

impl ScanOptions {
    pub fn with_cursor<S: Into<String>>(mut self, cursor: S) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// One page of scan results.
#[derive(Debug, Clone)]
pub struct ScanPage {
    pub deltas: Vec<Delta>,
    /// Present when more data may follow; feed back into
    /// [`ScanOptions::cursor`] to resume.
    pub next_cursor: Option<String>,
}

/// Pluggable persistence for immutable deltas.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Persist a delta. Returns `false` when the id was already present
    /// (idempotent no-op), `true` when newly written.
    async fn put(&self, delta: &Delta) -> Result<bool>;

    /// Fetch one delta by id.
    async fn get(&self, id: &str) -> Result<Option<Delta>>;

    /// Fetch many deltas by id; unknown ids are silently skipped.
    async fn multi_get(&self, ids: &[String]) -> Result<Vec<Delta>> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(delta) = self.get(id).await? {
                found.push(delta);
            }
        }
        Ok(found)
    }

    /// One page of the log. Memory backends yield insertion order; the disk
    /// backend yields chronological order via its timestamp key family.
    async fn scan(&self, options: ScanOptions) -> Result<ScanPage>;

    /// Number of persisted deltas.
    async fn len(&self) -> Result<usize>;

    /// Flush and release resources. Further operations may fail.
    async fn close(&self) -> Result<()>;

    /// Drain every page of the log, honoring cancellation.
    async fn scan_all(&self, cancel: Option<CancellationToken>) -> Result<Vec<Delta>> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            if let Some(token) = &cancel {
                token.check()?;
            }
            let mut options = ScanOptions::default().with_limit(DEFAULT_SCAN_PAGE);
            options.cursor = cursor;
            options.cancel = cancel.clone();
            let page = self.scan(options).await?;
            let done = page.next_cursor.is_none() || page.deltas.is_empty();
            all.extend(page.deltas);
            if done {
                return Ok(all);
            }
            cursor = page.next_cursor;
        }
    }
}
