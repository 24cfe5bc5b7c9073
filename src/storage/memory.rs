// # In-Memory Storage
//
// Reference backend: insertion-ordered id list plus an id -> delta map
// behind a read-write lock. Scans yield insertion order; the cursor is the
// insertion offset.

use crate::delta::Delta;
use crate::storage::{ScanOptions, ScanPage, StorageAdapter, DEFAULT_SCAN_PAGE};
use crate::{Result, RhizomeError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
struct MemoryInner {
    order: Vec<String>,
    by_id: HashMap<String, Delta>,
    closed: bool,
}

/// Insertion-ordered in-memory delta log.
#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<MemoryInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn put(&self, delta: &Delta) -> Result<bool> {
        let mut inner = self.inner.write();
        ensure_open(&inner)?;
        if inner.by_id.contains_key(&delta.id) {
            return Ok(false);
        }
        inner.order.push(delta.id.clone());
        inner.by_id.insert(delta.id.clone(), delta.clone());
        Ok(true)
    }

    async fn get(&self, id: &str) -> Result<Option<Delta>> {
        let inner = self.inner.read();
        ensure_open(&inner)?;
        Ok(inner.by_id.get(id).cloned())
    }

    async fn scan(&self, options: ScanOptions) -> Result<ScanPage> {
        let inner = self.inner.read();
        ensure_open(&inner)?;

        let start = match &options.cursor {
            Some(cursor) => cursor
                .parse::<usize>()
                .map_err(|_| RhizomeError::Storage(format!("malformed scan cursor: {cursor}")))?,
            None => 0,
        };
        let limit = options.limit.unwrap_or(DEFAULT_SCAN_PAGE);

        let mut deltas = Vec::new();
        let mut position = start;
        while position < inner.order.len() && deltas.len() < limit {
            if let Some(token) = &options.cancel {
                token.check()?;
            }
            let id = &inner.order[position];
            if let Some(delta) = inner.by_id.get(id) {
                deltas.push(delta.clone());
            }
            position += 1;
        }

        let next_cursor = (position < inner.order.len()).then(|| position.to_string());
        Ok(ScanPage { deltas, next_cursor })
    }

    async fn len(&self) -> Result<usize> {
        let inner = self.inner.read();
        ensure_open(&inner)?;
        Ok(inner.order.len())
    }

    async fn close(&self) -> Result<()> {
        self.inner.write().closed = true;
        Ok(())
    }
}

fn ensure_open(inner: &MemoryInner) -> Result<()> {
    if inner.closed {
        Err(RhizomeError::InvalidState(
            "storage adapter is closed".to_string(),
        ))
    } else {
        Ok(())
    }
}
