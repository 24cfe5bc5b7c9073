// # On-Disk Storage
//
// Ordered key-value backend over sled with five key families:
//
// ```text
// D:<id>                      -> delta payload (JSON)
// T:<padded-timestamp>:<id>   -> id            (chronological scans)
// A:<author>:<id>             -> id
// S:<system>:<id>             -> id
// X:<target-id>:<id>          -> id            (referenced entities)
// ```
//
// Timestamps are zero-padded to 20 digits so lexicographic key order equals
// chronological order. Each put applies one batched write covering every
// family. Scans walk the `T:` family and resume from a cursor key
// (exclusive), so an interrupted scan can pick up where it stopped.

use crate::delta::Delta;
use crate::storage::{ScanOptions, ScanPage, StorageAdapter, DEFAULT_SCAN_PAGE};
use crate::{Result, RhizomeError};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

const FAMILY_DELTA: &str = "D:";
const FAMILY_TIMESTAMP: &str = "T:";
const FAMILY_AUTHOR: &str = "A:";
const FAMILY_SYSTEM: &str = "S:";
const FAMILY_TARGET: &str = "X:";

/// Width of the zero-padded timestamp segment in `T:` keys.
const TIMESTAMP_PAD: usize = 20;

/// Sled-backed delta log. Contents survive close and reopen.
pub struct DiskStorage {
    db: sled::Db,
    closed: AtomicBool,
}

impl DiskStorage {
    /// Open (or create) the store under `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(RhizomeError::InvalidState(
                "storage adapter is closed".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn delta_key(id: &str) -> Vec<u8> {
        format!("{FAMILY_DELTA}{id}").into_bytes()
    }

    fn timestamp_key(timestamp: u64, id: &str) -> Vec<u8> {
        format!("{FAMILY_TIMESTAMP}{timestamp:0width$}:{id}", width = TIMESTAMP_PAD).into_bytes()
    }

    fn decode_delta(bytes: &[u8]) -> Result<Delta> {
        serde_json::from_slice(bytes)
            .map_err(|e| RhizomeError::Storage(format!("corrupt delta payload: {e}")))
    }
}

#[async_trait]
impl StorageAdapter for DiskStorage {
    async fn put(&self, delta: &Delta) -> Result<bool> {
        self.ensure_open()?;
        let delta_key = Self::delta_key(&delta.id);
        if self.db.contains_key(&delta_key)? {
            return Ok(false);
        }

        let payload = serde_json::to_vec(delta)?;
        let id_bytes = delta.id.as_bytes().to_vec();

        let mut batch = sled::Batch::default();
        batch.insert(delta_key, payload);
        batch.insert(Self::timestamp_key(delta.timestamp, &delta.id), id_bytes.clone());
        batch.insert(
            format!("{FAMILY_AUTHOR}{}:{}", delta.author, delta.id).into_bytes(),
            id_bytes.clone(),
        );
        batch.insert(
            format!("{FAMILY_SYSTEM}{}:{}", delta.system, delta.id).into_bytes(),
            id_bytes.clone(),
        );
        let targets: BTreeSet<&str> = delta.referenced_entities().into_iter().collect();
        for target in targets {
            batch.insert(
                format!("{FAMILY_TARGET}{target}:{}", delta.id).into_bytes(),
                id_bytes.clone(),
            );
        }
        self.db.apply_batch(batch)?;
        Ok(true)
    }

    async fn get(&self, id: &str) -> Result<Option<Delta>> {
        self.ensure_open()?;
        match self.db.get(Self::delta_key(id))? {
            Some(bytes) => Ok(Some(Self::decode_delta(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn scan(&self, options: ScanOptions) -> Result<ScanPage> {
        self.ensure_open()?;
        let limit = options.limit.unwrap_or(DEFAULT_SCAN_PAGE);

        let lower: Bound<Vec<u8>> = match &options.cursor {
            Some(cursor) => Bound::Excluded(cursor.clone().into_bytes()),
            None => Bound::Included(FAMILY_TIMESTAMP.as_bytes().to_vec()),
        };

        let mut deltas = Vec::new();
        let mut last_key: Option<String> = None;
        for item in self.db.range((lower, Bound::<Vec<u8>>::Unbounded)) {
            if let Some(token) = &options.cancel {
                token.check()?;
            }
            let (key, id_bytes) = item?;
            if !key.starts_with(FAMILY_TIMESTAMP.as_bytes()) {
                break;
            }
            if deltas.len() >= limit {
                return Ok(ScanPage {
                    deltas,
                    next_cursor: last_key,
                });
            }
            let id = String::from_utf8_lossy(&id_bytes).to_string();
            if let Some(delta) = self.get(&id).await? {
                deltas.push(delta);
            }
            last_key = Some(String::from_utf8_lossy(&key).to_string());
        }

        Ok(ScanPage {
            deltas,
            next_cursor: None,
        })
    }

    async fn len(&self) -> Result<usize> {
        self.ensure_open()?;
        let mut count = 0;
        for item in self.db.scan_prefix(FAMILY_DELTA.as_bytes()) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.db.flush_async().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{DeltaBuilder, Pointer};

    fn delta(id: &str, ts: u64) -> Delta {
        DeltaBuilder::new("alice", "sys-a")
            .with_id(id)
            .with_timestamp(ts)
            .pointer(Pointer::reference_in("named", "e1", "name"))
            .pointer(Pointer::primitive("name", "Alice"))
            .build()
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(dir.path()).unwrap();

        assert!(storage.put(&delta("d-1", 1000)).await.unwrap());
        let fetched = storage.get("d-1").await.unwrap().unwrap();
        assert_eq!(fetched.id, "d-1");
        assert_eq!(fetched.pointers.len(), 2);
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(dir.path()).unwrap();

        assert!(storage.put(&delta("d-1", 1000)).await.unwrap());
        assert!(!storage.put(&delta("d-1", 2000)).await.unwrap());
        assert_eq!(storage.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scan_is_chronological() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(dir.path()).unwrap();

        // Inserted out of timestamp order.
        storage.put(&delta("d-3", 3000)).await.unwrap();
        storage.put(&delta("d-1", 1000)).await.unwrap();
        storage.put(&delta("d-2", 2000)).await.unwrap();

        let page = storage.scan(ScanOptions::default()).await.unwrap();
        let ids: Vec<&str> = page.deltas.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d-1", "d-2", "d-3"]);
    }

    #[tokio::test]
    async fn test_scan_cursor_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(dir.path()).unwrap();
        for i in 1..=5u64 {
            storage.put(&delta(&format!("d-{i}"), i * 1000)).await.unwrap();
        }

        let first = storage
            .scan(ScanOptions::default().with_limit(3))
            .await
            .unwrap();
        assert_eq!(first.deltas.len(), 3);
        let cursor = first.next_cursor.expect("expected resumable cursor");

        let rest = storage
            .scan(ScanOptions::default().with_cursor(cursor))
            .await
            .unwrap();
        let ids: Vec<&str> = rest.deltas.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d-4", "d-5"]);
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let storage = DiskStorage::open(dir.path()).unwrap();
            storage.put(&delta("d-1", 1000)).await.unwrap();
            storage.put(&delta("d-2", 2000)).await.unwrap();
            storage.close().await.unwrap();
        }

        let reopened = DiskStorage::open(dir.path()).unwrap();
        assert_eq!(reopened.len().await.unwrap(), 2);
        let fetched = reopened.get("d-2").await.unwrap().unwrap();
        assert_eq!(fetched.timestamp, 2000);
    }

    #[tokio::test]
    async fn test_key_family_layout() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(dir.path()).unwrap();
        storage.put(&delta("d-1", 42)).await.unwrap();

        let keys: Vec<String> = storage
            .db
            .iter()
            .map(|item| String::from_utf8_lossy(&item.unwrap().0).to_string())
            .collect();

        assert!(keys.contains(&"D:d-1".to_string()));
        assert!(keys.contains(&"T:00000000000000000042:d-1".to_string()));
        assert!(keys.contains(&"A:alice:d-1".to_string()));
        assert!(keys.contains(&"S:sys-a:d-1".to_string()));
        assert!(keys.contains(&"X:e1:d-1".to_string()));
    }
}
