//! Single-file JSON metadata store.
//!
//! The whole table is held in memory and rewritten on every mutation with an
//! atomic write (temp file, then rename). A mutation is applied to a copy and
//! only becomes visible once the copy is on disk, so a failed flush leaves
//! both the file and the in-memory view unchanged.
//!
//! Each write clones and serializes the entire table, so ingesting N chunks
//! costs O(N²) in total. That is fine for a single host with a few thousand
//! chunks; larger deployments want a database-backed `MetadataStore`.
//! Mutations that change nothing skip the rewrite.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use chunkseal_core::{now_millis, ChunkRecord, ChunkStatistics, SealError, SealResult};

use crate::metadata::{ChunkTable, MetadataStore};

#[derive(Debug)]
pub struct JsonMetadataStore {
    path: PathBuf,
    table: Mutex<ChunkTable>,
}

impl JsonMetadataStore {
    /// Open or create the store at `path`.
    pub async fn open(path: &Path) -> SealResult<Self> {
        let table = match tokio::fs::read(path).await {
            Ok(bytes) => ChunkTable::from_json(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ChunkTable::default(),
            Err(e) => {
                return Err(SealError::StorageRead(format!(
                    "reading metadata store {}: {e}",
                    path.display()
                )))
            }
        };

        debug!(path = %path.display(), chunks = table.len(), "metadata store opened");
        Ok(Self {
            path: path.to_path_buf(),
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, table: &ChunkTable) -> anyhow::Result<()> {
        let json = table.to_json().context("serializing metadata store")?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating directory: {}", parent.display()))?;
        }

        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &json)
            .await
            .with_context(|| format!("writing metadata temp: {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("renaming metadata temp to {}", self.path.display()))?;
        Ok(())
    }

    /// Apply `f` to a copy of the table, persist it, then publish it.
    ///
    /// `f` returns its result and whether the table changed; an unchanged
    /// table is neither written nor swapped.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut ChunkTable) -> SealResult<(T, bool)>,
    ) -> SealResult<T> {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        let (out, changed) = f(&mut next)?;
        if !changed {
            return Ok(out);
        }
        self.flush(&next)
            .await
            .map_err(|e| SealError::StorageWrite(format!("{e:#}")))?;
        *table = next;
        Ok(out)
    }
}

#[async_trait]
impl MetadataStore for JsonMetadataStore {
    async fn insert_chunk(&self, record: &ChunkRecord) -> SealResult<()> {
        self.mutate(|t| t.insert(record).map(|()| ((), true))).await
    }

    async fn get_chunk(&self, chunk_id: &str) -> SealResult<Option<ChunkRecord>> {
        Ok(self.table.lock().await.get(chunk_id))
    }

    async fn find_by_session(&self, session_id: &str) -> SealResult<Vec<ChunkRecord>> {
        Ok(self.table.lock().await.find_by_session(session_id))
    }

    async fn last_sequence(&self, session_id: &str) -> SealResult<Option<u64>> {
        Ok(self.table.lock().await.last_sequence(session_id))
    }

    async fn delete_chunk(&self, chunk_id: &str) -> SealResult<bool> {
        self.mutate(|t| {
            let deleted = t.delete(chunk_id);
            Ok((deleted, deleted))
        })
        .await
    }

    async fn delete_by_session(&self, session_id: &str) -> SealResult<u64> {
        self.mutate(|t| {
            let removed = t.delete_session(session_id);
            Ok((removed, removed > 0))
        })
        .await
    }

    async fn find_created_before(&self, cutoff: u64) -> SealResult<Vec<ChunkRecord>> {
        Ok(self.table.lock().await.created_before(cutoff))
    }

    async fn aggregate_statistics(&self) -> SealResult<ChunkStatistics> {
        Ok(self.table.lock().await.statistics())
    }

    async fn register_session(&self, session_id: &str) -> SealResult<bool> {
        self.mutate(|t| {
            let added = t.register_session(session_id, now_millis());
            Ok((added, added))
        })
        .await
    }

    async fn session_exists(&self, session_id: &str) -> SealResult<bool> {
        Ok(self.table.lock().await.session_exists(session_id))
    }

    async fn remove_session(&self, session_id: &str) -> SealResult<bool> {
        self.mutate(|t| {
            let removed = t.remove_session(session_id);
            Ok((removed, removed))
        })
        .await
    }

    async fn relocate_chunk(&self, chunk_id: &str, storage_locator: &str) -> SealResult<bool> {
        self.mutate(|t| {
            let moved = t.relocate(chunk_id, storage_locator);
            Ok((moved, moved))
        })
        .await
    }

    async fn set_session_archived(&self, session_id: &str, archived: bool) -> SealResult<bool> {
        self.mutate(|t| {
            let Some(entry) = t.session(session_id) else {
                return Ok((false, false));
            };
            t.set_archived(session_id, archived);
            Ok((true, entry.archived != archived))
        })
        .await
    }

    async fn session_archived(&self, session_id: &str) -> SealResult<bool> {
        Ok(self
            .table
            .lock()
            .await
            .session(session_id)
            .is_some_and(|s| s.archived))
    }
}
