//! In-memory metadata store.
//!
//! Same semantics as the JSON backend without persistence; everything is lost
//! when the store is dropped.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use chunkseal_core::{now_millis, ChunkRecord, ChunkStatistics, SealResult};

use crate::metadata::{ChunkTable, MetadataStore};

#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    inner: RwLock<ChunkTable>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&ChunkTable) -> T) -> T {
        f(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write<T>(&self, f: impl FnOnce(&mut ChunkTable) -> T) -> T {
        f(&mut self.inner.write().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn insert_chunk(&self, record: &ChunkRecord) -> SealResult<()> {
        self.write(|t| t.insert(record))
    }

    async fn get_chunk(&self, chunk_id: &str) -> SealResult<Option<ChunkRecord>> {
        Ok(self.read(|t| t.get(chunk_id)))
    }

    async fn find_by_session(&self, session_id: &str) -> SealResult<Vec<ChunkRecord>> {
        Ok(self.read(|t| t.find_by_session(session_id)))
    }

    async fn last_sequence(&self, session_id: &str) -> SealResult<Option<u64>> {
        Ok(self.read(|t| t.last_sequence(session_id)))
    }

    async fn delete_chunk(&self, chunk_id: &str) -> SealResult<bool> {
        Ok(self.write(|t| t.delete(chunk_id)))
    }

    async fn delete_by_session(&self, session_id: &str) -> SealResult<u64> {
        Ok(self.write(|t| t.delete_session(session_id)))
    }

    async fn find_created_before(&self, cutoff: u64) -> SealResult<Vec<ChunkRecord>> {
        Ok(self.read(|t| t.created_before(cutoff)))
    }

    async fn aggregate_statistics(&self) -> SealResult<ChunkStatistics> {
        Ok(self.read(|t| t.statistics()))
    }

    async fn register_session(&self, session_id: &str) -> SealResult<bool> {
        Ok(self.write(|t| t.register_session(session_id, now_millis())))
    }

    async fn session_exists(&self, session_id: &str) -> SealResult<bool> {
        Ok(self.read(|t| t.session_exists(session_id)))
    }

    async fn remove_session(&self, session_id: &str) -> SealResult<bool> {
        Ok(self.write(|t| t.remove_session(session_id)))
    }

    async fn relocate_chunk(&self, chunk_id: &str, storage_locator: &str) -> SealResult<bool> {
        Ok(self.write(|t| t.relocate(chunk_id, storage_locator)))
    }

    async fn set_session_archived(&self, session_id: &str, archived: bool) -> SealResult<bool> {
        Ok(self.write(|t| t.set_archived(session_id, archived)))
    }

    async fn session_archived(&self, session_id: &str) -> SealResult<bool> {
        Ok(self.read(|t| t.session(session_id).is_some_and(|s| s.archived)))
    }
}
