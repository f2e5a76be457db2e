//! Chunk metadata store interface and its shared in-memory table

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use chunkseal_core::{ChunkRecord, ChunkStatistics, SealError, SealResult};

/// Durable chunk and session records.
///
/// Chunk ids are unique and so is `(session_id, sequence)`; an insert that
/// violates either fails with `DuplicateChunk` and changes nothing.
/// Implementations must accept concurrent calls for different sessions.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn insert_chunk(&self, record: &ChunkRecord) -> SealResult<()>;

    async fn get_chunk(&self, chunk_id: &str) -> SealResult<Option<ChunkRecord>>;

    /// Records of one session ordered by sequence.
    async fn find_by_session(&self, session_id: &str) -> SealResult<Vec<ChunkRecord>>;

    /// Highest stored sequence for the session, if any.
    async fn last_sequence(&self, session_id: &str) -> SealResult<Option<u64>>;

    /// Returns false if no such chunk existed.
    async fn delete_chunk(&self, chunk_id: &str) -> SealResult<bool>;

    /// Returns the number of records removed.
    async fn delete_by_session(&self, session_id: &str) -> SealResult<u64>;

    /// Chunks with `created_at <= cutoff` (Unix milliseconds).
    async fn find_created_before(&self, cutoff: u64) -> SealResult<Vec<ChunkRecord>>;

    async fn aggregate_statistics(&self) -> SealResult<ChunkStatistics>;

    /// Record that a session exists. Returns false if it already did.
    async fn register_session(&self, session_id: &str) -> SealResult<bool>;

    async fn session_exists(&self, session_id: &str) -> SealResult<bool>;

    /// Returns false if the session was not registered.
    async fn remove_session(&self, session_id: &str) -> SealResult<bool>;

    /// Point a chunk record at a new blob locator. Returns false if no such
    /// chunk exists.
    async fn relocate_chunk(&self, chunk_id: &str, storage_locator: &str) -> SealResult<bool>;

    /// Set or clear the archived flag. Returns false if the session was not
    /// registered.
    async fn set_session_archived(&self, session_id: &str, archived: bool) -> SealResult<bool>;

    /// False for unregistered sessions.
    async fn session_archived(&self, session_id: &str) -> SealResult<bool>;
}

/// Chunk and session records with their secondary indexes.
///
/// Backing state of both bundled backends. Serializes as the session map plus
/// a flat record list; indexes are rebuilt on load.
#[derive(Debug, Clone, Default)]
pub struct ChunkTable {
    chunks: HashMap<String, ChunkRecord>,
    /// session_id → sequence → chunk_id
    positions: HashMap<String, BTreeMap<u64, String>>,
    sessions: BTreeMap<String, SessionEntry>,
}

/// A registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntry {
    /// Unix milliseconds
    pub registered_at: u64,
    #[serde(default)]
    pub archived: bool,
}

#[derive(Serialize, Deserialize)]
struct TableDocument {
    #[serde(default)]
    sessions: BTreeMap<String, SessionEntry>,
    #[serde(default)]
    chunks: Vec<ChunkRecord>,
}

impl ChunkTable {
    pub fn insert(&mut self, record: &ChunkRecord) -> SealResult<()> {
        if self.chunks.contains_key(&record.chunk_id) {
            return Err(SealError::DuplicateChunk(format!(
                "chunk_id {} already stored",
                record.chunk_id
            )));
        }
        if let Some(existing) = self
            .positions
            .get(&record.session_id)
            .and_then(|seqs| seqs.get(&record.sequence))
        {
            return Err(SealError::DuplicateChunk(format!(
                "session {} sequence {} already stored as {existing}",
                record.session_id, record.sequence
            )));
        }
        self.positions
            .entry(record.session_id.clone())
            .or_default()
            .insert(record.sequence, record.chunk_id.clone());
        self.chunks.insert(record.chunk_id.clone(), record.clone());
        Ok(())
    }

    pub fn get(&self, chunk_id: &str) -> Option<ChunkRecord> {
        self.chunks.get(chunk_id).cloned()
    }

    pub fn find_by_session(&self, session_id: &str) -> Vec<ChunkRecord> {
        self.positions
            .get(session_id)
            .map(|seqs| {
                seqs.values()
                    .filter_map(|id| self.chunks.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn last_sequence(&self, session_id: &str) -> Option<u64> {
        self.positions
            .get(session_id)
            .and_then(|seqs| seqs.keys().next_back().copied())
    }

    pub fn delete(&mut self, chunk_id: &str) -> bool {
        let Some(record) = self.chunks.remove(chunk_id) else {
            return false;
        };
        if let Some(seqs) = self.positions.get_mut(&record.session_id) {
            seqs.remove(&record.sequence);
            if seqs.is_empty() {
                self.positions.remove(&record.session_id);
            }
        }
        true
    }

    pub fn delete_session(&mut self, session_id: &str) -> u64 {
        let Some(seqs) = self.positions.remove(session_id) else {
            return 0;
        };
        let mut removed = 0;
        for chunk_id in seqs.values() {
            if self.chunks.remove(chunk_id).is_some() {
                removed += 1;
            }
        }
        removed
    }

    pub fn created_before(&self, cutoff: u64) -> Vec<ChunkRecord> {
        let mut found: Vec<ChunkRecord> = self
            .chunks
            .values()
            .filter(|r| r.created_at <= cutoff)
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            (a.session_id.as_str(), a.sequence).cmp(&(b.session_id.as_str(), b.sequence))
        });
        found
    }

    pub fn relocate(&mut self, chunk_id: &str, storage_locator: &str) -> bool {
        match self.chunks.get_mut(chunk_id) {
            Some(record) => {
                record.storage_locator = storage_locator.to_string();
                true
            }
            None => false,
        }
    }

    pub fn statistics(&self) -> ChunkStatistics {
        let mut stats = ChunkStatistics::from_records(self.chunks.values());
        stats.archived_sessions = self.sessions.values().filter(|s| s.archived).count() as u64;
        stats.active_sessions = self.sessions.len() as u64 - stats.archived_sessions;
        stats
    }

    pub fn register_session(&mut self, session_id: &str, now: u64) -> bool {
        if self.sessions.contains_key(session_id) {
            return false;
        }
        self.sessions.insert(
            session_id.to_string(),
            SessionEntry {
                registered_at: now,
                archived: false,
            },
        );
        true
    }

    pub fn session(&self, session_id: &str) -> Option<SessionEntry> {
        self.sessions.get(session_id).copied()
    }

    pub fn set_archived(&mut self, session_id: &str, archived: bool) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(entry) => {
                entry.archived = archived;
                true
            }
            None => false,
        }
    }

    pub fn session_exists(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn remove_session(&mut self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        let mut chunks: Vec<ChunkRecord> = self.chunks.values().cloned().collect();
        chunks.sort_by(|a, b| {
            (a.session_id.as_str(), a.sequence).cmp(&(b.session_id.as_str(), b.sequence))
        });
        serde_json::to_vec_pretty(&TableDocument {
            sessions: self.sessions.clone(),
            chunks,
        })
    }

    /// Parse a JSON document, re-checking uniqueness as records are indexed.
    pub fn from_json(bytes: &[u8]) -> SealResult<Self> {
        let doc: TableDocument = serde_json::from_slice(bytes)
            .map_err(|e| SealError::StorageRead(format!("parsing metadata document: {e}")))?;
        let mut table = ChunkTable {
            sessions: doc.sessions,
            ..Default::default()
        };
        for record in &doc.chunks {
            table.insert(record)?;
        }
        Ok(table)
    }
}
