//! Session orchestration: chunks in, leaves appended, root anchored
//!
//! For one session, chunk N is persisted and appended as leaf N before chunk
//! N+1 is read. Leaf order therefore always equals sequence order.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chunkseal_chunks::segment_slice;
use chunkseal_core::{ChunkRecord, Digest, IntegrityStage, SealConfig, SealError, SealResult};
use chunkseal_crypto::{SessionKeyInfo, TransformPipeline};
use chunkseal_merkle::{AnchorRequest, MerkleRegistry, TreeProof};
use chunkseal_storage::{BlobStore, MetadataStore};

use crate::engine::ChunkStore;

/// Receives finalized roots for submission to an external ledger.
#[async_trait]
pub trait Anchor: Send + Sync {
    async fn submit(&self, request: &AnchorRequest) -> SealResult<()>;
}

/// Anchor that keeps every request in memory.
#[derive(Debug, Default)]
pub struct RecordingAnchor {
    requests: Mutex<Vec<AnchorRequest>>,
}

impl RecordingAnchor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<AnchorRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Anchor for RecordingAnchor {
    async fn submit(&self, request: &AnchorRequest) -> SealResult<()> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionOpened {
    pub key: SessionKeyInfo,
    pub tree_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub session_id: String,
    pub chunks: u64,
    pub bytes: u64,
    /// Root over the leaves appended so far
    pub root_hash: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub session_id: String,
    pub chunks_verified: u64,
    pub bytes: u64,
    pub stream_digest: Digest,
    pub root_hash: Digest,
    pub finalized: bool,
}

pub struct SessionIngest {
    store: Arc<ChunkStore>,
    trees: Arc<MerkleRegistry>,
    anchor: Arc<dyn Anchor>,
}

impl SessionIngest {
    pub fn new(
        store: Arc<ChunkStore>,
        trees: Arc<MerkleRegistry>,
        anchor: Arc<dyn Anchor>,
    ) -> Self {
        Self {
            store,
            trees,
            anchor,
        }
    }

    /// Wire a pipeline, store, and registry from one configuration, opening
    /// the blob backend it names.
    pub fn from_config(
        config: SealConfig,
        metadata: Arc<dyn MetadataStore>,
        anchor: Arc<dyn Anchor>,
    ) -> SealResult<Self> {
        config.validate()?;
        let blobs = BlobStore::from_config(&config.storage)?;
        Self::with_blobs(config, blobs, metadata, anchor)
    }

    /// Like `from_config` with an already opened blob store.
    pub fn with_blobs(
        config: SealConfig,
        blobs: BlobStore,
        metadata: Arc<dyn MetadataStore>,
        anchor: Arc<dyn Anchor>,
    ) -> SealResult<Self> {
        config.validate()?;
        let pipeline = Arc::new(TransformPipeline::new(config.transform.clone()));
        let trees = Arc::new(MerkleRegistry::new(config.transform.hash));
        let store = Arc::new(ChunkStore::new(config, pipeline, blobs, metadata));
        Ok(Self::new(store, trees, anchor))
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    pub fn trees(&self) -> &Arc<MerkleRegistry> {
        &self.trees
    }

    /// Register the session, generate its key, and start its tree.
    ///
    /// Steps already taken are undone if a later one fails.
    pub async fn open(&self, session_id: &str) -> SealResult<SessionOpened> {
        let metadata = self.store.metadata();
        let registered = metadata.register_session(session_id).await?;

        let key = match self.store.pipeline().init_session(session_id) {
            Ok(key) => key,
            Err(e) => {
                if registered {
                    metadata.remove_session(session_id).await?;
                }
                return Err(e);
            }
        };

        let tree_id = match self.trees.init(session_id) {
            Ok(id) => id,
            Err(e) => {
                self.store.pipeline().cleanup_session(session_id);
                if registered {
                    metadata.remove_session(session_id).await?;
                }
                return Err(e);
            }
        };

        info!(
            session = %session_id,
            tree = %tree_id,
            key = %key.key_fingerprint,
            "session opened"
        );
        Ok(SessionOpened { key, tree_id })
    }

    /// Persist one externally cut chunk and append its leaf.
    pub async fn ingest_chunk(
        &self,
        session_id: &str,
        sequence: u64,
        raw: &[u8],
    ) -> SealResult<ChunkRecord> {
        if self.trees.status(session_id)?.finalized {
            return Err(SealError::TreeFinalized(session_id.to_string()));
        }
        let record = self.store.write_chunk(session_id, sequence, raw).await?;
        self.append_leaf(&record)?;
        Ok(record)
    }

    fn append_leaf(&self, record: &ChunkRecord) -> SealResult<()> {
        self.trees
            .add_leaf(
                &record.session_id,
                &record.chunk_id,
                record.sequence,
                record.hash_encrypted,
            )
            .map(|_| ())
            .map_err(|e| {
                warn!(
                    session = %record.session_id,
                    chunk = %record.chunk_id,
                    "chunk persisted but leaf append failed: {e}"
                );
                e
            })
    }

    /// Segment an in-memory buffer into the session after its last stored
    /// chunk, appending a leaf per chunk. Stops at the first failure.
    pub async fn ingest_buffer(
        &self,
        session_id: &str,
        data: &[u8],
    ) -> SealResult<IngestSummary> {
        if self.trees.status(session_id)?.finalized {
            return Err(SealError::TreeFinalized(session_id.to_string()));
        }

        let first = self.store.next_sequence(session_id).await?;
        let segments = segment_slice(data, self.store.config().chunking.max_chunk_size);
        for segment in &segments {
            self.ingest_chunk(session_id, first + segment.sequence, segment.slice(data))
                .await?;
        }

        Ok(IngestSummary {
            session_id: session_id.to_string(),
            chunks: segments.len() as u64,
            bytes: data.len() as u64,
            root_hash: self.trees.status(session_id)?.root_hash,
        })
    }

    /// Segment `source` into the session, appending a leaf per chunk.
    ///
    /// Stops at the first failure; the session stays open (Building) for the
    /// caller to clean up or resume.
    pub async fn ingest_stream<R>(
        &self,
        session_id: &str,
        source: R,
        cancel: CancellationToken,
    ) -> SealResult<IngestSummary>
    where
        R: AsyncRead + Unpin + Send,
    {
        if self.trees.status(session_id)?.finalized {
            return Err(SealError::TreeFinalized(session_id.to_string()));
        }

        let mut stream = self.store.segment_stream(session_id, source, cancel);
        let mut chunks = 0u64;
        while let Some(record) = stream.next_chunk().await? {
            self.append_leaf(&record)?;
            chunks += 1;
        }

        Ok(IngestSummary {
            session_id: session_id.to_string(),
            chunks,
            bytes: stream.bytes_read(),
            root_hash: self.trees.status(session_id)?.root_hash,
        })
    }

    /// Freeze the session's tree and hand its root to the anchor.
    pub async fn finalize(&self, session_id: &str) -> SealResult<TreeProof> {
        let proof = self.trees.finalize(session_id)?;
        let request = proof.anchor_request();
        self.anchor.submit(&request).await?;

        info!(
            session = %session_id,
            root = %request.root_hash,
            leaves = request.leaf_count,
            height = request.height,
            "session root submitted for anchoring"
        );
        Ok(proof)
    }

    /// Reconstruct with full verification and prove every chunk into the
    /// tree. The first failing chunk is reported by id.
    pub async fn audit(&self, session_id: &str) -> SealResult<AuditReport> {
        let mut sink = tokio::io::sink();
        let summary = self
            .store
            .reconstruct_to(session_id, &mut sink, true)
            .await?;

        let records = self.store.list_chunks(session_id).await?;
        for record in &records {
            let result = self
                .trees
                .verify_leaf(session_id, &record.chunk_id, record.hash_encrypted)?;
            if !result.valid {
                return Err(SealError::Integrity {
                    chunk_id: record.chunk_id.clone(),
                    stage: IntegrityStage::MerkleProof,
                    detail: format!("leaf {} failed: {:?}", result.leaf_index, result.failure),
                });
            }
        }

        let status = self.trees.status(session_id)?;
        if status.leaf_count != records.len() as u64 {
            let chunk_id = records
                .last()
                .map(|r| r.chunk_id.clone())
                .unwrap_or_default();
            return Err(SealError::Integrity {
                chunk_id,
                stage: IntegrityStage::MerkleProof,
                detail: format!(
                    "tree has {} leaves but {} chunks are stored",
                    status.leaf_count,
                    records.len()
                ),
            });
        }

        info!(
            session = %session_id,
            chunks = summary.chunks,
            bytes = summary.bytes,
            root = %status.root_hash,
            "session audit passed"
        );
        Ok(AuditReport {
            session_id: session_id.to_string(),
            chunks_verified: summary.chunks,
            bytes: summary.bytes,
            stream_digest: summary.stream_digest,
            root_hash: status.root_hash,
            finalized: status.finalized,
        })
    }

    /// Discard the session's key and tree. Stored chunks are kept.
    pub fn close(&self, session_id: &str) {
        let had_key = self.store.pipeline().cleanup_session(session_id);
        let had_tree = self.trees.cleanup(session_id);
        info!(session = %session_id, had_key, had_tree, "session closed");
    }

    /// Close the session and delete its chunks and session record.
    pub async fn delete_session(&self, session_id: &str) -> SealResult<u64> {
        self.close(session_id);
        let removed = self.store.delete_session_chunks(session_id).await?;
        self.store.metadata().remove_session(session_id).await?;
        Ok(removed)
    }
}
