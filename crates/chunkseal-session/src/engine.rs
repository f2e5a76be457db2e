//! Chunk store engine
//!
//! Sequencing authority is the metadata store: the next sequence a session
//! accepts is its highest stored sequence plus one. Callers must not run
//! `write_chunk` concurrently for one session; different sessions are fully
//! independent.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use chunkseal_chunks::{hash_bytes, segment_slice, StreamHasher};
use chunkseal_core::{
    now_millis, ChunkRecord, ChunkStatistics, Digest, IntegrityStage, SealConfig, SealError,
    SealResult,
};
use chunkseal_crypto::TransformPipeline;
use chunkseal_storage::{BlobStore, MetadataStore};

use crate::stream::ChunkStream;

/// Outcome of a streamed reconstruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconstructSummary {
    pub session_id: String,
    pub chunks: u64,
    pub bytes: u64,
    /// Digest of the whole reconstructed stream
    pub stream_digest: Digest,
    pub verified: bool,
}

pub struct ChunkStore {
    config: SealConfig,
    pipeline: Arc<TransformPipeline>,
    blobs: BlobStore,
    metadata: Arc<dyn MetadataStore>,
}

impl ChunkStore {
    pub fn new(
        config: SealConfig,
        pipeline: Arc<TransformPipeline>,
        blobs: BlobStore,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            config,
            pipeline,
            blobs,
            metadata,
        }
    }

    pub fn config(&self) -> &SealConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Arc<TransformPipeline> {
        &self.pipeline
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    /// Blob key for one chunk.
    pub fn locator(&self, session_id: &str, sequence: u64, chunk_id: &str) -> String {
        format!(
            "{}/chunks/{session_id}/{sequence:08}-{chunk_id}",
            self.blob_prefix()
        )
    }

    /// Blob key for one chunk of an archived session.
    pub fn archive_locator(&self, session_id: &str, sequence: u64, chunk_id: &str) -> String {
        format!(
            "{}/archived/{session_id}/{sequence:08}-{chunk_id}",
            self.blob_prefix()
        )
    }

    fn blob_prefix(&self) -> &str {
        self.config.storage.blob_prefix.trim_end_matches('/')
    }

    /// Lazily cut `source` into chunks of at most `max_chunk_size` bytes,
    /// persisting each as it is produced.
    pub fn segment_stream<R>(
        &self,
        session_id: &str,
        source: R,
        cancel: CancellationToken,
    ) -> ChunkStream<'_, R>
    where
        R: AsyncRead + Unpin + Send,
    {
        ChunkStream::new(
            self,
            session_id,
            source,
            self.config.chunking.max_chunk_size,
            cancel,
        )
    }

    /// The only sequence `write_chunk` will accept next for the session.
    pub async fn next_sequence(&self, session_id: &str) -> SealResult<u64> {
        Ok(self
            .metadata
            .last_sequence(session_id)
            .await?
            .map_or(0, |last| last + 1))
    }

    /// Transform and persist one chunk at `sequence`.
    ///
    /// The sequence must be exactly the session's next one and the session
    /// must not be archived. If the record cannot be stored after the blob
    /// was written, the blob is removed again before the error is returned.
    pub async fn write_chunk(
        &self,
        session_id: &str,
        sequence: u64,
        raw: &[u8],
    ) -> SealResult<ChunkRecord> {
        if self.metadata.session_archived(session_id).await? {
            warn!(session = %session_id, sequence, "write to archived session rejected");
            return Err(SealError::SessionArchived(session_id.to_string()));
        }

        let expected = self.next_sequence(session_id).await?;
        if sequence != expected {
            warn!(
                session = %session_id,
                expected,
                got = sequence,
                "out-of-order chunk write rejected"
            );
            return Err(SealError::OutOfOrder {
                session_id: session_id.to_string(),
                expected,
                got: sequence,
            });
        }

        let meta = self.pipeline.process(session_id, raw, sequence)?;

        let chunk_id = uuid::Uuid::new_v4().to_string();
        let storage_locator = self.locator(session_id, sequence, &chunk_id);
        let record = ChunkRecord {
            chunk_id,
            session_id: session_id.to_string(),
            sequence,
            original_size: meta.original_size,
            compressed_size: meta.compressed_size,
            encrypted_size: meta.encrypted_size,
            compression_ratio: meta.compression_ratio,
            hash_algorithm: meta.hash_algorithm,
            hash_original: meta.hash_original,
            hash_compressed: meta.hash_compressed,
            hash_encrypted: meta.hash_encrypted,
            created_at: now_millis(),
            storage_locator,
        };

        self.blobs.put(&record.storage_locator, meta.sealed).await?;

        if let Err(e) = self.metadata.insert_chunk(&record).await {
            if let Err(rollback) = self.blobs.delete(&record.storage_locator).await {
                warn!(
                    locator = %record.storage_locator,
                    "rollback of chunk blob failed: {rollback}"
                );
            }
            return Err(match e {
                SealError::DuplicateChunk(_) | SealError::StorageWrite(_) => e,
                other => SealError::StorageWrite(format!(
                    "chunk record for {session_id}/{sequence}: {other}"
                )),
            });
        }

        info!(
            session = %session_id,
            sequence,
            chunk = %record.chunk_id,
            original = record.original_size,
            stored = record.encrypted_size,
            ratio = record.compression_ratio,
            "chunk written"
        );
        Ok(record)
    }

    /// Cut an in-memory buffer into chunks of at most `max_chunk_size` bytes
    /// and persist them after the session's last stored sequence.
    ///
    /// Stops at the first failure; chunks written before it stay stored.
    pub async fn write_buffer(
        &self,
        session_id: &str,
        data: &[u8],
    ) -> SealResult<Vec<ChunkRecord>> {
        let first = self.next_sequence(session_id).await?;
        let segments = segment_slice(data, self.config.chunking.max_chunk_size);
        let mut records = Vec::with_capacity(segments.len());
        for segment in &segments {
            let record = self
                .write_chunk(session_id, first + segment.sequence, segment.slice(data))
                .await?;
            records.push(record);
        }
        Ok(records)
    }

    /// Chunks of a session in sequence order.
    pub async fn list_chunks(&self, session_id: &str) -> SealResult<Vec<ChunkRecord>> {
        self.metadata.find_by_session(session_id).await
    }

    pub async fn get_chunk(&self, chunk_id: &str) -> SealResult<Option<ChunkRecord>> {
        self.metadata.get_chunk(chunk_id).await
    }

    /// Fetch and reverse one chunk.
    ///
    /// With `verify`, each stage is checked against the record in order:
    /// stored bytes, AEAD tag, compressed payload, decompression, raw size
    /// and digest.
    /// Without it only the AEAD tag is checked.
    pub async fn read_chunk(&self, record: &ChunkRecord, verify: bool) -> SealResult<Vec<u8>> {
        let algorithm = record.hash_algorithm;
        let sealed = self.blobs.get(&record.storage_locator).await?;

        if verify {
            check_stage(
                record,
                IntegrityStage::EncryptedHash,
                &record.hash_encrypted,
                &hash_bytes(algorithm, &sealed),
            )?;
        }

        let opened = self
            .pipeline
            .open_payload(&record.session_id, &sealed)
            .map_err(|e| match e {
                SealError::Authentication { .. } | SealError::Decryption { .. } => {
                    integrity_error(record, IntegrityStage::Authentication, e.to_string())
                }
                other => other,
            })?;

        if verify {
            check_stage(
                record,
                IntegrityStage::CompressedHash,
                &record.hash_compressed,
                &hash_bytes(algorithm, &opened.payload),
            )?;
        }

        let raw = opened
            .decompress()
            .map_err(|e| integrity_error(record, IntegrityStage::Decompression, e.to_string()))?;

        if verify {
            if raw.len() as u64 != record.original_size {
                return Err(integrity_error(
                    record,
                    IntegrityStage::OriginalHash,
                    format!(
                        "recorded size {} bytes, recovered {} bytes",
                        record.original_size,
                        raw.len()
                    ),
                ));
            }
            check_stage(
                record,
                IntegrityStage::OriginalHash,
                &record.hash_original,
                &hash_bytes(algorithm, &raw),
            )?;
        }

        debug!(
            session = %record.session_id,
            sequence = record.sequence,
            bytes = raw.len(),
            verified = verify,
            "chunk read"
        );
        Ok(raw)
    }

    /// Session records, checked to be a dense `0..N` range.
    async fn contiguous_chunks(&self, session_id: &str) -> SealResult<Vec<ChunkRecord>> {
        let records = self.list_chunks(session_id).await?;
        if records.is_empty() {
            return Err(SealError::SessionNotFound(session_id.to_string()));
        }
        for (expected, record) in records.iter().enumerate() {
            if record.sequence != expected as u64 {
                error!(
                    session = %session_id,
                    expected,
                    found = record.sequence,
                    "session has a sequence gap"
                );
                return Err(SealError::MissingSequence {
                    session_id: session_id.to_string(),
                    expected: expected as u64,
                    found: Some(record.sequence),
                });
            }
        }
        Ok(records)
    }

    /// Rebuild the original byte stream of a session.
    ///
    /// Nothing is returned unless every chunk is present and, with `verify`,
    /// passes every stage check.
    pub async fn reconstruct(&self, session_id: &str, verify: bool) -> SealResult<Vec<u8>> {
        let records = self.contiguous_chunks(session_id).await?;
        // Recorded sizes are untrusted until each chunk verifies
        let mut out = Vec::new();
        for record in &records {
            out.extend_from_slice(&self.read_chunk(record, verify).await?);
        }

        info!(
            session = %session_id,
            chunks = records.len(),
            bytes = out.len(),
            verified = verify,
            "session reconstructed"
        );
        Ok(out)
    }

    /// Stream the original bytes of a session into `writer`.
    ///
    /// Gaps are detected before anything is written. An integrity failure
    /// midway leaves the chunks before it in `writer`; discard the output on
    /// error.
    pub async fn reconstruct_to<W>(
        &self,
        session_id: &str,
        writer: &mut W,
        verify: bool,
    ) -> SealResult<ReconstructSummary>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let records = self.contiguous_chunks(session_id).await?;
        let mut hasher = StreamHasher::new(self.pipeline.hash_algorithm());
        let mut bytes = 0u64;

        for record in &records {
            let raw = self.read_chunk(record, verify).await?;
            writer.write_all(&raw).await?;
            hasher.update(&raw);
            bytes += raw.len() as u64;
        }
        writer.flush().await?;

        Ok(ReconstructSummary {
            session_id: session_id.to_string(),
            chunks: records.len() as u64,
            bytes,
            stream_digest: hasher.finalize(),
            verified: verify,
        })
    }

    /// Remove every blob and record of a session, continuing past
    /// per-chunk failures. Returns the number of records removed.
    pub async fn delete_session_chunks(&self, session_id: &str) -> SealResult<u64> {
        let records = self.list_chunks(session_id).await?;
        let mut removed = 0u64;
        for record in &records {
            if self.delete_one(record).await {
                removed += 1;
            }
        }

        info!(
            session = %session_id,
            removed,
            total = records.len(),
            "session chunks deleted"
        );
        Ok(removed)
    }

    async fn delete_one(&self, record: &ChunkRecord) -> bool {
        if let Err(e) = self.blobs.delete(&record.storage_locator).await {
            warn!(
                chunk = %record.chunk_id,
                locator = %record.storage_locator,
                "chunk blob delete failed: {e}"
            );
        }
        match self.metadata.delete_chunk(&record.chunk_id).await {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!(chunk = %record.chunk_id, "chunk record delete failed: {e}");
                false
            }
        }
    }

    /// Move every blob of a registered session under `archived/` and flag
    /// the session archived. Archived sessions stay readable but refuse new
    /// chunks. Returns the number of blobs moved.
    pub async fn archive_session(&self, session_id: &str) -> SealResult<u64> {
        self.relocate_session(session_id, true).await
    }

    /// Undo `archive_session`. A session that is not archived moves nothing.
    pub async fn restore_session(&self, session_id: &str) -> SealResult<u64> {
        self.relocate_session(session_id, false).await
    }

    /// Copy each blob to its target locator, repoint the record, then drop
    /// the old blob. Chunks already at their target are skipped, so an
    /// interrupted run can simply be repeated.
    async fn relocate_session(&self, session_id: &str, archive: bool) -> SealResult<u64> {
        if !self.metadata.session_exists(session_id).await? {
            return Err(SealError::SessionNotFound(session_id.to_string()));
        }

        let records = self.list_chunks(session_id).await?;
        let mut moved = 0u64;
        for record in &records {
            let target = if archive {
                self.archive_locator(session_id, record.sequence, &record.chunk_id)
            } else {
                self.locator(session_id, record.sequence, &record.chunk_id)
            };
            if record.storage_locator == target {
                continue;
            }

            let sealed = self.blobs.get(&record.storage_locator).await?;
            self.blobs.put(&target, sealed).await?;

            let repointed = match self.metadata.relocate_chunk(&record.chunk_id, &target).await {
                Ok(repointed) => repointed,
                Err(e) => {
                    self.discard_blob(&target).await;
                    return Err(e);
                }
            };
            if !repointed {
                debug!(chunk = %record.chunk_id, "chunk record vanished during relocation");
                self.discard_blob(&target).await;
                continue;
            }
            self.discard_blob(&record.storage_locator).await;
            moved += 1;
        }

        self.metadata.set_session_archived(session_id, archive).await?;
        info!(
            session = %session_id,
            moved,
            total = records.len(),
            archived = archive,
            "session relocated"
        );
        Ok(moved)
    }

    async fn discard_blob(&self, locator: &str) {
        if let Err(e) = self.blobs.delete(locator).await {
            warn!(locator = %locator, "stale chunk blob delete failed: {e}");
        }
    }

    /// Sweep chunks older than `older_than` whose session record is gone.
    ///
    /// Session existence is checked again immediately before each delete, so
    /// a session registered while the sweep runs keeps its chunks.
    pub async fn cleanup_orphans(&self, older_than: Duration) -> SealResult<u64> {
        let cutoff = now_millis().saturating_sub(older_than.as_millis() as u64);
        let candidates = self.metadata.find_created_before(cutoff).await?;

        let mut by_session: BTreeMap<&str, Vec<&ChunkRecord>> = BTreeMap::new();
        for record in &candidates {
            by_session
                .entry(record.session_id.as_str())
                .or_default()
                .push(record);
        }

        let mut removed = 0u64;
        for (session_id, records) in by_session {
            if self.metadata.session_exists(session_id).await? {
                continue;
            }
            for record in records {
                if self.metadata.session_exists(session_id).await? {
                    debug!(session = %session_id, "session reappeared during orphan sweep");
                    break;
                }
                if self.delete_one(record).await {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            info!(removed, cutoff, "orphaned chunks removed");
        }
        Ok(removed)
    }

    /// `cleanup_orphans` with the configured retention window.
    pub async fn cleanup_orphans_default(&self) -> SealResult<u64> {
        self.cleanup_orphans(self.config.retention.orphan_retention())
            .await
    }

    /// Aggregate metrics over every stored chunk record.
    pub async fn statistics(&self) -> SealResult<ChunkStatistics> {
        self.metadata.aggregate_statistics().await
    }
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore")
            .field("config", &self.config)
            .field("pipeline", &self.pipeline)
            .field("blobs", &self.blobs)
            .finish_non_exhaustive()
    }
}

fn integrity_error(record: &ChunkRecord, stage: IntegrityStage, detail: String) -> SealError {
    error!(
        session = %record.session_id,
        sequence = record.sequence,
        chunk = %record.chunk_id,
        %stage,
        "integrity check failed: {detail}"
    );
    SealError::Integrity {
        chunk_id: record.chunk_id.clone(),
        stage,
        detail,
    }
}

fn check_stage(
    record: &ChunkRecord,
    stage: IntegrityStage,
    expected: &Digest,
    actual: &Digest,
) -> SealResult<()> {
    if expected == actual {
        return Ok(());
    }
    Err(integrity_error(
        record,
        stage,
        format!("expected {}, computed {}", expected.short(), actual.short()),
    ))
}
