//! Chunk store sequencing, rollback, tamper detection, and orphan sweeps.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use chunkseal_core::telemetry::init_test_logging;
use chunkseal_core::{
    ChunkRecord, ChunkStatistics, Digest, IntegrityStage, SealConfig, SealError, SealResult,
};
use chunkseal_crypto::TransformPipeline;
use chunkseal_session::ChunkStore;
use chunkseal_storage::{BlobStore, MemoryMetadataStore, MetadataStore};

fn store_with(blobs: BlobStore, metadata: Arc<dyn MetadataStore>) -> ChunkStore {
    init_test_logging();
    let config = SealConfig::default();
    let pipeline = Arc::new(TransformPipeline::new(config.transform.clone()));
    ChunkStore::new(config, pipeline, blobs, metadata)
}

fn memory_store() -> ChunkStore {
    store_with(
        BlobStore::memory().unwrap(),
        Arc::new(MemoryMetadataStore::new()),
    )
}

fn payload(seq: u64) -> Vec<u8> {
    format!("chunk {seq} ").repeat(64).into_bytes()
}

async fn write_session(store: &ChunkStore, session_id: &str, count: u64) -> Vec<ChunkRecord> {
    store.pipeline().init_session(session_id).unwrap();
    let mut records = Vec::new();
    for seq in 0..count {
        records.push(store.write_chunk(session_id, seq, &payload(seq)).await.unwrap());
    }
    records
}

fn count_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                count_files(&path)
            } else {
                1
            }
        })
        .sum()
}

// --- Sequencing ---

#[tokio::test]
async fn rejects_out_of_order_writes() {
    let store = memory_store();
    write_session(&store, "s1", 2).await;

    match store.write_chunk("s1", 3, b"skip").await {
        Err(SealError::OutOfOrder { expected, got, .. }) => {
            assert_eq!(expected, 2);
            assert_eq!(got, 3);
        }
        other => panic!("expected OutOfOrder, got {other:?}"),
    }
    assert!(matches!(
        store.write_chunk("s1", 1, b"again").await,
        Err(SealError::OutOfOrder { expected: 2, .. })
    ));

    // First chunk of a fresh session must be sequence 0
    store.pipeline().init_session("s2").unwrap();
    assert!(matches!(
        store.write_chunk("s2", 1, b"late start").await,
        Err(SealError::OutOfOrder { expected: 0, .. })
    ));
    assert_eq!(store.list_chunks("s1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn write_without_session_key_fails() {
    let store = memory_store();
    let result = store.write_chunk("nokey", 0, b"data").await;
    assert!(matches!(result, Err(SealError::UnknownSession(_))));
    assert!(store.list_chunks("nokey").await.unwrap().is_empty());
}

#[tokio::test]
async fn reconstruct_reports_sequence_gap() {
    let store = memory_store();
    let records = write_session(&store, "s1", 4).await;

    assert!(store
        .metadata()
        .delete_chunk(&records[2].chunk_id)
        .await
        .unwrap());

    match store.reconstruct("s1", true).await {
        Err(SealError::MissingSequence {
            expected, found, ..
        }) => {
            assert_eq!(expected, 2);
            assert_eq!(found, Some(3));
        }
        other => panic!("expected MissingSequence, got {other:?}"),
    }

    let mut out = Vec::new();
    assert!(store.reconstruct_to("s1", &mut out, false).await.is_err());
    assert!(out.is_empty(), "gap is detected before any byte is written");
}

#[tokio::test]
async fn reconstruct_unknown_session_is_not_found() {
    let store = memory_store();
    assert!(matches!(
        store.reconstruct("ghost", true).await,
        Err(SealError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn records_are_listed_in_sequence_order() {
    let store = memory_store();
    let written = write_session(&store, "s1", 5).await;
    let listed = store.list_chunks("s1").await.unwrap();
    assert_eq!(listed, written);

    let fetched = store.get_chunk(&written[3].chunk_id).await.unwrap().unwrap();
    assert_eq!(fetched.sequence, 3);
    assert!(store.get_chunk("no-such-chunk").await.unwrap().is_none());
}

// --- Rollback ---

/// Accepts everything except chunk inserts.
struct RejectingMetadata {
    inner: MemoryMetadataStore,
}

#[async_trait]
impl MetadataStore for RejectingMetadata {
    async fn insert_chunk(&self, record: &ChunkRecord) -> SealResult<()> {
        Err(SealError::StorageWrite(format!(
            "injected failure for {}",
            record.chunk_id
        )))
    }

    async fn get_chunk(&self, chunk_id: &str) -> SealResult<Option<ChunkRecord>> {
        self.inner.get_chunk(chunk_id).await
    }

    async fn find_by_session(&self, session_id: &str) -> SealResult<Vec<ChunkRecord>> {
        self.inner.find_by_session(session_id).await
    }

    async fn last_sequence(&self, session_id: &str) -> SealResult<Option<u64>> {
        self.inner.last_sequence(session_id).await
    }

    async fn delete_chunk(&self, chunk_id: &str) -> SealResult<bool> {
        self.inner.delete_chunk(chunk_id).await
    }

    async fn delete_by_session(&self, session_id: &str) -> SealResult<u64> {
        self.inner.delete_by_session(session_id).await
    }

    async fn find_created_before(&self, cutoff: u64) -> SealResult<Vec<ChunkRecord>> {
        self.inner.find_created_before(cutoff).await
    }

    async fn aggregate_statistics(&self) -> SealResult<ChunkStatistics> {
        self.inner.aggregate_statistics().await
    }

    async fn register_session(&self, session_id: &str) -> SealResult<bool> {
        self.inner.register_session(session_id).await
    }

    async fn session_exists(&self, session_id: &str) -> SealResult<bool> {
        self.inner.session_exists(session_id).await
    }

    async fn remove_session(&self, session_id: &str) -> SealResult<bool> {
        self.inner.remove_session(session_id).await
    }

    async fn relocate_chunk(&self, chunk_id: &str, storage_locator: &str) -> SealResult<bool> {
        self.inner.relocate_chunk(chunk_id, storage_locator).await
    }

    async fn set_session_archived(&self, session_id: &str, archived: bool) -> SealResult<bool> {
        self.inner.set_session_archived(session_id, archived).await
    }

    async fn session_archived(&self, session_id: &str) -> SealResult<bool> {
        self.inner.session_archived(session_id).await
    }
}

#[tokio::test]
async fn failed_record_insert_removes_blob() {
    let tmp = tempfile::TempDir::new().unwrap();
    let blob_root = tmp.path().join("blobs");
    let store = store_with(
        BlobStore::fs(&blob_root).unwrap(),
        Arc::new(RejectingMetadata {
            inner: MemoryMetadataStore::new(),
        }),
    );
    store.pipeline().init_session("s1").unwrap();

    let result = store.write_chunk("s1", 0, &payload(0)).await;
    assert!(matches!(result, Err(SealError::StorageWrite(_))));
    assert_eq!(count_files(&blob_root), 0, "orphan blob left behind");

    // Sequencing is unaffected by the failed attempt
    assert_eq!(store.metadata().last_sequence("s1").await.unwrap(), None);
}

// --- Tamper detection ---

#[tokio::test]
async fn altered_blob_fails_encrypted_stage_when_verifying() {
    let store = memory_store();
    let records = write_session(&store, "s1", 3).await;
    let target = &records[1];

    let mut sealed = store.blobs().get(&target.storage_locator).await.unwrap();
    let last = sealed.len() - 1;
    sealed[last] ^= 0x01;
    store
        .blobs()
        .put(&target.storage_locator, sealed)
        .await
        .unwrap();

    match store.reconstruct("s1", true).await {
        Err(SealError::Integrity {
            chunk_id, stage, ..
        }) => {
            assert_eq!(chunk_id, target.chunk_id);
            assert_eq!(stage, IntegrityStage::EncryptedHash);
        }
        other => panic!("expected Integrity, got {other:?}"),
    }

    // Without verification the AEAD tag still catches it
    match store.reconstruct("s1", false).await {
        Err(SealError::Integrity {
            chunk_id, stage, ..
        }) => {
            assert_eq!(chunk_id, target.chunk_id);
            assert_eq!(stage, IntegrityStage::Authentication);
        }
        other => panic!("expected Integrity, got {other:?}"),
    }

    // Earlier chunks still read fine on their own
    assert_eq!(
        store.read_chunk(&records[0], true).await.unwrap(),
        payload(0)
    );
}

#[tokio::test]
async fn truncated_blob_is_an_integrity_failure() {
    let store = memory_store();
    let records = write_session(&store, "s1", 1).await;
    store
        .blobs()
        .put(&records[0].storage_locator, vec![0u8; 4])
        .await
        .unwrap();

    assert!(matches!(
        store.reconstruct("s1", false).await,
        Err(SealError::Integrity {
            stage: IntegrityStage::Authentication,
            ..
        })
    ));
}

#[tokio::test]
async fn altered_record_hash_fails_original_stage() {
    let store = memory_store();
    let records = write_session(&store, "s1", 2).await;

    let mut forged = records[0].clone();
    forged.hash_original = Digest::from_bytes([0xab; 32]);
    let metadata = store.metadata();
    metadata.delete_chunk(&forged.chunk_id).await.unwrap();
    metadata.insert_chunk(&forged).await.unwrap();

    match store.reconstruct("s1", true).await {
        Err(SealError::Integrity {
            chunk_id, stage, ..
        }) => {
            assert_eq!(chunk_id, forged.chunk_id);
            assert_eq!(stage, IntegrityStage::OriginalHash);
        }
        other => panic!("expected Integrity, got {other:?}"),
    }

    // Hash checks are skipped without verification
    let mut expected = payload(0);
    expected.extend(payload(1));
    assert_eq!(store.reconstruct("s1", false).await.unwrap(), expected);
}

#[tokio::test]
async fn forged_original_size_is_rejected_at_original_stage() {
    let store = memory_store();
    let records = write_session(&store, "s1", 2).await;

    let metadata = store.metadata();
    for record in &records {
        let mut forged = record.clone();
        forged.original_size = u64::MAX;
        metadata.delete_chunk(&forged.chunk_id).await.unwrap();
        metadata.insert_chunk(&forged).await.unwrap();
    }

    match store.reconstruct("s1", true).await {
        Err(SealError::Integrity {
            chunk_id,
            stage,
            detail,
        }) => {
            assert_eq!(chunk_id, records[0].chunk_id);
            assert_eq!(stage, IntegrityStage::OriginalHash);
            assert!(detail.contains("recorded size"), "{detail}");
        }
        other => panic!("expected Integrity, got {other:?}"),
    }

    // Recorded sizes are not trusted for allocation without verification
    let mut expected = payload(0);
    expected.extend(payload(1));
    assert_eq!(store.reconstruct("s1", false).await.unwrap(), expected);
}

#[tokio::test]
async fn missing_blob_is_a_read_error() {
    let store = memory_store();
    let records = write_session(&store, "s1", 1).await;
    store.blobs().delete(&records[0].storage_locator).await.unwrap();

    let result = store.reconstruct("s1", true).await;
    assert!(matches!(result, Err(SealError::StorageRead(_))));
}

// --- Deletion and orphan sweeps ---

#[tokio::test]
async fn delete_session_chunks_removes_blobs_and_records() {
    let store = memory_store();
    let doomed = write_session(&store, "doomed", 3).await;
    write_session(&store, "kept", 2).await;

    assert_eq!(store.delete_session_chunks("doomed").await.unwrap(), 3);
    for record in &doomed {
        assert!(!store.blobs().exists(&record.storage_locator).await.unwrap());
    }
    assert!(store.list_chunks("doomed").await.unwrap().is_empty());
    assert_eq!(store.list_chunks("kept").await.unwrap().len(), 2);

    // Nothing left to delete
    assert_eq!(store.delete_session_chunks("doomed").await.unwrap(), 0);
}

#[tokio::test]
async fn orphan_sweep_only_touches_unregistered_sessions() {
    let store = memory_store();
    store.metadata().register_session("live").await.unwrap();
    let live = write_session(&store, "live", 2).await;
    let gone = write_session(&store, "gone", 3).await;

    // Too young to be swept
    assert_eq!(
        store
            .cleanup_orphans(Duration::from_secs(3600))
            .await
            .unwrap(),
        0
    );

    assert_eq!(store.cleanup_orphans(Duration::ZERO).await.unwrap(), 3);
    for record in &gone {
        assert!(!store.blobs().exists(&record.storage_locator).await.unwrap());
    }
    assert!(store.list_chunks("gone").await.unwrap().is_empty());

    for record in &live {
        assert!(store.blobs().exists(&record.storage_locator).await.unwrap());
    }
    assert_eq!(store.reconstruct("live", true).await.unwrap().len(), 2 * payload(0).len());
}

#[tokio::test]
async fn default_retention_keeps_fresh_orphans() {
    let store = memory_store();
    write_session(&store, "gone", 2).await;
    assert_eq!(store.cleanup_orphans_default().await.unwrap(), 0);
    assert_eq!(store.list_chunks("gone").await.unwrap().len(), 2);
}

// --- Archival ---

#[tokio::test]
async fn archive_moves_blobs_and_blocks_writes() {
    let store = memory_store();
    store.metadata().register_session("s1").await.unwrap();
    let before = write_session(&store, "s1", 3).await;

    assert_eq!(store.archive_session("s1").await.unwrap(), 3);
    let after = store.list_chunks("s1").await.unwrap();
    for (old, new) in before.iter().zip(&after) {
        assert!(!store.blobs().exists(&old.storage_locator).await.unwrap());
        assert_eq!(
            new.storage_locator,
            store.archive_locator("s1", new.sequence, &new.chunk_id)
        );
        assert!(new.storage_locator.starts_with("sessions/archived/s1/"));
    }
    assert!(store.metadata().session_archived("s1").await.unwrap());

    // Still readable with full verification
    let expected: Vec<u8> = (0..3).flat_map(payload).collect();
    assert_eq!(store.reconstruct("s1", true).await.unwrap(), expected);

    // No new chunks, and the orphan sweep leaves it alone
    assert!(matches!(
        store.write_chunk("s1", 3, b"late").await,
        Err(SealError::SessionArchived(_))
    ));
    assert_eq!(store.cleanup_orphans(Duration::ZERO).await.unwrap(), 0);

    let stats = store.statistics().await.unwrap();
    assert_eq!(stats.archived_sessions, 1);
    assert_eq!(stats.active_sessions, 0);
    assert_eq!(stats.total_chunks, 3);

    // Archiving again moves nothing
    assert_eq!(store.archive_session("s1").await.unwrap(), 0);
}

#[tokio::test]
async fn restore_returns_blobs_and_accepts_writes() {
    let store = memory_store();
    store.metadata().register_session("s1").await.unwrap();
    let original = write_session(&store, "s1", 2).await;

    // Restoring a live session is a no-op
    assert_eq!(store.restore_session("s1").await.unwrap(), 0);

    store.archive_session("s1").await.unwrap();
    assert_eq!(store.restore_session("s1").await.unwrap(), 2);
    assert_eq!(store.list_chunks("s1").await.unwrap(), original);
    for record in &original {
        assert!(store.blobs().exists(&record.storage_locator).await.unwrap());
    }

    store.write_chunk("s1", 2, &payload(2)).await.unwrap();
    let stats = store.statistics().await.unwrap();
    assert_eq!(stats.active_sessions, 1);
    assert_eq!(stats.archived_sessions, 0);
}

#[tokio::test]
async fn archive_requires_registered_session() {
    let store = memory_store();
    write_session(&store, "unregistered", 1).await;
    assert!(matches!(
        store.archive_session("unregistered").await,
        Err(SealError::SessionNotFound(_))
    ));
    assert!(matches!(
        store.restore_session("ghost").await,
        Err(SealError::SessionNotFound(_))
    ));
}

// --- Buffer ingestion ---

#[tokio::test]
async fn write_buffer_cuts_at_max_chunk_size_and_continues_sequence() {
    init_test_logging();
    let mut config = SealConfig::default();
    config.chunking.max_chunk_size = 1000;
    let pipeline = Arc::new(TransformPipeline::new(config.transform.clone()));
    let store = ChunkStore::new(
        config,
        pipeline,
        BlobStore::memory().unwrap(),
        Arc::new(MemoryMetadataStore::new()),
    );
    store.pipeline().init_session("s1").unwrap();

    let data: Vec<u8> = (0..2400u32).map(|i| (i % 251) as u8).collect();
    let records = store.write_buffer("s1", &data).await.unwrap();
    let sizes: Vec<u64> = records.iter().map(|r| r.original_size).collect();
    assert_eq!(sizes, vec![1000, 1000, 400]);
    assert_eq!(store.next_sequence("s1").await.unwrap(), 3);

    // A second buffer lands after the first
    let tail = store.write_buffer("s1", b"tail").await.unwrap();
    assert_eq!(tail[0].sequence, 3);
    assert!(store.write_buffer("s1", &[]).await.unwrap().is_empty());

    let mut expected = data.clone();
    expected.extend_from_slice(b"tail");
    assert_eq!(store.reconstruct("s1", true).await.unwrap(), expected);
}

// --- Statistics ---

#[tokio::test]
async fn statistics_aggregate_across_sessions() {
    let store = memory_store();
    assert_eq!(store.statistics().await.unwrap().total_chunks, 0);

    write_session(&store, "a", 3).await;
    write_session(&store, "b", 2).await;

    let stats = store.statistics().await.unwrap();
    let expected_original: u64 = (0..3).chain(0..2).map(|s| payload(s).len() as u64).sum();
    assert_eq!(stats.total_chunks, 5);
    assert_eq!(stats.unique_sessions, 2);
    assert_eq!(stats.total_original_size, expected_original);
    // Repetitive payloads compress well under gzip
    assert!(stats.total_compressed_size < stats.total_original_size);
    assert!(stats.avg_compression_ratio > 1.0);
    assert!(stats.space_saved_bytes > 0);
    // Nonce and tag overhead on every chunk
    assert!(stats.total_encrypted_size > stats.total_compressed_size);
}

#[tokio::test]
async fn locators_follow_session_layout() {
    let store = memory_store();
    let records = write_session(&store, "cam-7", 2).await;
    assert_eq!(
        records[1].storage_locator,
        format!("sessions/chunks/cam-7/00000001-{}", records[1].chunk_id)
    );
    assert_eq!(
        store.locator("cam-7", 12, "abc"),
        "sessions/chunks/cam-7/00000012-abc"
    );
}
