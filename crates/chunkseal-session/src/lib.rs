//! chunkseal-session: sequenced chunk storage and whole-session orchestration
//!
//! [`ChunkStore`] owns chunk sequencing, runs each chunk through the
//! transform pipeline, persists sealed bytes and records, and reconstructs
//! streams with staged verification. [`SessionIngest`] ties a store to the
//! Merkle registry: every persisted chunk becomes the next leaf, finalization
//! hands the root to an [`Anchor`], and audits re-prove every chunk.

pub mod engine;
pub mod ingest;
pub mod stream;

pub use engine::{ChunkStore, ReconstructSummary};
pub use ingest::{
    Anchor, AuditReport, IngestSummary, RecordingAnchor, SessionIngest, SessionOpened,
};
pub use stream::ChunkStream;
