//! chunkseal-storage: where sealed chunk bytes and chunk records live
//!
//! - [`BlobStore`]: sealed chunk bytes behind an OpenDAL `Operator`
//!   (in-memory, local filesystem, or any S3-compatible endpoint)
//! - [`MetadataStore`]: chunk records and session records, with an
//!   in-memory backend and a single-file JSON backend

pub mod blob;
pub mod json;
pub mod memory;
pub mod metadata;

pub use blob::{BlobStore, S3Credentials};
pub use json::JsonMetadataStore;
pub use memory::MemoryMetadataStore;
pub use metadata::{ChunkTable, MetadataStore, SessionEntry};
