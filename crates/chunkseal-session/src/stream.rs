//! Lazy stream segmentation

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use chunkseal_core::{ChunkRecord, SealError, SealResult};

use crate::engine::ChunkStore;

/// A finite, non-restartable sequence of persisted chunks cut from one
/// source. Each call to [`ChunkStream::next_chunk`] reads up to one chunk,
/// writes it through the store, and yields its record.
///
/// Cancellation is observed only between chunks, so a partially read chunk
/// is never persisted. After an error or cancellation the stream is spent.
pub struct ChunkStream<'a, R> {
    store: &'a ChunkStore,
    session_id: String,
    source: R,
    max_chunk_size: usize,
    cancel: CancellationToken,
    next_sequence: u64,
    bytes_read: u64,
    finished: bool,
}

impl<'a, R> ChunkStream<'a, R>
where
    R: AsyncRead + Unpin + Send,
{
    pub(crate) fn new(
        store: &'a ChunkStore,
        session_id: &str,
        source: R,
        max_chunk_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            session_id: session_id.to_string(),
            source,
            max_chunk_size: max_chunk_size.max(1),
            cancel,
            next_sequence: 0,
            bytes_read: 0,
            finished: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Total raw bytes consumed from the source so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Read until `buf` is full or the source is exhausted.
    async fn fill(&mut self, buf: &mut [u8]) -> SealResult<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.source.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Produce and persist the next chunk; `None` once the source is drained.
    pub async fn next_chunk(&mut self) -> SealResult<Option<ChunkRecord>> {
        if self.finished {
            return Ok(None);
        }
        if self.cancel.is_cancelled() {
            self.finished = true;
            info!(
                session = %self.session_id,
                chunks = self.next_sequence,
                "segmentation cancelled at chunk boundary"
            );
            return Err(SealError::Cancelled(self.session_id.clone()));
        }

        let mut buf = vec![0u8; self.max_chunk_size];
        let filled = match self.fill(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                self.finished = true;
                return Err(e);
            }
        };
        if filled == 0 {
            self.finished = true;
            debug!(
                session = %self.session_id,
                chunks = self.next_sequence,
                bytes = self.bytes_read,
                "source drained"
            );
            return Ok(None);
        }
        if filled < self.max_chunk_size {
            // Short read: the source ended inside this chunk
            self.finished = true;
        }
        buf.truncate(filled);

        let record = match self
            .store
            .write_chunk(&self.session_id, self.next_sequence, &buf)
            .await
        {
            Ok(record) => record,
            Err(e) => {
                self.finished = true;
                return Err(e);
            }
        };

        self.next_sequence += 1;
        self.bytes_read += filled as u64;
        Ok(Some(record))
    }

    /// Drain the stream, returning every record in sequence order.
    pub async fn try_collect(mut self) -> SealResult<Vec<ChunkRecord>> {
        let mut records = Vec::new();
        while let Some(record) = self.next_chunk().await? {
            records.push(record);
        }
        Ok(records)
    }
}
