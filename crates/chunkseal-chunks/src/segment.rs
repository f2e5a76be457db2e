//! Bounded-size segmentation
//!
//! Session streams are cut at a fixed upper bound: every segment except the
//! last is exactly `max_chunk_size` bytes. Boundaries are positional, so the
//! sequence number of a segment is its index.

/// One segment of an in-memory buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// 0-based position in the stream
    pub sequence: u64,
    /// Byte offset within the source
    pub offset: u64,
    /// Segment length in bytes (never zero)
    pub length: usize,
}

impl Segment {
    /// Borrow this segment's bytes out of the source buffer.
    pub fn slice<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let start = self.offset as usize;
        &data[start..start + self.length]
    }
}

/// Split `data` into segments of at most `max_chunk_size` bytes.
///
/// Empty input yields no segments. A `max_chunk_size` of zero is treated as 1.
pub fn segment_slice(data: &[u8], max_chunk_size: usize) -> Vec<Segment> {
    let size = max_chunk_size.max(1);
    data.chunks(size)
        .enumerate()
        .map(|(i, chunk)| Segment {
            sequence: i as u64,
            offset: (i * size) as u64,
            length: chunk.len(),
        })
        .collect()
}
