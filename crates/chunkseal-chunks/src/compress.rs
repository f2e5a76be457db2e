//! Chunk compression codecs
//!
//! Compressed payloads are self-describing: `decompress` takes the one-byte
//! `Codec` tag recorded next to the bytes, not the configured algorithm, so a
//! chunk stored raw after a codec failure still decodes correctly.

use std::io::{Read, Write};

use chunkseal_core::{CompressionAlgorithm, SealError, SealResult};

/// Wire identity of a codec (levels are irrelevant for decoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Codec {
    None = 0,
    Gzip = 1,
    Zstd = 2,
}

impl Codec {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> SealResult<Self> {
        match tag {
            0 => Ok(Codec::None),
            1 => Ok(Codec::Gzip),
            2 => Ok(Codec::Zstd),
            other => Err(SealError::Decompression(format!(
                "unknown codec tag {other:#04x}"
            ))),
        }
    }

    pub fn of(algorithm: &CompressionAlgorithm) -> Self {
        match algorithm {
            CompressionAlgorithm::Gzip { .. } => Codec::Gzip,
            CompressionAlgorithm::Zstd { .. } => Codec::Zstd,
            CompressionAlgorithm::None => Codec::None,
        }
    }
}

/// Output of `compress`: the bytes plus the codec that actually produced them.
#[derive(Debug)]
pub struct Compressed {
    pub codec: Codec,
    pub data: Vec<u8>,
}

/// Compress `data` with the configured algorithm.
pub fn compress(data: &[u8], algorithm: &CompressionAlgorithm) -> SealResult<Compressed> {
    let out = match *algorithm {
        CompressionAlgorithm::Gzip { level } => compress_gzip(data, level),
        CompressionAlgorithm::Zstd { level } => compress_zstd(data, level),
        CompressionAlgorithm::None => Ok(data.to_vec()),
    }
    .map_err(|e| SealError::Compression(format!("{}: {e:#}", algorithm.name())))?;

    Ok(Compressed {
        codec: Codec::of(algorithm),
        data: out,
    })
}

/// Decompress bytes produced by `codec`.
pub fn decompress(data: &[u8], codec: Codec) -> SealResult<Vec<u8>> {
    let out = match codec {
        Codec::Gzip => decompress_gzip(data),
        Codec::Zstd => zstd::decode_all(data).map_err(anyhow::Error::from),
        Codec::None => Ok(data.to_vec()),
    };
    out.map_err(|e| SealError::Decompression(format!("{codec:?}: {e:#}")))
}

fn compress_gzip(data: &[u8], level: u32) -> anyhow::Result<Vec<u8>> {
    // flate2 silently clamps larger levels
    anyhow::ensure!(level <= 9, "level {level} out of range (0..=9)");
    let mut encoder = flate2::write::GzEncoder::new(
        Vec::with_capacity(data.len() / 2 + 64),
        flate2::Compression::new(level),
    );
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress_gzip(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 2);
    flate2::read::GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

fn compress_zstd(data: &[u8], level: i32) -> anyhow::Result<Vec<u8>> {
    Ok(zstd::encode_all(data, level)?)
}
