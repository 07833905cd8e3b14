use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::trace;

use crate::error::ProtoError;

/// Payloads below this size are not worth deflating.
pub const COMPRESS_THRESHOLD: usize = 512;
pub const COMPRESS_LEVEL: u32 = 6;
/// Inflation ceiling: a small compressed input must not be able to allocate
/// unbounded memory on the receiver.
pub const MAX_DECOMPRESSED_SIZE: usize = 10 * 1024 * 1024;

pub fn should_compress(size: usize) -> bool {
    size >= COMPRESS_THRESHOLD
}

/// Deflate `data` at level 6. Fails with `Ineffective` when the result is not
/// strictly smaller than the input - the send path treats that as "send raw".
pub fn compress(data: &[u8]) -> Result<Vec<u8>, ProtoError> {
    if data.is_empty() {
        return Err(ProtoError::Empty);
    }

    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len()), Compression::new(COMPRESS_LEVEL));
    encoder.write_all(data)?;
    let compressed = encoder.finish()?;

    if compressed.len() >= data.len() {
        trace!("compression ineffective: {} -> {} bytes", data.len(), compressed.len());
        return Err(ProtoError::Ineffective);
    }

    Ok(compressed)
}

/// Inflate `data`, refusing to produce more than [`MAX_DECOMPRESSED_SIZE`] bytes.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, ProtoError> {
    if data.is_empty() {
        return Err(ProtoError::Empty);
    }

    let mut out = Vec::with_capacity((data.len() * 3).max(1024).min(MAX_DECOMPRESSED_SIZE));
    let mut decoder = ZlibDecoder::new(data).take(MAX_DECOMPRESSED_SIZE as u64 + 1);
    decoder.read_to_end(&mut out)?;

    if out.len() > MAX_DECOMPRESSED_SIZE {
        return Err(ProtoError::BombSuspected(MAX_DECOMPRESSED_SIZE));
    }

    Ok(out)
}
