//! Payload compression.
//!
//! The journal engine only decides *when* to compress; the codec decides
//! how. A file records the algorithm in its incompatible flags and each
//! compressed DATA object carries the matching object flag.

use crate::error::{JournalError, JournalResult};

/// Smallest payload worth compressing, whatever the configuration says.
pub const MIN_COMPRESS_THRESHOLD: usize = 8;

/// Default payload size from which compression is attempted.
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 512;

/// Compression algorithms a file can be written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// LZ4 block format with an 8-byte little-endian length prefix.
    Lz4,
}

/// A payload compressor/decompressor.
pub trait Codec: Send + Sync {
    /// The algorithm this codec implements.
    fn algorithm(&self) -> Compression;

    /// Compresses `src`.
    ///
    /// Returns `None` if compression failed or would not shrink the
    /// payload; the caller then stores it uncompressed.
    fn compress(&self, src: &[u8]) -> Option<Vec<u8>>;

    /// Decompresses `src`, refusing output larger than `max_len`.
    ///
    /// # Errors
    ///
    /// Returns a malformed-data error if `src` is not valid output of
    /// [`Codec::compress`].
    fn decompress(&self, src: &[u8], max_len: usize) -> JournalResult<Vec<u8>>;
}

/// LZ4 codec backed by `lz4_flex`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Codec;

const LENGTH_PREFIX: usize = 8;

impl Codec for Lz4Codec {
    fn algorithm(&self) -> Compression {
        Compression::Lz4
    }

    fn compress(&self, src: &[u8]) -> Option<Vec<u8>> {
        let block = lz4_flex::block::compress(src);
        if block.len() + LENGTH_PREFIX >= src.len() {
            return None;
        }

        let mut out = Vec::with_capacity(LENGTH_PREFIX + block.len());
        out.extend_from_slice(&(src.len() as u64).to_le_bytes());
        out.extend_from_slice(&block);
        Some(out)
    }

    fn decompress(&self, src: &[u8], max_len: usize) -> JournalResult<Vec<u8>> {
        if src.len() < LENGTH_PREFIX {
            return Err(JournalError::malformed("compressed payload too short"));
        }
        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX]);
        let len = u64::from_le_bytes(prefix);

        if len == 0 || len > max_len as u64 {
            return Err(JournalError::malformed(format!(
                "compressed payload claims {len} bytes, limit {max_len}"
            )));
        }

        let out = lz4_flex::block::decompress(&src[LENGTH_PREFIX..], len as usize)
            .map_err(|e| JournalError::malformed(format!("lz4 decompression failed: {e}")))?;
        if out.len() as u64 != len {
            return Err(JournalError::malformed("lz4 payload length mismatch"));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressible_payload_shrinks() {
        let payload = format!("MESSAGE={}", "a".repeat(4096)).into_bytes();
        let compressed = Lz4Codec.compress(&payload).unwrap();

        assert!(compressed.len() < payload.len());
        assert_eq!(Lz4Codec.decompress(&compressed, usize::MAX).unwrap(), payload);
    }

    #[test]
    fn incompressible_payload_is_declined() {
        let payload: Vec<u8> = (0..64u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        assert!(Lz4Codec.compress(&payload).is_none());
    }

    #[test]
    fn decompress_respects_limit() {
        let payload = vec![b'x'; 1000];
        let compressed = Lz4Codec.compress(&payload).unwrap();

        let err = Lz4Codec.decompress(&compressed, 999).unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn decompress_rejects_garbage() {
        assert!(Lz4Codec.decompress(b"abc", 100).is_err());

        let mut bogus = 50u64.to_le_bytes().to_vec();
        bogus.extend_from_slice(&[0xff; 4]);
        assert!(Lz4Codec.decompress(&bogus, 100).is_err());
    }
}
