//! Compression helpers for columnar chunks and binary result pages.
//!
//! Chunks use raw deflate by default; gzip framing is available on request
//! for peers that want a self-describing stream. Inflation targets a declared
//! uncompressed size and rejects payloads that do not match it.

use std::io::Read;

use flate2::read::{DeflateDecoder, DeflateEncoder, GzEncoder};
use flate2::Compression;

use tidelog_common::{Error, Result};

/// Compress with raw deflate.
pub fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(data, Compression::default());
    let mut compressed = Vec::new();
    encoder
        .read_to_end(&mut compressed)
        .map_err(|e| Error::Serialization(format!("deflate failed: {}", e)))?;
    Ok(compressed)
}

/// Compress with gzip framing.
pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(data, Compression::default());
    let mut compressed = Vec::new();
    encoder
        .read_to_end(&mut compressed)
        .map_err(|e| Error::Serialization(format!("gzip failed: {}", e)))?;
    Ok(compressed)
}

/// Inflate a raw-deflate payload to exactly `uncompressed_size` bytes.
pub fn inflate(data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut output = Vec::with_capacity(uncompressed_size);
    // read one byte past the declared size so oversized payloads are caught
    decoder
        .by_ref()
        .take(uncompressed_size as u64 + 1)
        .read_to_end(&mut output)
        .map_err(|e| Error::Serialization(format!("inflate failed: {}", e)))?;

    if output.len() != uncompressed_size {
        return Err(Error::Protocol(format!(
            "inflated size {} does not match declared size {}",
            output.len(),
            uncompressed_size
        )));
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deflate_inflate_roundtrip() {
        let data = b"a highly compressible payload payload payload payload";
        let compressed = deflate(data).unwrap();
        assert_ne!(&compressed[..], &data[..]);

        let restored = inflate(&compressed, data.len()).unwrap();
        assert_eq!(&restored[..], &data[..]);
    }

    #[test]
    fn test_gzip_framing_differs_from_deflate() {
        let data = b"same input, different framing";
        let raw = deflate(data).unwrap();
        let framed = gzip(data).unwrap();
        assert_ne!(raw, framed);
        // gzip magic bytes
        assert_eq!(&framed[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn test_inflate_size_mismatch_rejected() {
        let data = b"twelve bytes";
        let compressed = deflate(data).unwrap();
        assert!(inflate(&compressed, data.len() - 1).is_err());
        assert!(inflate(&compressed, data.len() + 1).is_err());
    }

    #[test]
    fn test_inflate_garbage_rejected() {
        assert!(inflate(b"\x00\x01\x02garbage", 16).is_err());
    }

    #[test]
    fn test_empty_roundtrip() {
        let compressed = deflate(b"").unwrap();
        assert_eq!(inflate(&compressed, 0).unwrap(), Vec::<u8>::new());
    }
}
