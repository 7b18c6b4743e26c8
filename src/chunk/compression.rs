//! LZ4 compression for chunks
//!
//! Uses LZ4 for fast compression/decompression.
//! Only compresses if the result is actually smaller.

use crate::error::{Error, Result};

/// Compress data using LZ4
///
/// Returns None if compression doesn't reduce size
pub fn compress(data: &[u8], threshold: usize) -> Option<Vec<u8>> {
    if data.len() < threshold {
        return None; // Too small to bother
    }

    let compressed = lz4_flex::compress_prepend_size(data);

    if compressed.len() < data.len() {
        Some(compressed)
    } else {
        None
    }
}

/// Decompress LZ4 data, checking it expands to `expected_len` bytes
pub fn decompress(data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    // The size prefix is checked first so a damaged one cannot size the buffer
    if data.len() < 4 {
        return Err(Error::Corrupt("Compressed chunk is too short".to_string()));
    }
    let prefix = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if prefix != expected_len {
        return Err(Error::Corrupt(format!(
            "Chunk claims {} bytes, expected {}",
            prefix, expected_len
        )));
    }

    let decompressed = lz4_flex::decompress(&data[4..], expected_len)
        .map_err(|e| Error::Corrupt(format!("Decompression failed: {}", e)))?;

    if decompressed.len() != expected_len {
        return Err(Error::Corrupt(format!(
            "Chunk decompressed to {} bytes, expected {}",
            decompressed.len(),
            expected_len
        )));
    }

    Ok(decompressed)
}

/// Compress data, returning original if compression doesn't help
pub fn compress_or_original(data: &[u8], threshold: usize) -> (Vec<u8>, bool) {
    match compress(data, threshold) {
        Some(compressed) => (compressed, true),
        None => (data.to_vec(), false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_decompress() {
        let data = b"Hello, World! Hello, World! Hello, World!";

        if let Some(compressed) = compress(data, 10) {
            let decompressed = decompress(&compressed, data.len()).unwrap();
            assert_eq!(decompressed, data);
        }
    }

    #[test]
    fn test_compress_threshold() {
        let small_data = b"Hi";
        assert!(compress(small_data, 10).is_none());
    }

    #[test]
    fn test_compress_or_original() {
        let compressible = vec![0x42u8; 1000];
        let (result, compressed) = compress_or_original(&compressible, 10);

        assert!(compressed);
        assert!(result.len() < compressible.len());

        let decompressed = decompress(&result, compressible.len()).unwrap();
        assert_eq!(decompressed, compressible);
    }

    #[test]
    fn test_length_mismatch_is_corrupt() {
        let data = vec![7u8; 4096];
        let compressed = compress(&data, 10).unwrap();

        assert!(matches!(
            decompress(&compressed, 100),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let garbage = [0xffu8, 0xff, 0xff, 0x7f, 1, 2, 3];
        assert!(matches!(decompress(&garbage, 10), Err(Error::Corrupt(_))));
        assert!(matches!(decompress(&[1, 0], 1), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_damaged_payload_behind_valid_prefix() {
        let data = vec![9u8; 2048];
        let mut compressed = compress(&data, 10).unwrap();
        for b in &mut compressed[4..] {
            *b = 0xff;
        }
        assert!(matches!(
            decompress(&compressed, data.len()),
            Err(Error::Corrupt(_))
        ));
    }
}
