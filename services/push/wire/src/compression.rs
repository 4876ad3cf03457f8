//! Zlib helpers for packet payloads.
//!
//! The broker deflates some publish payloads and expects the connect payload
//! deflated. Compressed payloads are recognised by the zlib header: a `0x78`
//! CMF byte whose FLG companion passes the header checksum.

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use tracing::trace;

use crate::WireError;

/// Zlib CMF byte for deflate with a 32K window
pub const ZLIB_MAGIC: u8 = 0x78;

/// Whether `data` starts with a zlib stream header
pub fn is_zlib(data: &[u8]) -> bool {
    match data {
        [cmf, flg, ..] => *cmf == ZLIB_MAGIC && (u16::from(*cmf) * 256 + u16::from(*flg)) % 31 == 0,
        _ => false,
    }
}

/// Deflate `data` into a zlib stream
pub fn compress(data: &[u8]) -> Result<Bytes, WireError> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::best());
    encoder.write_all(data).map_err(WireError::Compress)?;
    let compressed = encoder.finish().map_err(WireError::Compress)?;
    Ok(Bytes::from(compressed))
}

/// Inflate `data` if it carries a zlib header, otherwise return it unchanged.
///
/// Inflated output larger than `limit` bytes fails with [`WireError::Size`].
pub fn maybe_decompress(data: Bytes, limit: usize) -> Result<Bytes, WireError> {
    if !is_zlib(&data) {
        return Ok(data);
    }

    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    let mut decoder = ZlibDecoder::new(data.as_ref()).take(cap);
    let mut inflated = Vec::with_capacity((data.len() * 4).min(limit));
    decoder
        .read_to_end(&mut inflated)
        .map_err(WireError::Decompress)?;
    if inflated.len() > limit {
        return Err(WireError::Size(inflated.len()));
    }
    trace!("Inflated payload {} -> {} bytes", data.len(), inflated.len());
    Ok(Bytes::from(inflated))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compressed_payload_detected() {
        let json = br#"{"token":"abc123","error":""}"#;
        let compressed = compress(json).unwrap();
        assert!(is_zlib(&compressed));

        let inflated = maybe_decompress(compressed, 1024).unwrap();
        assert_eq!(inflated.as_ref(), json);
    }

    #[test]
    fn test_plain_payload_untouched() {
        let plain = Bytes::from_static(b"{\"token\":\"abc\"}");
        assert!(!is_zlib(&plain));
        assert_eq!(maybe_decompress(plain.clone(), 1024).unwrap(), plain);

        // 'x' followed by a byte that fails the header checksum
        let text = Bytes::from_static(b"xyz");
        assert!(!is_zlib(&text));
        assert_eq!(maybe_decompress(text.clone(), 1024).unwrap(), text);

        assert!(maybe_decompress(Bytes::new(), 1024).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_stream_errors() {
        // Valid header, garbage body
        let corrupt = Bytes::from_static(&[0x78, 0x9C, 0xFF, 0xFF, 0xFF]);
        assert!(matches!(
            maybe_decompress(corrupt, 1024),
            Err(WireError::Decompress(_))
        ));
    }

    #[test]
    fn test_inflate_limit() {
        let zeros = vec![0u8; 64 * 1024];
        let bomb = compress(&zeros).unwrap();
        assert!(bomb.len() < 1024);

        assert!(matches!(
            maybe_decompress(bomb.clone(), 4096),
            Err(WireError::Size(n)) if n > 4096
        ));
        assert_eq!(maybe_decompress(bomb, zeros.len()).unwrap().len(), zeros.len());
    }
}
