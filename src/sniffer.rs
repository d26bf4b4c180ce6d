//! Content-decoding sniffer.
//!
//! Peeks a response body for gzip/zlib magic bytes when no
//! `Content-Encoding` header is present, and transparently decompresses it
//! using `flate2` when found.

use bytes::Bytes;
use std::io::Read;

use crate::error::PipelineError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
/// Common zlib header bytes (CMF/FLG pairs seen in practice): `78 01`
/// (fastest), `78 9c` (default), `78 da` (best compression).
const ZLIB_MAGICS: [[u8; 2]; 3] = [[0x78, 0x01], [0x78, 0x9c], [0x78, 0xda]];

/// The result of running a response body through the sniffer.
#[derive(Debug, Clone)]
pub struct SniffedBody {
    /// The (possibly decompressed) body.
    pub bytes: Bytes,
    /// The (possibly corrected) content type.
    pub content_type: String,
}

/// Detects a mislabeled gzip/zlib body and transparently decompresses it,
/// correcting the declared content type. Returns the body unchanged when
/// `content_encoding_header` is already present — a declared encoding is
/// assumed to have already been handled by the transport.
pub fn sniff(
    body: Bytes,
    content_encoding_header: Option<&str>,
    declared_content_type: &str,
) -> Result<SniffedBody, PipelineError> {
    if content_encoding_header.is_some() {
        return Ok(SniffedBody {
            bytes: body,
            content_type: declared_content_type.to_string(),
        });
    }

    let encoding = detect_encoding(&body);

    let decoded = match encoding {
        None => {
            return Ok(SniffedBody {
                bytes: body,
                content_type: declared_content_type.to_string(),
            })
        }
        Some(Encoding::Gzip) => decompress_gzip(&body)?,
        Some(Encoding::Zlib) => decompress_zlib(&body)?,
    };

    let content_type = sniff_content_type(&decoded).unwrap_or_else(|| declared_content_type.to_string());

    Ok(SniffedBody {
        bytes: Bytes::from(decoded),
        content_type,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Gzip,
    Zlib,
}

fn detect_encoding(body: &[u8]) -> Option<Encoding> {
    if body.len() < 2 {
        return None;
    }
    if body[0..2] == GZIP_MAGIC {
        return Some(Encoding::Gzip);
    }
    if ZLIB_MAGICS.iter().any(|magic| body[0..2] == *magic) {
        return Some(Encoding::Zlib);
    }
    None
}

fn decompress_gzip(body: &[u8]) -> Result<Vec<u8>, PipelineError> {
    let mut decoder = flate2::read::GzDecoder::new(body);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| PipelineError::Terminal(format!("gzip sniffing failed: {e}")))?;
    Ok(out)
}

fn decompress_zlib(body: &[u8]) -> Result<Vec<u8>, PipelineError> {
    let mut decoder = flate2::read::ZlibDecoder::new(body);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| PipelineError::Terminal(format!("zlib sniffing failed: {e}")))?;
    Ok(out)
}

/// Best-effort content-type sniffing of the decompressed payload, limited to
/// the JSON case.
fn sniff_content_type(decoded: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(decoded).ok()?;
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        Some("application/json".to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn gzip_bytes(payload: &[u8]) -> Bytes {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(payload).unwrap();
        Bytes::from(encoder.finish().unwrap())
    }

    #[test]
    fn passes_through_when_content_encoding_is_already_declared() {
        let raw = gzip_bytes(b"{\"a\":1}");
        let result = sniff(raw.clone(), Some("gzip"), "application/octet-stream").unwrap();
        assert_eq!(result.bytes, raw);
        assert_eq!(result.content_type, "application/octet-stream");
    }

    #[test]
    fn detects_and_decompresses_mislabeled_gzip_json() {
        let raw = gzip_bytes(b"{\"hello\":\"world\"}");
        let result = sniff(raw, None, "text/plain").unwrap();
        assert_eq!(result.bytes.as_ref(), b"{\"hello\":\"world\"}");
        assert_eq!(result.content_type, "application/json");
    }

    #[test]
    fn passes_through_plain_bodies_unchanged() {
        let raw = Bytes::from_static(b"hello world");
        let result = sniff(raw.clone(), None, "text/plain").unwrap();
        assert_eq!(result.bytes, raw);
        assert_eq!(result.content_type, "text/plain");
    }

    #[test]
    fn corrupted_magic_bytes_surface_as_terminal() {
        let mut corrupted = vec![0x1f, 0x8b, 0x00, 0x00];
        corrupted.extend_from_slice(b"not really gzip data at all");
        let err = sniff(Bytes::from(corrupted), None, "text/plain").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Terminal);
    }
}
