//! Header codecs
//!
//! Pure helpers shared by both protocols:
//! - `Content-Range` parsing (`bytes <start>-<end>/<total>`)
//! - tus `Upload-Metadata` encoding (`key base64(value)` pairs, comma separated)
//! - a stable hash over serializable values, used for idempotent upload ids

use crate::upload::Metadata;
use base64::Engine as _;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Parsed `Content-Range` header.
///
/// Unparseable positions are `None`, never zero: a garbled header must not
/// look like a chunk starting at offset 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentRange {
    pub start: Option<u64>,
    pub total: Option<u64>,
}

/// Parse a `Content-Range` style header.
///
/// Accepts `bytes 5-9/20`, `bytes=5-9/20`, extra whitespace, and `*` for an
/// unknown start or total.
pub fn parse_content_range(header: &str) -> ContentRange {
    let header = header.trim();
    let Some(rest) = strip_unit(header) else {
        return ContentRange::default();
    };

    let mut parts = rest.splitn(2, '/');
    let range = parts.next().unwrap_or("").trim();
    let total = parts.next().map(str::trim);

    ContentRange {
        start: leading_number(range),
        total: total.and_then(leading_number),
    }
}

fn strip_unit(header: &str) -> Option<&str> {
    let unit = header.get(..5)?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return None;
    }
    let rest = &header[5..];
    let trimmed = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '=');
    // "bytes" must be followed by a separator, not glued to digits
    if trimmed.len() == rest.len() {
        return None;
    }
    Some(trimmed)
}

fn leading_number(s: &str) -> Option<u64> {
    let end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    s[..end].parse().ok()
}

/// Encode metadata as `key base64(value)` pairs joined by commas
pub fn encode_metadata(metadata: &Metadata) -> String {
    metadata
        .iter()
        .map(|(key, value)| {
            format!(
                "{} {}",
                key,
                base64::engine::general_purpose::STANDARD.encode(value)
            )
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Decode an `Upload-Metadata` header.
///
/// Decoding is lenient: the first pair missing a key or value (or whose value
/// is not base64) stops decoding and the pairs read so far are returned.
pub fn decode_metadata(encoded: &str) -> Metadata {
    let mut metadata = Metadata::new();

    for pair in encoded.split(',') {
        let mut parts = pair.trim().split(' ');
        let key = parts.next().unwrap_or("");
        let value = parts.next().unwrap_or("");
        if key.is_empty() || value.is_empty() {
            break;
        }

        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(value) else {
            break;
        };
        metadata.insert(
            key.to_string(),
            String::from_utf8_lossy(&decoded).into_owned(),
        );
    }

    metadata
}

/// SHA-256 (hex) of the canonical JSON form of `value`.
///
/// Maps must be ordered (`BTreeMap`) for the digest to be stable.
pub fn stable_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let json = serde_json::to_vec(value)?;
    let mut hasher = Sha256::new();
    hasher.update(&json);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range() {
        let range = parse_content_range("bytes 5-9/20");
        assert_eq!(range.start, Some(5));
        assert_eq!(range.total, Some(20));
    }

    #[test]
    fn test_parse_content_range_alternate_separators() {
        assert_eq!(
            parse_content_range("  bytes=0-99 / 100 "),
            ContentRange {
                start: Some(0),
                total: Some(100)
            }
        );
        assert_eq!(parse_content_range("BYTES  10-19/*").start, Some(10));
    }

    #[test]
    fn test_parse_content_range_garbled_is_not_zero() {
        for header in ["", "garbage", "bytes", "bytes -/", "bytes0-1/2", "items 0-1/2"] {
            let range = parse_content_range(header);
            assert_eq!(range.start, None, "{header:?}");
            assert_eq!(range.total, None, "{header:?}");
        }
    }

    #[test]
    fn test_parse_content_range_unknown_start() {
        let range = parse_content_range("bytes */20");
        assert_eq!(range.start, None);
        assert_eq!(range.total, Some(20));
    }

    #[test]
    fn test_metadata_round_trip() {
        let mut metadata = Metadata::new();
        metadata.insert("filename".into(), "video.mp4".into());
        metadata.insert("mimeType".into(), "video/mp4".into());
        metadata.insert("note".into(), "hello, world".into());

        let encoded = encode_metadata(&metadata);
        assert_eq!(decode_metadata(&encoded), metadata);
    }

    #[test]
    fn test_encode_metadata_format() {
        let mut metadata = Metadata::new();
        metadata.insert("name".into(), "a".into());
        assert_eq!(encode_metadata(&metadata), "name YQ==");
    }

    #[test]
    fn test_decode_metadata_truncates_on_incomplete_pair() {
        let metadata = decode_metadata("name YQ==,broken,size MTA=");
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata["name"], "a");
    }

    #[test]
    fn test_decode_metadata_empty() {
        assert!(decode_metadata("").is_empty());
    }

    #[test]
    fn test_stable_hash_ignores_insertion_order() {
        let mut a = Metadata::new();
        a.insert("x".into(), "1".into());
        a.insert("y".into(), "2".into());
        let mut b = Metadata::new();
        b.insert("y".into(), "2".into());
        b.insert("x".into(), "1".into());

        assert_eq!(stable_hash(&a).unwrap(), stable_hash(&b).unwrap());
        assert_eq!(stable_hash(&a).unwrap().len(), 64);
    }
}
