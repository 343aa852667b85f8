//! Transport-safe encoding of file payloads
//!
//! State records are JSON documents, so file content has to travel as a
//! string. Text that is valid UTF-8 and free of control bytes is stored
//! as-is; anything else falls back to standard Base64.

use base64::Engine;
use serde::{Deserialize, Serialize};

/// How a payload is represented inside a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Content stored verbatim as UTF-8 text
    #[default]
    Raw,
    /// Content stored as standard (padded) Base64
    Base64,
}

impl Encoding {
    pub fn is_raw(&self) -> bool {
        matches!(self, Encoding::Raw)
    }
}

/// A payload ready to be placed into a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub content: String,
    pub encoding: Encoding,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Bytes the record envelope cannot carry verbatim.
///
/// Tab, newline and carriage return are allowed; every other C0 control
/// byte and DEL are not.
fn is_forbidden(byte: u8) -> bool {
    matches!(byte, 0x00..=0x08 | 0x0B | 0x0C | 0x0E..=0x1F | 0x7F)
}

/// Encode a payload, preferring raw text when it is safe to do so
pub fn encode(bytes: &[u8]) -> Encoded {
    match std::str::from_utf8(bytes) {
        Ok(text) if !text.bytes().any(is_forbidden) => Encoded {
            content: text.to_string(),
            encoding: Encoding::Raw,
        },
        _ => Encoded {
            content: base64::engine::general_purpose::STANDARD.encode(bytes),
            encoding: Encoding::Base64,
        },
    }
}

/// Invert [`encode`]
pub fn decode(content: &str, encoding: Encoding) -> Result<Vec<u8>, CodecError> {
    match encoding {
        Encoding::Raw => Ok(content.as_bytes().to_vec()),
        Encoding::Base64 => Ok(base64::engine::general_purpose::STANDARD.decode(content)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_stays_raw() {
        let encoded = encode(b"hello world\n\tindented\r\n");
        assert_eq!(encoded.encoding, Encoding::Raw);
        assert_eq!(encoded.content, "hello world\n\tindented\r\n");
    }

    #[test]
    fn test_unicode_text_stays_raw() {
        let encoded = encode("grüße, 世界".as_bytes());
        assert_eq!(encoded.encoding, Encoding::Raw);
        assert_eq!(decode(&encoded.content, encoded.encoding).unwrap(), "grüße, 世界".as_bytes());
    }

    #[test]
    fn test_invalid_utf8_falls_back_to_base64() {
        let bytes = [0xff, 0xfe, 0x00, 0x41];
        let encoded = encode(&bytes);
        assert_eq!(encoded.encoding, Encoding::Base64);
        assert_eq!(decode(&encoded.content, encoded.encoding).unwrap(), bytes);
    }

    #[test]
    fn test_control_bytes_fall_back_to_base64() {
        for byte in (0x00u8..=0x1f).chain(std::iter::once(0x7f)) {
            let payload = [b'a', byte, b'b'];
            let encoded = encode(&payload);
            let expected = if matches!(byte, b'\t' | b'\n' | b'\r') {
                Encoding::Raw
            } else {
                Encoding::Base64
            };
            assert_eq!(encoded.encoding, expected, "byte {:#04x}", byte);
            assert_eq!(decode(&encoded.content, encoded.encoding).unwrap(), payload);
        }
    }

    #[test]
    fn test_empty_payload() {
        let encoded = encode(b"");
        assert_eq!(encoded.encoding, Encoding::Raw);
        assert!(decode(&encoded.content, encoded.encoding).unwrap().is_empty());
    }

    #[test]
    fn test_every_byte_value_round_trips() {
        let all: Vec<u8> = (0..=255u8).collect();
        let encoded = encode(&all);
        assert_eq!(encoded.encoding, Encoding::Base64);
        assert_eq!(decode(&encoded.content, encoded.encoding).unwrap(), all);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode("not base64!!", Encoding::Base64).is_err());
    }

    #[test]
    fn test_encoding_serde_tag() {
        assert_eq!(serde_json::to_string(&Encoding::Base64).unwrap(), "\"base64\"");
        let parsed: Encoding = serde_json::from_str("\"base64\"").unwrap();
        assert_eq!(parsed, Encoding::Base64);
    }
}
