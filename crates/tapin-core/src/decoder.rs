//! Facility token decoding from tag payloads.
//!
//! Decoding is an ordered two-strategy policy:
//!
//! 1. **Text record**: the payload is an NFC Forum text record. Byte 0 is the
//!    status byte (bit 7 = UTF-16, bit 6 = reserved, bits 5..0 = language code
//!    length), followed by the language code and UTF-8 text.
//! 2. **Byte fallback**: used only when the text-record decode fails. Byte 0 is
//!    *assumed* to be a language-code-length prefix when its value is below 32,
//!    in which case the status byte and that many language bytes are skipped.
//!    Every remaining byte maps to one character (Latin-1).
//!
//! The fallback assumption is ambiguous: a value below 32 could also be the
//! first byte of the token itself. Because control characters are never valid
//! token characters this is accepted, and the chosen strategy is reported in
//! [`DecodedToken`] together with the text-record failure that triggered it.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ndef::RawTagRecord;

const STATUS_UTF16: u8 = 0x80;
const STATUS_RESERVED: u8 = 0x40;
const LANGUAGE_LENGTH_MASK: u8 = 0x3F;

/// Byte 0 values below this are treated as a length prefix by the fallback.
pub const FALLBACK_PREFIX_LIMIT: u8 = 32;

/// A non-empty, trimmed facility identifier read from a tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FacilityToken(String);

impl FacilityToken {
    /// Trim `raw` and wrap it, rejecting empty results.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::EmptyPayload`] if nothing remains after trimming.
    pub fn new(raw: &str) -> Result<Self, DecodeError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DecodeError::EmptyPayload);
        }
        Ok(Self(trimmed.to_string()))
    }

    /// The token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FacilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for FacilityToken {
    type Error = DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<FacilityToken> for String {
    fn from(token: FacilityToken) -> Self {
        token.0
    }
}

/// Why the text-record strategy could not decode a payload.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TextRecordError {
    /// The payload has no status byte.
    #[error("payload is empty")]
    Empty,

    /// The status byte declares UTF-16 text.
    #[error("status byte declares UTF-16 text")]
    Utf16Encoded,

    /// The reserved status bit is set.
    #[error("reserved status bit is set (status byte {status:#04x})")]
    ReservedBitSet {
        /// The status byte.
        status: u8,
    },

    /// The declared language code runs past the end of the payload.
    #[error("language code length {declared} exceeds payload length {available}")]
    LanguageCodeOverrun {
        /// Declared language code length.
        declared: usize,
        /// Bytes available after the status byte.
        available: usize,
    },

    /// The text is not valid UTF-8.
    #[error("text is not valid UTF-8 (invalid byte at offset {valid_up_to})")]
    InvalidUtf8 {
        /// Length of the valid prefix.
        valid_up_to: usize,
    },
}

/// Which strategy produced a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum DecodeStrategy {
    /// Standard text record.
    TextRecord {
        /// Language code from the record (e.g. `"en"`).
        language: String,
    },

    /// Byte-for-byte fallback after a text-record failure.
    ByteFallback {
        /// Number of leading bytes skipped as an assumed prefix.
        skipped: usize,
    },
}

impl fmt::Display for DecodeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TextRecord { language } => write!(f, "text record (language '{language}')"),
            Self::ByteFallback { skipped } => {
                write!(f, "byte fallback ({skipped} prefix bytes skipped)")
            }
        }
    }
}

/// A successfully decoded token plus diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedToken {
    /// The facility token.
    pub token: FacilityToken,

    /// Strategy that produced the token.
    pub strategy: DecodeStrategy,

    /// Text-record failure, when the fallback was used.
    pub primary_error: Option<TextRecordError>,
}

/// Errors from decoding a tag into a facility token.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The tag carried no record at all.
    #[error("Tag carried no readable record")]
    NoRecord,

    /// The record decoded to empty or all-whitespace text.
    #[error("Could not read site token from tag: payload is empty")]
    EmptyPayload,
}

/// Decode the facility token from the first record of a tag.
///
/// # Errors
///
/// Returns [`DecodeError::NoRecord`] if the tag has no records, otherwise the
/// errors of [`decode`].
pub fn decode_record_set(tag: &RawTagRecord) -> Result<DecodedToken, DecodeError> {
    let record = tag.first_record().ok_or(DecodeError::NoRecord)?;
    if !record.is_text() {
        tracing::debug!(
            tnf = record.tnf,
            record_type = ?record.record_type,
            "First record is not a text record, decoding payload anyway"
        );
    }
    decode(&record.payload)
}

/// Decode a raw record payload into a facility token.
///
/// # Errors
///
/// Returns [`DecodeError::EmptyPayload`] if the decoded text is empty after
/// trimming.
pub fn decode(payload: &[u8]) -> Result<DecodedToken, DecodeError> {
    let (text, strategy, primary_error) = match decode_text_record(payload) {
        Ok((language, text)) => (text, DecodeStrategy::TextRecord { language }, None),
        Err(primary) => {
            let (skipped, text) = decode_bytes_fallback(payload);
            tracing::debug!(
                error = %primary,
                skipped,
                "Text record decode failed, using byte fallback"
            );
            (text, DecodeStrategy::ByteFallback { skipped }, Some(primary))
        }
    };

    Ok(DecodedToken {
        token: FacilityToken::new(&text)?,
        strategy,
        primary_error,
    })
}

/// Decode a text record payload into `(language, text)`.
///
/// # Errors
///
/// Returns a [`TextRecordError`] describing the first structural problem found.
pub fn decode_text_record(payload: &[u8]) -> Result<(String, String), TextRecordError> {
    let (&status, rest) = payload.split_first().ok_or(TextRecordError::Empty)?;

    if status & STATUS_UTF16 != 0 {
        return Err(TextRecordError::Utf16Encoded);
    }
    if status & STATUS_RESERVED != 0 {
        return Err(TextRecordError::ReservedBitSet { status });
    }

    let language_len = usize::from(status & LANGUAGE_LENGTH_MASK);
    if language_len > rest.len() {
        return Err(TextRecordError::LanguageCodeOverrun {
            declared: language_len,
            available: rest.len(),
        });
    }

    let (language, text) = rest.split_at(language_len);
    let text = std::str::from_utf8(text).map_err(|e| TextRecordError::InvalidUtf8 {
        valid_up_to: e.valid_up_to(),
    })?;

    Ok((String::from_utf8_lossy(language).into_owned(), text.to_string()))
}

/// Byte-for-byte fallback decode. Returns `(skipped, text)`.
#[must_use]
pub fn decode_bytes_fallback(payload: &[u8]) -> (usize, String) {
    let skipped = match payload.first() {
        Some(&first) if first < FALLBACK_PREFIX_LIMIT => usize::from(first) + 1,
        _ => 0,
    };
    let text = payload
        .get(skipped..)
        .unwrap_or_default()
        .iter()
        .map(|&b| char::from(b))
        .collect();
    (skipped.min(payload.len()), text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ndef::NdefRecord;

    fn text_payload(language: &str, text: &str) -> Vec<u8> {
        let mut payload = vec![language.len() as u8];
        payload.extend_from_slice(language.as_bytes());
        payload.extend_from_slice(text.as_bytes());
        payload
    }

    #[test]
    fn test_decode_well_formed_text_record() {
        let decoded = decode(&text_payload("en", "SITE-42")).unwrap();
        assert_eq!(decoded.token.as_str(), "SITE-42");
        assert_eq!(
            decoded.strategy,
            DecodeStrategy::TextRecord {
                language: "en".to_string()
            }
        );
        assert!(decoded.primary_error.is_none());
    }

    #[test]
    fn test_decode_trims_whitespace() {
        let decoded = decode(&text_payload("en", "  SITE-42\n")).unwrap();
        assert_eq!(decoded.token.as_str(), "SITE-42");
    }

    #[test]
    fn test_decode_utf8_text() {
        let decoded = decode(&text_payload("fr", "Salle-Été")).unwrap();
        assert_eq!(decoded.token.as_str(), "Salle-Été");
    }

    #[test]
    fn test_decode_whitespace_is_empty_payload() {
        assert_eq!(
            decode(&text_payload("en", "   \t ")).unwrap_err(),
            DecodeError::EmptyPayload
        );
    }

    #[test]
    fn test_decode_empty_bytes_is_empty_payload() {
        assert_eq!(decode(&[]).unwrap_err(), DecodeError::EmptyPayload);
    }

    #[test]
    fn test_fallback_on_invalid_utf8() {
        // 0xE9 alone is not valid UTF-8 but is 'é' in Latin-1.
        let payload = [0x02, b'e', b'n', b'C', b'a', b'f', 0xE9];
        let decoded = decode(&payload).unwrap();

        assert_eq!(decoded.token.as_str(), "Café");
        assert_eq!(decoded.strategy, DecodeStrategy::ByteFallback { skipped: 3 });
        assert_eq!(
            decoded.primary_error,
            Some(TextRecordError::InvalidUtf8 { valid_up_to: 3 })
        );
    }

    #[test]
    fn test_fallback_on_utf16_flag_skips_nothing() {
        // Status byte 0x82 >= 32, so the fallback keeps it as a character.
        let payload = [0x82, b'e', b'n', b'X'];
        let decoded = decode(&payload).unwrap();

        assert_eq!(decoded.strategy, DecodeStrategy::ByteFallback { skipped: 0 });
        assert_eq!(decoded.primary_error, Some(TextRecordError::Utf16Encoded));
        assert_eq!(decoded.token.as_str(), "\u{82}enX");
    }

    #[test]
    fn test_fallback_on_language_overrun() {
        // Declares 5 language bytes but only 2 follow.
        let payload = [0x05, b'A', b'B'];
        let decoded = decode(&payload);

        // Fallback skips 6 bytes, leaving nothing.
        assert_eq!(decoded.unwrap_err(), DecodeError::EmptyPayload);
        assert_eq!(
            decode_text_record(&payload).unwrap_err(),
            TextRecordError::LanguageCodeOverrun {
                declared: 5,
                available: 2
            }
        );
    }

    #[test]
    fn test_reserved_bit_rejected_by_text_record() {
        let err = decode_text_record(&[0x42, b'e', b'n', b'X']).unwrap_err();
        assert_eq!(err, TextRecordError::ReservedBitSet { status: 0x42 });
    }

    #[test]
    fn test_fallback_clamps_skipped_to_payload() {
        let (skipped, text) = decode_bytes_fallback(&[0x1F]);
        assert_eq!(skipped, 1);
        assert!(text.is_empty());
    }

    #[test]
    fn test_decode_record_set_no_record() {
        let tag = RawTagRecord::default();
        assert_eq!(decode_record_set(&tag).unwrap_err(), DecodeError::NoRecord);
    }

    #[test]
    fn test_decode_record_set_uses_first_record() {
        let tag = RawTagRecord::new(vec![
            NdefRecord::text(text_payload("en", "FIRST")),
            NdefRecord::text(text_payload("en", "SECOND")),
        ]);
        assert_eq!(decode_record_set(&tag).unwrap().token.as_str(), "FIRST");
    }

    #[test]
    fn test_empty_record_is_not_no_record() {
        let tag = RawTagRecord::new(vec![NdefRecord::text(text_payload("en", ""))]);
        assert_eq!(
            decode_record_set(&tag).unwrap_err(),
            DecodeError::EmptyPayload
        );
    }

    #[test]
    fn test_facility_token_rejects_blank() {
        assert!(FacilityToken::new(" ").is_err());
        assert_eq!(FacilityToken::new(" A ").unwrap().to_string(), "A");
    }
}
