//! NDEF record model and message parsing.
//!
//! A tag read produces a [`RawTagRecord`]: the tag identifier (if the driver
//! exposes one) and the ordered list of NDEF records it carried. Drivers that
//! only see the raw NDEF message bytes can use [`NdefMessage::parse`] to split
//! them into records.
//!
//! Record header layout (one byte):
//!
//! ```text
//!   7    6    5    4    3    2..0
//! +----+----+----+----+----+-----+
//! | MB | ME | CF | SR | IL | TNF |
//! +----+----+----+----+----+-----+
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

const FLAG_ME: u8 = 0x40;
const FLAG_CF: u8 = 0x20;
const FLAG_SR: u8 = 0x10;
const FLAG_IL: u8 = 0x08;
const TNF_MASK: u8 = 0x07;

/// Type Name Format for NFC Forum well-known types.
pub const TNF_WELL_KNOWN: u8 = 0x01;

/// Record type of a well-known text record (`"T"`).
pub const RTD_TEXT: &[u8] = b"T";

/// A single NDEF record as delivered by the reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NdefRecord {
    /// Type Name Format (3 bits).
    pub tnf: u8,

    /// Record type, e.g. `b"T"` for a text record.
    pub record_type: Vec<u8>,

    /// Optional record identifier.
    pub id: Vec<u8>,

    /// Record payload bytes.
    pub payload: Vec<u8>,
}

impl NdefRecord {
    /// Build a well-known text record from an already encoded payload.
    #[must_use]
    pub fn text(payload: Vec<u8>) -> Self {
        Self {
            tnf: TNF_WELL_KNOWN,
            record_type: RTD_TEXT.to_vec(),
            id: Vec::new(),
            payload,
        }
    }

    /// Returns `true` if this record declares itself a well-known text record.
    #[must_use]
    pub fn is_text(&self) -> bool {
        self.tnf == TNF_WELL_KNOWN && self.record_type == RTD_TEXT
    }
}

/// Everything read from one presented tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTagRecord {
    /// Tag UID, when the driver reports one.
    pub tag_id: Option<Vec<u8>>,

    /// NDEF records in message order.
    pub records: Vec<NdefRecord>,
}

impl RawTagRecord {
    /// Create a tag record from a list of NDEF records.
    #[must_use]
    pub fn new(records: Vec<NdefRecord>) -> Self {
        Self {
            tag_id: None,
            records,
        }
    }

    /// The first record of the message, which carries the facility token.
    #[must_use]
    pub fn first_record(&self) -> Option<&NdefRecord> {
        self.records.first()
    }
}

/// Errors from parsing a raw NDEF message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NdefParseError {
    /// The message contains no bytes.
    #[error("NDEF message is empty")]
    Empty,

    /// The message ended in the middle of a record.
    #[error("NDEF message truncated at byte {offset}: needed {needed} more bytes")]
    Truncated {
        /// Offset where more data was expected.
        offset: usize,
        /// Bytes missing.
        needed: usize,
    },

    /// Chunked records are not supported.
    #[error("chunked NDEF records are not supported (record {index})")]
    ChunkedRecord {
        /// Record index in the message.
        index: usize,
    },

    /// Bytes remain after the record flagged as message end.
    #[error("{remaining} trailing bytes after the final NDEF record")]
    TrailingBytes {
        /// Number of unconsumed bytes.
        remaining: usize,
    },
}

/// A parsed NDEF message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NdefMessage {
    /// Records in message order.
    pub records: Vec<NdefRecord>,
}

impl NdefMessage {
    /// Parse a raw NDEF message into its records.
    ///
    /// # Errors
    ///
    /// Returns [`NdefParseError`] if the message is empty, truncated, uses
    /// chunked records, or has bytes after the final record.
    pub fn parse(bytes: &[u8]) -> Result<Self, NdefParseError> {
        if bytes.is_empty() {
            return Err(NdefParseError::Empty);
        }

        let mut cursor = Cursor { bytes, offset: 0 };
        let mut records = Vec::new();

        loop {
            let index = records.len();
            let header = cursor.take_u8()?;
            if header & FLAG_CF != 0 {
                return Err(NdefParseError::ChunkedRecord { index });
            }

            let type_len = usize::from(cursor.take_u8()?);
            let payload_len = if header & FLAG_SR != 0 {
                usize::from(cursor.take_u8()?)
            } else {
                let raw = cursor.take(4)?;
                u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize
            };
            let id_len = if header & FLAG_IL != 0 {
                usize::from(cursor.take_u8()?)
            } else {
                0
            };

            let record_type = cursor.take(type_len)?.to_vec();
            let id = cursor.take(id_len)?.to_vec();
            let payload = cursor.take(payload_len)?.to_vec();

            records.push(NdefRecord {
                tnf: header & TNF_MASK,
                record_type,
                id,
                payload,
            });

            if header & FLAG_ME != 0 {
                break;
            }
            if cursor.remaining() == 0 {
                // Tolerate a missing ME flag on the last record.
                break;
            }
        }

        if cursor.remaining() > 0 {
            return Err(NdefParseError::TrailingBytes {
                remaining: cursor.remaining(),
            });
        }

        Ok(Self { records })
    }
}

impl From<NdefMessage> for RawTagRecord {
    fn from(message: NdefMessage) -> Self {
        Self::new(message.records)
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], NdefParseError> {
        if len > self.remaining() {
            return Err(NdefParseError::Truncated {
                offset: self.offset,
                needed: len - self.remaining(),
            });
        }
        let slice = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, NdefParseError> {
        Ok(self.take(1)?[0])
    }
}
