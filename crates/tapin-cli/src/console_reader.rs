//! Tag driver that reads hex-encoded tag dumps from a line-oriented input.
//!
//! Each non-empty line is one tag. A line is parsed as a full NDEF message;
//! if that fails, the bytes are treated as the payload of a single text record.

use std::io::Write as _;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use tapin_core::{NdefMessage, NdefRecord, RawTagRecord, ReaderError, ReaderResult, TagDriver};

/// Prompt printed to stderr when a technology request opens.
const PROMPT: &str = "Hold the tag against the reader (paste its hex dump, Ctrl-C to cancel):";

/// [`TagDriver`] over hex lines.
pub struct ConsoleTagDriver<R> {
    lines: Mutex<Lines<R>>,
    prompt: bool,
}

impl<R: AsyncBufRead + Unpin + Send> ConsoleTagDriver<R> {
    /// Read tags from `input`.
    pub fn new(input: R) -> Self {
        Self {
            lines: Mutex::new(input.lines()),
            prompt: true,
        }
    }

    /// Do not print a prompt when a scan starts.
    #[must_use]
    pub fn quiet(mut self) -> Self {
        self.prompt = false;
        self
    }
}

/// Parse one input line into a tag. Blank lines yield `None`.
///
/// # Errors
///
/// Returns [`hex::FromHexError`] if the line is not valid hex.
pub fn parse_tag_line(line: &str) -> Result<Option<RawTagRecord>, hex::FromHexError> {
    let cleaned: String = line
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    if cleaned.is_empty() {
        return Ok(None);
    }

    let bytes = hex::decode(cleaned)?;
    let tag = match NdefMessage::parse(&bytes) {
        Ok(message) => message.into(),
        Err(e) => {
            debug!(error = %e, "Input is not an NDEF message, using it as a bare payload");
            RawTagRecord::new(vec![NdefRecord::text(bytes)])
        }
    };
    Ok(Some(tag))
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> TagDriver for ConsoleTagDriver<R> {
    async fn is_supported(&self) -> ReaderResult<bool> {
        Ok(true)
    }

    async fn request_technology(&self) -> ReaderResult<()> {
        if self.prompt {
            let mut stderr = std::io::stderr();
            writeln!(stderr, "{PROMPT}").map_err(|e| ReaderError::driver(e.to_string()))?;
        }
        Ok(())
    }

    async fn read_tag(&self) -> ReaderResult<RawTagRecord> {
        let mut lines = self.lines.lock().await;
        loop {
            let line = lines
                .next_line()
                .await
                .map_err(|e| ReaderError::driver(format!("Failed to read input: {e}")))?
                .ok_or_else(|| ReaderError::driver("Input closed before a tag was presented"))?;

            match parse_tag_line(&line) {
                Ok(Some(tag)) => return Ok(tag),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Ignoring input that is not hex"),
            }
        }
    }

    fn cancel_technology_request(&self) {
        debug!("Console reader released");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tapin_core::{decode_record_set, CancellationToken, TagReader};
    use tokio::io::BufReader;

    use super::*;

    #[test]
    fn test_parse_ndef_message_line() {
        let tag = parse_tag_line("D1 01 0A 54 02 65 6E 53 49 54 45 2D 34 32")
            .unwrap()
            .unwrap();
        assert_eq!(tag.records.len(), 1);
        assert!(tag.records[0].is_text());
        assert_eq!(decode_record_set(&tag).unwrap().token.as_str(), "SITE-42");
    }

    #[test]
    fn test_parse_bare_payload_line() {
        let tag = parse_tag_line("02:65:6e:53:49:54:45").unwrap().unwrap();
        assert_eq!(tag.records[0].payload, b"\x02enSITE");
        assert_eq!(decode_record_set(&tag).unwrap().token.as_str(), "SITE");
    }

    #[test]
    fn test_parse_blank_and_invalid_lines() {
        assert!(parse_tag_line("   ").unwrap().is_none());
        assert!(parse_tag_line("zz").is_err());
    }

    #[tokio::test]
    async fn test_reads_first_valid_line() {
        let input = tokio_test::io::Builder::new()
            .read(b"\nnot hex\n")
            .read(b"026573697465\n")
            .build();
        let driver = ConsoleTagDriver::new(BufReader::new(input)).quiet();

        let tag = driver.read_tag().await.unwrap();
        assert_eq!(tag.records[0].payload, b"\x02esite");
    }

    #[tokio::test]
    async fn test_closed_input_is_driver_error() {
        let driver = ConsoleTagDriver::new(BufReader::new(&b""[..])).quiet();
        let err = driver.read_tag().await.unwrap_err();
        assert!(matches!(err, ReaderError::Driver { .. }));
    }

    #[tokio::test]
    async fn test_scan_through_reader() {
        let input = std::io::Cursor::new(b"D1010A540265 6E534954452D3432\n".to_vec());
        let reader = TagReader::new(Arc::new(ConsoleTagDriver::new(input).quiet()));
        assert!(reader.check_supported().await);

        let tag = reader.scan(&CancellationToken::new()).await.unwrap();
        assert_eq!(decode_record_set(&tag).unwrap().token.as_str(), "SITE-42");
    }
}
