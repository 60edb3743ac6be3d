//! Unified error types for the tapin core library.
//!
//! Each module has its own error type ([`StoreError`], [`DecodeError`],
//! [`ReaderError`], [`VisitError`], [`ConfigError`]). [`TapinError`] folds
//! them into one type with a machine-readable [`error_code`] and a
//! user-facing [`FailureKind`].
//!
//! [`error_code`]: TapinError::error_code

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::VisitError;
use crate::config::ConfigError;
use crate::decoder::DecodeError;
use crate::reader::ReaderError;
use crate::storage::StoreError;

/// The unified error type for tapin operations.
#[derive(Debug, Error)]
pub enum TapinError {
    // =========================================================================
    // TAG READER ERRORS
    // =========================================================================
    /// The device cannot read tags.
    #[error("Tag reading is not supported on this device")]
    UnsupportedHardware,

    /// The scan was cancelled by the user.
    #[error("Scan cancelled")]
    ScanCancelled,

    /// No tag was presented in time.
    #[error("No tag presented within {timeout_secs} seconds. Hold the tag against the reader and try again.")]
    NoTagPresented {
        /// Timeout that elapsed.
        timeout_secs: u64,
    },

    /// The reader is busy or failed.
    #[error("Tag reader failure: {0}")]
    ReaderFailure(String),

    // =========================================================================
    // DECODE ERRORS
    // =========================================================================
    /// The tag carried no record.
    #[error("Tag carried no readable record")]
    NoRecord,

    /// The tag's record decoded to empty text.
    #[error("Could not read site token from tag")]
    EmptyPayload,

    // =========================================================================
    // SERVICE ERRORS
    // =========================================================================
    /// The service could not be reached.
    #[error("Could not reach the access-control service: {message}")]
    TransportError {
        /// Transport error description.
        message: String,
        /// Whether the request timed out.
        timed_out: bool,
    },

    /// The service answered with a non-2xx status.
    #[error("Access-control service returned HTTP {0}")]
    HttpStatusError(u16),

    /// The service answered with an unreadable body.
    #[error("Invalid response from access-control service: {0}")]
    InvalidResponse(String),

    // =========================================================================
    // CONFIGURATION & PERSISTENCE ERRORS
    // =========================================================================
    /// The configuration is unusable.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Persisted state could not be read or written.
    #[error("Persistence error: {0}")]
    PersistenceError(String),
}

/// A specialized [`Result`] type for tapin operations.
pub type Result<T> = std::result::Result<T, TapinError>;

/// User-facing classification of a failed or denied attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// The device cannot read tags.
    UnsupportedHardware,
    /// The user cancelled the scan.
    ScanCancelled,
    /// No tag was presented in time.
    NoTagPresented,
    /// The reader was busy or the driver failed.
    ReaderFailure,
    /// The tag had no record.
    NoRecord,
    /// The record decoded to empty text.
    EmptyPayload,
    /// The service could not be reached.
    TransportError,
    /// The service returned a non-2xx status.
    HttpStatusError,
    /// The service body could not be parsed.
    InvalidResponse,
    /// The service refused access.
    DomainDenied,
    /// Configuration is unusable.
    ConfigError,
    /// Persisted state failed.
    PersistenceError,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::UnsupportedHardware => "unsupported hardware",
            Self::ScanCancelled => "scan cancelled",
            Self::NoTagPresented => "no tag presented",
            Self::ReaderFailure => "reader failure",
            Self::NoRecord => "no record",
            Self::EmptyPayload => "empty payload",
            Self::TransportError => "transport error",
            Self::HttpStatusError => "HTTP status error",
            Self::InvalidResponse => "invalid response",
            Self::DomainDenied => "access denied",
            Self::ConfigError => "configuration error",
            Self::PersistenceError => "persistence error",
        };
        f.write_str(label)
    }
}

impl TapinError {
    /// Returns `true` if a fresh attempt may succeed without changing
    /// anything.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::ScanCancelled
            | Self::NoTagPresented { .. }
            | Self::ReaderFailure(_)
            | Self::TransportError { .. } => true,
            Self::HttpStatusError(status) => *status >= 500,
            _ => false,
        }
    }

    /// The user-facing classification of this error.
    #[must_use]
    pub const fn failure_kind(&self) -> FailureKind {
        match self {
            Self::UnsupportedHardware => FailureKind::UnsupportedHardware,
            Self::ScanCancelled => FailureKind::ScanCancelled,
            Self::NoTagPresented { .. } => FailureKind::NoTagPresented,
            Self::ReaderFailure(_) => FailureKind::ReaderFailure,
            Self::NoRecord => FailureKind::NoRecord,
            Self::EmptyPayload => FailureKind::EmptyPayload,
            Self::TransportError { .. } => FailureKind::TransportError,
            Self::HttpStatusError(_) => FailureKind::HttpStatusError,
            Self::InvalidResponse(_) => FailureKind::InvalidResponse,
            Self::ConfigError(_) => FailureKind::ConfigError,
            Self::PersistenceError(_) => FailureKind::PersistenceError,
        }
    }

    /// Returns a machine-readable error code.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::UnsupportedHardware => "UNSUPPORTED_HARDWARE",
            Self::ScanCancelled => "SCAN_CANCELLED",
            Self::NoTagPresented { .. } => "NO_TAG_PRESENTED",
            Self::ReaderFailure(_) => "READER_FAILURE",
            Self::NoRecord => "NO_RECORD",
            Self::EmptyPayload => "EMPTY_PAYLOAD",
            Self::TransportError { .. } => "TRANSPORT_ERROR",
            Self::HttpStatusError(_) => "HTTP_STATUS_ERROR",
            Self::InvalidResponse(_) => "INVALID_RESPONSE",
            Self::ConfigError(_) => "CONFIG_ERROR",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<ReaderError> for TapinError {
    fn from(err: ReaderError) -> Self {
        match err {
            ReaderError::Unsupported => Self::UnsupportedHardware,
            ReaderError::Cancelled => Self::ScanCancelled,
            ReaderError::NoTagPresented { timeout_secs } => Self::NoTagPresented { timeout_secs },
            ReaderError::Busy | ReaderError::Driver { .. } => Self::ReaderFailure(err.to_string()),
        }
    }
}

impl From<DecodeError> for TapinError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::NoRecord => Self::NoRecord,
            DecodeError::EmptyPayload => Self::EmptyPayload,
        }
    }
}

impl From<VisitError> for TapinError {
    fn from(err: VisitError) -> Self {
        match err {
            VisitError::Transport { message, timed_out } => {
                Self::TransportError { message, timed_out }
            }
            VisitError::HttpStatus { status } => Self::HttpStatusError(status),
            VisitError::InvalidResponse { message } => Self::InvalidResponse(message),
            VisitError::InvalidUrl { url, message } => {
                Self::ConfigError(format!("Invalid service URL '{url}': {message}"))
            }
        }
    }
}

impl From<StoreError> for TapinError {
    fn from(err: StoreError) -> Self {
        Self::PersistenceError(err.to_string())
    }
}

impl From<ConfigError> for TapinError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
                Self::ConfigError(messages.join("; "))
            }
            other => Self::ConfigError(other.to_string()),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_error_conversion() {
        assert!(matches!(
            TapinError::from(ReaderError::Unsupported),
            TapinError::UnsupportedHardware
        ));
        assert!(matches!(
            TapinError::from(ReaderError::Cancelled),
            TapinError::ScanCancelled
        ));
        let busy = TapinError::from(ReaderError::Busy);
        assert_eq!(busy.failure_kind(), FailureKind::ReaderFailure);
        assert!(busy.is_recoverable());
    }

    #[test]
    fn test_decode_error_conversion() {
        assert_eq!(
            TapinError::from(DecodeError::NoRecord).failure_kind(),
            FailureKind::NoRecord
        );
        let empty = TapinError::from(DecodeError::EmptyPayload);
        assert!(!empty.is_recoverable());
        assert_eq!(empty.error_code(), "EMPTY_PAYLOAD");
    }

    #[test]
    fn test_visit_error_conversion() {
        let status = TapinError::from(VisitError::HttpStatus { status: 502 });
        assert!(matches!(status, TapinError::HttpStatusError(502)));
        assert!(status.is_recoverable());

        let bad_request = TapinError::from(VisitError::HttpStatus { status: 400 });
        assert!(!bad_request.is_recoverable());

        let url = TapinError::from(VisitError::InvalidUrl {
            url: "x".into(),
            message: "bad".into(),
        });
        assert_eq!(url.failure_kind(), FailureKind::ConfigError);
    }

    #[test]
    fn test_store_error_conversion() {
        let err = TapinError::from(StoreError::NoDataDir);
        assert_eq!(err.failure_kind(), FailureKind::PersistenceError);
        assert!(err.to_string().contains("data directory"));
    }

    #[test]
    fn test_multiple_config_errors_are_joined() {
        let err = TapinError::from(ConfigError::MultipleValidationErrors(vec![
            ConfigError::ValidationError {
                field: "a".into(),
                message: "bad".into(),
            },
            ConfigError::ValidationError {
                field: "b".into(),
                message: "worse".into(),
            },
        ]));
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid a: bad; Invalid b: worse"
        );
    }

    #[test]
    fn test_failure_kind_serialization() {
        let json = serde_json::to_string(&FailureKind::DomainDenied).unwrap();
        assert_eq!(json, "\"DOMAIN_DENIED\"");
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<TapinError>();
        assert_sync::<TapinError>();
    }
}
