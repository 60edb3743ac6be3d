//! # tapin-core
//!
//! Core check-in protocol for tapin: tap a phone-sized reader against a
//! facility's proximity tag and record a member visit with the access-control
//! service.
//!
//! This crate provides:
//! - A persistent per-installation device identity
//! - Tag reading behind a swappable hardware driver
//! - Facility token decoding from raw tag payloads
//! - The two-phase (validate, then commit) visit authorization exchange
//! - A check-in state machine that sequences all of the above
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`coordinator`] - Check-in state machine and attempt outcomes
//! - [`reader`] - Exclusive tag reader sessions over a [`TagDriver`]
//! - [`ndef`] - NDEF message and record parsing
//! - [`decoder`] - Facility token extraction with a byte-level fallback
//! - [`client`] - HTTP client for the member visit endpoint
//! - [`identity`] - Device identity and member session assembly
//! - [`storage`] - Key-value persistence backed by a JSON file
//! - [`config`] - Configuration loading, saving, and validation
//! - [`error`] - Unified error types for the crate

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod coordinator;
pub mod decoder;
pub mod error;
pub mod identity;
pub mod ndef;
pub mod reader;
pub mod storage;

// Re-export primary types for convenience
pub use client::{
    AuthorizationRequest, AuthorizationResponse, HttpVisitClient, VisitAuthorizer, VisitError,
    VisitResult,
};
pub use config::{
    default_config_path, is_valid_api_version, is_valid_barcode, Config, ConfigError,
    ConfigResult, MemberConfig, ReaderConfig, ServiceConfig, StorageConfig,
};
pub use coordinator::{AttemptPhase, CheckInCoordinator, CheckInOutcome, CheckInState};
pub use decoder::{decode, decode_record_set, DecodeError, DecodeStrategy, DecodedToken, FacilityToken};
pub use error::{FailureKind, Result, TapinError};
pub use identity::{DeviceIdentity, DeviceIdentityStore, Member, Session};
pub use ndef::{NdefMessage, NdefParseError, NdefRecord, RawTagRecord};
#[cfg(any(test, feature = "mock-reader"))]
pub use reader::MockTagDriver;
pub use reader::{ReaderError, ReaderResult, TagDriver, TagReader, TechnologyHandle};
pub use storage::{default_data_dir, JsonFileStore, KeyValueStore, MemoryStore, StoreError};
pub use tokio_util::sync::CancellationToken;
