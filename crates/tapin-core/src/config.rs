//! Application configuration management.
//!
//! Handles loading, saving, and validating tapin configuration including:
//! - Access-control service endpoint and protocol version
//! - Request and scan timeouts
//! - The member checking in
//! - Data directory for persisted state
//!
//! Values can be overridden from the environment (`TAPIN_BASE_URL`,
//! `TAPIN_API_VERSION`, `TAPIN_BARCODE`, `TAPIN_MEMBER_NAME`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::identity::Member;

/// Default access-control service base URL.
pub const DEFAULT_BASE_URL: &str = "https://fitservice.fitnesspassport.com.au";

/// Default protocol version sent as `api`.
pub const DEFAULT_API_VERSION: &str = "v2";

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

/// Upper bound accepted for timeouts.
pub const MAX_TIMEOUT_SECS: u64 = 300;

/// Environment variable names for overrides.
pub mod env_vars {
    /// Overrides `service.base_url`.
    pub const BASE_URL: &str = "TAPIN_BASE_URL";
    /// Overrides `service.api_version`.
    pub const API_VERSION: &str = "TAPIN_API_VERSION";
    /// Overrides `member.barcode`.
    pub const BARCODE: &str = "TAPIN_BARCODE";
    /// Overrides `member.name`.
    pub const MEMBER_NAME: &str = "TAPIN_MEMBER_NAME";
}

#[allow(clippy::expect_used)]
static BARCODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9-]{1,64}$").expect("barcode regex is valid"));

#[allow(clippy::expect_used)]
static API_VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^v[0-9]+$").expect("api version regex is valid"));

/// Returns `true` if `barcode` is a plausible member barcode.
#[must_use]
pub fn is_valid_barcode(barcode: &str) -> bool {
    BARCODE_RE.is_match(barcode)
}

/// Returns `true` if `version` looks like `v1`, `v2`, ...
#[must_use]
pub fn is_valid_api_version(version: &str) -> bool {
    API_VERSION_RE.is_match(version)
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// Failed to read the configuration file.
    #[error("Failed to read {path}: {source}")]
    ReadError {
        /// File path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to write the configuration file.
    #[error("Failed to write {path}: {source}")]
    WriteError {
        /// File path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    /// The configuration could not be serialized.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A single field is invalid.
    #[error("Invalid {field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong.
        message: String,
    },

    /// Several fields are invalid.
    #[error("{} validation errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

impl ConfigError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Access-control service settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Base URL; requests go to `<base_url>/memberVisit`.
    pub base_url: String,

    /// Protocol version sent as the `api` query parameter.
    pub api_version: String,

    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl ServiceConfig {
    /// Request timeout as a [`Duration`].
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Tag reader settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Give up waiting for a tag after this many seconds. Unset waits until
    /// cancelled.
    pub scan_timeout_secs: Option<u64>,
}

impl ReaderConfig {
    /// Scan timeout as a [`Duration`].
    #[must_use]
    pub fn scan_timeout(&self) -> Option<Duration> {
        self.scan_timeout_secs.map(Duration::from_secs)
    }
}

/// The member checking in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemberConfig {
    /// Member barcode.
    pub barcode: String,

    /// Member display name.
    pub name: String,
}

impl MemberConfig {
    /// Whether a barcode has been configured.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.barcode.is_empty()
    }

    /// Convert into a [`Member`].
    #[must_use]
    pub fn to_member(&self) -> Member {
        Member {
            barcode: self.barcode.clone(),
            name: self.name.clone(),
        }
    }
}

/// Persisted state settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory. Unset uses the platform default.
    pub data_dir: Option<PathBuf>,
}

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Access-control service.
    pub service: ServiceConfig,

    /// Tag reader.
    pub reader: ReaderConfig,

    /// Member identity.
    pub member: MemberConfig,

    /// Persisted state.
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] if the file does not exist, or a read
    /// or parse error.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration from `path`, falling back to defaults if it is
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: impl AsRef<Path>) -> ConfigResult<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(ConfigError::NotFound(path)) => {
                tracing::debug!(%path, "No configuration file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Save configuration to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        let write_err = |source| ConfigError::WriteError {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(write_err)
    }

    /// Apply environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in
    /// production).
    #[must_use]
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(base_url) = get(env_vars::BASE_URL) {
            self.service.base_url = base_url;
        }
        if let Some(api_version) = get(env_vars::API_VERSION) {
            self.service.api_version = api_version;
        }
        if let Some(barcode) = get(env_vars::BARCODE) {
            self.member.barcode = barcode;
        }
        if let Some(name) = get(env_vars::MEMBER_NAME) {
            self.member.name = name;
        }
        self
    }

    /// Validate all fields, collecting every problem found.
    ///
    /// # Errors
    ///
    /// Returns a single [`ConfigError::ValidationError`] or
    /// [`ConfigError::MultipleValidationErrors`].
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        match Url::parse(&self.service.base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => errors.push(ConfigError::invalid(
                "service.base_url",
                format!("unsupported scheme '{}'", url.scheme()),
            )),
            Err(e) => errors.push(ConfigError::invalid("service.base_url", e.to_string())),
        }

        if !is_valid_api_version(&self.service.api_version) {
            errors.push(ConfigError::invalid(
                "service.api_version",
                format!("'{}' is not of the form v<N>", self.service.api_version),
            ));
        }

        if self.service.request_timeout_secs == 0
            || self.service.request_timeout_secs > MAX_TIMEOUT_SECS
        {
            errors.push(ConfigError::invalid(
                "service.request_timeout_secs",
                format!("must be between 1 and {MAX_TIMEOUT_SECS}"),
            ));
        }

        if let Some(secs) = self.reader.scan_timeout_secs {
            if secs == 0 || secs > MAX_TIMEOUT_SECS {
                errors.push(ConfigError::invalid(
                    "reader.scan_timeout_secs",
                    format!("must be between 1 and {MAX_TIMEOUT_SECS}"),
                ));
            }
        }

        if self.member.is_configured() && !is_valid_barcode(&self.member.barcode) {
            errors.push(ConfigError::invalid(
                "member.barcode",
                "must be 1-64 letters, digits or '-'",
            ));
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    /// Resolved data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if no directory is configured and the platform default
    /// cannot be determined.
    pub fn data_dir(&self) -> Result<PathBuf, crate::storage::StoreError> {
        match &self.storage.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => crate::storage::default_data_dir(),
        }
    }
}

/// Default configuration file path.
///
/// `config.toml` in the current user's platform config directory (for example
/// `~/.config/tapin/config.toml` on Linux), or `tapin.toml` in the working
/// directory when no home directory is known.
#[must_use]
pub fn default_config_path() -> PathBuf {
    crate::storage::project_dirs()
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("tapin.toml"))
}
