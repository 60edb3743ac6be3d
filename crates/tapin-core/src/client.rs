//! Member visit authorization against the remote access-control service.
//!
//! Every visit goes through `PUT <base>/memberVisit` with all request fields
//! as query parameters. The transport status only says whether the call
//! reached the service: whether the member may enter is carried in the body's
//! `ERROR` and `CANACCESS` flags, which callers must check on every response.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::config::ServiceConfig;
use crate::decoder::FacilityToken;
use crate::identity::{DeviceIdentity, Session};

/// Path of the visit endpoint relative to the base URL.
pub const MEMBER_VISIT_PATH: &str = "memberVisit";

/// Message shown when access is refused without server messages.
pub const ACCESS_REFUSED_MESSAGE: &str = "You are not allowed to access this facility";

/// One call to the visit endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    /// Facility identifier read from the tag.
    pub facility_token: FacilityToken,

    /// Identity of this device.
    pub device_identity: DeviceIdentity,

    /// Member barcode.
    pub member_barcode: String,

    /// Protocol version.
    pub api_version: String,

    /// Check eligibility without recording a visit.
    pub validate_only: bool,
}

impl AuthorizationRequest {
    /// Build the request for `token` on behalf of `session`.
    #[must_use]
    pub fn new(
        token: &FacilityToken,
        session: &Session,
        api_version: &str,
        validate_only: bool,
    ) -> Self {
        Self {
            facility_token: token.clone(),
            device_identity: session.device_identity.clone(),
            member_barcode: session.member_barcode.clone(),
            api_version: api_version.to_string(),
            validate_only,
        }
    }

    /// Query parameters in wire order. `validateOnly` is present only when set.
    #[must_use]
    pub fn query_pairs(&self) -> Vec<(&'static str, &str)> {
        let mut pairs = vec![
            ("siteToken", self.facility_token.as_str()),
            ("deviceToken", self.device_identity.as_str()),
            ("barcode", self.member_barcode.as_str()),
            ("api", self.api_version.as_str()),
        ];
        if self.validate_only {
            pairs.push(("validateOnly", "true"));
        }
        pairs
    }
}

/// Body returned by the visit endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationResponse {
    /// Whether the member may access the facility.
    #[serde(rename = "CANACCESS")]
    pub can_access: bool,

    /// Service status text.
    #[serde(rename = "STATUS", default)]
    pub status: String,

    /// Whether the service reports an error.
    #[serde(rename = "ERROR")]
    pub error: bool,

    /// Human-readable error messages, in order.
    #[serde(rename = "ERRORMESSAGES", default)]
    pub error_messages: Vec<String>,

    /// Active membership suspensions, when reported.
    #[serde(rename = "SUSPENSIONS", default, skip_serializing_if = "Option::is_none")]
    pub suspensions: Option<Vec<serde_json::Value>>,
}

impl AuthorizationResponse {
    /// Whether the response allows the attempt to proceed.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        self.can_access && !self.error
    }

    /// Messages explaining a denial.
    ///
    /// Server messages are used when present; otherwise a fixed refusal
    /// message is returned.
    #[must_use]
    pub fn denial_messages(&self) -> Vec<String> {
        let messages: Vec<String> = self
            .error_messages
            .iter()
            .map(|m| m.trim())
            .filter(|m| !m.is_empty())
            .map(ToString::to_string)
            .collect();
        if messages.is_empty() {
            vec![ACCESS_REFUSED_MESSAGE.to_string()]
        } else {
            messages
        }
    }
}

/// Client-level failures. Domain denial is not an error here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VisitError {
    /// The request never produced an HTTP response (connect, DNS, timeout).
    #[error("Could not reach the access-control service: {message}")]
    Transport {
        /// Transport error description.
        message: String,
        /// Whether the request timed out.
        timed_out: bool,
    },

    /// The service answered with a non-2xx status.
    #[error("Access-control service returned HTTP {status}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
    },

    /// The body could not be parsed.
    #[error("Invalid response from access-control service: {message}")]
    InvalidResponse {
        /// Parse error description.
        message: String,
    },

    /// The configured base URL cannot be used.
    #[error("Invalid service URL '{url}': {message}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Why it was rejected.
        message: String,
    },
}

impl VisitError {
    fn from_reqwest(err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::HttpStatus {
                status: status.as_u16(),
            };
        }
        if err.is_decode() {
            return Self::InvalidResponse {
                message: err.to_string(),
            };
        }
        Self::Transport {
            message: err.to_string(),
            timed_out: err.is_timeout(),
        }
    }
}

/// Result type for visit operations.
pub type VisitResult<T> = std::result::Result<T, VisitError>;

/// Registers member visits with the access-control service.
#[async_trait]
pub trait VisitAuthorizer: Send + Sync {
    /// Perform one visit call.
    ///
    /// A successful return carries the service's verdict; callers decide on
    /// denial from [`AuthorizationResponse::is_allowed`].
    async fn register_visit(&self, request: &AuthorizationRequest)
        -> VisitResult<AuthorizationResponse>;
}

/// HTTP implementation of [`VisitAuthorizer`].
#[derive(Debug, Clone)]
pub struct HttpVisitClient {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpVisitClient {
    /// Create a client for the service at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`VisitError::InvalidUrl`] if the base URL cannot be parsed, or
    /// [`VisitError::Transport`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> VisitResult<Self> {
        let endpoint = Self::endpoint_for(base_url)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VisitError::Transport {
                message: format!("Failed to create HTTP client: {e}"),
                timed_out: false,
            })?;

        Ok(Self { client, endpoint })
    }

    /// Create a client from service configuration.
    ///
    /// # Errors
    ///
    /// See [`HttpVisitClient::new`].
    pub fn from_config(config: &ServiceConfig) -> VisitResult<Self> {
        Self::new(&config.base_url, config.request_timeout())
    }

    /// The resolved `memberVisit` endpoint.
    #[must_use]
    pub const fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn endpoint_for(base_url: &str) -> VisitResult<Url> {
        let invalid = |message: String| VisitError::InvalidUrl {
            url: base_url.to_string(),
            message,
        };

        // Ensure a trailing slash so joining keeps any base path.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base = Url::parse(&normalized).map_err(|e| invalid(e.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(invalid("URL cannot be a base".to_string()));
        }
        base.join(MEMBER_VISIT_PATH)
            .map_err(|e| invalid(e.to_string()))
    }

    /// Full URL for `request`, including query parameters.
    #[must_use]
    pub fn request_url(&self, request: &AuthorizationRequest) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().extend_pairs(request.query_pairs());
        url
    }
}

#[async_trait]
impl VisitAuthorizer for HttpVisitClient {
    async fn register_visit(
        &self,
        request: &AuthorizationRequest,
    ) -> VisitResult<AuthorizationResponse> {
        let url = self.request_url(request);
        debug!(
            site = %request.facility_token,
            validate_only = request.validate_only,
            "Registering member visit"
        );

        let response = self
            .client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .send()
            .await
            .map_err(|e| VisitError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "Member visit call failed");
            return Err(VisitError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| VisitError::from_reqwest(&e))?;
        let parsed: AuthorizationResponse =
            serde_json::from_slice(&body).map_err(|e| VisitError::InvalidResponse {
                message: e.to_string(),
            })?;

        debug!(
            can_access = parsed.can_access,
            error = parsed.error,
            status = %parsed.status,
            "Member visit response"
        );
        Ok(parsed)
    }
}
