//! Check-in state machine.
//!
//! ```text
//! Idle ─trigger─▶ Scanning ─tag─▶ Decoding ─token─▶ Validating ─allowed─▶ CheckingIn
//!                    │               │                  │                    │
//!                    │ cancel        └──────────────────┴─▶ Denied / Failed ◀┘
//!                    ▼                                                       │
//!                  Idle ◀──────────────────── Succeeded ◀────────────────────┘
//! ```
//!
//! Only one attempt runs at a time: a trigger while an attempt is in flight is
//! ignored. Every terminal state falls back to `Idle` immediately, and no step
//! is retried. Cancellation is honoured only while `Scanning`; once the
//! validate call has been issued the attempt runs to completion.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::client::{AuthorizationRequest, AuthorizationResponse, VisitAuthorizer};
use crate::decoder::{decode_record_set, DecodeStrategy, DecodedToken, FacilityToken};
use crate::error::{FailureKind, TapinError};
use crate::identity::Session;
use crate::ndef::RawTagRecord;
use crate::reader::TagReader;

/// Observable coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckInState {
    /// Ready for a new attempt.
    Idle,
    /// Waiting for a tag.
    Scanning,
    /// Decoding the tag payload.
    Decoding,
    /// Validate-only call in flight.
    Validating,
    /// Commit call in flight.
    CheckingIn,
    /// The visit was recorded.
    Succeeded,
    /// The service refused access.
    Denied,
    /// The attempt failed.
    Failed,
}

impl CheckInState {
    /// Whether an attempt is in flight.
    #[must_use]
    pub const fn is_busy(self) -> bool {
        matches!(
            self,
            Self::Scanning | Self::Decoding | Self::Validating | Self::CheckingIn
        )
    }
}

impl fmt::Display for CheckInState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Decoding => "decoding",
            Self::Validating => "validating",
            Self::CheckingIn => "checking in",
            Self::Succeeded => "succeeded",
            Self::Denied => "denied",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Phase of an attempt in which an outcome was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptPhase {
    /// Reading the tag.
    Scanning,
    /// Decoding the payload.
    Decoding,
    /// Validate-only call.
    Validating,
    /// Commit call.
    CheckingIn,
}

/// Terminal result of one attempt, for presentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckInOutcome {
    /// The visit was recorded.
    Succeeded {
        /// Service status text from the commit call.
        status: String,
        /// Member display name.
        member_name: String,
        /// Facility checked into.
        facility: FacilityToken,
        /// When the commit call returned.
        checked_in_at: DateTime<Utc>,
    },

    /// The service refused access.
    Denied {
        /// Reasons to show the member.
        messages: Vec<String>,
        /// Call that was refused.
        phase: AttemptPhase,
    },

    /// The attempt could not complete.
    Failed {
        /// Classification.
        kind: FailureKind,
        /// Phase that failed.
        phase: AttemptPhase,
        /// Human-readable detail.
        detail: String,
    },
}

impl CheckInOutcome {
    fn failed(phase: AttemptPhase, err: &TapinError) -> Self {
        debug!(
            code = err.error_code(),
            recoverable = err.is_recoverable(),
            ?phase,
            "Attempt stopped by error"
        );
        Self::Failed {
            kind: err.failure_kind(),
            phase,
            detail: err.to_string(),
        }
    }

    /// Whether the visit was recorded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// Whether the attempt ended because the user cancelled the scan.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Failed {
                kind: FailureKind::ScanCancelled,
                ..
            }
        )
    }

    /// Failure classification; `DomainDenied` for denials, `None` on success.
    #[must_use]
    pub const fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Succeeded { .. } => None,
            Self::Denied { .. } => Some(FailureKind::DomainDenied),
            Self::Failed { kind, .. } => Some(*kind),
        }
    }

    /// Short title for the outcome.
    #[must_use]
    pub const fn title(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "Checked In",
            Self::Denied {
                phase: AttemptPhase::CheckingIn,
                ..
            } => "Check-in Failed",
            Self::Denied { .. } => "Access Denied",
            Self::Failed { .. } => "Error",
        }
    }

    /// Lines to show the member.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        match self {
            Self::Succeeded {
                status,
                member_name,
                ..
            } => vec![
                "Check-in successful!".to_string(),
                format!("Member: {member_name}"),
                format!("Status: {status}"),
            ],
            Self::Denied { messages, .. } => messages.clone(),
            Self::Failed {
                phase: AttemptPhase::CheckingIn,
                detail,
                ..
            } => vec![
                "Access was confirmed but the visit could not be recorded.".to_string(),
                detail.clone(),
            ],
            Self::Failed { detail, .. } => vec![detail.clone()],
        }
    }

    const fn terminal_state(&self) -> CheckInState {
        match self {
            Self::Succeeded { .. } => CheckInState::Succeeded,
            Self::Denied { .. } => CheckInState::Denied,
            Self::Failed { .. } => CheckInState::Failed,
        }
    }
}

/// One check-in attempt, from a completed scan to its terminal state.
#[derive(Debug, Clone)]
pub struct Attempt {
    /// Attempt identifier for log correlation.
    pub id: Uuid,
    /// When the tag was read.
    pub started_at: DateTime<Utc>,
    /// The decoded facility token.
    pub decoded: DecodedToken,
}

impl Attempt {
    fn new(decoded: DecodedToken) -> Self {
        Self {
            id: Uuid::now_v7(),
            started_at: Utc::now(),
            decoded,
        }
    }

    /// The facility token for this attempt.
    #[must_use]
    pub const fn token(&self) -> &FacilityToken {
        &self.decoded.token
    }

    /// Strategy that decoded the token.
    #[must_use]
    pub const fn strategy(&self) -> &DecodeStrategy {
        &self.decoded.strategy
    }
}

/// Returns the coordinator to `Idle` however the attempt ends, including when
/// the `check_in` future is dropped.
struct AttemptGuard<'a> {
    coordinator: &'a CheckInCoordinator,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.coordinator.cancel.lock();
        if let Some(token) = slot.take() {
            token.cancel();
        }
        self.coordinator.state.send_replace(CheckInState::Idle);
    }
}

/// Sequences tag reading, decoding and the two-phase visit exchange.
pub struct CheckInCoordinator {
    reader: Arc<TagReader>,
    authorizer: Arc<dyn VisitAuthorizer>,
    api_version: String,
    state: watch::Sender<CheckInState>,
    cancel: Mutex<Option<CancellationToken>>,
    last_success: Mutex<Option<CheckInOutcome>>,
}

impl CheckInCoordinator {
    /// Create a coordinator in the `Idle` state.
    pub fn new(
        reader: Arc<TagReader>,
        authorizer: Arc<dyn VisitAuthorizer>,
        api_version: impl Into<String>,
    ) -> Self {
        let (state, _) = watch::channel(CheckInState::Idle);
        Self {
            reader,
            authorizer,
            api_version: api_version.into(),
            state,
            cancel: Mutex::new(None),
            last_success: Mutex::new(None),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CheckInState {
        *self.state.borrow()
    }

    /// Observe state changes. Receivers cannot change the state.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CheckInState> {
        self.state.subscribe()
    }

    /// Whether the reader reported support for tag scanning.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.reader.is_supported()
    }

    /// The most recent successful check-in, if any.
    #[must_use]
    pub fn last_success(&self) -> Option<CheckInOutcome> {
        self.last_success.lock().clone()
    }

    /// Run one check-in attempt for `session`.
    ///
    /// Returns `None` without doing anything if an attempt is already in
    /// flight. Otherwise returns the terminal outcome; the coordinator is back
    /// in `Idle` when this returns.
    #[instrument(skip_all, fields(device = %session.device_identity.abbreviated()))]
    pub async fn check_in(&self, session: &Session) -> Option<CheckInOutcome> {
        let cancel = {
            let mut slot = self.cancel.lock();
            let started = self.state.send_if_modified(|state| {
                if *state == CheckInState::Idle {
                    *state = CheckInState::Scanning;
                    true
                } else {
                    false
                }
            });
            if !started {
                debug!(state = %self.state(), "Check-in already in progress, ignoring trigger");
                return None;
            }
            let token = CancellationToken::new();
            *slot = Some(token.clone());
            token
        };
        let _guard = AttemptGuard { coordinator: self };

        let outcome = self.run_attempt(session, &cancel).await;

        match &outcome {
            CheckInOutcome::Succeeded { status, facility, .. } => {
                info!(%facility, %status, "Check-in succeeded");
                *self.last_success.lock() = Some(outcome.clone());
            }
            CheckInOutcome::Denied { messages, phase } => {
                info!(?phase, ?messages, "Check-in denied");
            }
            CheckInOutcome::Failed { kind, phase, detail } => {
                warn!(%kind, ?phase, %detail, "Check-in failed");
            }
        }

        // A cancelled scan goes straight back to Idle.
        if !outcome.is_cancelled() {
            self.state.send_replace(outcome.terminal_state());
        }
        Some(outcome)
    }

    /// Abort the attempt if it is waiting for a tag.
    ///
    /// Returns `true` if a scan was cancelled. Has no effect once the tag has
    /// been read: network calls are never interrupted.
    pub fn cancel(&self) -> bool {
        let slot = self.cancel.lock();
        if self.state() != CheckInState::Scanning {
            debug!(state = %self.state(), "Cancel ignored outside scanning");
            return false;
        }
        match slot.as_ref() {
            Some(token) => {
                info!("Cancelling scan");
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn run_attempt(&self, session: &Session, cancel: &CancellationToken) -> CheckInOutcome {
        let tag = match self.scan(cancel).await {
            Ok(tag) => tag,
            Err(e) => return CheckInOutcome::failed(AttemptPhase::Scanning, &e),
        };

        let decoded = match decode_record_set(&tag) {
            Ok(decoded) => decoded,
            Err(e) => return CheckInOutcome::failed(AttemptPhase::Decoding, &e.into()),
        };
        let attempt = Attempt::new(decoded);
        info!(
            attempt = %attempt.id,
            site = %attempt.token(),
            strategy = %attempt.strategy(),
            started_at = %attempt.started_at,
            "Read facility tag"
        );
        if let Some(primary) = &attempt.decoded.primary_error {
            warn!(attempt = %attempt.id, error = %primary, "Tag is not a valid text record");
        }

        self.state.send_replace(CheckInState::Validating);
        let validation = match self.register(&attempt, session, true).await {
            Ok(response) => response,
            Err(e) => return CheckInOutcome::failed(AttemptPhase::Validating, &e),
        };
        if !validation.is_allowed() {
            return CheckInOutcome::Denied {
                messages: validation.denial_messages(),
                phase: AttemptPhase::Validating,
            };
        }

        self.state.send_replace(CheckInState::CheckingIn);
        let commit = match self.register(&attempt, session, false).await {
            Ok(response) => response,
            Err(e) => return CheckInOutcome::failed(AttemptPhase::CheckingIn, &e),
        };
        if !commit.is_allowed() {
            return CheckInOutcome::Denied {
                messages: commit.denial_messages(),
                phase: AttemptPhase::CheckingIn,
            };
        }

        CheckInOutcome::Succeeded {
            status: commit.status,
            member_name: session.member_name.clone(),
            facility: attempt.token().clone(),
            checked_in_at: Utc::now(),
        }
    }

    async fn scan(&self, cancel: &CancellationToken) -> Result<RawTagRecord, TapinError> {
        let result = self.reader.scan(cancel).await;

        // Leave Scanning under the cancel lock so a late cancel cannot slip
        // in after the tag was read.
        let _slot = self.cancel.lock();
        if cancel.is_cancelled() {
            return Err(TapinError::ScanCancelled);
        }
        let tag = result?;
        self.state.send_replace(CheckInState::Decoding);
        Ok(tag)
    }

    async fn register(
        &self,
        attempt: &Attempt,
        session: &Session,
        validate_only: bool,
    ) -> Result<AuthorizationResponse, TapinError> {
        let request =
            AuthorizationRequest::new(attempt.token(), session, &self.api_version, validate_only);
        let response = self.authorizer.register_visit(&request).await?;
        debug!(
            attempt = %attempt.id,
            validate_only,
            can_access = response.can_access,
            error = response.error,
            "Visit call returned"
        );
        Ok(response)
    }
}

impl fmt::Debug for CheckInCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckInCoordinator")
            .field("state", &self.state())
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::client::{VisitError, VisitResult};
    use crate::identity::DeviceIdentity;
    use crate::ndef::NdefRecord;
    use crate::reader::{MockTagDriver, TagDriver};

    /// Authorizer that replays canned responses and records every request.
    #[derive(Default)]
    struct ScriptedAuthorizer {
        responses: Mutex<VecDeque<VisitResult<AuthorizationResponse>>>,
        requests: Mutex<Vec<AuthorizationRequest>>,
        calls: AtomicUsize,
    }

    impl ScriptedAuthorizer {
        fn with(responses: Vec<VisitResult<AuthorizationResponse>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                ..Self::default()
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl VisitAuthorizer for ScriptedAuthorizer {
        async fn register_visit(
            &self,
            request: &AuthorizationRequest,
        ) -> VisitResult<AuthorizationResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().push(request.clone());
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(VisitError::HttpStatus { status: 500 }))
        }
    }

    fn allowed(status: &str) -> VisitResult<AuthorizationResponse> {
        Ok(AuthorizationResponse {
            can_access: true,
            status: status.to_string(),
            ..AuthorizationResponse::default()
        })
    }

    fn session() -> Session {
        Session {
            device_identity: DeviceIdentity::new("device-1"),
            member_barcode: "26782701".to_string(),
            member_name: "Sam Doe".to_string(),
        }
    }

    fn site_tag(text: &str) -> RawTagRecord {
        let mut payload = vec![0x02, b'e', b'n'];
        payload.extend_from_slice(text.as_bytes());
        RawTagRecord::new(vec![NdefRecord::text(payload)])
    }

    async fn coordinator(
        driver: &Arc<MockTagDriver>,
        authorizer: &Arc<ScriptedAuthorizer>,
    ) -> Arc<CheckInCoordinator> {
        let reader = TagReader::new(Arc::clone(driver) as Arc<dyn TagDriver>);
        reader.check_supported().await;
        Arc::new(CheckInCoordinator::new(
            Arc::new(reader),
            Arc::clone(authorizer) as Arc<dyn VisitAuthorizer>,
            "v2",
        ))
    }

    async fn wait_for_scanning(coordinator: &CheckInCoordinator, driver: &MockTagDriver) {
        let mut states = coordinator.subscribe();
        states
            .wait_for(|s| *s == CheckInState::Scanning)
            .await
            .unwrap();
        while !driver.is_open() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_full_success_path() {
        let driver = Arc::new(MockTagDriver::new());
        let authorizer = ScriptedAuthorizer::with(vec![allowed(""), allowed("OK")]);
        let coordinator = coordinator(&driver, &authorizer).await;
        driver.present(site_tag("SITE-42"));

        let outcome = coordinator.check_in(&session()).await.unwrap();

        match &outcome {
            CheckInOutcome::Succeeded {
                status, facility, ..
            } => {
                assert_eq!(status, "OK");
                assert_eq!(facility.as_str(), "SITE-42");
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(coordinator.state(), CheckInState::Idle);
        assert_eq!(coordinator.last_success(), Some(outcome));

        let requests = authorizer.requests.lock();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].validate_only);
        assert!(!requests[1].validate_only);
        assert_eq!(requests[1].facility_token.as_str(), "SITE-42");
        assert_eq!(requests[1].api_version, "v2");
        assert_eq!(driver.releases(), 1);
    }

    #[tokio::test]
    async fn test_validate_error_short_circuits() {
        let driver = Arc::new(MockTagDriver::new());
        let authorizer = ScriptedAuthorizer::with(vec![Ok(AuthorizationResponse {
            can_access: true,
            error: true,
            error_messages: vec!["Membership expired".to_string()],
            ..AuthorizationResponse::default()
        })]);
        let coordinator = coordinator(&driver, &authorizer).await;
        driver.present(site_tag("SITE-42"));

        let outcome = coordinator.check_in(&session()).await.unwrap();

        assert_eq!(
            outcome,
            CheckInOutcome::Denied {
                messages: vec!["Membership expired".to_string()],
                phase: AttemptPhase::Validating,
            }
        );
        assert_eq!(authorizer.calls(), 1);
        assert_eq!(outcome.failure_kind(), Some(FailureKind::DomainDenied));
    }

    #[tokio::test]
    async fn test_validate_refused_without_messages() {
        let driver = Arc::new(MockTagDriver::new());
        let authorizer = ScriptedAuthorizer::with(vec![Ok(AuthorizationResponse::default())]);
        let coordinator = coordinator(&driver, &authorizer).await;
        driver.present(site_tag("SITE-42"));

        let outcome = coordinator.check_in(&session()).await.unwrap();

        assert_eq!(
            outcome.messages(),
            vec![crate::client::ACCESS_REFUSED_MESSAGE.to_string()]
        );
        assert_eq!(outcome.title(), "Access Denied");
        assert_eq!(authorizer.calls(), 1);
    }

    #[tokio::test]
    async fn test_commit_denied() {
        let driver = Arc::new(MockTagDriver::new());
        let authorizer = ScriptedAuthorizer::with(vec![
            allowed(""),
            Ok(AuthorizationResponse {
                can_access: true,
                error: true,
                error_messages: vec!["Already checked in today".to_string()],
                ..AuthorizationResponse::default()
            }),
        ]);
        let coordinator = coordinator(&driver, &authorizer).await;
        driver.present(site_tag("SITE-42"));

        let outcome = coordinator.check_in(&session()).await.unwrap();

        assert!(matches!(
            outcome,
            CheckInOutcome::Denied {
                phase: AttemptPhase::CheckingIn,
                ..
            }
        ));
        assert_eq!(outcome.title(), "Check-in Failed");
        assert_eq!(authorizer.calls(), 2);
        assert!(coordinator.last_success().is_none());
    }

    #[tokio::test]
    async fn test_commit_transport_failure_is_distinct() {
        let driver = Arc::new(MockTagDriver::new());
        let authorizer = ScriptedAuthorizer::with(vec![
            allowed(""),
            Err(VisitError::Transport {
                message: "connection reset".to_string(),
                timed_out: false,
            }),
        ]);
        let coordinator = coordinator(&driver, &authorizer).await;
        driver.present(site_tag("SITE-42"));

        let outcome = coordinator.check_in(&session()).await.unwrap();

        assert!(matches!(
            outcome,
            CheckInOutcome::Failed {
                kind: FailureKind::TransportError,
                phase: AttemptPhase::CheckingIn,
                ..
            }
        ));
        assert_eq!(outcome.messages().len(), 2);
        assert_eq!(authorizer.calls(), 2);
    }

    #[tokio::test]
    async fn test_validate_http_error_fails() {
        let driver = Arc::new(MockTagDriver::new());
        let authorizer =
            ScriptedAuthorizer::with(vec![Err(VisitError::HttpStatus { status: 503 })]);
        let coordinator = coordinator(&driver, &authorizer).await;
        driver.present(site_tag("SITE-42"));

        let outcome = coordinator.check_in(&session()).await.unwrap();

        assert!(matches!(
            outcome,
            CheckInOutcome::Failed {
                kind: FailureKind::HttpStatusError,
                phase: AttemptPhase::Validating,
                ..
            }
        ));
        assert_eq!(authorizer.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_tag_fails_before_network() {
        let driver = Arc::new(MockTagDriver::new());
        let authorizer = ScriptedAuthorizer::with(vec![]);
        let coordinator = coordinator(&driver, &authorizer).await;
        driver.present(site_tag("   "));

        let outcome = coordinator.check_in(&session()).await.unwrap();

        assert_eq!(outcome.failure_kind(), Some(FailureKind::EmptyPayload));
        assert_eq!(authorizer.calls(), 0);

        driver.present(RawTagRecord::default());
        let outcome = coordinator.check_in(&session()).await.unwrap();
        assert_eq!(outcome.failure_kind(), Some(FailureKind::NoRecord));
    }

    #[tokio::test]
    async fn test_unsupported_hardware() {
        let driver = Arc::new(MockTagDriver::unsupported());
        let authorizer = ScriptedAuthorizer::with(vec![]);
        let coordinator = coordinator(&driver, &authorizer).await;

        assert!(!coordinator.is_supported());
        let outcome = coordinator.check_in(&session()).await.unwrap();
        assert_eq!(outcome.failure_kind(), Some(FailureKind::UnsupportedHardware));
        assert_eq!(driver.requests(), 0);
    }

    #[tokio::test]
    async fn test_second_trigger_is_noop_while_scanning() {
        let driver = Arc::new(MockTagDriver::new());
        let authorizer = ScriptedAuthorizer::with(vec![allowed(""), allowed("OK")]);
        let coordinator = coordinator(&driver, &authorizer).await;

        let first = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.check_in(&session()).await })
        };
        wait_for_scanning(&coordinator, &driver).await;

        assert!(coordinator.state().is_busy());
        assert!(coordinator.check_in(&session()).await.is_none());
        assert_eq!(coordinator.state(), CheckInState::Scanning);
        assert_eq!(driver.requests(), 1);

        driver.present(site_tag("SITE-42"));
        assert!(first.await.unwrap().unwrap().is_success());
        assert_eq!(coordinator.state(), CheckInState::Idle);
        assert!(!coordinator.state().is_busy());
    }

    #[tokio::test]
    async fn test_cancel_during_scanning() {
        let driver = Arc::new(MockTagDriver::new());
        let authorizer = ScriptedAuthorizer::with(vec![allowed(""), allowed("OK")]);
        let coordinator = coordinator(&driver, &authorizer).await;

        let attempt = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.check_in(&session()).await })
        };
        wait_for_scanning(&coordinator, &driver).await;

        assert!(coordinator.cancel());
        let outcome = attempt.await.unwrap().unwrap();

        assert!(outcome.is_cancelled());
        assert_eq!(coordinator.state(), CheckInState::Idle);
        assert_eq!(driver.releases(), 1);
        assert!(!driver.is_open());
        assert_eq!(authorizer.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_when_idle_is_ignored() {
        let driver = Arc::new(MockTagDriver::new());
        let authorizer = ScriptedAuthorizer::with(vec![]);
        let coordinator = coordinator(&driver, &authorizer).await;

        assert!(!coordinator.cancel());
        assert_eq!(coordinator.state(), CheckInState::Idle);
    }

    #[tokio::test]
    async fn test_dropped_attempt_returns_to_idle() {
        let driver = Arc::new(MockTagDriver::new());
        let authorizer = ScriptedAuthorizer::with(vec![]);
        let coordinator = coordinator(&driver, &authorizer).await;

        let attempt = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.check_in(&session()).await })
        };
        wait_for_scanning(&coordinator, &driver).await;

        attempt.abort();
        assert!(attempt.await.unwrap_err().is_cancelled());

        assert_eq!(coordinator.state(), CheckInState::Idle);
        assert_eq!(driver.releases(), 1);
    }

    #[tokio::test]
    async fn test_observer_sees_progress() {
        let driver = Arc::new(MockTagDriver::new());
        let authorizer = ScriptedAuthorizer::with(vec![allowed(""), allowed("OK")]);
        let coordinator = coordinator(&driver, &authorizer).await;
        let mut states = coordinator.subscribe();
        driver.present(site_tag("SITE-42"));

        coordinator.check_in(&session()).await.unwrap();

        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), CheckInState::Idle);
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = CheckInOutcome::Failed {
            kind: FailureKind::NoRecord,
            phase: AttemptPhase::Decoding,
            detail: "Tag carried no readable record".to_string(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["kind"], "NO_RECORD");
        assert_eq!(json["phase"], "decoding");
    }
}
