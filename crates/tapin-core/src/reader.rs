//! Proximity tag reader with exclusive hardware access.
//!
//! This module provides:
//! - [`TagDriver`], the seam to the platform's tag-reading subsystem
//! - [`TagReader`], which owns exclusive access for one scan at a time
//! - [`TechnologyHandle`], the scoped acquisition that releases the driver's
//!   technology request when dropped
//!
//! Release happens in `Drop`, so it covers successful reads, driver errors,
//! cancellation, timeouts, and the scan future itself being dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ndef::RawTagRecord;

/// Errors from the tag reader.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReaderError {
    /// The device has no usable tag reader.
    #[error("Tag reading is not supported on this device")]
    Unsupported,

    /// Another scan already holds the reader.
    #[error("A scan is already in progress")]
    Busy,

    /// No tag was presented before the scan timed out.
    #[error("No tag presented within {timeout_secs} seconds")]
    NoTagPresented {
        /// Scan timeout that elapsed.
        timeout_secs: u64,
    },

    /// The scan was aborted by the caller.
    #[error("Scan cancelled")]
    Cancelled,

    /// The driver reported a failure.
    #[error("Tag reader failure: {message}")]
    Driver {
        /// Driver error message.
        message: String,
    },
}

impl ReaderError {
    /// Build a driver error from any displayable message.
    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver {
            message: message.into(),
        }
    }
}

/// Result type for reader operations.
pub type ReaderResult<T> = std::result::Result<T, ReaderError>;

/// Platform tag-reading subsystem.
///
/// Implementations map onto the platform's technology-request model: a
/// request is opened, a tag is awaited and read, and the request is cancelled
/// to give the hardware back.
#[async_trait]
pub trait TagDriver: Send + Sync {
    /// Whether the hardware can read tags at all.
    async fn is_supported(&self) -> ReaderResult<bool>;

    /// Open an exclusive technology request on the hardware.
    async fn request_technology(&self) -> ReaderResult<()>;

    /// Wait for a tag and return its records.
    async fn read_tag(&self) -> ReaderResult<RawTagRecord>;

    /// Abort any pending request and release the hardware.
    ///
    /// Called from `Drop`, so it must not block and must tolerate being called
    /// when no request is open.
    fn cancel_technology_request(&self);
}

/// Exclusive hold on the reader for the duration of one scan.
///
/// Dropping the handle cancels the driver's technology request and frees the
/// reader for the next scan.
pub struct TechnologyHandle {
    driver: Arc<dyn TagDriver>,
    _exclusive: OwnedMutexGuard<()>,
}

impl Drop for TechnologyHandle {
    fn drop(&mut self) {
        self.driver.cancel_technology_request();
        debug!("Released tag technology request");
    }
}

/// Reader that serializes access to a [`TagDriver`].
pub struct TagReader {
    driver: Arc<dyn TagDriver>,
    exclusive: Arc<Mutex<()>>,
    supported: AtomicBool,
    scan_timeout: Option<Duration>,
}

impl TagReader {
    /// Wrap a driver. The reader starts as unsupported until
    /// [`check_supported`](Self::check_supported) runs.
    pub fn new(driver: Arc<dyn TagDriver>) -> Self {
        Self {
            driver,
            exclusive: Arc::new(Mutex::new(())),
            supported: AtomicBool::new(false),
            scan_timeout: None,
        }
    }

    /// Give up on a scan when no tag is presented within `timeout`.
    #[must_use]
    pub fn with_scan_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Query hardware capability and remember the answer.
    ///
    /// A failing query is not an error: it disables scanning.
    pub async fn check_supported(&self) -> bool {
        let supported = match self.driver.is_supported().await {
            Ok(supported) => supported,
            Err(e) => {
                warn!(error = %e, "Tag reader capability check failed, disabling scanning");
                false
            }
        };
        self.supported.store(supported, Ordering::Release);
        info!(supported, "Tag reader capability checked");
        supported
    }

    /// Result of the last capability check.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.supported.load(Ordering::Acquire)
    }

    /// Acquire exclusive access and open a technology request.
    ///
    /// # Errors
    ///
    /// Returns [`ReaderError::Busy`] if another handle is alive, or the driver's
    /// error if the request cannot be opened.
    pub async fn acquire(&self) -> ReaderResult<TechnologyHandle> {
        let guard = Arc::clone(&self.exclusive)
            .try_lock_owned()
            .map_err(|_| ReaderError::Busy)?;

        // Construct the handle before requesting so a failed request is still
        // cancelled on the driver side.
        let handle = TechnologyHandle {
            driver: Arc::clone(&self.driver),
            _exclusive: guard,
        };
        self.driver.request_technology().await?;
        Ok(handle)
    }

    /// Scan a single tag.
    ///
    /// Blocks until a tag is read, `cancel` fires, or the scan timeout
    /// elapses. The technology request is released before returning on every
    /// path.
    ///
    /// # Errors
    ///
    /// Returns [`ReaderError::Unsupported`] before touching the hardware if the
    /// capability check failed, [`ReaderError::Cancelled`] on cancellation,
    /// [`ReaderError::NoTagPresented`] on timeout, and driver errors otherwise.
    pub async fn scan(&self, cancel: &CancellationToken) -> ReaderResult<RawTagRecord> {
        if !self.is_supported() {
            return Err(ReaderError::Unsupported);
        }

        let handle = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ReaderError::Cancelled),
            handle = self.acquire() => handle?,
        };

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ReaderError::Cancelled),
            result = self.read_with_timeout() => result,
        };

        drop(handle);

        match &result {
            Ok(tag) => debug!(records = tag.records.len(), "Tag read"),
            Err(e) => debug!(error = %e, "Scan ended without a tag"),
        }
        result
    }

    async fn read_with_timeout(&self) -> ReaderResult<RawTagRecord> {
        match self.scan_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.driver.read_tag())
                .await
                .map_err(|_| ReaderError::NoTagPresented {
                    timeout_secs: timeout.as_secs(),
                })?,
            None => self.driver.read_tag().await,
        }
    }
}

#[cfg(any(test, feature = "mock-reader"))]
pub use mock::MockTagDriver;

#[cfg(any(test, feature = "mock-reader"))]
mod mock {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    use super::{ReaderError, ReaderResult, TagDriver};
    use crate::ndef::RawTagRecord;

    /// Scripted in-memory tag driver.
    ///
    /// Presented tags are queued with [`present`](Self::present); a read with
    /// an empty queue waits until a tag is presented. Request and release
    /// counts are tracked so tests can assert the hardware was handed back.
    #[derive(Default)]
    pub struct MockTagDriver {
        unsupported: bool,
        queue: Mutex<VecDeque<ReaderResult<RawTagRecord>>>,
        presented: Notify,
        open: Mutex<bool>,
        requests: AtomicUsize,
        releases: AtomicUsize,
        request_error: Mutex<Option<ReaderError>>,
    }

    impl MockTagDriver {
        /// A driver reporting supported hardware with no tag presented.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// A driver reporting that the hardware is missing.
        #[must_use]
        pub fn unsupported() -> Self {
            Self {
                unsupported: true,
                ..Self::default()
            }
        }

        /// Queue a tag for the next read.
        pub fn present(&self, tag: RawTagRecord) {
            self.queue.lock().push_back(Ok(tag));
            self.presented.notify_one();
        }

        /// Queue a driver failure for the next read.
        pub fn fail_next_read(&self, error: ReaderError) {
            self.queue.lock().push_back(Err(error));
            self.presented.notify_one();
        }

        /// Make the next technology request fail.
        pub fn fail_next_request(&self, error: ReaderError) {
            *self.request_error.lock() = Some(error);
        }

        /// Number of technology requests opened.
        pub fn requests(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }

        /// Number of release calls received.
        pub fn releases(&self) -> usize {
            self.releases.load(Ordering::SeqCst)
        }

        /// Whether a technology request is currently open.
        pub fn is_open(&self) -> bool {
            *self.open.lock()
        }
    }

    #[async_trait]
    impl TagDriver for MockTagDriver {
        async fn is_supported(&self) -> ReaderResult<bool> {
            Ok(!self.unsupported)
        }

        async fn request_technology(&self) -> ReaderResult<()> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = self.request_error.lock().take() {
                return Err(error);
            }
            *self.open.lock() = true;
            Ok(())
        }

        async fn read_tag(&self) -> ReaderResult<RawTagRecord> {
            loop {
                let notified = self.presented.notified();
                let next = self.queue.lock().pop_front();
                if let Some(next) = next {
                    return next;
                }
                notified.await;
            }
        }

        fn cancel_technology_request(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
            *self.open.lock() = false;
        }
    }
}
