//! Device identity persistence and session assembly.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::{KeyValueStore, StoreError};

/// Storage key holding the device identity.
pub const DEVICE_TOKEN_KEY: &str = "device_token";

/// Opaque per-installation identifier sent as `deviceToken`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    /// Wrap an identity that was created elsewhere.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a fresh random identity.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A shortened form for display (first 24 characters).
    #[must_use]
    pub fn abbreviated(&self) -> String {
        let short: String = self.0.chars().take(24).collect();
        if short.len() < self.0.len() {
            format!("{short}...")
        } else {
            short
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Owns the persisted device identity.
///
/// The identity is created on first use and returned unchanged afterwards,
/// including across restarts when the store is persistent.
#[derive(Clone)]
pub struct DeviceIdentityStore {
    store: Arc<dyn KeyValueStore>,
}

impl DeviceIdentityStore {
    /// Wrap a key/value store.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Return the persisted identity, creating and persisting one if absent.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store cannot be read or written. No
    /// identity is handed out unless it has been persisted.
    pub fn get_or_create(&self) -> Result<DeviceIdentity, StoreError> {
        if let Some(existing) = self.store.get(DEVICE_TOKEN_KEY)? {
            if !existing.trim().is_empty() {
                return Ok(DeviceIdentity(existing));
            }
            tracing::warn!("Stored device identity is blank, generating a new one");
        }

        let identity = DeviceIdentity::generate();
        self.store.set(DEVICE_TOKEN_KEY, identity.as_str())?;
        tracing::info!(device = %identity.abbreviated(), "Created new device identity");
        Ok(identity)
    }
}

impl fmt::Debug for DeviceIdentityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentityStore").finish_non_exhaustive()
    }
}

/// The member on whose behalf check-ins are made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Member barcode sent as `barcode`.
    pub barcode: String,

    /// Display name.
    pub name: String,
}

/// Read-only inputs for a check-in attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Identity of this device.
    pub device_identity: DeviceIdentity,

    /// Member barcode.
    pub member_barcode: String,

    /// Member display name.
    pub member_name: String,
}

impl Session {
    /// Assemble a session from the identity store and a member.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the device identity cannot be loaded.
    pub fn assemble(identities: &DeviceIdentityStore, member: &Member) -> Result<Self, StoreError> {
        Ok(Self {
            device_identity: identities.get_or_create()?,
            member_barcode: member.barcode.clone(),
            member_name: member.name.clone(),
        })
    }
}
