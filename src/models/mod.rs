// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Vault Data Models
//!
//! Plaintext domain types returned by the store. Sensitive columns are
//! decrypted by the time a value of these types exists; their sealed form
//! lives in `storage::records` and never leaves the storage layer.
//!
//! ## Model Categories
//!
//! - **Users**: identity, credential hash, federated linkage, locale
//! - **Box items**: the vault content (title/content/recipient are sensitive)
//! - **Guardians**: trusted contacts with capability access tokens
//! - **Share links**: revocable, PIN/usage/expiry limited capability links
//! - **Account state**: reset tokens, emergency protocol, settings, progress
//! - **Idempotency**: client retry keys for safe creation

pub mod account;
pub mod guardians;
pub mod items;
pub mod share_links;
pub mod users;

pub use account::{
    EmergencyProtocol, GuideProgress, PasswordResetToken, SettingsUpdate, UserSettings,
};
pub use guardians::{Guardian, GuardianUpdate, NewGuardian};
pub use items::{BoxItem, BoxItemSummary, BoxItemUpdate, NewBoxItem, ShareScope};
pub use share_links::{
    LinkAvailability, NewShareLink, NewShareLinkAccess, ShareLink, ShareLinkAccess,
    ShareLinkUpdate,
};
pub use users::{normalize_email, NewUser, User, UserUpdate, DEFAULT_LOCALE};

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

pub type UserId = i64;
pub type ItemId = i64;
pub type GuardianId = i64;
pub type ShareLinkId = i64;

/// Longest accepted idempotency key.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

// =============================================================================
// Idempotency
// =============================================================================

/// Resource kinds that can be created idempotently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    BoxItem,
    Guardian,
    ShareLink,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::BoxItem => "box_item",
            ResourceType::Guardian => "guardian",
            ResourceType::ShareLink => "share_link",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "box_item" => Ok(ResourceType::BoxItem),
            "guardian" => Ok(ResourceType::Guardian),
            "share_link" => Ok(ResourceType::ShareLink),
            other => Err(StoreError::invalid(format!("unknown resource type '{other}'"))),
        }
    }
}

/// A registered idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub user_id: UserId,
    pub key: String,
    pub resource_type: ResourceType,
    pub resource_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Result of registering an idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IdempotencyOutcome {
    /// First use of the key; it now maps to the supplied resource.
    Registered,
    /// The key was already registered for another resource.
    Existing { resource_id: i64 },
}

impl IdempotencyOutcome {
    pub fn created(&self) -> bool {
        matches!(self, IdempotencyOutcome::Registered)
    }

    pub fn existing_resource_id(&self) -> Option<i64> {
        match self {
            IdempotencyOutcome::Registered => None,
            IdempotencyOutcome::Existing { resource_id } => Some(*resource_id),
        }
    }
}

/// A resource returned from a create call that may have been replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Created<T> {
    pub resource: T,
    /// `false` when an idempotency key matched an earlier creation.
    pub created: bool,
}

impl<T> Created<T> {
    pub fn new(resource: T) -> Self {
        Self {
            resource,
            created: true,
        }
    }

    pub fn replayed(resource: T) -> Self {
        Self {
            resource,
            created: false,
        }
    }

    pub fn into_inner(self) -> T {
        self.resource
    }
}

/// Validate a client-supplied idempotency key.
pub fn validate_idempotency_key(key: &str) -> StoreResult<&str> {
    let key = key.trim();
    if key.is_empty() {
        return Err(StoreError::invalid("idempotency key is empty"));
    }
    if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(StoreError::invalid(format!(
            "idempotency key exceeds {MAX_IDEMPOTENCY_KEY_LEN} bytes"
        )));
    }
    if !key.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(StoreError::invalid(
            "idempotency key must be printable ASCII without spaces",
        ));
    }
    Ok(key)
}
