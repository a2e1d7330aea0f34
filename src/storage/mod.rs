// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Vault Storage Module
//!
//! The [`VaultStore`] contract and its two backends:
//!
//! - [`memory::InMemoryStore`] for development and tests
//! - [`sql::SqlStore`] on SQLite (sqlx) for production
//!
//! Both backends are behaviorally equivalent; the same conformance suite
//! runs against each.
//!
//! ## Security Model
//!
//! - Sensitive columns (item title/content/recipient, guardian
//!   name/email/phone/notes) are sealed with the [`SensitiveCodec`] before
//!   they are written, and writes fail closed when the codec cannot seal
//! - Every owner-scoped lookup filters on owner id; a foreign resource is
//!   reported as `NotFound`
//! - Guardian access tokens are upgraded on read by the
//!   [`token_repair::AccessTokenManager`]
//! - Share-link tokens and PIN hashes never leave the store serialized
//!
//! ## Storage Layout
//!
//! ```text
//! users
//!   ├── box_items            (cascade)
//!   ├── guardians            (cascade)
//!   ├── share_links          (cascade)
//!   │     └── share_link_accesses (cascade)
//!   ├── idempotency_keys     (cascade)
//!   ├── password_reset_tokens(cascade)
//!   ├── emergency_protocols  (cascade)
//!   ├── user_settings        (cascade)
//!   └── guide_progress       (cascade)
//! system_config              (single row: encryption salt)
//! ```
//!
//! [`SensitiveCodec`]: crate::crypto::SensitiveCodec

pub mod memory;
pub mod ownership;
pub mod pagination;
pub(crate) mod records;
pub mod sql;
pub mod token_repair;

#[cfg(test)]
mod conformance;

pub use memory::InMemoryStore;
pub use ownership::{OwnedResource, OwnershipCheck};
pub use pagination::{Page, PageRequest, DEFAULT_MAX_PAGE_LIMIT, DEFAULT_PAGE_LIMIT};
pub use sql::SqlStore;
pub use token_repair::{AccessTokenManager, TokenRepairSink};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{StoreError, StoreResult};
use crate::models::{
    validate_idempotency_key, BoxItem, BoxItemSummary, BoxItemUpdate, Created, EmergencyProtocol,
    Guardian, GuardianId, GuardianUpdate, GuideProgress, IdempotencyOutcome, IdempotencyRecord,
    ItemId, NewBoxItem, NewGuardian, NewShareLink, NewShareLinkAccess, NewUser,
    PasswordResetToken, ResourceType, SettingsUpdate, ShareLink, ShareLinkAccess, ShareLinkId,
    ShareLinkUpdate, ShareScope, User, UserId, UserSettings, UserUpdate,
};

/// Storage contract consumed by the HTTP layer.
///
/// All owner-scoped operations take the owner id first. Operations keyed by
/// a capability token (guardian access token, share-link token) or by a
/// share-link id on the access path are not owner-scoped.
#[async_trait]
pub trait VaultStore: Send + Sync {
    // ---- users ----------------------------------------------------------

    /// Register a user. The email is normalized; duplicates are `AlreadyExists`.
    async fn create_user(&self, new: NewUser) -> StoreResult<User>;
    async fn get_user(&self, id: UserId) -> StoreResult<User>;
    async fn get_user_by_email(&self, email: &str) -> StoreResult<User>;
    async fn get_user_by_federated_id(&self, federated_id: &str) -> StoreResult<User>;
    async fn update_user(&self, id: UserId, update: UserUpdate) -> StoreResult<User>;
    /// Attach a federated identity. `AlreadyExists` if another user holds it.
    async fn link_federated_identity(&self, id: UserId, federated_id: &str) -> StoreResult<User>;
    /// Delete a user and everything the user owns, atomically.
    async fn delete_user(&self, id: UserId) -> StoreResult<()>;

    // ---- box items ------------------------------------------------------

    async fn create_box_item(
        &self,
        owner: UserId,
        new: NewBoxItem,
        idempotency_key: Option<&str>,
    ) -> StoreResult<Created<BoxItem>>;
    async fn get_box_item(&self, owner: UserId, id: ItemId) -> StoreResult<BoxItem>;
    async fn list_box_items(&self, owner: UserId) -> StoreResult<Vec<BoxItemSummary>>;
    async fn list_box_items_paginated(
        &self,
        owner: UserId,
        page: PageRequest,
    ) -> StoreResult<Page<BoxItemSummary>>;
    async fn count_box_items(&self, owner: UserId) -> StoreResult<u64>;
    async fn update_box_item(
        &self,
        owner: UserId,
        id: ItemId,
        update: BoxItemUpdate,
    ) -> StoreResult<BoxItem>;
    async fn delete_box_item(&self, owner: UserId, id: ItemId) -> StoreResult<()>;
    /// Shared items visible under `scope`, newest first.
    async fn list_shared_box_items(
        &self,
        owner: UserId,
        scope: &ShareScope,
    ) -> StoreResult<Vec<BoxItem>>;

    // ---- guardians ------------------------------------------------------

    async fn create_guardian(
        &self,
        owner: UserId,
        new: NewGuardian,
        idempotency_key: Option<&str>,
    ) -> StoreResult<Created<Guardian>>;
    async fn get_guardian(&self, owner: UserId, id: GuardianId) -> StoreResult<Guardian>;
    /// Resolve a guardian by capability token. Legacy-format tokens never match.
    async fn get_guardian_by_access_token(&self, token: &str) -> StoreResult<Guardian>;
    async fn list_guardians(&self, owner: UserId) -> StoreResult<Vec<Guardian>>;
    async fn list_guardians_paginated(
        &self,
        owner: UserId,
        page: PageRequest,
    ) -> StoreResult<Page<Guardian>>;
    async fn count_guardians(&self, owner: UserId) -> StoreResult<u64>;
    async fn update_guardian(
        &self,
        owner: UserId,
        id: GuardianId,
        update: GuardianUpdate,
    ) -> StoreResult<Guardian>;
    /// Set (`Some`) or clear (`None`) the guardian's PIN.
    async fn set_guardian_pin(
        &self,
        owner: UserId,
        id: GuardianId,
        pin: Option<&str>,
    ) -> StoreResult<Guardian>;
    /// Issue a new access token, revoking the previous one.
    async fn rotate_guardian_token(&self, owner: UserId, id: GuardianId) -> StoreResult<Guardian>;
    async fn delete_guardian(&self, owner: UserId, id: GuardianId) -> StoreResult<()>;

    // ---- share links ----------------------------------------------------

    async fn create_share_link(
        &self,
        owner: UserId,
        new: NewShareLink,
        idempotency_key: Option<&str>,
    ) -> StoreResult<Created<ShareLink>>;
    async fn get_share_link(&self, owner: UserId, id: ShareLinkId) -> StoreResult<ShareLink>;
    /// Exact-match lookup of an active link. Expiry and usage caps are the
    /// caller's to check.
    async fn get_share_link_by_token(&self, token: &str) -> StoreResult<ShareLink>;
    async fn list_share_links(&self, owner: UserId) -> StoreResult<Vec<ShareLink>>;
    async fn list_share_links_paginated(
        &self,
        owner: UserId,
        page: PageRequest,
    ) -> StoreResult<Page<ShareLink>>;
    async fn update_share_link(
        &self,
        owner: UserId,
        id: ShareLinkId,
        update: ShareLinkUpdate,
    ) -> StoreResult<ShareLink>;
    async fn delete_share_link(&self, owner: UserId, id: ShareLinkId) -> StoreResult<()>;
    /// Count one use. Atomic; refuses an inactive link or one at its cap.
    async fn increment_share_link_usage(
        &self,
        id: ShareLinkId,
        now: DateTime<Utc>,
    ) -> StoreResult<ShareLink>;
    async fn record_share_link_access(
        &self,
        id: ShareLinkId,
        access: NewShareLinkAccess,
    ) -> StoreResult<ShareLinkAccess>;
    async fn list_share_link_accesses(
        &self,
        owner: UserId,
        id: ShareLinkId,
    ) -> StoreResult<Vec<ShareLinkAccess>>;

    // ---- idempotency ----------------------------------------------------

    /// Register-or-fetch. The first registration wins and is never replaced.
    async fn register_idempotency_key(
        &self,
        owner: UserId,
        key: &str,
        resource_type: ResourceType,
        resource_id: i64,
    ) -> StoreResult<IdempotencyOutcome>;
    async fn get_idempotency_key(
        &self,
        owner: UserId,
        key: &str,
        resource_type: ResourceType,
    ) -> StoreResult<Option<IdempotencyRecord>>;
    /// Remove a key so a retry creates a new resource. Returns whether it existed.
    async fn delete_idempotency_key(
        &self,
        owner: UserId,
        key: &str,
        resource_type: ResourceType,
    ) -> StoreResult<bool>;

    // ---- password reset -------------------------------------------------

    /// Store a reset token. Only the digest of `raw_token` is persisted.
    async fn create_password_reset_token(
        &self,
        user_id: UserId,
        raw_token: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<PasswordResetToken>;
    /// Look a reset token up by its raw value.
    async fn get_password_reset_token(&self, raw_token: &str) -> StoreResult<PasswordResetToken>;
    /// Consume a reset token. A second use is `InvalidData`.
    async fn mark_password_reset_token_used(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<PasswordResetToken>;
    /// Drop every reset token of a user. Returns how many were removed.
    async fn delete_password_reset_tokens(&self, user_id: UserId) -> StoreResult<u64>;

    // ---- emergency protocol ---------------------------------------------

    async fn get_emergency_protocol(&self, owner: UserId) -> StoreResult<EmergencyProtocol>;
    async fn set_emergency_protocol(
        &self,
        owner: UserId,
        active: bool,
    ) -> StoreResult<EmergencyProtocol>;

    // ---- settings -------------------------------------------------------

    /// Settings, created with defaults on first read.
    async fn get_settings(&self, owner: UserId) -> StoreResult<UserSettings>;
    async fn update_settings(
        &self,
        owner: UserId,
        update: SettingsUpdate,
    ) -> StoreResult<UserSettings>;

    // ---- guide progress -------------------------------------------------

    /// Mark an onboarding step complete. Repeats return the first completion.
    async fn mark_guide_step(&self, owner: UserId, step_key: &str) -> StoreResult<GuideProgress>;
    async fn list_guide_progress(&self, owner: UserId) -> StoreResult<Vec<GuideProgress>>;

    // ---- maintenance ----------------------------------------------------

    async fn health_check(&self) -> StoreResult<()>;
}

/// Validate a guide step key.
pub(crate) fn validate_step_key(step_key: &str) -> StoreResult<&str> {
    let step_key = step_key.trim();
    if step_key.is_empty() || step_key.len() > 64 {
        return Err(StoreError::invalid("guide step key must be 1-64 characters"));
    }
    Ok(step_key)
}

/// Hash an optional PIN, reporting a malformed PIN as `InvalidData`.
pub(crate) fn hash_optional_pin(pin: Option<&str>) -> StoreResult<Option<String>> {
    use crate::crypto::{pin as pins, CryptoError};

    pin.map(|p| {
        pins::hash_pin(p).map_err(|e| match e {
            CryptoError::InvalidPin(msg) => StoreError::invalid(format!("PIN {msg}")),
            other => other.into(),
        })
    })
    .transpose()
}

/// Validate an optional idempotency key.
pub(crate) fn validated_key(key: Option<&str>) -> StoreResult<Option<&str>> {
    key.map(validate_idempotency_key).transpose()
}

/// A replayed idempotency key whose resource has since been deleted.
pub(crate) fn replay_missing(resource_type: ResourceType, id: i64) -> StoreError {
    StoreError::not_found(format!(
        "{resource_type} {id} registered under idempotency key"
    ))
}

/// Reject blank required text fields.
pub(crate) fn require_text(field: &str, value: &str) -> StoreResult<()> {
    if value.trim().is_empty() {
        return Err(StoreError::invalid(format!("{field} is required")));
    }
    Ok(())
}

/// Drop blank and repeated categories, keeping first-seen order.
pub(crate) fn clean_categories(categories: Vec<String>) -> Vec<String> {
    let mut cleaned: Vec<String> = Vec::with_capacity(categories.len());
    for category in categories {
        let category = category.trim();
        if !category.is_empty() && !cleaned.iter().any(|c| c == category) {
            cleaned.push(category.to_string());
        }
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_errors_are_invalid_data() {
        assert!(matches!(
            hash_optional_pin(Some("12")),
            Err(StoreError::InvalidData(_))
        ));
        assert_eq!(hash_optional_pin(None).unwrap(), None);
        assert!(hash_optional_pin(Some("1234")).unwrap().is_some());
    }

    #[test]
    fn categories_cleaned() {
        let cleaned = clean_categories(vec![
            " finance ".into(),
            "".into(),
            "health".into(),
            "finance".into(),
        ]);
        assert_eq!(cleaned, vec!["finance", "health"]);
    }

    #[test]
    fn step_keys_validated() {
        assert_eq!(validate_step_key(" welcome ").unwrap(), "welcome");
        assert!(validate_step_key("").is_err());
        assert!(validate_step_key(&"s".repeat(65)).is_err());
    }

    #[test]
    fn blank_text_rejected() {
        assert!(require_text("title", "  ").is_err());
        assert!(require_text("title", "x").is_ok());
    }
}
