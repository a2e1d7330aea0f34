// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Persisted row shapes.
//!
//! Both backends hold exactly these records: sensitive columns are sealed by
//! the [`SensitiveCodec`] before a record is built and opened only when a
//! record is turned back into a domain model. Nothing outside `storage`
//! sees a sealed value.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::ownership::OwnedResource;
use crate::crypto::SensitiveCodec;
use crate::error::{StoreError, StoreResult};
use crate::models::{
    BoxItem, BoxItemSummary, BoxItemUpdate, EmergencyProtocol, Guardian, GuardianId,
    GuardianUpdate, GuideProgress, IdempotencyRecord, NewBoxItem, NewGuardian, PasswordResetToken,
    ShareLink, ShareLinkAccess, User, UserId, UserSettings,
};

fn count_from_db(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

// =============================================================================
// Users
// =============================================================================

#[derive(Debug, Clone, FromRow)]
pub(crate) struct UserRecord {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub password_hash: Option<String>,
    pub federated_id: Option<String>,
    pub locale: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<UserRecord> for User {
    fn from(r: UserRecord) -> Self {
        User {
            id: r.id,
            email: r.email,
            name: r.name,
            password_hash: r.password_hash,
            federated_id: r.federated_id,
            locale: r.locale,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

// =============================================================================
// Box items
// =============================================================================

#[derive(Debug, Clone, FromRow)]
pub(crate) struct BoxItemRecord {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub content: String,
    pub recipient: String,
    pub category: String,
    pub item_type: String,
    pub is_important: bool,
    pub is_shared: bool,
    #[sqlx(json)]
    pub guardian_ids: Vec<GuardianId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Sealed sensitive columns of a box item.
#[derive(Debug, Clone, Default)]
pub(crate) struct SealedItemText {
    pub title: Option<String>,
    pub content: Option<String>,
    pub recipient: Option<String>,
}

impl SealedItemText {
    pub fn seal_new(codec: &SensitiveCodec, new: &NewBoxItem) -> StoreResult<Self> {
        Ok(Self {
            title: Some(codec.encrypt_sensitive(&new.title)?),
            content: Some(codec.encrypt_sensitive(&new.content)?),
            recipient: Some(codec.encrypt_sensitive(&new.recipient)?),
        })
    }

    pub fn seal_update(codec: &SensitiveCodec, update: &BoxItemUpdate) -> StoreResult<Self> {
        Ok(Self {
            title: codec.encrypt_optional(update.title.as_deref())?,
            content: codec.encrypt_optional(update.content.as_deref())?,
            recipient: codec.encrypt_optional(update.recipient.as_deref())?,
        })
    }
}

impl BoxItemRecord {
    pub fn open(self, codec: &SensitiveCodec) -> BoxItem {
        BoxItem {
            id: self.id,
            user_id: self.user_id,
            title: codec.decrypt_sensitive(&self.title),
            content: codec.decrypt_sensitive(&self.content),
            recipient: codec.decrypt_sensitive(&self.recipient),
            category: self.category,
            item_type: self.item_type,
            is_important: self.is_important,
            is_shared: self.is_shared,
            guardian_ids: self.guardian_ids,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Summary projection; only the title is decrypted.
    pub fn open_summary(self, codec: &SensitiveCodec) -> BoxItemSummary {
        BoxItemSummary {
            id: self.id,
            title: codec.decrypt_sensitive(&self.title),
            category: self.category,
            item_type: self.item_type,
            is_important: self.is_important,
            is_shared: self.is_shared,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Apply already-sealed text plus the plain fields of an update.
    pub fn apply(&mut self, sealed: SealedItemText, update: BoxItemUpdate, now: DateTime<Utc>) {
        if let Some(title) = sealed.title {
            self.title = title;
        }
        if let Some(content) = sealed.content {
            self.content = content;
        }
        if let Some(recipient) = sealed.recipient {
            self.recipient = recipient;
        }
        if let Some(category) = update.category {
            self.category = category;
        }
        if let Some(item_type) = update.item_type {
            self.item_type = item_type;
        }
        if let Some(is_important) = update.is_important {
            self.is_important = is_important;
        }
        if let Some(is_shared) = update.is_shared {
            self.is_shared = is_shared;
        }
        if let Some(guardian_ids) = update.guardian_ids {
            self.guardian_ids = dedup_ids(guardian_ids);
        }
        self.updated_at = now;
    }
}

impl OwnedResource for BoxItemRecord {
    fn owner_id(&self) -> UserId {
        self.user_id
    }
}

/// Sort and deduplicate a guardian id list.
pub(crate) fn dedup_ids(mut ids: Vec<GuardianId>) -> Vec<GuardianId> {
    ids.sort_unstable();
    ids.dedup();
    ids
}

// =============================================================================
// Guardians
// =============================================================================

#[derive(Debug, Clone, FromRow)]
pub(crate) struct GuardianRecord {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub notes: String,
    pub relationship: String,
    pub access_token: Option<String>,
    pub pin_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SealedGuardianText {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub notes: Option<String>,
}

impl SealedGuardianText {
    pub fn seal_new(codec: &SensitiveCodec, new: &NewGuardian) -> StoreResult<Self> {
        Ok(Self {
            name: Some(codec.encrypt_sensitive(&new.name)?),
            email: Some(codec.encrypt_sensitive(&new.email)?),
            phone: Some(codec.encrypt_sensitive(&new.phone)?),
            notes: Some(codec.encrypt_sensitive(&new.notes)?),
        })
    }

    pub fn seal_update(codec: &SensitiveCodec, update: &GuardianUpdate) -> StoreResult<Self> {
        Ok(Self {
            name: codec.encrypt_optional(update.name.as_deref())?,
            email: codec.encrypt_optional(update.email.as_deref())?,
            phone: codec.encrypt_optional(update.phone.as_deref())?,
            notes: codec.encrypt_optional(update.notes.as_deref())?,
        })
    }
}

impl GuardianRecord {
    /// Decrypt into a model. The token is returned as stored; the access
    /// token manager upgrades it before the guardian leaves the store.
    pub fn open(self, codec: &SensitiveCodec) -> Guardian {
        Guardian {
            id: self.id,
            user_id: self.user_id,
            name: codec.decrypt_sensitive(&self.name),
            email: codec.decrypt_sensitive(&self.email),
            phone: codec.decrypt_sensitive(&self.phone),
            notes: codec.decrypt_sensitive(&self.notes),
            relationship: self.relationship,
            access_token: self.access_token.unwrap_or_default(),
            has_pin: self.pin_hash.is_some(),
            pin_hash: self.pin_hash,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn apply(
        &mut self,
        sealed: SealedGuardianText,
        update: GuardianUpdate,
        now: DateTime<Utc>,
    ) {
        if let Some(name) = sealed.name {
            self.name = name;
        }
        if let Some(email) = sealed.email {
            self.email = email;
        }
        if let Some(phone) = sealed.phone {
            self.phone = phone;
        }
        if let Some(notes) = sealed.notes {
            self.notes = notes;
        }
        if let Some(relationship) = update.relationship {
            self.relationship = relationship;
        }
        self.updated_at = now;
    }
}

impl OwnedResource for GuardianRecord {
    fn owner_id(&self) -> UserId {
        self.user_id
    }
}

// =============================================================================
// Share links
// =============================================================================

#[derive(Debug, Clone, FromRow)]
pub(crate) struct ShareLinkRecord {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub token: String,
    pub pin_hash: Option<String>,
    #[sqlx(json)]
    pub categories: Vec<String>,
    #[sqlx(json)]
    pub guardian_ids: Vec<GuardianId>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_uses: i64,
    pub usage_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ShareLinkRecord> for ShareLink {
    fn from(r: ShareLinkRecord) -> Self {
        ShareLink {
            id: r.id,
            user_id: r.user_id,
            name: r.name,
            token: r.token,
            has_pin: r.pin_hash.is_some(),
            pin_hash: r.pin_hash,
            categories: r.categories,
            guardian_ids: r.guardian_ids,
            expires_at: r.expires_at,
            max_uses: count_from_db(r.max_uses),
            usage_count: count_from_db(r.usage_count),
            last_used_at: r.last_used_at,
            is_active: r.is_active,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

impl ShareLinkRecord {
    /// Whether one more use fits under the cap.
    pub fn accepts_use(&self) -> bool {
        self.is_active && (self.max_uses == 0 || self.usage_count < self.max_uses)
    }
}

impl OwnedResource for ShareLinkRecord {
    fn owner_id(&self) -> UserId {
        self.user_id
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct ShareLinkAccessRecord {
    pub id: i64,
    pub share_link_id: i64,
    pub guardian_id: Option<i64>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub accessed_at: DateTime<Utc>,
}

impl From<ShareLinkAccessRecord> for ShareLinkAccess {
    fn from(r: ShareLinkAccessRecord) -> Self {
        ShareLinkAccess {
            id: r.id,
            share_link_id: r.share_link_id,
            guardian_id: r.guardian_id,
            ip_address: r.ip_address,
            user_agent: r.user_agent,
            accessed_at: r.accessed_at,
        }
    }
}

// =============================================================================
// Account state
// =============================================================================

#[derive(Debug, Clone, FromRow)]
pub(crate) struct IdempotencyKeyRecord {
    pub user_id: i64,
    pub idempotency_key: String,
    pub resource_type: String,
    pub resource_id: i64,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<IdempotencyKeyRecord> for IdempotencyRecord {
    type Error = StoreError;

    fn try_from(r: IdempotencyKeyRecord) -> Result<Self, Self::Error> {
        Ok(IdempotencyRecord {
            user_id: r.user_id,
            key: r.idempotency_key,
            resource_type: r.resource_type.parse()?,
            resource_id: r.resource_id,
            created_at: r.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct PasswordResetRecord {
    pub id: i64,
    pub user_id: i64,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<PasswordResetRecord> for PasswordResetToken {
    fn from(r: PasswordResetRecord) -> Self {
        PasswordResetToken {
            id: r.id,
            user_id: r.user_id,
            token_hash: r.token_hash,
            expires_at: r.expires_at,
            used_at: r.used_at,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct EmergencyRecord {
    pub user_id: i64,
    pub is_active: bool,
    pub activated_at: Option<DateTime<Utc>>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<EmergencyRecord> for EmergencyProtocol {
    fn from(r: EmergencyRecord) -> Self {
        EmergencyProtocol {
            user_id: r.user_id,
            is_active: r.is_active,
            activated_at: r.activated_at,
            deactivated_at: r.deactivated_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct SettingsRecord {
    pub user_id: i64,
    pub theme: String,
    pub notifications_enabled: bool,
    pub reminder_interval_days: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<SettingsRecord> for UserSettings {
    fn from(r: SettingsRecord) -> Self {
        UserSettings {
            user_id: r.user_id,
            theme: r.theme,
            notifications_enabled: r.notifications_enabled,
            reminder_interval_days: count_from_db(r.reminder_interval_days),
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct GuideProgressRecord {
    pub id: i64,
    pub user_id: i64,
    pub step_key: String,
    pub completed_at: DateTime<Utc>,
}

impl From<GuideProgressRecord> for GuideProgress {
    fn from(r: GuideProgressRecord) -> Self {
        GuideProgress {
            id: r.id,
            user_id: r.user_id,
            step_key: r.step_key,
            completed_at: r.completed_at,
        }
    }
}
