// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Share links and their access log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{GuardianId, ShareLinkId, ShareScope, UserId};
use crate::crypto::pin;

/// Whether a resolved link may be opened right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkAvailability {
    Available,
    Inactive,
    Expired,
    Exhausted,
}

/// A share link owned by a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareLink {
    pub id: ShareLinkId,
    pub user_id: UserId,
    pub name: String,
    /// Capability secret. Only handed out once, at creation.
    #[serde(skip)]
    pub token: String,
    #[serde(skip)]
    pub pin_hash: Option<String>,
    pub has_pin: bool,
    pub categories: Vec<String>,
    pub guardian_ids: Vec<GuardianId>,
    /// `None` never expires.
    pub expires_at: Option<DateTime<Utc>>,
    /// `0` is unlimited.
    pub max_uses: u32,
    pub usage_count: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ShareLink {
    pub fn availability(&self, now: DateTime<Utc>) -> LinkAvailability {
        if !self.is_active {
            LinkAvailability::Inactive
        } else if self.expires_at.is_some_and(|at| at <= now) {
            LinkAvailability::Expired
        } else if self.max_uses > 0 && self.usage_count >= self.max_uses {
            LinkAvailability::Exhausted
        } else {
            LinkAvailability::Available
        }
    }

    /// Check a supplied PIN. Links without a PIN accept any input.
    pub fn verify_pin(&self, supplied: Option<&str>) -> bool {
        match self.pin_hash.as_deref() {
            None => true,
            Some(stored) => supplied.is_some_and(|p| pin::verify_pin(p, stored)),
        }
    }

    /// Items this link exposes.
    pub fn scope(&self) -> ShareScope {
        ShareScope {
            categories: self.categories.clone(),
            guardian_ids: self.guardian_ids.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewShareLink {
    pub name: String,
    #[serde(default)]
    pub pin: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub guardian_ids: Vec<GuardianId>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_uses: u32,
}

impl NewShareLink {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Mutable share-link fields. Id, owner, token and PIN are fixed.
///
/// `expires_at: Some(None)` clears the expiry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareLinkUpdate {
    pub name: Option<String>,
    pub categories: Option<Vec<String>>,
    #[serde(default, with = "double_option")]
    pub expires_at: Option<Option<DateTime<Utc>>>,
    pub max_uses: Option<u32>,
    pub is_active: Option<bool>,
}

/// One recorded opening of a share link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareLinkAccess {
    pub id: i64,
    pub share_link_id: ShareLinkId,
    pub guardian_id: Option<GuardianId>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub accessed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewShareLinkAccess {
    #[serde(default)]
    pub guardian_id: Option<GuardianId>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

/// Distinguishes an absent field from an explicit `null`.
mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T, S>(value: &Option<Option<T>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        match value {
            None => serializer.serialize_none(),
            Some(inner) => inner.serialize(serializer),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}
