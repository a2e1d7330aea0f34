// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Box items: the content a user leaves behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{GuardianId, ItemId, UserId};

/// A vault item with its sensitive fields decrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxItem {
    pub id: ItemId,
    pub user_id: UserId,
    pub title: String,
    pub content: String,
    pub recipient: String,
    pub category: String,
    #[serde(rename = "type")]
    pub item_type: String,
    pub is_important: bool,
    pub is_shared: bool,
    /// Guardians allowed to see this item. Empty means every guardian the
    /// item is shared with.
    pub guardian_ids: Vec<GuardianId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// List projection of a [`BoxItem`]; only the title is decrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxItemSummary {
    pub id: ItemId,
    pub title: String,
    pub category: String,
    #[serde(rename = "type")]
    pub item_type: String,
    pub is_important: bool,
    pub is_shared: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBoxItem {
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub category: String,
    #[serde(rename = "type", default)]
    pub item_type: String,
    #[serde(default)]
    pub is_important: bool,
    #[serde(default)]
    pub is_shared: bool,
    #[serde(default)]
    pub guardian_ids: Vec<GuardianId>,
}

impl NewBoxItem {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            ..Self::default()
        }
    }
}

/// Partial item update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxItemUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    pub recipient: Option<String>,
    pub category: Option<String>,
    #[serde(rename = "type")]
    pub item_type: Option<String>,
    pub is_important: Option<bool>,
    pub is_shared: Option<bool>,
    pub guardian_ids: Option<Vec<GuardianId>>,
}

/// Which shared items a guardian or share link may see.
///
/// An item is visible when it is shared, its category is in `categories`
/// (empty allows all), and either it is not restricted to specific
/// guardians or one of its guardians is in `guardian_ids`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareScope {
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub guardian_ids: Vec<GuardianId>,
}

impl ShareScope {
    /// Every shared item not restricted to particular guardians.
    pub fn all() -> Self {
        Self::default()
    }

    /// Scope of a single guardian's view.
    pub fn guardian(guardian_id: GuardianId) -> Self {
        Self {
            categories: Vec::new(),
            guardian_ids: vec![guardian_id],
        }
    }

    pub fn admits(&self, category: &str, is_shared: bool, item_guardians: &[GuardianId]) -> bool {
        if !is_shared {
            return false;
        }
        if !self.categories.is_empty() && !self.categories.iter().any(|c| c == category) {
            return false;
        }
        item_guardians.is_empty() || item_guardians.iter().any(|g| self.guardian_ids.contains(g))
    }
}
