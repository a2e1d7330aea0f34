// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Per-account state: password resets, emergency protocol, settings and
//! onboarding progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UserId;

/// Pending password reset. Only the token digest is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordResetToken {
    pub id: i64,
    pub user_id: UserId,
    #[serde(skip)]
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PasswordResetToken {
    /// Unused and not yet expired.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.used_at.is_none() && self.expires_at > now
    }
}

/// Emergency protocol toggle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyProtocol {
    pub user_id: UserId,
    pub is_active: bool,
    pub activated_at: Option<DateTime<Utc>>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl EmergencyProtocol {
    pub(crate) fn inactive(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            is_active: false,
            activated_at: None,
            deactivated_at: None,
            updated_at: now,
        }
    }

    /// Apply a toggle. Re-applying the current state only bumps `updated_at`.
    pub(crate) fn toggle(&mut self, active: bool, now: DateTime<Utc>) {
        if active && !self.is_active {
            self.activated_at = Some(now);
        } else if !active && self.is_active {
            self.deactivated_at = Some(now);
        }
        self.is_active = active;
        self.updated_at = now;
    }
}

/// User preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    pub user_id: UserId,
    pub theme: String,
    pub notifications_enabled: bool,
    pub reminder_interval_days: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserSettings {
    pub const DEFAULT_THEME: &'static str = "system";
    pub const DEFAULT_REMINDER_INTERVAL_DAYS: u32 = 90;

    pub(crate) fn defaults(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            theme: Self::DEFAULT_THEME.to_string(),
            notifications_enabled: true,
            reminder_interval_days: Self::DEFAULT_REMINDER_INTERVAL_DAYS,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn apply(&mut self, update: SettingsUpdate, now: DateTime<Utc>) {
        if let Some(theme) = update.theme {
            self.theme = theme;
        }
        if let Some(enabled) = update.notifications_enabled {
            self.notifications_enabled = enabled;
        }
        if let Some(days) = update.reminder_interval_days {
            self.reminder_interval_days = days;
        }
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    pub theme: Option<String>,
    pub notifications_enabled: Option<bool>,
    pub reminder_interval_days: Option<u32>,
}

/// A completed onboarding step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuideProgress {
    pub id: i64,
    pub user_id: UserId,
    pub step_key: String,
    pub completed_at: DateTime<Utc>,
}
