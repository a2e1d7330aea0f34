// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Guardians: trusted contacts holding capability access tokens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{GuardianId, UserId};
use crate::crypto::pin;

/// A guardian with its sensitive fields decrypted.
///
/// `access_token` is always present and in the current format by the time a
/// `Guardian` leaves the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guardian {
    pub id: GuardianId,
    pub user_id: UserId,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub notes: String,
    pub relationship: String,
    pub access_token: String,
    #[serde(skip)]
    pub pin_hash: Option<String>,
    pub has_pin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Guardian {
    /// Check a supplied PIN. Guardians without a PIN accept any input.
    pub fn verify_pin(&self, supplied: Option<&str>) -> bool {
        match self.pin_hash.as_deref() {
            None => true,
            Some(stored) => supplied.is_some_and(|p| pin::verify_pin(p, stored)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewGuardian {
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub relationship: String,
    /// Plain PIN, hashed before it reaches storage.
    #[serde(default)]
    pub pin: Option<String>,
}

impl NewGuardian {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Partial guardian update. The token and PIN have dedicated operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub notes: Option<String>,
    pub relationship: Option<String>,
}
