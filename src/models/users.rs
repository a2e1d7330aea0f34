// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! User accounts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use super::UserId;
use crate::error::{StoreError, StoreResult};

/// Locale assigned when registration does not supply one.
pub const DEFAULT_LOCALE: &str = "pt-BR";

/// A registered user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// Normalized email (unique).
    pub email: String,
    pub name: String,
    /// Credential hash produced by the auth layer. Never serialized.
    #[serde(skip)]
    pub password_hash: Option<String>,
    /// Subject identifier from the federated identity provider (unique).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub federated_id: Option<String>,
    pub locale: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registration input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub password_hash: Option<String>,
    #[serde(default)]
    pub federated_id: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
}

impl NewUser {
    pub fn with_email(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            ..Self::default()
        }
    }
}

/// Partial profile update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserUpdate {
    pub name: Option<String>,
    pub password_hash: Option<String>,
    pub locale: Option<String>,
}

/// Normalize an email for storage and lookup.
///
/// Trims, applies Unicode NFKC and lowercases.
///
/// # Errors
/// [`StoreError::InvalidData`] when nothing is left after normalization.
pub fn normalize_email(raw: &str) -> StoreResult<String> {
    let normalized: String = raw.trim().nfkc().collect::<String>().to_lowercase();
    if normalized.is_empty() {
        return Err(StoreError::invalid("email is empty"));
    }
    if normalized.chars().any(char::is_whitespace) {
        return Err(StoreError::invalid("email contains whitespace"));
    }
    Ok(normalized)
}
