// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Store error taxonomy.
//!
//! Every store operation returns [`StoreResult`]. The HTTP layer translates
//! errors to status codes using [`StoreError::error_code`]; the store itself
//! never decides on transport semantics.

use crate::crypto::CryptoError;

/// Error type for all vault store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Resource absent, or not owned by the caller.
    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness violation (duplicate email, federated identity, token).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Malformed input caught at the store boundary.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// No encryptor configured; sensitive writes are refused.
    #[error("encryption is not configured, refusing to store sensitive data")]
    EncryptionUnavailable,

    /// A tagged ciphertext could not be opened.
    #[error("sensitive field could not be decrypted")]
    DecryptionFailed,

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists(what.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidData(message.into())
    }

    /// Stable machine-readable code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "not_found",
            StoreError::AlreadyExists(_) => "already_exists",
            StoreError::InvalidData(_) => "invalid_data",
            StoreError::EncryptionUnavailable => "encryption_unavailable",
            StoreError::DecryptionFailed => "decryption_failed",
            StoreError::Crypto(_) => "crypto_error",
            StoreError::Config(_) => "config_error",
            StoreError::Database(_) => "database_error",
            StoreError::Migration(_) => "migration_error",
            StoreError::Serialization(_) => "serialization_error",
            StoreError::Internal(_) => "internal_error",
        }
    }

    /// Whether the caller can fix the request (as opposed to a server fault).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound(_) | StoreError::AlreadyExists(_) | StoreError::InvalidData(_)
        )
    }

    /// Map a database error, turning unique-constraint violations into
    /// [`StoreError::AlreadyExists`].
    pub(crate) fn from_db(err: sqlx::Error, what: impl Into<String>) -> Self {
        let unique = err
            .as_database_error()
            .is_some_and(|db| db.is_unique_violation());
        if unique {
            StoreError::AlreadyExists(what.into())
        } else {
            StoreError::Database(err)
        }
    }
}
