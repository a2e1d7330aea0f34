// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Cryptography
//!
//! Everything the store needs to keep sensitive columns and capability
//! credentials safe at rest:
//!
//! - [`Encryptor`] - AES-256-GCM with a PBKDF2-derived key (`ring`)
//! - [`SensitiveCodec`] - fail-closed field policy and legacy plaintext tolerance
//! - [`tokens`] - access/share tokens and password-reset token digests
//! - [`pin`] - salted PIN hashes with constant-time verification
//!
//! ## Envelope Format
//!
//! ```text
//! nonce (12 bytes) | ciphertext | tag (16 bytes)
//! ```
//!
//! Stored columns carry the envelope as `enc:v1:<base64>`.

pub mod codec;
pub mod encryptor;
pub mod pin;
pub mod tokens;

pub use codec::SensitiveCodec;
pub use encryptor::{EncryptionSalt, Encryptor};

/// Errors raised by the cryptographic primitives.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption passphrase must be at least {min} bytes")]
    InvalidPassphrase { min: usize },

    #[error("invalid encryption salt: {0}")]
    InvalidSalt(String),

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("system randomness unavailable")]
    Randomness,

    #[error("AEAD seal failed")]
    Seal,

    /// Tag mismatch, truncation or tampering.
    #[error("AEAD open failed (authentication tag mismatch or truncated envelope)")]
    Open,

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("invalid PIN: {0}")]
    InvalidPin(String),
}
