// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Capability tokens.
//!
//! Guardian access tokens and share-link tokens are bearer credentials: 32
//! bytes from the system RNG, encoded base64url without padding. The result
//! is always 43 characters from `A-Z a-z 0-9 - _`, so it never contains a
//! path separator, a query delimiter or padding.
//!
//! Earlier deployments issued UUIDs and short random strings; anything not in
//! the current shape is reported by [`is_legacy_token`].

use base64ct::{Base64UrlUnpadded, Encoding};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};

use super::CryptoError;

/// Random bytes per token.
pub const TOKEN_BYTES: usize = 32;

/// Encoded token length.
pub const TOKEN_LEN: usize = 43;

/// Generate a fresh capability token.
pub fn generate_token() -> Result<String, CryptoError> {
    let mut bytes = [0u8; TOKEN_BYTES];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| CryptoError::Randomness)?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

/// Whether `token` has the current format.
pub fn is_current_token(token: &str) -> bool {
    token.len() == TOKEN_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        && Base64UrlUnpadded::decode_vec(token).is_ok_and(|bytes| bytes.len() == TOKEN_BYTES)
}

/// Whether `token` is absent or in a legacy/insecure format.
pub fn is_legacy_token(token: &str) -> bool {
    !is_current_token(token)
}

/// Digest under which a password-reset token is stored.
///
/// The raw token only ever exists in the reset email.
pub fn hash_reset_token(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    Base64UrlUnpadded::encode_string(&digest)
}
