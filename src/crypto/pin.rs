// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! PIN hashing for guardians and share links.
//!
//! Stored format:
//!
//! ```text
//! pbkdf2-sha256$<iterations>$<base64 salt>$<base64 hash>
//! ```
//!
//! The PIN itself is never persisted and never leaves this module.

use std::num::NonZeroU32;

use base64ct::{Base64, Encoding};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};

use super::CryptoError;

const SCHEME: &str = "pbkdf2-sha256";
const PIN_ITERATIONS: u32 = 100_000;
const PIN_SALT_LEN: usize = 16;
const PIN_HASH_LEN: usize = 32;

/// Shortest accepted PIN.
pub const MIN_PIN_LEN: usize = 4;
/// Longest accepted PIN.
pub const MAX_PIN_LEN: usize = 12;

/// Check that a PIN is 4-12 ASCII digits.
pub fn validate_pin(pin: &str) -> Result<(), CryptoError> {
    if !(MIN_PIN_LEN..=MAX_PIN_LEN).contains(&pin.len()) {
        return Err(CryptoError::InvalidPin(format!(
            "must be {MIN_PIN_LEN}-{MAX_PIN_LEN} digits"
        )));
    }
    if !pin.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CryptoError::InvalidPin("must contain digits only".to_string()));
    }
    Ok(())
}

/// Hash a PIN with a fresh random salt.
pub fn hash_pin(pin: &str) -> Result<String, CryptoError> {
    validate_pin(pin)?;

    let mut salt = [0u8; PIN_SALT_LEN];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| CryptoError::Randomness)?;

    let iterations = NonZeroU32::new(PIN_ITERATIONS).ok_or(CryptoError::KeyDerivation)?;
    let mut hash = [0u8; PIN_HASH_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        &salt,
        pin.as_bytes(),
        &mut hash,
    );

    Ok(format!(
        "{SCHEME}${PIN_ITERATIONS}${}${}",
        Base64::encode_string(&salt),
        Base64::encode_string(&hash)
    ))
}

/// Verify `pin` against a stored hash in constant time.
///
/// Malformed stored hashes never verify.
pub fn verify_pin(pin: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(scheme), Some(iterations), Some(salt), Some(hash), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };
    if scheme != SCHEME {
        return false;
    }
    let Some(iterations) = iterations.parse::<u32>().ok().and_then(NonZeroU32::new) else {
        return false;
    };
    let (Ok(salt), Ok(hash)) = (Base64::decode_vec(salt), Base64::decode_vec(hash)) else {
        return false;
    };

    pbkdf2::verify(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        &salt,
        pin.as_bytes(),
        &hash,
    )
    .is_ok()
}
