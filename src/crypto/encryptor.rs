// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Authenticated symmetric encryption keyed by (passphrase, salt).
//!
//! The key is derived once at construction with PBKDF2-HMAC-SHA256. The
//! derivation is deterministic, so the persisted salt plus the configured
//! passphrase always reproduce the same key across restarts.

use std::fmt;
use std::num::NonZeroU32;

use base64ct::{Base64, Encoding};
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};

use super::CryptoError;

/// PBKDF2 iteration count for the field-encryption key.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// AES-256 key length.
pub const KEY_LEN: usize = 32;

/// AES-GCM nonce length.
pub const NONCE_LEN: usize = aead::NONCE_LEN;

/// AES-GCM authentication tag length.
pub const TAG_LEN: usize = 16;

/// Fixed bytes every envelope carries on top of the payload.
pub const ENVELOPE_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Shortest accepted passphrase.
pub const MIN_PASSPHRASE_LEN: usize = 16;

// =============================================================================
// Salt
// =============================================================================

/// Process-wide salt used for key derivation.
///
/// Not secret in the cryptographic sense, but it must never change once data
/// has been written with it.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionSalt(Vec<u8>);

impl EncryptionSalt {
    /// Length of freshly generated salts.
    pub const GENERATED_LEN: usize = 32;
    /// Shortest salt accepted from configuration or storage.
    pub const MIN_LEN: usize = 16;

    /// Generate a new random salt.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = vec![0u8; Self::GENERATED_LEN];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| CryptoError::Randomness)?;
        Ok(Self(bytes))
    }

    /// Wrap raw salt bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() < Self::MIN_LEN {
            return Err(CryptoError::InvalidSalt(format!(
                "expected at least {} bytes, got {}",
                Self::MIN_LEN,
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    /// Parse a base64-encoded salt (as stored in config or `system_config`).
    pub fn from_encoded(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = Base64::decode_vec(encoded.trim())
            .map_err(|_| CryptoError::InvalidSalt("not valid base64".to_string()))?;
        Self::from_bytes(bytes)
    }

    /// Base64 form for persistence.
    pub fn encode(&self) -> String {
        Base64::encode_string(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for EncryptionSalt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionSalt({} bytes)", self.0.len())
    }
}

// =============================================================================
// Encryptor
// =============================================================================

/// AES-256-GCM encryptor with a derived key.
pub struct Encryptor {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl Encryptor {
    /// Derive the key from `passphrase` and `salt`.
    ///
    /// # Errors
    /// Fails when the passphrase is shorter than [`MIN_PASSPHRASE_LEN`]. This
    /// is a startup failure, not a per-call one.
    pub fn new(passphrase: &str, salt: &EncryptionSalt) -> Result<Self, CryptoError> {
        if passphrase.len() < MIN_PASSPHRASE_LEN {
            return Err(CryptoError::InvalidPassphrase {
                min: MIN_PASSPHRASE_LEN,
            });
        }

        let iterations = NonZeroU32::new(PBKDF2_ITERATIONS).ok_or(CryptoError::KeyDerivation)?;
        let mut key_bytes = [0u8; KEY_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            salt.as_bytes(),
            passphrase.as_bytes(),
            &mut key_bytes,
        );

        let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes);
        key_bytes.fill(0);
        let unbound = unbound.map_err(|_| CryptoError::KeyDerivation)?;

        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Seal `plaintext` into a self-describing envelope.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CryptoError::Randomness)?;

        let mut in_out = Vec::with_capacity(plaintext.len() + TAG_LEN);
        in_out.extend_from_slice(plaintext);
        self.key
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce_bytes), Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::Seal)?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + in_out.len());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&in_out);
        Ok(envelope)
    }

    /// Open an envelope produced by [`Encryptor::encrypt`].
    ///
    /// Tampered or truncated input always fails; corrupted plaintext is
    /// never returned.
    pub fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if envelope.len() < ENVELOPE_OVERHEAD {
            return Err(CryptoError::MalformedEnvelope(format!(
                "{} bytes is shorter than the {ENVELOPE_OVERHEAD}-byte envelope overhead",
                envelope.len()
            )));
        }

        let (nonce_bytes, sealed) = envelope.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| CryptoError::Open)?;

        let mut in_out = sealed.to_vec();
        let plaintext_len = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::Open)?
            .len();
        in_out.truncate(plaintext_len);
        Ok(in_out)
    }
}

impl fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Encryptor")
            .field("algorithm", &"AES-256-GCM")
            .field("kdf", &"PBKDF2-HMAC-SHA256")
            .finish_non_exhaustive()
    }
}
