// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Sensitive-field codec.
//!
//! Policy wrapper around [`Encryptor`] applied at the persistence boundary:
//!
//! - empty values pass through untouched in both directions
//! - writes fail closed: no encryptor, or a failed seal, is an error and the
//!   value is never stored as plaintext
//! - stored ciphertext is tagged with [`CIPHERTEXT_MARKER`]
//! - reads tolerate legacy plaintext written before encryption was enabled
//!
//! ## Legacy Disambiguation
//!
//! Untagged values are either legacy plaintext or untagged envelopes written
//! by an early encrypted deployment. A value is only *attempted* as
//! ciphertext when its structure can be an envelope:
//!
//! | Check | Bound |
//! |-------|-------|
//! | length | at least [`MIN_UNTAGGED_CIPHERTEXT_LEN`] (40) characters |
//! | encoding | canonical padded base64, no whitespace |
//! | framing | decodes to at least nonce + tag + 1 byte (29 bytes) |
//!
//! The threshold comes from the envelope overhead: the smallest envelope of a
//! non-empty value is 12 + 16 + 1 = 29 bytes, i.e. 40 base64 characters, so
//! no genuine envelope is ever shorter. Plaintext containing a space, any
//! punctuation outside `+/=`, or non-ASCII text can never pass.
//!
//! A false positive (plaintext that happens to be well-formed base64 of the
//! right length) costs one failed AEAD open and the value is returned
//! unchanged. Returning garbage instead would require forging a GCM tag,
//! probability 2^-128. A false negative is impossible for envelopes this
//! encryptor produced, because all of them satisfy every check.

use std::sync::Arc;

use base64ct::{Base64, Encoding};

use super::encryptor::{EncryptionSalt, Encryptor, ENVELOPE_OVERHEAD};
use super::CryptoError;
use crate::error::{StoreError, StoreResult};

/// Prefix marking a stored value as known ciphertext.
pub const CIPHERTEXT_MARKER: &str = "enc:v1:";

/// Smallest decoded envelope of a non-empty value.
pub const MIN_ENVELOPE_LEN: usize = ENVELOPE_OVERHEAD + 1;

/// Shortest untagged value that is attempted as ciphertext.
pub const MIN_UNTAGGED_CIPHERTEXT_LEN: usize = MIN_ENVELOPE_LEN.div_ceil(3) * 4;

/// Encrypts and decrypts sensitive columns.
///
/// Cheap to clone; the encryptor is shared.
#[derive(Debug, Clone)]
pub struct SensitiveCodec {
    encryptor: Option<Arc<Encryptor>>,
}

impl SensitiveCodec {
    /// Codec backed by a configured encryptor.
    pub fn new(encryptor: Encryptor) -> Self {
        Self {
            encryptor: Some(Arc::new(encryptor)),
        }
    }

    /// Codec without an encryptor.
    ///
    /// Every non-empty sensitive write fails with
    /// [`StoreError::EncryptionUnavailable`]; legacy plaintext stays readable.
    pub fn disabled() -> Self {
        Self { encryptor: None }
    }

    /// Codec for an optional configured passphrase.
    ///
    /// No passphrase yields a disabled codec; a bad passphrase is an error.
    pub fn from_passphrase(
        passphrase: Option<&str>,
        salt: &EncryptionSalt,
    ) -> Result<Self, CryptoError> {
        match passphrase {
            Some(passphrase) => Ok(Self::new(Encryptor::new(passphrase, salt)?)),
            None => {
                tracing::warn!(
                    "No encryption passphrase configured, sensitive writes will be refused"
                );
                Ok(Self::disabled())
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.encryptor.is_some()
    }

    /// Encrypt a value for storage.
    pub fn encrypt_sensitive(&self, value: &str) -> StoreResult<String> {
        if value.is_empty() {
            return Ok(String::new());
        }

        let encryptor = self
            .encryptor
            .as_ref()
            .ok_or(StoreError::EncryptionUnavailable)?;
        let envelope = encryptor.encrypt(value.as_bytes())?;

        let mut stored = String::with_capacity(CIPHERTEXT_MARKER.len() + envelope.len() * 4 / 3 + 4);
        stored.push_str(CIPHERTEXT_MARKER);
        stored.push_str(&Base64::encode_string(&envelope));
        Ok(stored)
    }

    /// Encrypt an optional value; `None` stays `None`.
    pub fn encrypt_optional(&self, value: Option<&str>) -> StoreResult<Option<String>> {
        value.map(|v| self.encrypt_sensitive(v)).transpose()
    }

    /// Decrypt a stored value for display.
    ///
    /// Never fails: an unreadable tagged value becomes the empty string, so a
    /// single corrupt field cannot break a whole list response.
    pub fn decrypt_sensitive(&self, stored: &str) -> String {
        match self.try_decrypt_sensitive(stored) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "Sensitive field unreadable, returning empty value");
                String::new()
            }
        }
    }

    /// Strict variant of [`SensitiveCodec::decrypt_sensitive`].
    ///
    /// # Errors
    /// - [`StoreError::EncryptionUnavailable`] for tagged input without an encryptor
    /// - [`StoreError::DecryptionFailed`] when a tagged envelope cannot be opened
    pub fn try_decrypt_sensitive(&self, stored: &str) -> StoreResult<String> {
        if stored.is_empty() {
            return Ok(String::new());
        }

        if let Some(encoded) = stored.strip_prefix(CIPHERTEXT_MARKER) {
            let encryptor = self
                .encryptor
                .as_ref()
                .ok_or(StoreError::EncryptionUnavailable)?;
            let envelope = Base64::decode_vec(encoded).map_err(|_| StoreError::DecryptionFailed)?;
            let plaintext = encryptor
                .decrypt(&envelope)
                .map_err(|_| StoreError::DecryptionFailed)?;
            return String::from_utf8(plaintext).map_err(|_| StoreError::DecryptionFailed);
        }

        let Some(encryptor) = self.encryptor.as_ref() else {
            return Ok(stored.to_string());
        };

        match decode_candidate_envelope(stored) {
            Some(envelope) => match encryptor.decrypt(&envelope) {
                Ok(plaintext) => match String::from_utf8(plaintext) {
                    Ok(value) => Ok(value),
                    Err(_) => Ok(stored.to_string()),
                },
                Err(_) => Ok(stored.to_string()),
            },
            None => Ok(stored.to_string()),
        }
    }

    /// Whether an untagged value is structurally able to be an envelope.
    pub fn looks_like_ciphertext(value: &str) -> bool {
        decode_candidate_envelope(value).is_some()
    }

    /// Whether a stored value carries the ciphertext marker.
    pub fn is_tagged(stored: &str) -> bool {
        stored.starts_with(CIPHERTEXT_MARKER)
    }
}

fn decode_candidate_envelope(value: &str) -> Option<Vec<u8>> {
    if value.len() < MIN_UNTAGGED_CIPHERTEXT_LEN || value.len() % 4 != 0 {
        return None;
    }
    let bytes = Base64::decode_vec(value).ok()?;
    (bytes.len() >= MIN_ENVELOPE_LEN).then_some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncryptionSalt;

    fn codec() -> SensitiveCodec {
        let salt = EncryptionSalt::from_bytes(vec![3u8; 32]).unwrap();
        SensitiveCodec::new(Encryptor::new("codec test passphrase", &salt).unwrap())
    }

    #[test]
    fn threshold_matches_envelope_overhead() {
        assert_eq!(MIN_ENVELOPE_LEN, 29);
        assert_eq!(MIN_UNTAGGED_CIPHERTEXT_LEN, 40);
    }

    #[test]
    fn round_trip_is_tagged() {
        let codec = codec();
        let stored = codec.encrypt_sensitive("Pix key").unwrap();
        assert!(SensitiveCodec::is_tagged(&stored));
        assert!(!stored.contains("Pix key"));
        assert_eq!(codec.decrypt_sensitive(&stored), "Pix key");
    }

    #[test]
    fn empty_passes_through() {
        let codec = codec();
        assert_eq!(codec.encrypt_sensitive("").unwrap(), "");
        assert_eq!(codec.decrypt_sensitive(""), "");
        assert_eq!(SensitiveCodec::disabled().encrypt_sensitive("").unwrap(), "");
    }

    #[test]
    fn disabled_codec_fails_closed() {
        let codec = SensitiveCodec::disabled();
        let err = codec.encrypt_sensitive("my secret").unwrap_err();
        assert!(matches!(err, StoreError::EncryptionUnavailable));
        assert!(codec.encrypt_optional(Some("x")).is_err());
        assert_eq!(codec.encrypt_optional(None).unwrap(), None);
    }

    #[test]
    fn disabled_codec_reads_legacy_plaintext() {
        let codec = SensitiveCodec::disabled();
        assert_eq!(codec.decrypt_sensitive("plain note"), "plain note");
        let tagged = self::codec().encrypt_sensitive("secret").unwrap();
        assert!(matches!(
            codec.try_decrypt_sensitive(&tagged),
            Err(StoreError::EncryptionUnavailable)
        ));
        assert_eq!(codec.decrypt_sensitive(&tagged), "");
    }

    #[test]
    fn legacy_plaintext_returned_unchanged() {
        let codec = codec();
        let just_below = "a".repeat(MIN_UNTAGGED_CIPHERTEXT_LEN - 1);
        let samples = [
            "1234",
            "My bank password is in the blue folder",
            "Chave Pix: joao@example.com",
            "https://example.com/reset?token=abc",
            "ÇÃO acentuação",
            just_below.as_str(),
        ];
        for sample in samples {
            assert_eq!(codec.decrypt_sensitive(sample), sample);
        }
    }

    #[test]
    fn base64_shaped_plaintext_survives_false_positive() {
        let codec = codec();
        // 48 chars of canonical base64 decoding to 35 bytes: passes every
        // structural check, fails AEAD, must come back untouched.
        let tricky = "VGhpcyBpcyBqdXN0IGEgbm90ZSB0aGF0IGxvb2tzIGxpa2U=";
        assert!(SensitiveCodec::looks_like_ciphertext(tricky));
        assert_eq!(codec.decrypt_sensitive(tricky), tricky);
    }

    #[test]
    fn untagged_envelope_from_earlier_deployment_decrypts() {
        let codec = codec();
        let tagged = codec.encrypt_sensitive("legacy ciphertext").unwrap();
        let untagged = tagged.trim_start_matches(CIPHERTEXT_MARKER);
        assert!(SensitiveCodec::looks_like_ciphertext(untagged));
        assert_eq!(codec.decrypt_sensitive(untagged), "legacy ciphertext");
    }

    #[test]
    fn shortest_envelope_passes_structural_check() {
        let codec = codec();
        let tagged = codec.encrypt_sensitive("x").unwrap();
        let untagged = tagged.trim_start_matches(CIPHERTEXT_MARKER);
        assert_eq!(untagged.len(), MIN_UNTAGGED_CIPHERTEXT_LEN);
        assert!(SensitiveCodec::looks_like_ciphertext(untagged));
    }

    #[test]
    fn corrupt_tagged_value_becomes_empty() {
        let codec = codec();
        let stored = codec.encrypt_sensitive("content").unwrap();
        let mut envelope = Base64::decode_vec(&stored[CIPHERTEXT_MARKER.len()..]).unwrap();
        envelope[20] ^= 0xFF;
        let tampered = format!("{CIPHERTEXT_MARKER}{}", Base64::encode_string(&envelope));
        assert_eq!(codec.decrypt_sensitive(&tampered), "");
        assert!(matches!(
            codec.try_decrypt_sensitive(&tampered),
            Err(StoreError::DecryptionFailed)
        ));
        assert_eq!(codec.decrypt_sensitive("enc:v1:!!not-base64!!"), "");
        assert!(matches!(
            codec.try_decrypt_sensitive("enc:v1:!!not-base64!!"),
            Err(StoreError::DecryptionFailed)
        ));
    }

    #[test]
    fn value_from_other_key_is_never_shown_raw() {
        let other_salt = EncryptionSalt::from_bytes(vec![4u8; 32]).unwrap();
        let other = SensitiveCodec::new(Encryptor::new("codec test passphrase", &other_salt).unwrap());
        let stored = other.encrypt_sensitive("foreign").unwrap();
        assert_eq!(codec().decrypt_sensitive(&stored), "");
    }
}
