//! AES-256-GCM sealing with detached tags
//!
//! Uses the ring library for hardware-accelerated AES-256-GCM. Every seal draws a
//! fresh 96-bit nonce from the system CSPRNG; the key manager rotates keys well
//! before random-nonce collision probability becomes meaningful.

use ring::aead::{Aad, LessSafeKey, Nonce, Tag, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};

use super::{CryptoError, KeyMaterial};

/// AES-GCM nonce length in bytes
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes
pub const TAG_LEN: usize = 16;

/// Output of a seal operation.
#[derive(Debug, Clone)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
}

// == Crypto Box ==
/// Authenticated encryption of byte payloads under versioned key material.
pub struct CryptoBox {
    rng: SystemRandom,
}

impl CryptoBox {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }

    fn aead_key(key: &KeyMaterial) -> Result<LessSafeKey, CryptoError> {
        let unbound = UnboundKey::new(&AES_256_GCM, key.secret())
            .map_err(|_| CryptoError::InvalidKey("AES-256-GCM key rejected".into()))?;
        Ok(LessSafeKey::new(unbound))
    }

    // == Seal ==
    /// Encrypts `plaintext` under `key`, authenticating `aad` alongside it.
    pub fn seal(
        &self,
        plaintext: &[u8],
        key: &KeyMaterial,
        aad: &[u8],
    ) -> Result<Sealed, CryptoError> {
        let aead_key = Self::aead_key(key)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CryptoError::RngFailure)?;

        let mut ciphertext = plaintext.to_vec();
        let tag: Tag = aead_key
            .seal_in_place_separate_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(aad),
                &mut ciphertext,
            )
            .map_err(|e| CryptoError::EncryptionFailed(format!("AES-GCM seal failed: {:?}", e)))?;

        let mut tag_bytes = [0u8; TAG_LEN];
        tag_bytes.copy_from_slice(tag.as_ref());

        Ok(Sealed {
            ciphertext,
            nonce: nonce_bytes,
            tag: tag_bytes,
        })
    }

    // == Open ==
    /// Decrypts and verifies a sealed payload.
    ///
    /// Any mismatch of ciphertext, nonce, tag, key or AAD yields
    /// `CryptoError::AuthenticationFailed`.
    pub fn open(
        &self,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_LEN],
        tag: &[u8; TAG_LEN],
        key: &KeyMaterial,
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let aead_key = Self::aead_key(key)?;

        // ring verifies the tag appended to the ciphertext
        let mut in_out = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        in_out.extend_from_slice(ciphertext);
        in_out.extend_from_slice(tag);

        let plaintext_len = aead_key
            .open_in_place(Nonce::assume_unique_for_key(*nonce), Aad::from(aad), &mut in_out)
            .map_err(|_| CryptoError::AuthenticationFailed)?
            .len();
        in_out.truncate(plaintext_len);

        Ok(in_out)
    }
}

impl Default for CryptoBox {
    fn default() -> Self {
        Self::new()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{derive_key, SALT_LEN};
    use std::num::NonZeroU32;

    fn key(salt_byte: u8) -> KeyMaterial {
        derive_key(
            b"unit test master secret",
            &[salt_byte; SALT_LEN],
            NonZeroU32::new(1).unwrap(),
            1,
        )
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let crypto = CryptoBox::new();
        let key = key(1);

        let sealed = crypto.seal(b"secret session", &key, b"aad").unwrap();
        assert_ne!(sealed.ciphertext.as_slice(), b"secret session");

        let plaintext = crypto
            .open(&sealed.ciphertext, &sealed.nonce, &sealed.tag, &key, b"aad")
            .unwrap();
        assert_eq!(plaintext, b"secret session");
    }

    #[test]
    fn test_empty_plaintext() {
        let crypto = CryptoBox::new();
        let key = key(1);

        let sealed = crypto.seal(b"", &key, b"").unwrap();
        assert!(sealed.ciphertext.is_empty());
        let plaintext = crypto
            .open(&sealed.ciphertext, &sealed.nonce, &sealed.tag, &key, b"")
            .unwrap();
        assert!(plaintext.is_empty());
    }

    #[test]
    fn test_nonces_differ_per_seal() {
        let crypto = CryptoBox::new();
        let key = key(1);

        let a = crypto.seal(b"same", &key, b"aad").unwrap();
        let b = crypto.seal(b"same", &key, b"aad").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_flipped_ciphertext_bit_fails() {
        let crypto = CryptoBox::new();
        let key = key(1);

        let mut sealed = crypto.seal(b"tamper me", &key, b"aad").unwrap();
        sealed.ciphertext[0] ^= 0x01;

        let result = crypto.open(&sealed.ciphertext, &sealed.nonce, &sealed.tag, &key, b"aad");
        assert_eq!(result.unwrap_err(), CryptoError::AuthenticationFailed);
    }

    #[test]
    fn test_flipped_tag_bit_fails() {
        let crypto = CryptoBox::new();
        let key = key(1);

        let mut sealed = crypto.seal(b"tamper me", &key, b"aad").unwrap();
        sealed.tag[TAG_LEN - 1] ^= 0x80;

        let result = crypto.open(&sealed.ciphertext, &sealed.nonce, &sealed.tag, &key, b"aad");
        assert_eq!(result.unwrap_err(), CryptoError::AuthenticationFailed);
    }

    #[test]
    fn test_wrong_key_fails() {
        let crypto = CryptoBox::new();
        let sealed = crypto.seal(b"payload", &key(1), b"aad").unwrap();

        let result = crypto.open(&sealed.ciphertext, &sealed.nonce, &sealed.tag, &key(2), b"aad");
        assert_eq!(result.unwrap_err(), CryptoError::AuthenticationFailed);
    }

    #[test]
    fn test_wrong_aad_fails() {
        let crypto = CryptoBox::new();
        let key = key(1);
        let sealed = crypto.seal(b"payload", &key, b"user:1").unwrap();

        let result = crypto.open(&sealed.ciphertext, &sealed.nonce, &sealed.tag, &key, b"user:2");
        assert_eq!(result.unwrap_err(), CryptoError::AuthenticationFailed);
    }
}
