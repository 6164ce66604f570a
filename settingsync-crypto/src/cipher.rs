//! ChaCha20-Poly1305 sealing with associated data, plus DEK wrapping.

use crate::error::{CryptoError, CryptoResult};
use crate::key::{DataKey, KEY_SIZE};
use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use zeroize::Zeroize;

/// Nonce size for ChaCha20-Poly1305 (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Poly1305 authentication tag size.
pub const TAG_SIZE: usize = 16;

/// Output of [`seal`]: a fresh random nonce and the tagged ciphertext.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedValue {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

fn cipher_for(key: &DataKey) -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()))
}

/// Encrypts `plaintext` under `key`, binding `aad` into the tag.
///
/// A new random nonce is drawn on every call.
pub fn seal(key: &DataKey, plaintext: &[u8], aad: &[u8]) -> CryptoResult<SealedValue> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher_for(key)
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Encryption("aead seal failed".to_string()))?;

    Ok(SealedValue { nonce, ciphertext })
}

/// Decrypts a sealed value. `aad` must be byte-identical to what was sealed.
pub fn open(key: &DataKey, nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> CryptoResult<Vec<u8>> {
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::MalformedPayload(format!(
            "nonce must be {NONCE_SIZE} bytes, got {}",
            nonce.len()
        )));
    }
    if ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::MalformedPayload(
            "ciphertext shorter than authentication tag".to_string(),
        ));
    }

    cipher_for(key)
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Wraps a DEK under a KEK.
///
/// The result is `base64(nonce || ciphertext)`, the single-blob form the
/// relay stores as `encrypted_dek`.
pub fn wrap_key(kek: &DataKey, dek: &DataKey) -> CryptoResult<String> {
    let sealed = seal(kek, dek.as_bytes(), &[])?;
    let mut blob = Vec::with_capacity(NONCE_SIZE + sealed.ciphertext.len());
    blob.extend_from_slice(&sealed.nonce);
    blob.extend_from_slice(&sealed.ciphertext);
    Ok(STANDARD.encode(blob))
}

/// Reverses [`wrap_key`]. A wrong recovery code surfaces as `AuthenticationFailed`.
pub fn unwrap_key(kek: &DataKey, blob: &str) -> CryptoResult<DataKey> {
    let raw = STANDARD
        .decode(blob.trim())
        .map_err(|e| CryptoError::Encoding(format!("encrypted dek is not valid base64: {e}")))?;
    if raw.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::MalformedPayload(
            "encrypted dek payload too short".to_string(),
        ));
    }

    let (nonce, ciphertext) = raw.split_at(NONCE_SIZE);
    let mut plaintext = open(kek, nonce, ciphertext, &[])?;
    if plaintext.len() != KEY_SIZE {
        let actual = plaintext.len();
        plaintext.zeroize();
        return Err(CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual,
        });
    }
    let dek = DataKey::from_slice(&plaintext);
    plaintext.zeroize();
    dek
}
