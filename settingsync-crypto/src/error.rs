//! Crypto error types.

use thiserror::Error;

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors that can occur in encryption, decryption, and key handling.
///
/// Messages never include key bytes, recovery codes, or plaintext.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("authentication failed (wrong key, wrong context, or tampered data)")]
    AuthenticationFailed,

    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("unsupported kdf: {0}")]
    UnsupportedKdf(String),

    #[error("invalid encoding: {0}")]
    Encoding(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("recovery code is empty")]
    EmptyRecoveryCode,
}
