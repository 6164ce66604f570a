//! Encryption layer for settingsync.
//!
//! Provides zero-knowledge protection for synced setting values using:
//! - ChaCha20-Poly1305 for authenticated encryption with caller-supplied AAD
//! - Argon2id for deriving a key-encryption key from a recovery code
//! - Secure key handling with zeroization
//!
//! # Architecture
//!
//! The encryption uses a two-tier key system:
//!
//! 1. **Data Encryption Key (DEK)**: A random 256-bit key that encrypts every
//!    setting value. It lives only in the device's secure credential store.
//!
//! 2. **Key Encryption Key (KEK)**: Derived from the user's recovery code with
//!    Argon2id. It is never stored; it only wraps the DEK before the wrapped
//!    blob is handed to the relay, and unwraps it again on a new device.
//!
//! Every value ciphertext is bound to its semantic context through AAD, so a
//! ciphertext copied onto a different key or plugin fails authentication.

mod cipher;
mod error;
mod key;
pub mod recovery;

pub use cipher::{open, seal, unwrap_key, wrap_key, SealedValue, NONCE_SIZE, TAG_SIZE};
pub use error::{CryptoError, CryptoResult};
pub use key::{derive_kek, DataKey, KdfParams, KDF_ALG_ARGON2ID, KEY_SIZE, SALT_SIZE};
pub use recovery::{format_recovery_code, generate_recovery_code, normalize_recovery_code};
