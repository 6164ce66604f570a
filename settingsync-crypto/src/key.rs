//! Key types and Argon2id key derivation.

use crate::error::{CryptoError, CryptoResult};
use crate::recovery::normalize_recovery_code;
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of every symmetric key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of a freshly generated KDF salt in bytes.
pub const SALT_SIZE: usize = 16;

/// The only KDF algorithm this crate accepts.
pub const KDF_ALG_ARGON2ID: &str = "argon2id";

/// A 256-bit symmetric key, used both as DEK and as KEK.
///
/// Zeroized on drop. `Debug` never prints the key bytes.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey([u8; KEY_SIZE]);

impl DataKey {
    /// Generates a random key from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Builds a key from a slice, rejecting anything that is not exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Standard base64 encoding, the at-rest form inside the credential store.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> CryptoResult<Self> {
        let mut raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::Encoding(format!("key is not valid base64: {e}")))?;
        let key = Self::from_slice(&raw);
        raw.zeroize();
        key
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataKey(<redacted>)")
    }
}

impl PartialEq for DataKey {
    fn eq(&self, other: &Self) -> bool {
        // Constant-time comparison; keys are only compared in tests and restore checks.
        self.0
            .iter()
            .zip(other.0.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl Eq for DataKey {}

/// Argon2id parameters, serialized with the relay's field names.
///
/// Generated fresh (with a new salt) every time a DEK is wrapped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub alg: String,
    /// Argon2 version number (19 = 0x13).
    pub version: u32,
    /// Base64-encoded salt.
    #[serde(default)]
    pub salt: String,
    #[serde(rename = "iter")]
    pub iterations: u32,
    #[serde(rename = "mem_kib")]
    pub memory_kib: u32,
    pub parallelism: u32,
    pub hash_len: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            alg: KDF_ALG_ARGON2ID.to_string(),
            version: 19,
            salt: String::new(),
            iterations: 3,
            memory_kib: 65536,
            parallelism: 2,
            hash_len: KEY_SIZE as u32,
        }
    }
}

impl KdfParams {
    /// Returns a copy of these parameters carrying a fresh random salt.
    pub fn with_random_salt(&self) -> Self {
        let mut salt = [0u8; SALT_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        Self {
            salt: STANDARD.encode(salt),
            ..self.clone()
        }
    }

    /// Decodes the base64 salt.
    pub fn salt_bytes(&self) -> CryptoResult<Vec<u8>> {
        STANDARD
            .decode(self.salt.trim())
            .map_err(|e| CryptoError::Encoding(format!("invalid kdf salt: {e}")))
    }

    fn argon2_version(&self) -> CryptoResult<Version> {
        match self.version {
            0x13 => Ok(Version::V0x13),
            0x10 => Ok(Version::V0x10),
            other => Err(CryptoError::UnsupportedKdf(format!(
                "argon2 version {other}"
            ))),
        }
    }
}

/// Derives a key-encryption key from a recovery code.
///
/// The code is normalized first, so grouped (`ABCD-EFGH`) and raw
/// (`abcdefgh`) spellings derive the same key.
pub fn derive_kek(recovery_code: &str, params: &KdfParams) -> CryptoResult<DataKey> {
    if !params.alg.eq_ignore_ascii_case(KDF_ALG_ARGON2ID) {
        return Err(CryptoError::UnsupportedKdf(params.alg.clone()));
    }
    if params.hash_len as usize != KEY_SIZE {
        return Err(CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: params.hash_len as usize,
        });
    }

    let mut code = normalize_recovery_code(recovery_code);
    if code.is_empty() {
        return Err(CryptoError::EmptyRecoveryCode);
    }

    let salt = params.salt_bytes()?;
    let argon_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, params.argon2_version()?, argon_params);

    let mut out = [0u8; KEY_SIZE];
    let result = argon2.hash_password_into(code.as_bytes(), &salt, &mut out);
    code.zeroize();
    result.map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let key = DataKey::from_bytes(out);
    out.zeroize();
    Ok(key)
}
