//! Database key derivation
//!
//! The database key is a pure function of the recovery phrase: PBKDF2-HMAC-SHA256
//! over the space-joined words with a fixed application salt. None of the
//! parameters below may ever change, or stores encrypted by earlier builds
//! become unopenable.

use crate::phrase::RecoveryPhrase;
use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::Sha256;
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

/// PBKDF2 iteration count
pub const KDF_ITERATIONS: u32 = 100_000;

/// Derived key length in bytes (256 bits)
pub const KEY_LENGTH: usize = 32;

/// Fixed, non-secret application salt
pub const KDF_SALT: &[u8] = b"TaskAppEncryption";

/// Symmetric key for the encrypted database
#[derive(Clone, PartialEq, Eq)]
pub struct DerivedKey(Zeroizing<[u8; KEY_LENGTH]>);

impl DerivedKey {
    /// Derive the database key from a recovery phrase.
    ///
    /// Word order matters: the password is the words joined by single spaces.
    pub fn derive(phrase: &RecoveryPhrase) -> Self {
        let password = Zeroizing::new(phrase.joined(" "));
        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), KDF_SALT, KDF_ITERATIONS, &mut *key);
        Self(key)
    }

    /// Create from raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Create from raw key bytes slice
    pub fn from_bytes_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_LENGTH {
            return Err(Error::Encryption("Invalid key length".to_string()));
        }
        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    /// Decode a key persisted with [`DerivedKey::to_base64`]
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| Error::Encryption(format!("Invalid stored key encoding: {}", e)))?,
        );
        Self::from_bytes_slice(&bytes)
    }

    /// Encode for the secret store
    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(STANDARD.encode(&self.0[..]))
    }

    /// Get key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// SQLCipher raw-key literal (`x'<hex>'`), bypassing SQLCipher's own KDF
    pub(crate) fn sqlcipher_literal(&self) -> Zeroizing<String> {
        let hex = Zeroizing::new(hex::encode(&self.0[..]));
        Zeroizing::new(format!("x'{}'", hex.as_str()))
    }
}

impl Zeroize for DerivedKey {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey([REDACTED])")
    }
}
