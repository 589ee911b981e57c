//! Key Derivation Functions using Argon2id
//!
//! The passphrase given on the command line is stretched once per mount
//! into the AES content key. The salt is fixed per configuration so the
//! same passphrase always yields the same key.

use crate::config::EncryptionConfig;
use crate::crypto::{KEY_SIZE, SALT_SIZE};
use crate::error::{Error, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use zeroize::Zeroizing;

/// Application salt used when the configuration does not provide one
pub const DEFAULT_SALT: &[u8; SALT_SIZE] = b"mirrorcrypt-salt";

/// Derived key with associated salt
#[derive(Clone)]
pub struct DerivedKey {
    /// The derived key material (zeroized on drop)
    key: Zeroizing<[u8; KEY_SIZE]>,
    /// Salt used for derivation
    salt: [u8; SALT_SIZE],
}

impl DerivedKey {
    /// Get the key bytes
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Get the salt
    pub fn salt(&self) -> &[u8; SALT_SIZE] {
        &self.salt
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("key", &"<redacted>")
            .field("salt", &hex::encode(self.salt))
            .finish()
    }
}

/// Derive a key from a passphrase using Argon2id
///
/// # Arguments
/// * `password` - The passphrase to derive from
/// * `config` - Argon2 parameters and optional salt
pub fn derive_key(password: &[u8], config: &EncryptionConfig) -> Result<DerivedKey> {
    if password.is_empty() {
        return Err(Error::KeyDerivation("Passphrase must not be empty".to_string()));
    }

    let mut salt_bytes = [0u8; SALT_SIZE];
    match config.salt.len() {
        0 => salt_bytes.copy_from_slice(DEFAULT_SALT),
        SALT_SIZE => salt_bytes.copy_from_slice(&config.salt),
        n => {
            return Err(Error::KeyDerivation(format!(
                "Salt must be {} bytes, got {}",
                SALT_SIZE, n
            )));
        }
    }

    let params = Params::new(
        config.argon2_memory_kib,
        config.argon2_iterations,
        config.argon2_parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| Error::KeyDerivation(format!("Invalid Argon2 parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key_bytes = Zeroizing::new([0u8; KEY_SIZE]);
    argon2
        .hash_password_into(password, &salt_bytes, key_bytes.as_mut())
        .map_err(|e| Error::KeyDerivation(format!("Key derivation failed: {}", e)))?;

    Ok(DerivedKey {
        key: key_bytes,
        salt: salt_bytes,
    })
}
