//! Per-mount session context
//!
//! Built once by the mount controller and shared read-only by every
//! filesystem call. Nothing in the crate reaches for session state any
//! other way.

use crate::config::EncryptionConfig;
use crate::crypto::{AesCtrCipher, Cipher};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Mirror root and content cipher for one mount
pub struct SessionContext {
    root: PathBuf,
    cipher: Box<dyn Cipher>,
}

impl SessionContext {
    /// Build a session from the mirror directory and the passphrase
    pub fn new(root: &Path, passphrase: &str, config: &EncryptionConfig) -> Result<Self> {
        if passphrase.is_empty() {
            return Err(Error::InvalidArgument(
                "Encryption key must not be empty".to_string(),
            ));
        }
        // Key derivation is slow; validate the directory first.
        let root = canonical_root(root)?;
        let cipher = AesCtrCipher::from_passphrase(passphrase, config)?;
        Ok(Self {
            root,
            cipher: Box::new(cipher),
        })
    }

    /// Build a session around an already keyed cipher
    pub fn with_cipher(root: &Path, cipher: Box<dyn Cipher>) -> Result<Self> {
        Ok(Self {
            root: canonical_root(root)?,
            cipher,
        })
    }

    /// Absolute, canonical mirror directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cipher(&self) -> &dyn Cipher {
        self.cipher.as_ref()
    }
}

fn canonical_root(root: &Path) -> Result<PathBuf> {
    let canonical = root
        .canonicalize()
        .map_err(|_| Error::PathNotFound(root.display().to_string()))?;
    if !canonical.is_dir() {
        return Err(Error::InvalidArgument(format!(
            "Mirror directory is not a directory: {}",
            canonical.display()
        )));
    }
    Ok(canonical)
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}
