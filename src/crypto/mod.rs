//! Content cryptography
//!
//! - Key derivation: Argon2id, once per session
//! - Content transform: AES-256-CTR over the whole file stream
//!
//! There is no authentication tag. The transform provides confidentiality
//! only, and any byte can be decoded once the prefix before it is decoded.

pub mod kdf;
mod stream;

pub use kdf::{derive_key, DerivedKey, DEFAULT_SALT};
pub use stream::AesCtrCipher;

use crate::error::Result;
use std::io::{Read, Write};

/// Size of the content key in bytes (AES-256)
pub const KEY_SIZE: usize = 32;

/// Size of the Argon2 salt in bytes
pub const SALT_SIZE: usize = 16;

/// Size of the per-file CTR nonce in bytes
pub const NONCE_SIZE: usize = 16;

/// Magic bytes opening every encoded stream
pub const MAGIC: &[u8; 4] = b"MCR1";

/// Bytes an encoded stream carries in front of the ciphertext
pub const HEADER_SIZE: usize = MAGIC.len() + NONCE_SIZE;

/// Direction of a content transform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Plaintext in, stored ciphertext out
    Encode,
    /// Stored ciphertext in, plaintext out
    Decode,
    /// Identity copy, used for unencrypted files
    Pass,
}

/// Stream transform applied to whole-file content
///
/// Implementations must satisfy `decode(encode(x)) == x` and must report
/// malformed input as [`crate::Error::Cipher`], keeping I/O failures of the
/// underlying streams as [`crate::Error::Io`].
pub trait Cipher: Send + Sync {
    /// Transform everything readable from `input` into `output`
    fn transform(
        &self,
        input: &mut dyn Read,
        output: &mut dyn Write,
        direction: Direction,
    ) -> Result<()>;

    /// Plaintext length of a stored encoded stream of `stored_len` bytes
    fn decoded_len(&self, stored_len: u64) -> u64;
}
