//! AES-256-CTR content transform
//!
//! Encoded layout: `MAGIC || nonce || AES-256-CTR(key, nonce, plaintext)`.
//! A fresh nonce is drawn for every encode, so re-encrypting a file after
//! an edit never reuses keystream. An empty stored stream decodes to empty
//! plaintext.

use super::{Cipher, Direction, HEADER_SIZE, KEY_SIZE, MAGIC, NONCE_SIZE};
use crate::config::EncryptionConfig;
use crate::error::{Error, Result};
use aes::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use std::io::{ErrorKind, Read, Write};
use zeroize::Zeroizing;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Streaming buffer size
const CHUNK_SIZE: usize = 64 * 1024;

/// Whole-stream AES-256-CTR cipher keyed once per session
pub struct AesCtrCipher {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl AesCtrCipher {
    /// Create a cipher from raw key material
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    /// Derive the key from a passphrase and build the cipher
    pub fn from_passphrase(passphrase: &str, config: &EncryptionConfig) -> Result<Self> {
        let derived = super::derive_key(passphrase.as_bytes(), config)?;
        Ok(Self::new(*derived.key()))
    }

    fn keystream(&self, nonce: &[u8; NONCE_SIZE]) -> Aes256Ctr {
        let key: &[u8; KEY_SIZE] = &self.key;
        Aes256Ctr::new(key.into(), nonce.into())
    }

    fn encode(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<()> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        output.write_all(MAGIC)?;
        output.write_all(&nonce)?;

        let mut cipher = self.keystream(&nonce);
        pump(input, output, |chunk| cipher.apply_keystream(chunk))
    }

    fn decode(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<()> {
        let mut header = [0u8; HEADER_SIZE];
        let filled = read_full(input, &mut header)?;

        if filled == 0 {
            output.flush()?;
            return Ok(());
        }
        if filled < HEADER_SIZE {
            return Err(Error::Cipher(format!(
                "Truncated header: {} of {} bytes",
                filled, HEADER_SIZE
            )));
        }
        if &header[..MAGIC.len()] != MAGIC {
            return Err(Error::Cipher("Unrecognized stream header".to_string()));
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&header[MAGIC.len()..]);

        let mut cipher = self.keystream(&nonce);
        pump(input, output, |chunk| cipher.apply_keystream(chunk))
    }
}

impl Cipher for AesCtrCipher {
    fn transform(
        &self,
        input: &mut dyn Read,
        output: &mut dyn Write,
        direction: Direction,
    ) -> Result<()> {
        match direction {
            Direction::Encode => self.encode(input, output),
            Direction::Decode => self.decode(input, output),
            Direction::Pass => pump(input, output, |_| {}),
        }
    }

    fn decoded_len(&self, stored_len: u64) -> u64 {
        stored_len.saturating_sub(HEADER_SIZE as u64)
    }
}

/// Copy `input` to `output`, letting `apply` rewrite each chunk in place
fn pump(
    input: &mut dyn Read,
    output: &mut dyn Write,
    mut apply: impl FnMut(&mut [u8]),
) -> Result<()> {
    let mut buf = Zeroizing::new(vec![0u8; CHUNK_SIZE]);
    loop {
        let n = match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        apply(&mut buf[..n]);
        output.write_all(&buf[..n])?;
    }
    output.flush()?;
    Ok(())
}

/// Fill `buf` unless the stream ends first; returns the bytes read
fn read_full(input: &mut dyn Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn cipher() -> AesCtrCipher {
        AesCtrCipher::new([0x42; KEY_SIZE])
    }

    fn run(cipher: &AesCtrCipher, data: &[u8], direction: Direction) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        cipher.transform(&mut Cursor::new(data), &mut out, direction)?;
        Ok(out)
    }

    #[test]
    fn test_encode_layout() {
        let encoded = run(&cipher(), b"hello", Direction::Encode).unwrap();
        assert_eq!(encoded.len(), HEADER_SIZE + 5);
        assert_eq!(&encoded[..4], MAGIC);
        assert_ne!(&encoded[HEADER_SIZE..], b"hello");
        assert_eq!(cipher().decoded_len(encoded.len() as u64), 5);
    }

    #[test]
    fn test_fresh_nonce_per_encode() {
        let c = cipher();
        let a = run(&c, b"same plaintext", Direction::Encode).unwrap();
        let b = run(&c, b"same plaintext", Direction::Encode).unwrap();
        assert_ne!(a, b);
        assert_eq!(run(&c, &a, Direction::Decode).unwrap(), b"same plaintext");
        assert_eq!(run(&c, &b, Direction::Decode).unwrap(), b"same plaintext");
    }

    #[test]
    fn test_pass_is_identity() {
        let data = b"\x00\x01plain bytes\xff";
        assert_eq!(run(&cipher(), data, Direction::Pass).unwrap(), data);
    }

    #[test]
    fn test_empty_stream_decodes_to_empty() {
        assert!(run(&cipher(), b"", Direction::Decode).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_header_is_cipher_error() {
        let result = run(&cipher(), b"MCR1abc", Direction::Decode);
        assert!(matches!(result, Err(Error::Cipher(_))));
    }

    #[test]
    fn test_foreign_header_is_cipher_error() {
        let result = run(&cipher(), &[0u8; 64], Direction::Decode);
        assert!(matches!(result, Err(Error::Cipher(_))));
    }

    #[test]
    fn test_wrong_key_does_not_recover_plaintext() {
        let encoded = run(&cipher(), b"top secret", Direction::Encode).unwrap();
        let other = AesCtrCipher::new([0x24; KEY_SIZE]);
        assert_ne!(run(&other, &encoded, Direction::Decode).unwrap(), b"top secret");
    }

    #[test]
    fn test_multi_chunk_stream() {
        let data: Vec<u8> = (0..(CHUNK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        let c = cipher();
        let encoded = run(&c, &data, Direction::Encode).unwrap();
        assert_eq!(run(&c, &encoded, Direction::Decode).unwrap(), data);
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let c = cipher();
            let encoded = run(&c, &data, Direction::Encode).unwrap();
            prop_assert_eq!(run(&c, &encoded, Direction::Decode).unwrap(), data);
        }
    }
}
