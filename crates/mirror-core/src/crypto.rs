//! Content identity and the per-file stream cipher.
//!
//! Every blob is encrypted with its own random 256-bit key using AES-256 in
//! counter mode, starting from an all-zero counter block. A key encrypts
//! exactly one plaintext for its whole life; that is the only thing that
//! makes the fixed IV sound, so keys must never be reused or derived.

use std::fmt;
use std::io::{self, Read, Write};

use aes::Aes256;
use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::TryRngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of a file key in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// Length of a hex-encoded SHA-256 identity.
pub const IDENTITY_LEN: usize = 64;

const ZERO_IV: [u8; 16] = [0u8; 16];
const BUFFER_LEN: usize = 8192;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// base64url. Padded on encode; clients that strip `=` still decode.
const KEY_ENCODING: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Entropy source failure: {0}")]
    Entropy(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Content-and-name fingerprint of a tracked file.
///
/// Names both the Store entry and the blob on disk, so it is always 64
/// lowercase hex characters and can be joined onto a directory safely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(String);

impl Identity {
    /// SHA-256 over `name` followed by the full content stream.
    pub fn compute(name: &str, mut content: impl Read) -> Result<Self> {
        let mut hasher = IdentityHasher::new(name);
        io::copy(&mut content, &mut hasher)?;
        Ok(hasher.finish())
    }

    /// Accept only a well-formed identity string.
    pub fn parse(s: &str) -> Result<Self> {
        let well_formed = s.len() == IDENTITY_LEN
            && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if well_formed {
            Ok(Self(s.to_string()))
        } else {
            Err(CryptoError::InvalidIdentity(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incremental identity computation, for callers that see the content in
/// pieces (e.g. while encrypting it).
pub struct IdentityHasher(Sha256);

impl IdentityHasher {
    pub fn new(name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        Self(hasher)
    }

    pub fn update(&mut self, content: &[u8]) {
        self.0.update(content);
    }

    pub fn finish(self) -> Identity {
        Identity(hex::encode(self.0.finalize()))
    }
}

impl Write for IdentityHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A 256-bit symmetric key. Wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct FileKey([u8; KEY_LEN]);

impl FileKey {
    /// Draw a fresh key from the OS entropy source.
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; KEY_LEN];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CryptoError::Entropy(e.to_string()))?;
        Ok(Self(bytes))
    }

    #[cfg(test)]
    pub(crate) fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Decode a base64url key as handed out by the list endpoint.
    pub fn decode(encoded: &str) -> Result<Self> {
        let mut decoded = KEY_ENCODING
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        let key = <[u8; KEY_LEN]>::try_from(decoded.as_slice())
            .map(Self)
            .map_err(|_| {
                CryptoError::InvalidKey(format!(
                    "expected {} bytes, got {}",
                    KEY_LEN,
                    decoded.len()
                ))
            });
        decoded.zeroize();
        key
    }

    pub fn encode(&self) -> String {
        KEY_ENCODING.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Start a keystream at counter zero.
    pub fn keystream(&self) -> Keystream {
        Keystream(Aes256Ctr::new(&self.0.into(), &ZERO_IV.into()))
    }
}

impl PartialEq for FileKey {
    fn eq(&self, other: &Self) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
    }
}

impl Eq for FileKey {}

impl fmt::Debug for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FileKey(<redacted>)")
    }
}

/// Incremental form of [`transform`] for chunked streams.
///
/// Feeding a stream through `apply` in arbitrary chunk sizes produces the
/// same bytes as a single `transform` over the whole stream.
pub struct Keystream(Aes256Ctr);

impl Keystream {
    pub fn apply(&mut self, buf: &mut [u8]) {
        self.0.apply_keystream(buf);
    }
}

/// Encrypt or decrypt `reader` into `writer`. Returns the number of bytes
/// processed. The operation is its own inverse under the same key.
pub fn transform<R: Read, W: Write>(key: &FileKey, mut reader: R, mut writer: W) -> Result<u64> {
    let mut stream = key.keystream();
    let mut buffer = [0u8; BUFFER_LEN];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        stream.apply(&mut buffer[..n]);
        writer.write_all(&buffer[..n])?;
        total += n as u64;
    }

    writer.flush()?;
    buffer.zeroize();
    Ok(total)
}
