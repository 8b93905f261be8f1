use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

use std::fmt;
use std::str::FromStr;

/// Width in bytes of every digest produced by a [`HashProvider`]
pub const DIGEST_LEN: usize = 32;

/// Width in hex characters of an encoded digest
pub const DIGEST_HEX_LEN: usize = DIGEST_LEN * 2;

/// Block size used by the HMAC construction (both backends use 64-byte blocks)
const HMAC_BLOCK_LEN: usize = 64;

/// Length of a freshly generated ledger secret
const SECRET_LEN: usize = 32;

/// A fixed-width digest
pub type Digest = [u8; DIGEST_LEN];

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid secret: {0}")]
    InvalidSecret(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),
}

/// A one-way digest function used for block hashing and tag derivation.
///
/// Implementations must be deterministic and side-effect free. The ledger
/// receives its provider by injection and never inspects which backend it got.
pub trait HashProvider: fmt::Debug + Send + Sync {
    /// Short identifier of the backend, used in logs and exports
    fn name(&self) -> &'static str;

    /// Digests `data` into a fixed-width value
    fn digest(&self, data: &[u8]) -> Digest;

    /// Digests `data` and returns the lowercase hex encoding
    fn digest_hex(&self, data: &[u8]) -> String {
        hex::encode(self.digest(data))
    }
}

/// SHA-256 backend
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Provider;

impl HashProvider for Sha256Provider {
    fn name(&self) -> &'static str {
        "sha256"
    }

    fn digest(&self, data: &[u8]) -> Digest {
        let mut hasher = Sha256::new();
        hasher.update(data);

        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&hasher.finalize());
        digest
    }
}

/// BLAKE3 backend
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Provider;

impl HashProvider for Blake3Provider {
    fn name(&self) -> &'static str {
        "blake3"
    }

    fn digest(&self, data: &[u8]) -> Digest {
        *blake3::hash(data).as_bytes()
    }
}

/// Computes an HMAC-style authentication tag (RFC 2104) over `message`
/// keyed by `key`, using whichever provider is injected.
///
/// With [`Sha256Provider`] the result is exactly HMAC-SHA256.
pub fn hmac_tag(provider: &dyn HashProvider, key: &[u8], message: &[u8]) -> String {
    let mut block_key = [0u8; HMAC_BLOCK_LEN];
    if key.len() > HMAC_BLOCK_LEN {
        block_key[..DIGEST_LEN].copy_from_slice(&provider.digest(key));
    } else {
        block_key[..key.len()].copy_from_slice(key);
    }

    let mut inner = Vec::with_capacity(HMAC_BLOCK_LEN + message.len());
    inner.extend(block_key.iter().map(|b| b ^ 0x36));
    inner.extend_from_slice(message);
    let inner_digest = provider.digest(&inner);

    let mut outer = Vec::with_capacity(HMAC_BLOCK_LEN + DIGEST_LEN);
    outer.extend(block_key.iter().map(|b| b ^ 0x5c));
    outer.extend_from_slice(&inner_digest);

    provider.digest_hex(&outer)
}

/// Checks `tag` against a freshly computed tag without short-circuiting
/// on the first differing byte
pub fn verify_tag(provider: &dyn HashProvider, key: &[u8], message: &[u8], tag: &str) -> bool {
    let expected = hmac_tag(provider, key, message);
    if expected.len() != tag.len() {
        return false;
    }

    expected
        .bytes()
        .zip(tag.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// An opaque account identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Address(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Address {
    fn from(address: &str) -> Self {
        Address(address.to_string())
    }
}

impl FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(CryptoError::InvalidAddress("address is empty".to_string()));
        }

        Ok(Address(trimmed.to_string()))
    }
}

/// Authentication state of a block or transaction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "tag", rename_all = "snake_case")]
pub enum Signature {
    #[default]
    Unsigned,
    Signed(String),
}

impl Signature {
    pub fn is_signed(&self) -> bool {
        matches!(self, Signature::Signed(_))
    }

    pub fn tag(&self) -> Option<&str> {
        match self {
            Signature::Signed(tag) => Some(tag),
            Signature::Unsigned => None,
        }
    }
}

/// Symmetric keying material owned by a ledger
#[derive(Clone)]
pub struct LedgerSecret(Vec<u8>);

impl LedgerSecret {
    /// Generates a random secret from the OS RNG
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut bytes);
        LedgerSecret(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.is_empty() {
            return Err(CryptoError::InvalidSecret("secret is empty".to_string()));
        }

        Ok(LedgerSecret(bytes.to_vec()))
    }

    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| CryptoError::DecodingError(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

// Never print keying material.
impl fmt::Debug for LedgerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LedgerSecret").field(&"<redacted>").finish()
    }
}
