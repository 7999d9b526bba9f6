//! Key hashing strategies used to place keys on the ring.
//!
//! The ring lives in a 32 bit hash space: a key's ring position is the first four bytes (big
//! endian) of the configured digest of the key bytes.
use std::fmt;
use std::str::FromStr;

use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::{ClientError, Result};

/// A named strategy for mapping a key to a position on the ring.
pub trait KeyHasher: Send + Sync + 'static {
    /// the name of this strategy, as used in configuration
    fn name(&self) -> &str;

    /// computes the ring position of `key`
    fn hash(&self, key: &[u8]) -> u64;
}

/// The built-in hash algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-1, the cluster's default
    Sha1,
    /// SHA-256
    Sha256,
}

impl KeyHasher for HashAlgorithm {
    fn name(&self) -> &str {
        match self {
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
        }
    }

    fn hash(&self, key: &[u8]) -> u64 {
        match self {
            HashAlgorithm::Sha1 => leading_u32(&Sha1::digest(key)),
            HashAlgorithm::Sha256 => leading_u32(&Sha256::digest(key)),
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" | "sha-1" => Ok(HashAlgorithm::Sha1),
            "sha256" | "sha-256" => Ok(HashAlgorithm::Sha256),
            other => Err(ClientError::Config(format!("unknown hash algorithm {:?}", other))),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn leading_u32(digest: &[u8]) -> u64 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&digest[..4]);
    u64::from(u32::from_be_bytes(buf))
}
