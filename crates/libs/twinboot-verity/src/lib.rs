//! Integrity verification of slot images.
//!
//! Two layers are provided. A flat SHA-256 checksum catches transport corruption early
//! and cheaply. The block-level hash tree (dm-verity hash format version 1) yields the
//! root hash that identifies an image and that is later embedded into boot entries.
//!
//! ```rust
//! # use std::io::Cursor;
//! # use twinboot_verity::{compute_root_hash, verify};
//! #
//! let image = vec![0x5a; 10_000];
//!
//! let root_hash = compute_root_hash(&mut Cursor::new(&image)).unwrap();
//! assert!(verify(&mut Cursor::new(&image), &root_hash).unwrap());
//!
//! let mut tampered = image.clone();
//! tampered[4242] ^= 1;
//! assert!(!verify(&mut Cursor::new(&tampered), &root_hash).unwrap());
//! ```

use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;

pub mod checksum;
pub mod metadata;
pub mod tree;

#[cfg(feature = "serde")]
mod serde;

pub use checksum::{sha256_reader, verify_checksum, StreamHasher};
pub use metadata::VerityMetadata;
pub use tree::{IntegrityTreeBuilder, Sha256TreeBuilder, VerityParams, VerityTree};

/// Size of a SHA-256 digest in bytes.
pub const DIGEST_SIZE: usize = 32;

/// Errors of the integrity verifier.
#[derive(Debug, thiserror::Error)]
pub enum VerityError {
    #[error("unable to read image")]
    Io(#[from] io::Error),
    #[error("invalid verity parameters: {0}")]
    InvalidParams(&'static str),
    #[error("invalid integrity metadata: {0}")]
    InvalidMetadata(String),
    #[error("invalid hash digest: {0}")]
    InvalidDigest(#[from] InvalidDigestError),
}

pub type VerityResult<T> = Result<T, VerityError>;

/// Invalid textual representation of a digest.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidDigestError {
    #[error("digest is empty")]
    Empty,
    #[error("digest is not a hex string")]
    NotHex,
    #[error("digest has {0} bytes instead of 32")]
    InvalidSize(usize),
}

/// SHA-256 digest, used both for flat checksums and for tree root hashes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashDigest([u8; DIGEST_SIZE]);

impl HashDigest {
    /// Create a digest from raw bytes.
    pub const fn new(raw: [u8; DIGEST_SIZE]) -> Self {
        Self(raw)
    }

    /// Create a digest from a slice, checking its length.
    pub fn from_slice(raw: &[u8]) -> Result<Self, InvalidDigestError> {
        raw.try_into()
            .map(Self)
            .map_err(|_| InvalidDigestError::InvalidSize(raw.len()))
    }

    /// Raw digest bytes.
    pub fn raw(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    /// Lowercase hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for HashDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for HashDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashDigest({})", self.to_hex())
    }
}

impl FromStr for HashDigest {
    type Err = InvalidDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(InvalidDigestError::Empty);
        }
        let raw = hex::decode(s).map_err(|_| InvalidDigestError::NotHex)?;
        Self::from_slice(&raw)
    }
}

/// Compute the root hash of an image with the default parameters.
pub fn compute_root_hash(image: &mut dyn Read) -> VerityResult<HashDigest> {
    Ok(Sha256TreeBuilder
        .build(&VerityParams::default(), image)?
        .root_hash)
}

/// Recompute the root hash of an image with the default parameters and compare it.
///
/// I/O errors are reported as errors and never as a successful verification.
pub fn verify(image: &mut dyn Read, expected: &HashDigest) -> VerityResult<bool> {
    Sha256TreeBuilder.verify(&VerityParams::default(), image, expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_from_str() {
        let hex = "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f";
        let digest = HashDigest::from_str(hex).unwrap();
        assert_eq!(digest.to_string(), hex);
        assert_eq!(
            HashDigest::from_str(&format!("  {}\n", hex.to_uppercase())).unwrap(),
            digest
        );
        assert_eq!(HashDigest::from_str(""), Err(InvalidDigestError::Empty));
        assert_eq!(HashDigest::from_str("xyz"), Err(InvalidDigestError::NotHex));
        assert_eq!(
            HashDigest::from_str("abcd"),
            Err(InvalidDigestError::InvalidSize(2))
        );
    }
}
