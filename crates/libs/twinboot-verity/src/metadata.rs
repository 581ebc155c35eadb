//! Sidecar files shipped alongside an image.
//!
//! The integrity metadata follows the output of `veritysetup format`:
//!
//! ```text
//! VERITY header information for rootfs.img.hashtree
//! Hash type:              1
//! Data blocks:            262144
//! Data block size:        4096
//! Hash block size:        4096
//! Hash algorithm:         sha256
//! Salt:                   -
//! Root hash:              4e3a...
//! ```
//!
//! A file containing nothing but a hex-encoded root hash is accepted as well. The
//! checksum file follows the output of `sha256sum`.

use std::str::FromStr;

use crate::tree::VerityParams;
use crate::{HashDigest, VerityError, VerityResult};

/// Integrity metadata of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerityMetadata {
    pub root_hash: HashDigest,
    pub salt: Vec<u8>,
    pub data_block_size: Option<usize>,
    pub hash_block_size: Option<usize>,
    /// Number of data blocks the tree was generated for, if known.
    pub data_blocks: Option<u64>,
}

impl VerityMetadata {
    /// Metadata consisting only of a root hash.
    pub fn from_root_hash(root_hash: HashDigest) -> Self {
        Self {
            root_hash,
            salt: Vec::new(),
            data_block_size: None,
            hash_block_size: None,
            data_blocks: None,
        }
    }

    /// Parse the contents of an integrity metadata file.
    pub fn parse(text: &str) -> VerityResult<Self> {
        let trimmed = text.trim();
        if !trimmed.contains(':') && !trimmed.contains('\n') {
            return Ok(Self::from_root_hash(HashDigest::from_str(trimmed)?));
        }
        let mut root_hash = None;
        let mut metadata = Self::from_root_hash(HashDigest::new([0; 32]));
        for line in trimmed.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "root hash" => root_hash = Some(HashDigest::from_str(value)?),
                "salt" => {
                    if value != "-" {
                        metadata.salt = hex::decode(value).map_err(|_| {
                            VerityError::InvalidMetadata(format!("invalid salt {value:?}"))
                        })?;
                    }
                }
                "data block size" => metadata.data_block_size = Some(parse_number(key, value)?),
                "hash block size" => metadata.hash_block_size = Some(parse_number(key, value)?),
                "data blocks" => metadata.data_blocks = Some(parse_number(key, value)?),
                "hash algorithm" => {
                    if !value.eq_ignore_ascii_case("sha256") {
                        return Err(VerityError::InvalidMetadata(format!(
                            "unsupported hash algorithm {value:?}"
                        )));
                    }
                }
                "hash type" => {
                    if value != "1" {
                        return Err(VerityError::InvalidMetadata(format!(
                            "unsupported hash type {value:?}"
                        )));
                    }
                }
                _ => { /* informational */ }
            }
        }
        let Some(root_hash) = root_hash else {
            return Err(VerityError::InvalidMetadata("missing root hash".to_owned()));
        };
        metadata.root_hash = root_hash;
        Ok(metadata)
    }

    /// Tree parameters, falling back to the given defaults for unspecified sizes.
    pub fn params(&self, defaults: &VerityParams) -> VerityParams {
        VerityParams {
            data_block_size: self.data_block_size.unwrap_or(defaults.data_block_size),
            hash_block_size: self.hash_block_size.unwrap_or(defaults.hash_block_size),
            salt: self.salt.clone(),
        }
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> VerityResult<T> {
    value
        .parse()
        .map_err(|_| VerityError::InvalidMetadata(format!("invalid value {value:?} for {key:?}")))
}

/// Parse the contents of a checksum file, e.g., `<hex>  rootfs.img`.
pub fn parse_checksum_file(text: &str) -> VerityResult<HashDigest> {
    let Some(digest) = text.split_whitespace().next() else {
        return Err(VerityError::InvalidMetadata("empty checksum file".to_owned()));
    };
    Ok(HashDigest::from_str(digest)?)
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    const ROOT: &str = "4e3a7d3c0f4bb6d9a1b3f0e8f5f2c0d1e2a3b4c5d6e7f8091a2b3c4d5e6f7081";

    #[test]
    fn test_parse_veritysetup_output() {
        let metadata = VerityMetadata::parse(&format!(
            indoc! {"
                VERITY header information for rootfs.img.hashtree
                UUID:                   0a5c4f2e-6a83-4f39-8a61-7b1e2a4a6a57
                Hash type:              1
                Data blocks:            262144
                Data block size:        4096
                Hash block size:        4096
                Hash algorithm:         sha256
                Salt:                   c0ffee
                Root hash:              {}
            "},
            ROOT
        ))
        .unwrap();
        assert_eq!(metadata.root_hash.to_hex(), ROOT);
        assert_eq!(metadata.salt, vec![0xc0, 0xff, 0xee]);
        assert_eq!(metadata.data_blocks, Some(262144));
        assert_eq!(metadata.data_block_size, Some(4096));
    }

    #[test]
    fn test_parse_bare_root_hash() {
        let metadata = VerityMetadata::parse(&format!("{ROOT}\n")).unwrap();
        assert_eq!(metadata.root_hash.to_hex(), ROOT);
        assert!(metadata.salt.is_empty());
        assert_eq!(metadata.params(&VerityParams::default()), VerityParams::default());
    }

    #[test]
    fn test_parse_rejects_foreign_metadata() {
        assert!(VerityMetadata::parse("Hash algorithm: sha1\nRoot hash: 00").is_err());
        assert!(VerityMetadata::parse("Salt: -\nData blocks: 3\n").is_err());
        assert!(VerityMetadata::parse("").is_err());
    }

    #[test]
    fn test_parse_checksum_file() {
        let digest = parse_checksum_file(&format!("{ROOT}  rootfs.img\n")).unwrap();
        assert_eq!(digest.to_hex(), ROOT);
        assert!(parse_checksum_file("  \n").is_err());
    }
}
