//! Block-level hash tree (dm-verity hash format version 1, SHA-256).

use std::io::{self, Read};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{HashDigest, VerityError, VerityResult, DIGEST_SIZE};

/// Default size of data and hash blocks.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Largest block size accepted, the limit `veritysetup` enforces.
pub const MAX_BLOCK_SIZE: usize = 512 * 1024;

/// Parameters of the hash tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerityParams {
    /// Size of the blocks the image is split into.
    pub data_block_size: usize,
    /// Size of the blocks digests are packed into.
    pub hash_block_size: usize,
    /// Salt prepended to every hashed block.
    pub salt: Vec<u8>,
}

impl Default for VerityParams {
    fn default() -> Self {
        Self {
            data_block_size: DEFAULT_BLOCK_SIZE,
            hash_block_size: DEFAULT_BLOCK_SIZE,
            salt: Vec::new(),
        }
    }
}

impl VerityParams {
    /// Check that the block sizes are usable.
    ///
    /// Both sizes must be powers of two of at most [`MAX_BLOCK_SIZE`] bytes. Data blocks
    /// must be at least 512 bytes and a hash block must hold at least two digests,
    /// otherwise the tree does not shrink.
    pub fn validate(&self) -> VerityResult<()> {
        if self.data_block_size > MAX_BLOCK_SIZE || self.hash_block_size > MAX_BLOCK_SIZE {
            return Err(VerityError::InvalidParams("block sizes must not exceed 512 KiB"));
        }
        if !self.data_block_size.is_power_of_two() || self.data_block_size < 512 {
            return Err(VerityError::InvalidParams(
                "data block size must be a power of two of at least 512 bytes",
            ));
        }
        if !self.hash_block_size.is_power_of_two() || self.hash_block_size < 2 * DIGEST_SIZE {
            return Err(VerityError::InvalidParams(
                "hash block size must be a power of two of at least 64 bytes",
            ));
        }
        Ok(())
    }

    /// Number of digests stored in a single hash block.
    pub fn digests_per_block(&self) -> usize {
        self.hash_block_size / DIGEST_SIZE
    }

    fn salted_digest(&self, block: &[u8]) -> [u8; DIGEST_SIZE] {
        let mut hasher = Sha256::new();
        hasher.update(&self.salt);
        hasher.update(block);
        hasher.finalize().into()
    }
}

/// Summary of a computed hash tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerityTree {
    /// Root hash of the tree.
    pub root_hash: HashDigest,
    /// Number of bytes read from the image.
    pub image_size: u64,
    /// Number of data blocks, the last one possibly zero-padded.
    pub data_blocks: u64,
    /// Number of tree levels.
    pub levels: usize,
    /// Size of all hash blocks in bytes.
    pub hash_tree_size: u64,
}

/// Builds the hash tree of an image.
pub trait IntegrityTreeBuilder {
    /// Read the full image and compute its tree.
    fn build(&self, params: &VerityParams, image: &mut dyn Read) -> VerityResult<VerityTree>;

    /// Recompute the root hash of the image and compare it with the expected one.
    fn verify(
        &self,
        params: &VerityParams,
        image: &mut dyn Read,
        expected: &HashDigest,
    ) -> VerityResult<bool> {
        let tree = self.build(params, image)?;
        if &tree.root_hash != expected {
            debug!(expected = %expected, found = %tree.root_hash, "root hash mismatch");
            return Ok(false);
        }
        Ok(true)
    }
}

/// In-process SHA-256 tree builder.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256TreeBuilder;

impl IntegrityTreeBuilder for Sha256TreeBuilder {
    fn build(&self, params: &VerityParams, image: &mut dyn Read) -> VerityResult<VerityTree> {
        params.validate()?;
        let mut block = vec![0; params.data_block_size];
        let mut level = Vec::new();
        let mut image_size = 0;
        let mut data_blocks = 0;
        loop {
            let filled = read_block(image, &mut block)?;
            if filled == 0 {
                break;
            }
            block[filled..].fill(0);
            level.extend_from_slice(&params.salted_digest(&block));
            image_size += filled as u64;
            data_blocks += 1;
            if filled < block.len() {
                break;
            }
        }
        let mut levels = 0;
        let mut hash_tree_size = 0;
        let root_hash = loop {
            let hash_blocks = pack_digests(&level, params);
            levels += 1;
            hash_tree_size += hash_blocks.len() as u64;
            if hash_blocks.len() == params.hash_block_size {
                break HashDigest::new(params.salted_digest(&hash_blocks));
            }
            level = hash_blocks
                .chunks_exact(params.hash_block_size)
                .flat_map(|block| params.salted_digest(block))
                .collect();
        };
        Ok(VerityTree {
            root_hash,
            image_size,
            data_blocks,
            levels,
            hash_tree_size,
        })
    }
}

/// Pack digests into zero-padded hash blocks, producing at least one block.
fn pack_digests(digests: &[u8], params: &VerityParams) -> Vec<u8> {
    let count = digests.len() / DIGEST_SIZE;
    let per_block = params.digests_per_block();
    let blocks = count.div_ceil(per_block).max(1);
    let mut packed = vec![0; blocks * params.hash_block_size];
    for (idx, digest) in digests.chunks_exact(DIGEST_SIZE).enumerate() {
        let offset = (idx / per_block) * params.hash_block_size + (idx % per_block) * DIGEST_SIZE;
        packed[offset..offset + DIGEST_SIZE].copy_from_slice(digest);
    }
    packed
}

/// Fill the buffer from the reader, stopping early only at the end of the stream.
fn read_block(reader: &mut dyn Read, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn sha256(parts: &[&[u8]]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize().into()
    }

    fn build(params: &VerityParams, image: &[u8]) -> VerityTree {
        Sha256TreeBuilder
            .build(params, &mut Cursor::new(image))
            .unwrap()
    }

    #[test]
    fn test_single_block_known_answer() {
        let params = VerityParams {
            salt: b"salt".to_vec(),
            ..VerityParams::default()
        };
        let mut data_block = vec![0; 4096];
        data_block[..5].copy_from_slice(b"hello");
        let leaf = sha256(&[b"salt", &data_block]);
        let mut hash_block = vec![0; 4096];
        hash_block[..32].copy_from_slice(&leaf);
        let expected = HashDigest::new(sha256(&[b"salt", &hash_block]));

        let tree = build(&params, b"hello");
        assert_eq!(tree.root_hash, expected);
        assert_eq!(tree.image_size, 5);
        assert_eq!(tree.data_blocks, 1);
        assert_eq!(tree.levels, 1);
        assert_eq!(tree.hash_tree_size, 4096);
    }

    #[test]
    fn test_empty_image() {
        let tree = build(&VerityParams::default(), b"");
        assert_eq!(tree.data_blocks, 0);
        assert_eq!(tree.root_hash, HashDigest::new(sha256(&[&[0; 4096]])));
    }

    #[test]
    fn test_multiple_levels() {
        let params = VerityParams {
            data_block_size: 512,
            hash_block_size: 64,
            salt: Vec::new(),
        };
        // 5 digests -> 3 hash blocks -> 2 hash blocks -> 1 hash block.
        let image = (0..5 * 512).map(|idx| (idx % 251) as u8).collect::<Vec<_>>();
        let tree = build(&params, &image);
        assert_eq!(tree.data_blocks, 5);
        assert_eq!(tree.levels, 3);
        assert_eq!(tree.hash_tree_size, (3 + 2 + 1) * 64);

        let mut tampered = image.clone();
        tampered[4 * 512 + 7] ^= 0x80;
        assert_ne!(build(&params, &tampered).root_hash, tree.root_hash);
    }

    #[test]
    fn test_trailing_zero_padding() {
        let params = VerityParams::default();
        let mut image = vec![0xa5; 5000];
        let short = build(&params, &image);
        image.resize(8192, 0);
        let padded = build(&params, &image);
        assert_eq!(short.root_hash, padded.root_hash);
        assert_eq!(short.data_blocks, 2);
        assert_eq!(short.image_size, 5000);
    }

    #[test]
    fn test_salt_changes_root() {
        let image = vec![1; 10_000];
        let unsalted = build(&VerityParams::default(), &image);
        let salted = build(
            &VerityParams {
                salt: vec![0xff; 32],
                ..VerityParams::default()
            },
            &image,
        );
        assert_ne!(unsalted.root_hash, salted.root_hash);
    }

    #[test]
    fn test_invalid_params() {
        for (data_block_size, hash_block_size) in [
            (500, 4096),
            (256, 4096),
            (4096, 32),
            (1 << 62, 4096),
            (4096, 2 * MAX_BLOCK_SIZE),
        ] {
            let params = VerityParams {
                data_block_size,
                hash_block_size,
                salt: Vec::new(),
            };
            assert!(matches!(
                Sha256TreeBuilder.build(&params, &mut Cursor::new(b"")),
                Err(VerityError::InvalidParams(_))
            ));
        }
    }

    #[test]
    fn test_largest_block_size_accepted() {
        let params = VerityParams {
            data_block_size: MAX_BLOCK_SIZE,
            hash_block_size: MAX_BLOCK_SIZE,
            salt: Vec::new(),
        };
        assert_eq!(build(&params, b"hello").data_blocks, 1);
    }

    #[test]
    fn test_read_error_is_fatal() {
        struct Broken;

        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::other("device vanished"))
            }
        }

        let expected = HashDigest::new([0; 32]);
        assert!(matches!(
            Sha256TreeBuilder.verify(&VerityParams::default(), &mut Broken, &expected),
            Err(VerityError::Io(_))
        ));
    }
}
