//! Flat SHA-256 checksums.

use std::io::{self, Read};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{HashDigest, VerityResult};

/// Reader computing the SHA-256 digest of everything read through it.
pub struct StreamHasher<R> {
    reader: R,
    hasher: Sha256,
    consumed: u64,
}

impl<R> StreamHasher<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            hasher: Sha256::new(),
            consumed: 0,
        }
    }

    /// Number of bytes read so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn finalize(self) -> HashDigest {
        HashDigest::new(self.hasher.finalize().into())
    }
}

impl<R: Read> Read for StreamHasher<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.reader.read(buf)?;
        self.hasher.update(&buf[..read]);
        self.consumed += read as u64;
        Ok(read)
    }
}

/// Compute the SHA-256 digest of the remaining bytes of the reader.
pub fn sha256_reader(reader: &mut dyn Read) -> VerityResult<HashDigest> {
    let mut hasher = StreamHasher::new(reader);
    io::copy(&mut hasher, &mut io::sink())?;
    Ok(hasher.finalize())
}

/// Check the flat checksum of an image.
pub fn verify_checksum(image: &mut dyn Read, expected: &HashDigest) -> VerityResult<bool> {
    let found = sha256_reader(image)?;
    if &found != expected {
        debug!(expected = %expected, found = %found, "checksum mismatch");
        return Ok(false);
    }
    Ok(true)
}
