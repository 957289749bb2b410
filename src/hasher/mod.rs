pub mod sha256;

use std::path::Path;

use crate::error::{Error, Result};

pub use sha256::compute_file_hash;

/// Length of a hex-encoded SHA-256 digest.
pub const HASH_LEN: usize = 64;

/// Content hasher used to verify relocations.
pub trait FileHasher: Send + Sync {
    fn hash_file(&self, path: &Path) -> Result<String>;
}

/// Streaming SHA-256 over the file contents.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Hasher;

impl FileHasher for Sha256Hasher {
    fn hash_file(&self, path: &Path) -> Result<String> {
        compute_file_hash(path)
    }
}

pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == HASH_LEN
        && hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Reject anything that is not exactly 64 lowercase hex characters.
pub fn validate_hash(hash: &str) -> Result<()> {
    if is_valid_hash(hash) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "hash must be {} lowercase hex characters, got {:?}",
            HASH_LEN, hash
        )))
    }
}
