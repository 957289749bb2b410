use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::{Error, Result};

/// Read buffer size (64KB). Files are streamed, never loaded whole.
const BUFFER_SIZE: usize = 64 * 1024;

/// Stream a file through SHA-256 and return the lowercase hex digest.
pub fn compute_file_hash(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| Error::io_at(path, e))?;
    hash_reader(BufReader::with_capacity(BUFFER_SIZE, file))
        .map_err(|e| Error::io_at(path, e))
}

pub fn hash_reader<R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_known_digest() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("hello.txt");
        fs::write(&path, "Hello, World!").unwrap();
        assert_eq!(
            compute_file_hash(&path).unwrap(),
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }

    #[test]
    fn test_empty_file_digest() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("empty");
        fs::write(&path, b"").unwrap();
        assert_eq!(
            compute_file_hash(&path).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_multi_buffer_file_matches_in_memory_digest() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("large.bin");
        let data: Vec<u8> = (0..(3 * BUFFER_SIZE + 17)).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &data).unwrap();
        let expected = hex::encode(Sha256::digest(&data));
        assert_eq!(compute_file_hash(&path).unwrap(), expected);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let tmp = tempdir().unwrap();
        let err = compute_file_hash(&tmp.path().join("nope")).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Io);
    }
}
