//! Streaming SHA-256 hashing utilities.
//!
//! All functions stream in 64 KiB blocks — never a full file in memory.

use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

const BUF_SIZE: usize = 64 * 1024;

/// SHA-256 of an entire file by streaming. Lowercase hex.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let file = std::fs::File::open(path)?;
    hash_reader(file)
}

/// SHA-256 of everything a reader produces. Lowercase hex.
pub fn hash_reader(mut reader: impl Read) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of a byte slice. Lowercase hex.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    // sha256("abc")
    const ABC: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn bytes_known_vector() {
        assert_eq!(hash_bytes(b"abc"), ABC);
    }

    #[test]
    fn reader_matches_bytes() {
        let data = vec![7u8; 200_000]; // spans multiple 64 KiB blocks
        assert_eq!(
            hash_reader(std::io::Cursor::new(data.clone())).unwrap(),
            hash_bytes(&data)
        );
    }

    #[test]
    fn file_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(hash_file(&path).unwrap(), ABC);
    }
}
