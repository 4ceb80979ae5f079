//! SHA-256 helpers.
//!
//! One digest family is used everywhere a fingerprint is needed: archive
//! integrity in the download pool, source-tree hashes in the firmware
//! ledger, and device-identity hashing in the device manager.

use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of a byte slice.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hex-encoded SHA-256 of a file's contents, streamed in 64 KiB chunks.
///
/// # Errors
///
/// Returns any I/O error from opening or reading the file.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_file_matches_slice() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("blob.bin");
        std::fs::write(&path, b"firmware image").unwrap();
        assert_eq!(sha256_file(&path).unwrap(), sha256_hex(b"firmware image"));
    }
}
