//! Content hashing.
//!
//! File identity is the hex SHA-256 of the contents, read in 8 KiB
//! chunks. The hash, not event ordering, decides whether a downstream
//! peer considers a file changed.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Read buffer size.
const CHUNK_SIZE: usize = 8 * 1024;

/// Hex SHA-256 of a file's contents.
///
/// # Errors
///
/// Propagates I/O errors (missing file, permissions, truncation races).
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 of a byte slice.
#[must_use]
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
