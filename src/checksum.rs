//! Streaming SHA-1 content hashing

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha1::{Digest, Sha1};

use crate::config::IO_CHUNK_SIZE;

/// SHA-1 of the file at `path`, lowercase hex.
///
/// Returns `None` when the file cannot be opened or read. Callers treat
/// that as "no local content", the same way the wire format uses an empty
/// checksum string for a file that is absent.
pub fn file_checksum(path: &Path) -> Option<String> {
    let mut file = File::open(path).ok()?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; IO_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).ok()?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Some(hex::encode(hasher.finalize()))
}

/// SHA-1 of an in-memory buffer, lowercase hex.
pub fn bytes_checksum(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}
