//! Fixed-size chunk planning for transfers
//!
//! Files move over the wire in fixed-size pieces, one at a time. Chunk IDs
//! are fresh UUIDs naming a single transfer attempt; they are not content
//! hashes and are never reused across syncs.

use uuid::Uuid;

/// Number of chunks a file of `size` bytes occupies.
/// A zero-byte file yields zero chunks; transfer loops materialize such
/// files without fetching anything.
pub fn chunk_count(size: u64, chunk_size: u64) -> usize {
    debug_assert!(chunk_size > 0);
    (size / chunk_size + u64::from(size % chunk_size != 0)) as usize
}

/// Fresh transfer IDs for every chunk of a file.
pub fn chunk_ids(size: u64, chunk_size: u64) -> Vec<String> {
    (0..chunk_count(size, chunk_size))
        .map(|_| Uuid::new_v4().to_string())
        .collect()
}

/// Inclusive byte range requested for chunk `n`.
///
/// The first chunk spans `[0, chunk_size]`; every later chunk starts one
/// byte past the previous boundary. With inclusive HTTP range semantics
/// the ranges tile the file without overlap, and the server clips the
/// final range to the file's end.
pub fn chunk_range(n: usize, chunk_size: u64) -> (u64, u64) {
    let n = n as u64;
    let start = if n == 0 { 0 } else { chunk_size * n + 1 };
    (start, chunk_size * (n + 1))
}

/// `Range` header value for chunk `n`.
pub fn range_header(n: usize, chunk_size: u64) -> String {
    let (start, end) = chunk_range(n, chunk_size);
    format!("bytes={start}-{end}")
}
