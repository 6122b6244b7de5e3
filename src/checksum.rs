//! The checksum engine: inserted into the `FileManager`'s append path,
//! transparent to the `Transaction`s producing the stream it watches.

use crate::codec::{encode_checksum_row, ChecksumRow};
use crate::error::Result;

/// Finalized data/null rows between consecutive `ChecksumRow`s.
pub const CHECKSUM_INTERVAL: u32 = 10_000;

/// Tracks the running CRC32 of the append stream and the finalized-row
/// countdown to the next boundary checksum.
///
/// Holds no file bytes beyond the rolling hash state: appending a
/// `ChecksumEngine` to its own stream is O(1) regardless of file size.
pub struct ChecksumEngine {
    hasher: crc32fast::Hasher,
    rows_since_checksum: u32,
}

impl ChecksumEngine {
    /// A fresh engine for a brand-new, empty file.
    pub fn new() -> Self {
        Self {
            hasher: crc32fast::Hasher::new(),
            rows_since_checksum: 0,
        }
    }

    /// Resumes an engine for a file that already has `bytes_so_far` on disk
    /// and has seen `rows_since_checksum` finalized rows since the last
    /// `ChecksumRow`. Used when a `FileManager` opens an existing file.
    pub fn resume(bytes_so_far: &[u8], rows_since_checksum: u32) -> Self {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(bytes_so_far);
        Self {
            hasher,
            rows_since_checksum,
        }
    }

    pub fn rows_since_checksum(&self) -> u32 {
        self.rows_since_checksum
    }

    /// Rebuilds an engine from an already-accumulated hasher, used by
    /// `FileManager::open`'s replay of an existing file where re-hashing
    /// from raw bytes the caller already streamed once would double the
    /// work.
    pub(crate) fn from_parts(hasher: crc32fast::Hasher, rows_since_checksum: u32) -> Self {
        Self {
            hasher,
            rows_since_checksum,
        }
    }

    /// Must be called, in file order, for every byte run appended to the
    /// file — including checksum rows this engine itself produced — so the
    /// running hash always covers exactly the bytes on disk.
    pub fn observe_append(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Call once a finalizing fragment (one ending in `ROW_END` for a
    /// `DataRow` or `NullRow`) has been appended and observed. Returns the
    /// bytes of a boundary `ChecksumRow` when this finalization is the
    /// 10,000th since the last one; the caller must append those bytes to
    /// the file immediately, before anything else.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::InvalidInput`] from the codec if `row_size` is
    /// too small to hold a row — unreachable once a `Header` has validated
    /// `row_size`, but surfaced rather than unwrapped.
    pub fn on_row_finalized(&mut self, row_size: u32) -> Result<Option<Vec<u8>>> {
        self.rows_since_checksum += 1;
        if self.rows_since_checksum < CHECKSUM_INTERVAL {
            return Ok(None);
        }

        let crc = self.hasher.clone().finalize();
        let row = encode_checksum_row(row_size, crc)?;
        self.hasher.update(&row);
        self.rows_since_checksum = 0;
        Ok(Some(row))
    }
}

impl Default for ChecksumEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Verifies a decoded [`ChecksumRow`] against the bytes it claims to cover.
/// Used by the bootstrap-checksum check in `FileManager::open` and by any
/// later full-file integrity scan.
pub fn verify(row: &ChecksumRow, preceding_bytes: &[u8]) -> bool {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(preceding_bytes);
    hasher.finalize() == row.crc32
}
