//! `Create`: one-shot provisioning of a brand-new database file. Mechanical
//! compared to the rest of the crate; it introduces no invariants of its
//! own, only writing what `FileManager` later reads and validates.

use std::path::Path;

use crate::codec::encode_checksum_row;
use crate::error::{Error, Result};
use crate::header::Header;
use crate::io::{DataFile, Filesystem, ProductionFilesystem};

/// Creates a new, empty database at `path` with the given `row_size` and
/// `skew_ms` (validated by [`Header::new`]).
///
/// Writes the 64-byte header, then the bootstrap `ChecksumRow` covering
/// it, then fsyncs. Does not acquire the write-mode exclusive lock — that
/// happens on the first `Handle::open(path, "write")`.
///
/// # Errors
///
/// `InvalidInput` if `row_size`/`skew_ms` are out of range. `PathError` if
/// a file already exists at `path` or its parent directory does not
/// exist. `WriteError` for any I/O failure while writing.
pub fn create(path: impl AsRef<Path>, row_size: u32, skew_ms: u64) -> Result<()> {
    create_with(path, row_size, skew_ms, ProductionFilesystem)
}

pub(crate) fn create_with<FS: Filesystem>(
    path: impl AsRef<Path>,
    row_size: u32,
    skew_ms: u64,
    fs: FS,
) -> Result<()> {
    let path = path.as_ref();
    let header = Header::new(row_size, skew_ms)?;

    if fs.exists(path) {
        return Err(Error::path_error(format!(
            "{} already exists",
            path.display()
        )));
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !fs.exists(parent) {
            return Err(Error::path_error(format!(
                "parent directory {} does not exist",
                parent.display()
            )));
        }
    }

    let mut file = fs
        .create_new(path)
        .map_err(|e| Error::write_error("create", e))?;
    let header_bytes = header.marshal();
    file.append(&header_bytes)
        .map_err(|e| Error::write_error("header", e))?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header_bytes);
    let checksum_row = encode_checksum_row(row_size, hasher.finalize())?;
    file.append(&checksum_row)
        .map_err(|e| Error::write_error("bootstrap checksum row", e))?;

    file.sync_all().map_err(|e| Error::write_error("fsync", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HEADER_LEN;
    use crate::io::test_support::MemFilesystem;

    const ROW_SIZE: u32 = 512;

    #[test]
    fn provisions_header_and_bootstrap_checksum() {
        let fs = MemFilesystem::new();
        create_with("db", ROW_SIZE, 5000, fs.clone()).unwrap();

        let file = fs.open(Path::new("db"), false).unwrap();
        assert_eq!(file.len().unwrap(), HEADER_LEN as u64 + ROW_SIZE as u64);

        let mut header_bytes = [0u8; HEADER_LEN];
        file.read_at(0, &mut header_bytes).unwrap();
        let header = Header::parse(&header_bytes).unwrap();
        assert_eq!(header.row_size(), ROW_SIZE);
        assert_eq!(header.skew_ms(), 5000);

        let mut checksum_bytes = vec![0u8; ROW_SIZE as usize];
        file.read_at(HEADER_LEN as u64, &mut checksum_bytes).unwrap();
        let decoded = crate::codec::decode(ROW_SIZE, &checksum_bytes).unwrap();
        match decoded {
            crate::codec::Row::Checksum(row) => {
                assert!(crate::checksum::verify(&row, &header_bytes));
            }
            other => panic!("expected a checksum row, got {other:?}"),
        }
    }

    #[test]
    fn rejects_existing_file() {
        let fs = MemFilesystem::new();
        create_with("db", ROW_SIZE, 5000, fs.clone()).unwrap();
        let err = create_with("db", ROW_SIZE, 5000, fs).unwrap_err();
        assert!(matches!(err, Error::PathError { .. }));
    }

    #[test]
    fn rejects_missing_parent_directory() {
        let fs = MemFilesystem::new();
        let err = create_with("/missing/dir/db", ROW_SIZE, 5000, fs).unwrap_err();
        assert!(matches!(err, Error::PathError { .. }));
    }

    #[test]
    fn rejects_out_of_range_row_size() {
        let fs = MemFilesystem::new();
        let err = create_with("db", 1, 5000, fs).unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }));
    }
}
