//! `Finder`: a minimal read-side helper that resolves a row's owning
//! transaction bounds by scanning the fixed-size grid, then defers to the
//! commit-visibility resolver to decide what is actually durable.
//!
//! This is explicitly secondary to the Transaction/Resolver/FileManager/
//! Checksum core: it only reads, and it coordinates with the writer only
//! through `FileManager::read`/`size`, never through the write-request
//! channel.

use std::sync::Arc;

use uuid::Uuid;

use crate::codec::{self, Row, StartControl};
use crate::error::{Error, Result};
use crate::file_manager::FileManager;
use crate::header::HEADER_LEN;
use crate::io::{Filesystem, ProductionFilesystem};
use crate::visibility;

/// The byte range `[start_offset, end_offset]` of one transaction's rows on
/// disk: the offset of its first row (`start_control == T`, or the single
/// row of a null transaction) and the offset of its terminating row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionBounds {
    pub start_offset: u64,
    pub end_offset: u64,
}

/// Resolves committed values by offset, scanning the append-only row grid.
///
/// Holds only a shared handle to the `FileManager` it reads through; it
/// retains no row bytes between calls, matching the constant-memory
/// guarantee the rest of the crate carries.
pub struct Finder<FS: Filesystem = ProductionFilesystem> {
    file_manager: Arc<FileManager<FS>>,
}

impl<FS: Filesystem> Finder<FS> {
    pub(crate) fn new(file_manager: Arc<FileManager<FS>>) -> Self {
        Self { file_manager }
    }

    /// Resolves the `[start, end]` row offsets of the transaction that owns
    /// the row at `offset`.
    ///
    /// # Errors
    ///
    /// `KeyNotFoundError` if `offset` does not land on a row boundary.
    /// `TransactionActiveError` if the owning transaction has no
    /// terminating end-control on disk yet.
    pub fn bounds_at(&self, offset: u64) -> Result<TransactionBounds> {
        let row_size = u64::from(self.file_manager.header().row_size());
        let size = self.file_manager.size();
        self.check_boundary(offset, row_size, size)?;

        let start_offset = self.scan_backward_to_start(offset, row_size)?;
        let end_offset = self.scan_forward_to_terminator(start_offset, row_size, size)?;
        Ok(TransactionBounds {
            start_offset,
            end_offset,
        })
    }

    /// Resolves the `(key, value)` at `offset` iff the row is part of the
    /// committed prefix of its owning transaction. Returns `Ok(None)` for a
    /// structurally valid row that rolled back or belongs to the open tail
    /// of a transaction with no terminator yet is not itself an error —
    /// only a caller that needs to distinguish "not committed" from
    /// "transaction still open" should call `bounds_at` directly.
    ///
    /// # Errors
    ///
    /// `KeyNotFoundError` if `offset` does not land on a row boundary.
    pub fn committed_value_at(&self, offset: u64) -> Result<Option<(Uuid, Vec<u8>)>> {
        let row_size = u64::from(self.file_manager.header().row_size());
        let size = self.file_manager.size();
        self.check_boundary(offset, row_size, size)?;

        let start_offset = self.scan_backward_to_start(offset, row_size)?;
        let end_offset = match self.scan_forward_to_terminator(start_offset, row_size, size) {
            Ok(end) => end,
            Err(Error::TransactionActiveError) => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut rows = Vec::new();
        let mut target_index = None;
        let mut cur = start_offset;
        while cur <= end_offset {
            match self.decode_at(cur, row_size)? {
                Row::Checksum(_) => {}
                Row::Null(_) => {}
                Row::Data(row) => {
                    if cur == offset {
                        target_index = Some(rows.len());
                    }
                    rows.push(row);
                }
            }
            cur += row_size;
        }

        let Some(index) = target_index else {
            return Ok(None);
        };
        if visibility::is_row_committed(&rows, index) {
            let row = &rows[index];
            Ok(Some((row.key, row.value.clone())))
        } else {
            Ok(None)
        }
    }

    fn check_boundary(&self, offset: u64, row_size: u64, size: u64) -> Result<()> {
        if offset < HEADER_LEN as u64
            || offset >= size
            || (offset - HEADER_LEN as u64) % row_size != 0
        {
            return Err(Error::KeyNotFoundError);
        }
        Ok(())
    }

    fn decode_at(&self, offset: u64, row_size: u64) -> Result<Row> {
        let bytes = self.file_manager.read(offset, row_size as usize)?;
        codec::decode(row_size as u32, &bytes)
    }

    fn scan_backward_to_start(&self, offset: u64, row_size: u64) -> Result<u64> {
        let mut cur = offset;
        loop {
            match self.decode_at(cur, row_size)? {
                Row::Null(_) => return Ok(cur),
                Row::Data(row) if row.start == StartControl::Transaction => return Ok(cur),
                Row::Data(_) | Row::Checksum(_) => {
                    if cur < HEADER_LEN as u64 + row_size {
                        return Err(Error::KeyNotFoundError);
                    }
                    cur -= row_size;
                }
            }
        }
    }

    fn scan_forward_to_terminator(&self, start_offset: u64, row_size: u64, size: u64) -> Result<u64> {
        let mut cur = start_offset;
        loop {
            match self.decode_at(cur, row_size)? {
                Row::Null(_) => return Ok(cur),
                Row::Checksum(_) => {}
                Row::Data(row) if row.end.is_terminating() => return Ok(cur),
                Row::Data(_) => {}
            }
            cur += row_size;
            if cur >= size {
                return Err(Error::TransactionActiveError);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_checksum_row;
    use crate::config::FrozenDbConfig;
    use crate::file_manager::Mode;
    use crate::header::Header;
    use crate::io::test_support::MemFilesystem;
    use crate::io::DataFile;
    use crate::transaction::Transaction;
    use std::path::Path;

    const ROW_SIZE: u32 = 512;

    fn provision(fs: &MemFilesystem, path: &Path) {
        let header = Header::new(ROW_SIZE, 5000).unwrap();
        let header_bytes = header.marshal();
        let mut file = fs.create_new(path).unwrap();
        file.append(&header_bytes).unwrap();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header_bytes);
        let checksum_row = encode_checksum_row(ROW_SIZE, hasher.finalize()).unwrap();
        file.append(&checksum_row).unwrap();
    }

    #[test]
    fn resolves_a_committed_single_row_transaction() {
        let fs = MemFilesystem::new();
        let path = Path::new("/db");
        provision(&fs, path);
        let fm = Arc::new(
            FileManager::open_with(path, Mode::Write, FrozenDbConfig::default(), fs).unwrap(),
        );

        let tx = Transaction::new(fm.clone());
        tx.begin().unwrap();
        let key = Uuid::now_v7();
        tx.add_row(key, b"value").unwrap();
        tx.commit().unwrap();

        let finder = Finder::new(fm.clone());
        let row_offset = HEADER_LEN as u64 + u64::from(ROW_SIZE);
        let resolved = finder.committed_value_at(row_offset).unwrap();
        assert_eq!(resolved, Some((key, b"value".to_vec())));
    }

    #[test]
    fn rolled_back_row_resolves_to_none() {
        let fs = MemFilesystem::new();
        let path = Path::new("/db");
        provision(&fs, path);
        let fm = Arc::new(
            FileManager::open_with(path, Mode::Write, FrozenDbConfig::default(), fs).unwrap(),
        );

        let tx = Transaction::new(fm.clone());
        tx.begin().unwrap();
        tx.add_row(Uuid::now_v7(), b"value").unwrap();
        tx.rollback(0).unwrap();

        let finder = Finder::new(fm.clone());
        let row_offset = HEADER_LEN as u64 + u64::from(ROW_SIZE);
        let resolved = finder.committed_value_at(row_offset).unwrap();
        assert_eq!(resolved, None);
    }

    #[test]
    fn offset_off_the_row_grid_is_key_not_found() {
        let fs = MemFilesystem::new();
        let path = Path::new("/db");
        provision(&fs, path);
        let fm = Arc::new(
            FileManager::open_with(path, Mode::Read, FrozenDbConfig::default(), fs).unwrap(),
        );
        let finder = Finder::new(fm);
        let err = finder.committed_value_at(1).unwrap_err();
        assert!(matches!(err, Error::KeyNotFoundError));
    }

    #[test]
    fn open_transaction_bounds_report_transaction_active() {
        let fs = MemFilesystem::new();
        let path = Path::new("/db");
        provision(&fs, path);
        let fm = Arc::new(
            FileManager::open_with(path, Mode::Write, FrozenDbConfig::default(), fs).unwrap(),
        );

        let tx = Transaction::new(fm.clone());
        tx.begin().unwrap();
        tx.add_row(Uuid::now_v7(), b"value").unwrap();

        let finder = Finder::new(fm.clone());
        let row_offset = HEADER_LEN as u64 + u64::from(ROW_SIZE);
        let err = finder.bounds_at(row_offset).unwrap_err();
        assert!(matches!(err, Error::TransactionActiveError));
    }

    #[test]
    fn savepoint_prefix_resolves_while_later_rows_roll_back() {
        let fs = MemFilesystem::new();
        let path = Path::new("/db");
        provision(&fs, path);
        let fm = Arc::new(
            FileManager::open_with(path, Mode::Write, FrozenDbConfig::default(), fs).unwrap(),
        );

        let tx = Transaction::new(fm.clone());
        tx.begin().unwrap();
        let k1 = Uuid::now_v7();
        tx.add_row(k1, b"a").unwrap();
        tx.savepoint().unwrap();
        tx.add_row(Uuid::now_v7(), b"b").unwrap();
        tx.rollback(1).unwrap();

        let finder = Finder::new(fm.clone());
        let first_row_offset = HEADER_LEN as u64 + u64::from(ROW_SIZE);
        let second_row_offset = first_row_offset + u64::from(ROW_SIZE);

        assert_eq!(
            finder.committed_value_at(first_row_offset).unwrap(),
            Some((k1, b"a".to_vec()))
        );
        assert_eq!(finder.committed_value_at(second_row_offset).unwrap(), None);
    }
}
