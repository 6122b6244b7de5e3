//! `Transaction`: the public `Begin/AddRow/Savepoint/Rollback/Commit` state
//! machine, mutex-guarded, byte-exact with what is submitted to the
//! `FileManager`.

use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::codec::{max_value_len, DataRow, EndControl, StartControl};
use crate::error::{Error, Result};
use crate::file_manager::FileManager;
use crate::io::{Filesystem, ProductionFilesystem};
use crate::partial::{Finalized, PartialDataRow};
use crate::visibility;

const MAX_ROWS: usize = 100;
const MAX_SAVEPOINTS: u8 = 9;

struct Inner {
    rows: Vec<DataRow>,
    partial: Option<PartialDataRow>,
    null_row: Option<crate::codec::NullRow>,
    max_timestamp: u64,
    tombstoned: bool,
}

/// One bracketed transaction against a write-mode `FileManager`.
///
/// All public methods acquire the same internal mutex for their entire
/// duration: calls from different threads on the same `Transaction` are
/// fully serialized, matching the single-writer model this type exists to
/// enforce.
pub struct Transaction<FS: Filesystem = ProductionFilesystem> {
    file_manager: Arc<FileManager<FS>>,
    inner: Mutex<Inner>,
}

impl<FS: Filesystem> Transaction<FS> {
    pub(crate) fn new(file_manager: Arc<FileManager<FS>>) -> Self {
        Self {
            file_manager,
            inner: Mutex::new(Inner {
                rows: Vec::new(),
                partial: None,
                null_row: None,
                max_timestamp: 0,
                tombstoned: false,
            }),
        }
    }

    /// Starts the transaction: submits the 2-byte `(ROW_START,
    /// start_control=T)` prefix. `Handle::begin_transaction` calls this
    /// immediately on every `Transaction` it returns.
    pub(crate) fn begin(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.tombstoned {
            return Err(Error::TombstonedError);
        }
        if !(inner.rows.is_empty() && inner.null_row.is_none() && inner.partial.is_none()) {
            return Err(Error::invalid_action(
                "begin called on a non-empty transaction",
            ));
        }
        let row_size = self.file_manager.header().row_size();
        let (partial, prefix) = PartialDataRow::new(row_size, StartControl::Transaction);
        self.write(&mut inner, prefix, false)?;
        inner.partial = Some(partial);
        Ok(())
    }

    /// Appends one key/value row.
    ///
    /// # Errors
    ///
    /// `InvalidAction` if the transaction is not active. `InvalidInput` if
    /// `key` is not a non-nil UUIDv7, `value` is empty or too large, or the
    /// transaction already holds 100 rows. `KeyOrderingError` if
    /// `ms(key) + skew_ms <= max_timestamp`. `TombstonedError` if a prior
    /// call already failed to write. Any of these that reach the writer
    /// tombstone the transaction.
    pub fn add_row(&self, key: Uuid, value: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.tombstoned {
            return Err(Error::TombstonedError);
        }
        if inner.partial.is_none() || inner.null_row.is_some() {
            return Err(Error::invalid_action(
                "add_row requires an active transaction",
            ));
        }
        if inner.rows.len() + 1 >= MAX_ROWS {
            return Err(Error::invalid_action(
                "transaction already holds 100 rows",
            ));
        }
        validate_key(&key)?;
        if value.is_empty() {
            return Err(Error::invalid_input("value must not be empty"));
        }
        let row_size = self.file_manager.header().row_size();
        let limit = max_value_len(row_size);
        if value.len() > limit {
            return Err(Error::invalid_input(format!(
                "value length {} exceeds the maximum of {limit} bytes",
                value.len()
            )));
        }
        let skew_ms = self.file_manager.header().skew_ms();
        let ts = uuidv7_timestamp_ms(&key);
        if ts + skew_ms <= inner.max_timestamp {
            return Err(Error::KeyOrderingError {
                new_ts: ts,
                skew_ms,
                max_ts: inner.max_timestamp,
            });
        }

        let partial = inner.partial.take().expect("checked Some above");
        let needs_finalize = matches!(
            partial,
            PartialDataRow::WithPayload { .. } | PartialDataRow::WithSavepoint { .. }
        );
        let partial = if needs_finalize {
            let is_savepoint_row = matches!(partial, PartialDataRow::WithSavepoint { .. });
            let end = if is_savepoint_row {
                EndControl::SavepointContinue
            } else {
                EndControl::RowContinue
            };
            let (finalized, tail) = partial
                .finalize(end)
                .expect("row-continue end control is always legal for a row with a payload");
            self.write(&mut inner, tail, true)?;
            match finalized {
                Finalized::Data(row) => inner.rows.push(row),
                Finalized::Null(_) => {
                    unreachable!("add_row never finalizes the current row as null")
                }
            }
            let (fresh, prefix) = PartialDataRow::new(row_size, StartControl::Continuation);
            self.write(&mut inner, prefix, false)?;
            fresh
        } else {
            partial
        };

        let (partial, fragment) = partial
            .add_row(key, value)
            .expect("state, value length, and emptiness already validated above");
        self.write(&mut inner, fragment, false)?;
        inner.max_timestamp = inner.max_timestamp.max(ts);
        inner.partial = Some(partial);
        Ok(())
    }

    /// Marks the current row as a savepoint target for a later `rollback`.
    /// Emits no bytes by itself.
    ///
    /// # Errors
    ///
    /// `InvalidAction` if the transaction is inactive, tombstoned, the
    /// current row has no payload yet, or the transaction already holds 9
    /// savepoints.
    pub fn savepoint(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.tombstoned {
            return Err(Error::TombstonedError);
        }
        match &inner.partial {
            Some(PartialDataRow::WithPayload { .. }) => {}
            Some(_) => {
                return Err(Error::invalid_action(
                    "savepoint requires a row with a payload that is not already a savepoint",
                ));
            }
            None => {
                return Err(Error::invalid_action(
                    "cannot savepoint an empty transaction",
                ));
            }
        }
        let existing_savepoints = inner.rows.iter().filter(|r| r.end.is_savepoint()).count() as u8;
        if existing_savepoints >= MAX_SAVEPOINTS {
            return Err(Error::invalid_action(
                "transaction already holds 9 savepoints",
            ));
        }
        let partial = inner.partial.take().expect("checked WithPayload above");
        inner.partial = Some(
            partial
                .savepoint()
                .expect("already verified the partial has a payload"),
        );
        Ok(())
    }

    /// Rolls back to `savepoint_id` (`0` = full rollback) and terminates
    /// the transaction.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if `savepoint_id` is outside `0..=9` or exceeds the
    /// number of savepoints actually marked. `InvalidAction` if the
    /// transaction is inactive/already terminated. `TombstonedError` if a
    /// prior call already failed to write.
    pub fn rollback(&self, savepoint_id: u8) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.tombstoned {
            return Err(Error::TombstonedError);
        }
        if savepoint_id > 9 {
            return Err(Error::invalid_input("savepoint id must be in 0..=9"));
        }
        let pending_savepoint = matches!(inner.partial, Some(PartialDataRow::WithSavepoint { .. }));
        let existing_savepoints = inner.rows.iter().filter(|r| r.end.is_savepoint()).count() as u8
            + u8::from(pending_savepoint);
        if savepoint_id > 0 && savepoint_id > existing_savepoints {
            return Err(Error::invalid_input(format!(
                "savepoint {savepoint_id} does not exist; only {existing_savepoints} have been marked"
            )));
        }
        let partial = match inner.partial.take() {
            Some(p) => p,
            None => {
                return Err(Error::invalid_action(
                    "rollback requires an active transaction",
                ));
            }
        };

        let is_with_start_control = matches!(partial, PartialDataRow::WithStartControl { .. });
        if is_with_start_control && savepoint_id != 0 {
            inner.partial = Some(partial);
            return Err(Error::invalid_input(format!(
                "savepoint {savepoint_id} does not exist; transaction has no rows yet"
            )));
        }

        let is_savepoint_row = matches!(partial, PartialDataRow::WithSavepoint { .. });
        let end = if is_with_start_control {
            EndControl::NullRow
        } else if is_savepoint_row {
            EndControl::SavepointRollback(savepoint_id)
        } else {
            EndControl::Rollback(savepoint_id)
        };
        let (finalized, tail) = partial
            .finalize(end)
            .expect("rollback end control is always legal for the current state");
        self.write(&mut inner, tail, true)?;
        match finalized {
            Finalized::Null(n) => inner.null_row = Some(n),
            Finalized::Data(row) => inner.rows.push(row),
        }
        Ok(())
    }

    /// Commits the transaction, terminating it.
    ///
    /// # Errors
    ///
    /// `InvalidAction` if the transaction is inactive or already
    /// terminated. `TombstonedError` if a prior call already failed.
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.tombstoned {
            return Err(Error::TombstonedError);
        }
        let partial = match inner.partial.take() {
            Some(p) => p,
            None => return Err(Error::invalid_action("commit requires an active transaction")),
        };

        let end = if matches!(partial, PartialDataRow::WithStartControl { .. }) {
            EndControl::NullRow
        } else if matches!(partial, PartialDataRow::WithSavepoint { .. }) {
            EndControl::SavepointCommit
        } else {
            EndControl::Commit
        };
        let (finalized, tail) = partial
            .finalize(end)
            .expect("commit end control is always legal for the current state");
        self.write(&mut inner, tail, true)?;
        match finalized {
            Finalized::Null(n) => inner.null_row = Some(n),
            Finalized::Data(row) => inner.rows.push(row),
        }
        Ok(())
    }

    /// The committed subset of this transaction's rows, as a fresh, finite,
    /// non-restartable iterator.
    pub fn committed_rows(&self) -> std::vec::IntoIter<(Uuid, Vec<u8>)> {
        let inner = self.inner.lock();
        let visible: Vec<(Uuid, Vec<u8>)> = visibility::committed_rows(&inner.rows)
            .map(|row| (row.key, row.value.clone()))
            .collect();
        visible.into_iter()
    }

    /// `true` iff `rows` ends in a terminating end-control, or the
    /// transaction committed as an empty/null row.
    pub fn is_committed(&self) -> bool {
        let inner = self.inner.lock();
        inner.null_row.is_some()
            || inner
                .rows
                .last()
                .map(|row| row.end.is_terminating())
                .unwrap_or(false)
    }

    /// Positions of the rows that marked a savepoint.
    pub fn savepoint_indices(&self) -> Vec<usize> {
        let inner = self.inner.lock();
        inner
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.end.is_savepoint())
            .map(|(i, _)| i)
            .collect()
    }

    fn write(&self, inner: &mut Inner, bytes: Vec<u8>, finalizes_row: bool) -> Result<()> {
        match self.file_manager.submit(bytes, finalizes_row) {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.tombstones() {
                    inner.tombstoned = true;
                }
                Err(e)
            }
        }
    }
}

fn validate_key(key: &Uuid) -> Result<()> {
    if key.is_nil() {
        return Err(Error::invalid_input("key must not be the nil UUID"));
    }
    if key.get_version_num() != 7 {
        return Err(Error::invalid_input("key must be a UUIDv7"));
    }
    Ok(())
}

/// Extracts the 48-bit Unix-ms prefix embedded in a UUIDv7.
fn uuidv7_timestamp_ms(key: &Uuid) -> u64 {
    let bytes = key.as_bytes();
    let mut buf = [0u8; 8];
    buf[2..8].copy_from_slice(&bytes[0..6]);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_checksum_row;
    use crate::config::FrozenDbConfig;
    use crate::file_manager::Mode;
    use crate::header::Header;
    use crate::io::test_support::MemFilesystem;
    use crate::io::{DataFile, Filesystem};
    use pretty_assertions::assert_eq;
    use std::path::Path;

    const ROW_SIZE: u32 = 512;

    fn key_at_ms(ms: u64) -> Uuid {
        let mut bytes = [0u8; 16];
        bytes[0..6].copy_from_slice(&ms.to_be_bytes()[2..8]);
        bytes[6] = 0x70; // version nibble 7
        bytes[8] = 0x80; // RFC 4122 variant
        Uuid::from_bytes(bytes)
    }

    fn provision(fs: &MemFilesystem, path: &Path, skew_ms: u64) {
        let header = Header::new(ROW_SIZE, skew_ms).unwrap();
        let header_bytes = header.marshal();
        let mut file = fs.create_new(path).unwrap();
        file.append(&header_bytes).unwrap();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header_bytes);
        let checksum_row = encode_checksum_row(ROW_SIZE, hasher.finalize()).unwrap();
        file.append(&checksum_row).unwrap();
    }

    fn open_write(fs: MemFilesystem, path: &Path) -> Arc<FileManager<MemFilesystem>> {
        Arc::new(
            FileManager::open_with(path, Mode::Write, FrozenDbConfig::default(), fs).unwrap(),
        )
    }

    #[test]
    fn single_row_commit() {
        let fs = MemFilesystem::new();
        let path = Path::new("/db");
        provision(&fs, path, 5000);
        let fm = open_write(fs, path);
        let size_before = fm.size();

        let tx = Transaction::new(fm.clone());
        tx.begin().unwrap();
        let key = key_at_ms(1000);
        tx.add_row(key, b"{\"name\":\"John\"}").unwrap();
        tx.commit().unwrap();

        assert_eq!(fm.size() - size_before, ROW_SIZE as u64);
        let rows: Vec<_> = tx.committed_rows().collect();
        assert_eq!(rows, vec![(key, b"{\"name\":\"John\"}".to_vec())]);
        assert!(tx.is_committed());
    }

    #[test]
    fn empty_commit() {
        let fs = MemFilesystem::new();
        let path = Path::new("/db");
        provision(&fs, path, 5000);
        let fm = open_write(fs, path);

        let tx = Transaction::new(fm);
        tx.begin().unwrap();
        tx.commit().unwrap();

        assert_eq!(tx.committed_rows().count(), 0);
        assert!(tx.is_committed());
    }

    #[test]
    fn partial_rollback() {
        let fs = MemFilesystem::new();
        let path = Path::new("/db");
        provision(&fs, path, 5000);
        let fm = open_write(fs, path);

        let tx = Transaction::new(fm);
        tx.begin().unwrap();
        let k1 = key_at_ms(1000);
        tx.add_row(k1, b"a").unwrap();
        tx.savepoint().unwrap();
        tx.add_row(key_at_ms(1001), b"b").unwrap();
        tx.add_row(key_at_ms(1002), b"c").unwrap();
        tx.rollback(1).unwrap();

        let rows: Vec<_> = tx.committed_rows().collect();
        assert_eq!(rows, vec![(k1, b"a".to_vec())]);
        assert_eq!(tx.savepoint_indices(), vec![0]);
    }

    #[test]
    fn full_rollback_with_savepoint() {
        let fs = MemFilesystem::new();
        let path = Path::new("/db");
        provision(&fs, path, 5000);
        let fm = open_write(fs, path);

        let tx = Transaction::new(fm);
        tx.begin().unwrap();
        tx.add_row(key_at_ms(1000), b"a").unwrap();
        tx.savepoint().unwrap();
        tx.rollback(0).unwrap();

        assert_eq!(tx.committed_rows().count(), 0);
        assert!(tx.is_committed());
    }

    #[test]
    fn monotonic_key_violation() {
        let fs = MemFilesystem::new();
        let path = Path::new("/db");
        provision(&fs, path, 0);
        let fm = open_write(fs, path);

        let tx = Transaction::new(fm);
        tx.begin().unwrap();
        tx.add_row(key_at_ms(1000), b"a").unwrap();
        let err = tx.add_row(key_at_ms(999), b"b").unwrap_err();
        assert!(matches!(err, Error::KeyOrderingError { .. }));
        assert_eq!(tx.committed_rows().count(), 0);
    }

    #[test]
    fn rejects_begin_twice() {
        let fs = MemFilesystem::new();
        let path = Path::new("/db");
        provision(&fs, path, 5000);
        let fm = open_write(fs, path);

        let tx = Transaction::new(fm);
        tx.begin().unwrap();
        assert!(tx.begin().is_err());
    }

    #[test]
    fn rejects_commit_without_begin() {
        let fs = MemFilesystem::new();
        let path = Path::new("/db");
        provision(&fs, path, 5000);
        let fm = open_write(fs, path);

        let tx = Transaction::new(fm);
        assert!(tx.commit().is_err());
    }

    #[test]
    fn rejects_non_v7_key() {
        let fs = MemFilesystem::new();
        let path = Path::new("/db");
        provision(&fs, path, 5000);
        let fm = open_write(fs, path);

        let tx = Transaction::new(fm);
        tx.begin().unwrap();
        let err = tx.add_row(Uuid::new_v4(), b"a").unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }));
    }

    #[test]
    fn write_failure_tombstones() {
        let fs = MemFilesystem::new();
        let path = Path::new("/db");
        provision(&fs, path, 5000);
        fs.fail_nth_append(1, std::io::ErrorKind::PermissionDenied);
        let fm = open_write(fs, path);

        let tx = Transaction::new(fm);
        let err = tx.begin().unwrap_err();
        assert!(matches!(err, Error::WriteError { .. }));

        assert!(matches!(tx.begin(), Err(Error::TombstonedError)));
        assert!(matches!(
            tx.add_row(key_at_ms(1000), b"a"),
            Err(Error::TombstonedError)
        ));
        assert!(matches!(tx.commit(), Err(Error::TombstonedError)));
        assert_eq!(tx.committed_rows().count(), 0);
    }

    #[test]
    fn crosses_a_row_boundary_with_multiple_add_rows() {
        let fs = MemFilesystem::new();
        let path = Path::new("/db");
        provision(&fs, path, 5000);
        let fm = open_write(fs, path);
        let size_before = fm.size();

        let tx = Transaction::new(fm.clone());
        tx.begin().unwrap();
        tx.add_row(key_at_ms(1000), b"a").unwrap();
        tx.add_row(key_at_ms(1001), b"b").unwrap();
        tx.commit().unwrap();

        assert_eq!(fm.size() - size_before, 2 * ROW_SIZE as u64);
        let rows: Vec<_> = tx.committed_rows().collect();
        assert_eq!(rows.len(), 2);
    }
}
