//! `Handle`: the top-level `open/close/begin_transaction` surface wrapping
//! one `FileManager`.

use std::path::Path;
use std::sync::Arc;

use crate::config::FrozenDbConfig;
use crate::error::{Error, Result};
use crate::file_manager::{FileManager, Mode};
use crate::finder::Finder;
use crate::io::{Filesystem, ProductionFilesystem};
use crate::transaction::Transaction;

/// A database opened in `read` or `write` mode.
///
/// Cloning the underlying `FileManager` handle is not exposed; each
/// `Handle` owns it via `Arc` so `Transaction`s it vends can outlive a
/// `begin_transaction` call without borrowing from `self`.
pub struct Handle<FS: Filesystem = ProductionFilesystem> {
    file_manager: Arc<FileManager<FS>>,
    mode: Mode,
}

impl Handle<ProductionFilesystem> {
    /// Opens `path` in `mode` (`"read"` or `"write"`) using the real
    /// filesystem, with the default [`FrozenDbConfig`].
    pub fn open(path: impl AsRef<Path>, mode: &str) -> Result<Self> {
        Self::open_with_config(path, mode, FrozenDbConfig::default())
    }

    /// As [`Handle::open`], with an explicit [`FrozenDbConfig`].
    pub fn open_with_config(path: impl AsRef<Path>, mode: &str, config: FrozenDbConfig) -> Result<Self> {
        let mode = Mode::parse(mode)?;
        Self::open_with(path, mode, config, ProductionFilesystem)
    }
}

impl<FS: Filesystem> Handle<FS> {
    pub(crate) fn open_with(path: impl AsRef<Path>, mode: Mode, config: FrozenDbConfig, fs: FS) -> Result<Self> {
        let file_manager = Arc::new(FileManager::open_with(path, mode, config, fs)?);
        Ok(Self { file_manager, mode })
    }

    /// Idempotent; drains the writer and releases the lock.
    pub fn close(&self) -> Result<()> {
        self.file_manager.close()
    }

    /// Begins a new [`Transaction`] against this handle's `FileManager`.
    ///
    /// # Errors
    ///
    /// `InvalidAction` if this handle was opened in read mode. Otherwise
    /// propagates whatever `Transaction::begin` returns for a failed first
    /// write (the handle itself remains usable; only the returned
    /// transaction, if any, would be tombstoned — but on failure no
    /// transaction is returned at all).
    pub fn begin_transaction(&self) -> Result<Transaction<FS>> {
        if self.mode != Mode::Write {
            return Err(Error::invalid_action(
                "begin_transaction requires a handle opened in write mode",
            ));
        }
        let tx = Transaction::new(Arc::clone(&self.file_manager));
        tx.begin()?;
        Ok(tx)
    }

    /// A read-side [`Finder`] over this handle's `FileManager`. Available in
    /// either open mode, since it only issues positional reads.
    pub fn finder(&self) -> Finder<FS> {
        Finder::new(Arc::clone(&self.file_manager))
    }
}
