//! The filesystem abstraction `FileManager` is built on.
//!
//! A trait boundary between the append/read logic and the actual syscalls
//! lets tests inject I/O failures and check for descriptor leaks without
//! touching a real disk. The production implementation is a thin wrapper
//! over `std::fs::File` using positional I/O so reads never disturb the
//! file's append cursor.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// A single open data file, abstracted for testability.
///
/// Implementors need not be `Clone`; `FileManager` holds exactly one per
/// `Handle` and never shares it across threads except via its own request
/// channel.
pub trait DataFile: Send + 'static {
    /// Reads exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Appends `bytes` to the end of the file. Implementations must never
    /// seek backward; this is the only mutation path.
    fn append(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Flushes to stable storage.
    fn sync_all(&self) -> io::Result<()>;

    /// Current length in bytes.
    fn len(&self) -> io::Result<u64>;
}

/// A filesystem capable of opening [`DataFile`]s, abstracted so tests can
/// substitute an in-memory or fault-injecting implementation.
pub trait Filesystem: Send + Sync + 'static {
    type File: DataFile;

    /// Opens an existing file. `writable` additionally opens it for append.
    fn open(&self, path: &Path, writable: bool) -> io::Result<Self::File>;

    /// Creates a new, empty file; fails if one already exists at `path`.
    fn create_new(&self, path: &Path) -> io::Result<Self::File>;

    /// `true` if a file exists at `path`.
    fn exists(&self, path: &Path) -> bool;
}

/// The production [`Filesystem`], backed directly by `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProductionFilesystem;

impl Filesystem for ProductionFilesystem {
    type File = StdDataFile;

    fn open(&self, path: &Path, writable: bool) -> io::Result<Self::File> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .append(writable)
            .open(path)?;
        Ok(StdDataFile { file })
    }

    fn create_new(&self, path: &Path) -> io::Result<Self::File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .append(true)
            .create_new(true)
            .open(path)?;
        Ok(StdDataFile { file })
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// A [`DataFile`] backed by a real `std::fs::File`, using `pread`/`O_APPEND`
/// so positional reads never race the writer's append cursor.
#[derive(Debug)]
pub struct StdDataFile {
    file: File,
}

impl DataFile for StdDataFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes)
    }

    fn sync_all(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}
