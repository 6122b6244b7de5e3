//! `FileManager`: open/validate/lock lifecycle, a single background append
//! worker, and positional reads. Embeds the checksum engine directly in the
//! append path.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::checksum::ChecksumEngine;
use crate::codec::{self, Row};
use crate::config::FrozenDbConfig;
use crate::error::{CorruptKind, Error, Result};
use crate::header::{Header, HEADER_LEN};
use crate::io::{DataFile, Filesystem, ProductionFilesystem};

/// `read` or `write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

impl Mode {
    /// Parses the lowercase mode constants.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for anything other than `"read"` or
    /// `"write"`.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "read" => Ok(Mode::Read),
            "write" => Ok(Mode::Write),
            other => Err(Error::invalid_input(format!(
                "unknown open mode {other:?}; expected \"read\" or \"write\""
            ))),
        }
    }
}

struct WriteRequest {
    bytes: Vec<u8>,
    finalizes_row: bool,
    reply: mpsc::Sender<Result<()>>,
}

struct WriterHandle {
    sender: Option<mpsc::Sender<WriteRequest>>,
    join: Option<thread::JoinHandle<()>>,
}

/// Open/validate/lock lifecycle, background writer, positional reads.
///
/// Generic over [`Filesystem`] so tests can substitute an in-memory double;
/// [`FileManager::open`] is the production entry point fixed to
/// [`ProductionFilesystem`].
pub struct FileManager<FS: Filesystem = ProductionFilesystem> {
    read_file: FS::File,
    header: Header,
    size: Arc<AtomicU64>,
    writer: Mutex<Option<WriterHandle>>,
    lock: Mutex<Option<fslock::LockFile>>,
    closed: AtomicBool,
}

impl FileManager<ProductionFilesystem> {
    /// Opens `path` in `mode` using the real filesystem.
    pub fn open(path: impl AsRef<Path>, mode: Mode) -> Result<Self> {
        Self::open_with(path, mode, FrozenDbConfig::default(), ProductionFilesystem)
    }

    /// As [`FileManager::open`], with an explicit [`FrozenDbConfig`].
    pub fn open_with_config(
        path: impl AsRef<Path>,
        mode: Mode,
        config: FrozenDbConfig,
    ) -> Result<Self> {
        Self::open_with(path, mode, config, ProductionFilesystem)
    }
}

impl<FS: Filesystem> FileManager<FS> {
    /// Opens `path` in `mode` against an arbitrary [`Filesystem`].
    ///
    /// # Errors
    ///
    /// `PathError` if the file does not exist. A discriminated
    /// `CorruptDatabase` sub-kind if the header or bootstrap checksum row
    /// fails validation. `WriteError` if `mode` is [`Mode::Write`] and the
    /// exclusive lock cannot be acquired within `config.max_open_retries`
    /// attempts.
    pub fn open_with(path: impl AsRef<Path>, mode: Mode, config: FrozenDbConfig, fs: FS) -> Result<Self> {
        let path = path.as_ref();
        if !fs.exists(path) {
            return Err(Error::path_error(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let read_file = fs
            .open(path, false)
            .map_err(|e| Error::read_error("open for reading", e))?;

        let mut header_bytes = [0u8; HEADER_LEN];
        read_file
            .read_at(0, &mut header_bytes)
            .map_err(|e| Error::read_error("header", e))?;
        let header = Header::parse(&header_bytes)?;
        debug!(row_size = header.row_size(), skew_ms = header.skew_ms(), "header validated");

        let size = read_file
            .len()
            .map_err(|e| Error::read_error("size", e))?;
        if size < HEADER_LEN as u64 + u64::from(header.row_size()) {
            return Err(Error::corrupt(CorruptKind::ShortFile));
        }

        let mut bootstrap_bytes = vec![0u8; header.row_size() as usize];
        read_file
            .read_at(HEADER_LEN as u64, &mut bootstrap_bytes)
            .map_err(|e| Error::read_error("bootstrap checksum row", e))?;
        verify_bootstrap_checksum(header.row_size(), &bootstrap_bytes, &header_bytes)?;

        let writer = match mode {
            Mode::Read => None,
            Mode::Write => {
                let lock = acquire_lock(path, config.max_open_retries)?;
                let engine = replay(&read_file, &header, size)?;
                let write_file = fs
                    .open(path, true)
                    .map_err(|e| Error::write_error("open for writing", e))?;
                let size_handle = Arc::new(AtomicU64::new(size));
                let (sender, receiver) = mpsc::channel();
                let join = spawn_writer(
                    write_file,
                    header.row_size(),
                    engine,
                    config.sync_on_append,
                    Arc::clone(&size_handle),
                    receiver,
                );
                Some((
                    WriterHandle {
                        sender: Some(sender),
                        join: Some(join),
                    },
                    lock,
                    size_handle,
                ))
            }
        };

        let (writer_handle, lock, size_handle) = match writer {
            Some((w, l, s)) => (Some(w), Some(l), s),
            None => (None, None, Arc::new(AtomicU64::new(size))),
        };

        Ok(Self {
            read_file,
            header,
            size: size_handle,
            writer: Mutex::new(writer_handle),
            lock: Mutex::new(lock),
            closed: AtomicBool::new(false),
        })
    }

    pub fn header(&self) -> Header {
        self.header
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    /// Positional read of exactly `len` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadError`] if `offset + len` exceeds the current
    /// file size or the underlying read fails.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let size = self.size();
        if offset.saturating_add(len as u64) > size {
            return Err(Error::read_error(
                "read beyond file size",
                io::Error::new(io::ErrorKind::UnexpectedEof, "read beyond file size"),
            ));
        }
        let mut buf = vec![0u8; len];
        self.read_file
            .read_at(offset, &mut buf)
            .map_err(|e| Error::read_error("read", e))?;
        Ok(buf)
    }

    /// Submits a byte run to the background writer and blocks for the
    /// reply. `finalizes_row` marks a fragment that carries a row's
    /// trailing `ROW_END`, which is what drives checksum-boundary
    /// insertion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAction`] if this `FileManager` was opened in
    /// read mode. Returns [`Error::WriteError`] if the writer has been
    /// closed or the underlying append failed.
    pub(crate) fn submit(&self, bytes: Vec<u8>, finalizes_row: bool) -> Result<()> {
        let guard = self.writer.lock();
        let handle = guard
            .as_ref()
            .ok_or_else(|| Error::invalid_action("file was not opened in write mode"))?;
        let sender = handle.sender.as_ref().ok_or_else(|| {
            Error::write_error(
                "closed",
                io::Error::new(io::ErrorKind::BrokenPipe, "file manager is closed"),
            )
        })?;

        let (reply_tx, reply_rx) = mpsc::channel();
        trace!(bytes = bytes.len(), finalizes_row, "submitting write request");
        sender
            .send(WriteRequest {
                bytes,
                finalizes_row,
                reply: reply_tx,
            })
            .map_err(|_| {
                Error::write_error(
                    "closed",
                    io::Error::new(io::ErrorKind::BrokenPipe, "writer thread exited"),
                )
            })?;

        reply_rx.recv().map_err(|_| {
            Error::write_error(
                "closed",
                io::Error::new(io::ErrorKind::BrokenPipe, "writer thread exited"),
            )
        })?
    }

    /// Idempotent; safe to call from multiple threads. Drains the writer,
    /// releases the lock.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("closing file manager");
        if let Some(handle) = self.writer.lock().take() {
            drop(handle.sender);
            if let Some(join) = handle.join {
                let _ = join.join();
            }
        }
        drop(self.lock.lock().take());
        Ok(())
    }
}

impl<FS: Filesystem> Drop for FileManager<FS> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn verify_bootstrap_checksum(row_size: u32, bootstrap_bytes: &[u8], header_bytes: &[u8]) -> Result<()> {
    let row = codec::decode(row_size, bootstrap_bytes)?;
    let checksum = match row {
        Row::Checksum(c) => c,
        _ => return Err(Error::corrupt(CorruptKind::BadFrame)),
    };
    if !crate::checksum::verify(&checksum, header_bytes) {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(header_bytes);
        return Err(Error::corrupt(CorruptKind::ChecksumMismatch {
            expected: checksum.crc32,
            computed: hasher.finalize(),
        }));
    }
    Ok(())
}

/// Rebuilds the checksum engine's running hash and finalized-row countdown
/// by replaying every full row already on disk. A one-time O(file size)
/// cost paid once at `open`, never again.
fn replay<F: DataFile>(file: &F, header: &Header, size: u64) -> Result<ChecksumEngine> {
    let row_size = u64::from(header.row_size());
    let mut hasher = crc32fast::Hasher::new();

    let mut header_bytes = [0u8; HEADER_LEN];
    file.read_at(0, &mut header_bytes)
        .map_err(|e| Error::read_error("replay header", e))?;
    hasher.update(&header_bytes);

    let mut rows_since_checksum: u32 = 0;
    let mut offset = HEADER_LEN as u64;
    while offset + row_size <= size {
        let mut row_bytes = vec![0u8; row_size as usize];
        file.read_at(offset, &mut row_bytes)
            .map_err(|e| Error::read_error("replay row", e))?;
        hasher.update(&row_bytes);

        match codec::decode(header.row_size(), &row_bytes)? {
            Row::Checksum(_) => rows_since_checksum = 0,
            Row::Data(_) | Row::Null(_) => rows_since_checksum += 1,
        }
        offset += row_size;
    }

    Ok(ChecksumEngine::from_parts(hasher, rows_since_checksum))
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut lock_path = path.as_os_str().to_owned();
    lock_path.push(".lock");
    PathBuf::from(lock_path)
}

fn acquire_lock(path: &Path, max_attempts: u32) -> Result<fslock::LockFile> {
    let lock_path = lock_path_for(path);
    let mut last_err = None;
    for attempt in 0..max_attempts {
        let mut lock = fslock::LockFile::open(&lock_path)
            .map_err(|e| Error::write_error("open lock file", e))?;
        match lock.try_lock() {
            Ok(true) => return Ok(lock),
            Ok(false) => {
                warn!(attempt, "database is locked for writing by another handle");
                last_err = Some(Error::write_error(
                    "lock",
                    io::Error::new(io::ErrorKind::WouldBlock, "database is locked for writing"),
                ));
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(Error::write_error("lock", e)),
        }
    }
    Err(last_err.expect("loop runs at least once since max_attempts >= 1"))
}

fn spawn_writer<F: DataFile>(
    mut file: F,
    row_size: u32,
    mut engine: ChecksumEngine,
    sync_on_append: bool,
    size: Arc<AtomicU64>,
    receiver: mpsc::Receiver<WriteRequest>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while let Ok(request) = receiver.recv() {
            let result = append_request(&mut file, row_size, &mut engine, sync_on_append, &size, &request);
            let _ = request.reply.send(result);
        }
    })
}

fn append_request<F: DataFile>(
    file: &mut F,
    row_size: u32,
    engine: &mut ChecksumEngine,
    sync_on_append: bool,
    size: &AtomicU64,
    request: &WriteRequest,
) -> Result<()> {
    engine.observe_append(&request.bytes);
    file.append(&request.bytes)
        .map_err(|e| Error::write_error("append", e))?;
    size.fetch_add(request.bytes.len() as u64, Ordering::SeqCst);

    if request.finalizes_row {
        if let Some(checksum_row) = engine.on_row_finalized(row_size)? {
            file.append(&checksum_row)
                .map_err(|e| Error::write_error("checksum row append", e))?;
            size.fetch_add(checksum_row.len() as u64, Ordering::SeqCst);
        }
    }

    if sync_on_append {
        file.sync_all().map_err(|e| Error::write_error("fsync", e))?;
    }

    Ok(())
}
