//! The closed error taxonomy.
//!
//! Every fallible operation in this crate returns one of the kinds below.
//! Errors are returned, never panicked: the only `unwrap`/`expect` calls
//! left in non-test code guard invariants that a prior validation step has
//! already made unreachable, and each such call is commented as such.

use std::io;

use snafu::Snafu;

/// Discriminated sub-kinds of [`Error::CorruptDatabase`].
///
/// Splitting these out lets callers match on *why* the database was judged
/// corrupt (bad header vs. bad row vs. bad checksum) without string
/// matching on a `Display` message.
#[derive(Debug, Snafu)]
pub enum CorruptKind {
    #[snafu(display("header is not valid JSON: {source}"))]
    MalformedJson { source: serde_json::Error },

    #[snafu(display("header signature does not equal \"fDB\""))]
    BadSignature,

    #[snafu(display("header version is not 1"))]
    BadVersion,

    #[snafu(display("header row_size {row_size} is out of range [128, 65536]"))]
    RowSizeOutOfRange { row_size: u64 },

    #[snafu(display("header skew_ms {skew_ms} is out of range [0, 86400000]"))]
    SkewOutOfRange { skew_ms: u64 },

    #[snafu(display("header is missing its NUL terminator"))]
    MissingTerminator,

    #[snafu(display("header padding contains a non-NUL byte before byte 63"))]
    BadPadding,

    #[snafu(display("header byte 63 is not a newline"))]
    MissingNewline,

    #[snafu(display("row is missing ROW_START or ROW_END framing bytes"))]
    BadFrame,

    #[snafu(display("unknown row start control byte {byte:#04x}"))]
    UnknownStartControl { byte: u8 },

    #[snafu(display("unknown row end control bytes {b0:#04x} {b1:#04x}"))]
    UnknownEndControl { b0: u8, b1: u8 },

    #[snafu(display("LRC parity mismatch: row says {expected:02X}, computed {computed:02X}"))]
    ParityMismatch { expected: u8, computed: u8 },

    #[snafu(display(
        "checksum row mismatch: row says {expected:#010x}, computed {computed:#010x}"
    ))]
    ChecksumMismatch { expected: u32, computed: u32 },

    #[snafu(display("row key is not a valid base64-encoded UUID"))]
    BadUuid,

    #[snafu(display("data row value is not NUL-terminated before the padding region"))]
    MissingValueTerminator,

    #[snafu(display("file is shorter than the header plus bootstrap checksum row"))]
    ShortFile,
}

/// The closed set of error kinds this crate returns.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// Caller violated a precondition: bad UUID, empty value, out-of-range
    /// savepoint id, oversize value, bad mode string, bad path.
    #[snafu(display("invalid input: {reason}"))]
    InvalidInput { reason: String },

    /// State-machine violation: Begin on a non-empty transaction, Commit on
    /// an inactive/committed transaction, Savepoint on an empty
    /// transaction, more than 100 rows, more than 9 savepoints, etc.
    #[snafu(display("invalid action: {reason}"))]
    InvalidAction { reason: String },

    /// An on-disk invariant was violated.
    #[snafu(display("corrupt database: {source}"))]
    CorruptDatabase { source: CorruptKind },

    /// Lock contention or disk I/O failure during append.
    #[snafu(display("write error ({reason}): {source}"))]
    WriteError { reason: String, source: io::Error },

    /// Positional read beyond file size, or an OS failure.
    #[snafu(display("read error ({reason}): {source}"))]
    ReadError { reason: String, source: io::Error },

    /// Filesystem-level path issue: file does not exist, parent does not
    /// exist, or similar.
    #[snafu(display("path error: {reason}"))]
    PathError { reason: String },

    /// `new_ts + skew_ms <= max_timestamp`.
    #[snafu(display(
        "key ordering violated: {new_ts} + {skew_ms} <= {max_ts}"
    ))]
    KeyOrderingError {
        new_ts: u64,
        skew_ms: u64,
        max_ts: u64,
    },

    /// Used by the read side when a key cannot be located.
    #[snafu(display("key not found"))]
    KeyNotFoundError,

    /// Every public call on a transaction after its first write failure.
    #[snafu(display("transaction is tombstoned"))]
    TombstonedError,

    /// Used by the read side when resolving a transaction whose terminator
    /// is not yet on disk.
    #[snafu(display("transaction is still active"))]
    TransactionActiveError,
}

impl Error {
    pub(crate) fn invalid_input(reason: impl Into<String>) -> Self {
        Error::InvalidInput {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_action(reason: impl Into<String>) -> Self {
        Error::InvalidAction {
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt(kind: CorruptKind) -> Self {
        Error::CorruptDatabase { source: kind }
    }

    pub(crate) fn write_error(reason: impl Into<String>, source: io::Error) -> Self {
        Error::WriteError {
            reason: reason.into(),
            source,
        }
    }

    pub(crate) fn read_error(reason: impl Into<String>, source: io::Error) -> Self {
        Error::ReadError {
            reason: reason.into(),
            source,
        }
    }

    pub(crate) fn path_error(reason: impl Into<String>) -> Self {
        Error::PathError {
            reason: reason.into(),
        }
    }

    /// `true` for the kinds that tombstone a transaction: any failure of
    /// the underlying write channel.
    pub(crate) fn tombstones(&self) -> bool {
        matches!(self, Error::WriteError { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
