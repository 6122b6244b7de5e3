//! `frozendb`: an embedded, append-only, single-writer / multi-reader
//! key-value store.
//!
//! A database is one file: a 64-byte JSON header, a sequence of fixed-size
//! rows, and periodic `ChecksumRow`s inserted automatically every 10,000
//! finalized data rows. Keys are UUIDv7 values that must be monotonically
//! non-decreasing within a configured skew. Values are opaque byte payloads
//! (intended to be JSON). Writers mutate the file exclusively through
//! bracketed transactions that may commit, roll back fully, or roll back to
//! a savepoint.
//!
//! ```no_run
//! use frozendb::Handle;
//! use uuid::Uuid;
//!
//! frozendb::create("db.frozen", 512, 5_000)?;
//! let handle = Handle::open("db.frozen", "write")?;
//! let tx = handle.begin_transaction()?;
//! tx.add_row(Uuid::now_v7(), br#"{"name":"John"}"#)?;
//! tx.commit()?;
//! # Ok::<(), frozendb::Error>(())
//! ```

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

mod checksum;
mod codec;
mod config;
mod create;
mod error;
mod file_manager;
mod finder;
mod handle;
mod header;
mod io;
mod partial;
mod transaction;
mod visibility;

pub use codec::{max_value_len, row_size_for, DataRow, EndControl, StartControl};
pub use config::{FrozenDbConfig, FrozenDbConfigBuilder};
pub use create::create;
pub use error::{CorruptKind, Error, Result};
pub use file_manager::Mode;
pub use finder::{Finder, TransactionBounds};
pub use handle::Handle;
pub use header::Header;
pub use transaction::Transaction;
