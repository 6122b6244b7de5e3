//! `PartialDataRow`: a 3-state builder that emits incremental byte runs
//! instead of mutating a row in place.
//!
//! Each transition consumes `self` and returns the next state plus the bytes
//! the caller must submit to the `FileManager`. There is no way to observe
//! an intermediate state twice, which is what makes the byte-accounting
//! invariant hold by construction.

use uuid::Uuid;

use crate::codec::{
    encode_data_row, encode_null_row, max_value_len, DataRow, EndControl, NullRow, StartControl,
    ROW_START,
};
use crate::error::{Error, Result};

/// The row a [`PartialDataRow`] finalizes into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finalized {
    Data(DataRow),
    Null(NullRow),
}

/// The incremental builder for one row of a transaction.
#[derive(Debug, Clone)]
pub enum PartialDataRow {
    /// Only `ROW_START` and `start_control` are known.
    WithStartControl { row_size: u32, start: StartControl },
    /// The full payload (key + value) is known; no savepoint has been
    /// marked on this row yet.
    WithPayload {
        row_size: u32,
        start: StartControl,
        key: Uuid,
        value: Vec<u8>,
    },
    /// As `WithPayload`, but a [`PartialDataRow::savepoint`] call requires
    /// this row's finalization to use an `S`-family end control.
    WithSavepoint {
        row_size: u32,
        start: StartControl,
        key: Uuid,
        value: Vec<u8>,
    },
}

impl PartialDataRow {
    /// Starts a new partial row. Returns the builder and the 2-byte prefix
    /// (`ROW_START`, `start_control`) that must be submitted to the writer.
    pub fn new(row_size: u32, start: StartControl) -> (Self, Vec<u8>) {
        let prefix = vec![ROW_START, start.to_byte()];
        (PartialDataRow::WithStartControl { row_size, start }, prefix)
    }

    /// How many bytes of this row have been submitted to the writer so far.
    pub fn bytes_written(&self) -> usize {
        match self {
            PartialDataRow::WithStartControl { .. } => 2,
            PartialDataRow::WithPayload { row_size, .. }
            | PartialDataRow::WithSavepoint { row_size, .. } => *row_size as usize - 5,
        }
    }

    /// `WithStartControl -> WithPayload`. Returns the new state and the
    /// `row_size - 7` bytes of base64 key, value, and NUL padding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAction`] if this partial row already has a
    /// payload. Returns [`Error::InvalidInput`] if `value` is empty or too
    /// large for `row_size`.
    pub fn add_row(self, key: Uuid, value: &[u8]) -> Result<(Self, Vec<u8>)> {
        let (row_size, start) = match self {
            PartialDataRow::WithStartControl { row_size, start } => (row_size, start),
            PartialDataRow::WithPayload { .. } | PartialDataRow::WithSavepoint { .. } => {
                return Err(Error::invalid_action(
                    "add_row called on a partial row that already has a payload",
                ));
            }
        };
        if value.is_empty() {
            return Err(Error::invalid_input("value must not be empty"));
        }
        let limit = max_value_len(row_size);
        if value.len() > limit {
            return Err(Error::invalid_input(format!(
                "value length {} exceeds the maximum of {limit} bytes for row_size {row_size}",
                value.len()
            )));
        }

        // Reuse the codec's own encoder to guarantee the emitted bytes are
        // byte-identical to what `decode` will later accept; slice out the
        // payload region rather than hand-rolling base64 + padding again.
        let placeholder = encode_data_row(row_size, start, EndControl::RowContinue, &key, value)?;
        let fragment = placeholder[2..row_size as usize - 5].to_vec();

        Ok((
            PartialDataRow::WithPayload {
                row_size,
                start,
                key,
                value: value.to_vec(),
            },
            fragment,
        ))
    }

    /// `WithPayload -> WithSavepoint`. Emits no bytes: the savepoint is only
    /// recorded on disk by the `S`-family end control this row eventually
    /// finalizes with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAction`] if there is no payload yet (the
    /// caller must `add_row` before marking a savepoint).
    pub fn savepoint(self) -> Result<Self> {
        match self {
            PartialDataRow::WithPayload {
                row_size,
                start,
                key,
                value,
            } => Ok(PartialDataRow::WithSavepoint {
                row_size,
                start,
                key,
                value,
            }),
            PartialDataRow::WithStartControl { .. } => Err(Error::invalid_action(
                "cannot savepoint an empty transaction",
            )),
            PartialDataRow::WithSavepoint { .. } => Ok(self),
        }
    }

    /// Finalizes this partial row with `end`. Returns the finalized row and
    /// the final byte run (5 bytes from `WithPayload`/`WithSavepoint`;
    /// `row_size - 2` bytes, i.e. a full `NullRow`'s tail, from
    /// `WithStartControl`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAction`] if `end` is not legal for the
    /// current state (only [`EndControl::NullRow`] is legal from
    /// `WithStartControl`; [`EndControl::NullRow`] is never legal once a
    /// payload exists).
    pub fn finalize(self, end: EndControl) -> Result<(Finalized, Vec<u8>)> {
        match self {
            PartialDataRow::WithStartControl { row_size, .. } => {
                if end != EndControl::NullRow {
                    return Err(Error::invalid_action(
                        "an empty transaction can only finalize as a null row",
                    ));
                }
                let full = encode_null_row(row_size)?;
                let tail = full[2..].to_vec();
                Ok((Finalized::Null(NullRow), tail))
            }
            PartialDataRow::WithPayload {
                row_size,
                start,
                key,
                value,
            }
            | PartialDataRow::WithSavepoint {
                row_size,
                start,
                key,
                value,
            } => {
                if end == EndControl::NullRow {
                    return Err(Error::invalid_action(
                        "a row with a payload cannot finalize as a null row",
                    ));
                }
                let full = encode_data_row(row_size, start, end, &key, &value)?;
                let tail = full[row_size as usize - 5..].to_vec();
                Ok((
                    Finalized::Data(DataRow {
                        start,
                        end,
                        key,
                        value,
                    }),
                    tail,
                ))
            }
        }
    }
}
