//! The commit-visibility resolver: given a transaction's finalized rows,
//! compute which prefix — if any — is logically committed under arbitrary
//! savepoint/rollback interleavings.

use crate::codec::{DataRow, EndControl};

/// The outcome of scanning a transaction's row list.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolution {
    /// Rows `0..=last` are committed.
    Range(usize),
    /// A full rollback (`R0`/`S0`) discarded everything.
    Empty,
    /// No terminating end-control was found; the transaction is still open.
    Open,
}

fn resolve(rows: &[DataRow]) -> Resolution {
    let savepoint_positions: Vec<usize> = rows
        .iter()
        .enumerate()
        .filter(|(_, row)| row.end.is_savepoint())
        .map(|(i, _)| i)
        .collect();

    for (i, row) in rows.iter().enumerate() {
        match row.end {
            EndControl::Commit | EndControl::SavepointCommit => return Resolution::Range(i),
            EndControl::Rollback(0) | EndControl::SavepointRollback(0) => {
                return Resolution::Empty;
            }
            EndControl::Rollback(n) | EndControl::SavepointRollback(n) => {
                // `n` is a 1-based ordinal into `savepoint_positions`; the
                // Transaction never submits an `n` beyond the savepoints it
                // has actually marked, so this index is always present.
                return match savepoint_positions.get(usize::from(n - 1)) {
                    Some(&last) => Resolution::Range(last),
                    None => Resolution::Empty,
                };
            }
            EndControl::RowContinue | EndControl::SavepointContinue => continue,
            EndControl::NullRow | EndControl::Checksum => {
                unreachable!("a transaction's rows list never holds a null or checksum row")
            }
        }
    }
    Resolution::Open
}

/// Returns the committed rows of `rows` as a lazy forward iterator.
///
/// An open (unterminated) transaction and a fully rolled-back one both
/// yield nothing — the distinction is only visible via [`is_row_committed`]
/// returning `false` for every index either way.
pub fn committed_rows(rows: &[DataRow]) -> impl Iterator<Item = &DataRow> + '_ {
    let last = match resolve(rows) {
        Resolution::Range(last) => Some(last),
        Resolution::Empty | Resolution::Open => None,
    };
    rows.iter()
        .enumerate()
        .take_while(move |(i, _)| Some(*i) <= last)
        .map(|(_, row)| row)
}

/// Returns `true` iff `rows[i]` is part of the committed prefix.
pub fn is_row_committed(rows: &[DataRow], i: usize) -> bool {
    matches!(resolve(rows), Resolution::Range(last) if i <= last)
}
