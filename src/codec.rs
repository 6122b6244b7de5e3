//! Row codec: bit-exact encode/decode of fixed-size rows, LRC parity,
//! base64 UUID encoding, NUL padding. Pure, no I/O.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use uuid::Uuid;

use crate::error::{CorruptKind, Error, Result};

/// First byte of every row.
pub const ROW_START: u8 = 0x1F;
/// Last byte of every row.
pub const ROW_END: u8 = 0x0A;

/// Minimum frame overhead for a data/null row: `ROW_START` + start control +
/// 24-byte base64 key + end control (2) + LRC hex (2) + `ROW_END`.
const DATA_ROW_OVERHEAD: usize = 1 + 1 + 24 + 2 + 2 + 1;

/// `start_control` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartControl {
    /// `T` — first row of a transaction.
    Transaction,
    /// `R` — continuation row.
    Continuation,
    /// `C` — checksum row. Never produced by a `Transaction`.
    Checksum,
}

impl StartControl {
    pub fn to_byte(self) -> u8 {
        match self {
            StartControl::Transaction => b'T',
            StartControl::Continuation => b'R',
            StartControl::Checksum => b'C',
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'T' => Some(StartControl::Transaction),
            b'R' => Some(StartControl::Continuation),
            b'C' => Some(StartControl::Checksum),
            _ => None,
        }
    }
}

/// `end_control` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndControl {
    /// `TC` — transaction commit.
    Commit,
    /// `RE` — row end, transaction continues.
    RowContinue,
    /// `SC` — savepoint and commit, in one row.
    SavepointCommit,
    /// `SE` — savepoint and continue.
    SavepointContinue,
    /// `NR` — null row (empty transaction marker).
    NullRow,
    /// `Rn`, n in 0..=9 — full rollback (n=0) or rollback to savepoint n.
    Rollback(u8),
    /// `Sn`, n in 0..=9 — as `Rollback`, but this row was also a savepoint.
    SavepointRollback(u8),
    /// `CS` — checksum row.
    Checksum,
}

impl EndControl {
    pub fn to_bytes(self) -> [u8; 2] {
        match self {
            EndControl::Commit => *b"TC",
            EndControl::RowContinue => *b"RE",
            EndControl::SavepointCommit => *b"SC",
            EndControl::SavepointContinue => *b"SE",
            EndControl::NullRow => *b"NR",
            EndControl::Rollback(n) => [b'R', b'0' + n],
            EndControl::SavepointRollback(n) => [b'S', b'0' + n],
            EndControl::Checksum => *b"CS",
        }
    }

    pub fn from_bytes(bytes: [u8; 2]) -> Option<Self> {
        match bytes {
            [b'T', b'C'] => Some(EndControl::Commit),
            [b'R', b'E'] => Some(EndControl::RowContinue),
            [b'S', b'C'] => Some(EndControl::SavepointCommit),
            [b'S', b'E'] => Some(EndControl::SavepointContinue),
            [b'N', b'R'] => Some(EndControl::NullRow),
            [b'C', b'S'] => Some(EndControl::Checksum),
            [b'R', d @ b'0'..=b'9'] => Some(EndControl::Rollback(d - b'0')),
            [b'S', d @ b'0'..=b'9'] => Some(EndControl::SavepointRollback(d - b'0')),
            _ => None,
        }
    }

    /// `true` for the `S`-family end controls (`Transaction::savepoint_indices`).
    pub fn is_savepoint(self) -> bool {
        matches!(
            self,
            EndControl::SavepointCommit
                | EndControl::SavepointContinue
                | EndControl::SavepointRollback(_)
        )
    }

    /// `true` for the end controls that terminate a transaction.
    pub fn is_terminating(self) -> bool {
        matches!(
            self,
            EndControl::Commit | EndControl::SavepointCommit | EndControl::Rollback(_) | EndControl::SavepointRollback(_)
        )
    }
}

/// A decoded data row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRow {
    pub start: StartControl,
    pub end: EndControl,
    pub key: Uuid,
    pub value: Vec<u8>,
}

/// A decoded null row: the empty-transaction marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NullRow;

/// A decoded checksum row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumRow {
    pub crc32: u32,
}

/// A decoded row of any variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Row {
    Data(DataRow),
    Null(NullRow),
    Checksum(ChecksumRow),
}

/// Maximum raw value length for a given `row_size`.
pub fn max_value_len(row_size: u32) -> usize {
    (row_size as usize).saturating_sub(DATA_ROW_OVERHEAD)
}

/// The smallest `row_size` that can hold a value up to `max_value_len` bytes.
///
/// Inverse of [`max_value_len`]; a convenience for callers provisioning a new
/// database around a known maximum payload size.
pub fn row_size_for(max_value_len: usize) -> u32 {
    (max_value_len + DATA_ROW_OVERHEAD) as u32
}

fn compute_lrc(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc ^ b)
}

fn lrc_to_hex(lrc: u8) -> [u8; 2] {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    [DIGITS[(lrc >> 4) as usize], DIGITS[(lrc & 0x0F) as usize]]
}

fn hex_nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn hex_to_byte(bytes: [u8; 2]) -> Option<u8> {
    Some((hex_nibble(bytes[0])? << 4) | hex_nibble(bytes[1])?)
}

fn base64_encode_into(buf: &mut [u8], bytes: &[u8]) {
    let encoded = STANDARD.encode(bytes);
    debug_assert_eq!(encoded.len(), buf.len());
    buf.copy_from_slice(encoded.as_bytes());
}

fn finish_row(buf: &mut [u8], row_size: usize, end: EndControl) {
    let end_bytes = end.to_bytes();
    buf[row_size - 5] = end_bytes[0];
    buf[row_size - 4] = end_bytes[1];

    let lrc = compute_lrc(&buf[..row_size - 3]);
    let hex = lrc_to_hex(lrc);
    buf[row_size - 3] = hex[0];
    buf[row_size - 2] = hex[1];
    buf[row_size - 1] = ROW_END;
}

/// Encodes a data row.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if `value` is empty or too large for
/// `row_size`, or if `start`/`end` are not a legal data-row combination.
pub fn encode_data_row(
    row_size: u32,
    start: StartControl,
    end: EndControl,
    key: &Uuid,
    value: &[u8],
) -> Result<Vec<u8>> {
    if !matches!(start, StartControl::Transaction | StartControl::Continuation) {
        return Err(Error::invalid_input(
            "data row start control must be T or R",
        ));
    }
    if matches!(end, EndControl::NullRow | EndControl::Checksum) {
        return Err(Error::invalid_input(
            "data row end control must not be NR or CS",
        ));
    }
    if value.is_empty() {
        return Err(Error::invalid_input("data row value must not be empty"));
    }
    let limit = max_value_len(row_size);
    if value.len() > limit {
        return Err(Error::invalid_input(format!(
            "value length {} exceeds the maximum of {} bytes for row_size {}",
            value.len(),
            limit,
            row_size
        )));
    }

    let row_size = row_size as usize;
    let mut buf = vec![0u8; row_size];
    buf[0] = ROW_START;
    buf[1] = start.to_byte();
    base64_encode_into(&mut buf[2..26], key.as_bytes());
    buf[26..26 + value.len()].copy_from_slice(value);
    finish_row(&mut buf, row_size, end);
    Ok(buf)
}

/// Encodes the empty-transaction marker row.
pub fn encode_null_row(row_size: u32) -> Result<Vec<u8>> {
    if (row_size as usize) < DATA_ROW_OVERHEAD {
        return Err(Error::invalid_input(format!(
            "row_size {row_size} is too small to hold a row"
        )));
    }

    let row_size = row_size as usize;
    let mut buf = vec![0u8; row_size];
    buf[0] = ROW_START;
    buf[1] = StartControl::Transaction.to_byte();
    base64_encode_into(&mut buf[2..26], Uuid::nil().as_bytes());
    finish_row(&mut buf, row_size, EndControl::NullRow);
    Ok(buf)
}

/// Encodes a checksum row whose payload is the big-endian bytes of `crc32`.
pub fn encode_checksum_row(row_size: u32, crc32: u32) -> Result<Vec<u8>> {
    if (row_size as usize) < DATA_ROW_OVERHEAD {
        return Err(Error::invalid_input(format!(
            "row_size {row_size} is too small to hold a row"
        )));
    }

    let row_size = row_size as usize;
    let mut buf = vec![0u8; row_size];
    buf[0] = ROW_START;
    buf[1] = StartControl::Checksum.to_byte();
    base64_encode_into(&mut buf[2..10], &crc32.to_be_bytes());
    finish_row(&mut buf, row_size, EndControl::Checksum);
    Ok(buf)
}

/// Decodes and fully verifies a row.
///
/// # Errors
///
/// Returns a discriminated [`Error::CorruptDatabase`] sub-kind for each
/// distinct way the bytes can fail to represent a valid row.
pub fn decode(row_size: u32, bytes: &[u8]) -> Result<Row> {
    let row_size = row_size as usize;
    if bytes.len() != row_size || row_size < DATA_ROW_OVERHEAD {
        return Err(Error::corrupt(CorruptKind::BadFrame));
    }
    if bytes[0] != ROW_START || bytes[row_size - 1] != ROW_END {
        return Err(Error::corrupt(CorruptKind::BadFrame));
    }

    let start = StartControl::from_byte(bytes[1])
        .ok_or(Error::corrupt(CorruptKind::UnknownStartControl { byte: bytes[1] }))?;

    let end_raw = [bytes[row_size - 5], bytes[row_size - 4]];
    let end = EndControl::from_bytes(end_raw).ok_or(Error::corrupt(
        CorruptKind::UnknownEndControl {
            b0: end_raw[0],
            b1: end_raw[1],
        },
    ))?;

    let computed = compute_lrc(&bytes[..row_size - 3]);
    let expected = hex_to_byte([bytes[row_size - 3], bytes[row_size - 2]]).ok_or(
        Error::corrupt(CorruptKind::ParityMismatch {
            expected: 0,
            computed,
        }),
    )?;
    if expected != computed {
        return Err(Error::corrupt(CorruptKind::ParityMismatch {
            expected,
            computed,
        }));
    }

    match (start, end) {
        (StartControl::Checksum, EndControl::Checksum) => {
            let decoded = STANDARD
                .decode(&bytes[2..10])
                .map_err(|_| Error::corrupt(CorruptKind::BadUuid))?;
            let crc32 = u32::from_be_bytes(
                decoded
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::corrupt(CorruptKind::BadUuid))?,
            );
            Ok(Row::Checksum(ChecksumRow { crc32 }))
        }
        (StartControl::Checksum, _) | (_, EndControl::Checksum) => Err(Error::corrupt(
            CorruptKind::UnknownEndControl {
                b0: end_raw[0],
                b1: end_raw[1],
            },
        )),
        (_, EndControl::NullRow) => {
            let key = decode_key(&bytes[2..26])?;
            if key != Uuid::nil() {
                return Err(Error::corrupt(CorruptKind::BadUuid));
            }
            Ok(Row::Null(NullRow))
        }
        _ => {
            let key = decode_key(&bytes[2..26])?;
            let value_region = &bytes[26..row_size - 5];
            let terminator = value_region
                .iter()
                .position(|&b| b == 0)
                .ok_or(Error::corrupt(CorruptKind::MissingValueTerminator))?;
            if terminator == 0 {
                // An empty value is only legal for a NullRow.
                return Err(Error::corrupt(CorruptKind::MissingValueTerminator));
            }
            let value = value_region[..terminator].to_vec();
            Ok(Row::Data(DataRow {
                start,
                end,
                key,
                value,
            }))
        }
    }
}

fn decode_key(encoded: &[u8]) -> Result<Uuid> {
    let decoded = STANDARD
        .decode(encoded)
        .map_err(|_| Error::corrupt(CorruptKind::BadUuid))?;
    Uuid::from_slice(&decoded).map_err(|_| Error::corrupt(CorruptKind::BadUuid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ROW_SIZE: u32 = 512;

    fn any_uuid_v7() -> Uuid {
        Uuid::now_v7()
    }

    #[test]
    fn round_trip_data_row() {
        let key = any_uuid_v7();
        let value = b"{\"name\":\"John\"}";
        let encoded = encode_data_row(
            ROW_SIZE,
            StartControl::Transaction,
            EndControl::Commit,
            &key,
            value,
        )
        .unwrap();
        assert_eq!(encoded.len(), ROW_SIZE as usize);

        let decoded = decode(ROW_SIZE, &encoded).unwrap();
        match decoded {
            Row::Data(row) => {
                assert_eq!(row.start, StartControl::Transaction);
                assert_eq!(row.end, EndControl::Commit);
                assert_eq!(row.key, key);
                assert_eq!(row.value, value);
            }
            other => panic!("expected a data row, got {other:?}"),
        }
    }

    #[test]
    fn round_trip_null_row() {
        let encoded = encode_null_row(ROW_SIZE).unwrap();
        let decoded = decode(ROW_SIZE, &encoded).unwrap();
        assert_eq!(decoded, Row::Null(NullRow));
    }

    #[test]
    fn round_trip_checksum_row() {
        let encoded = encode_checksum_row(ROW_SIZE, 0xDEAD_BEEF).unwrap();
        let decoded = decode(ROW_SIZE, &encoded).unwrap();
        assert_eq!(decoded, Row::Checksum(ChecksumRow { crc32: 0xDEAD_BEEF }));
    }

    #[test]
    fn padding_is_zeroed() {
        let key = any_uuid_v7();
        let value = b"x";
        let encoded = encode_data_row(
            ROW_SIZE,
            StartControl::Transaction,
            EndControl::Commit,
            &key,
            value,
        )
        .unwrap();
        let padding = &encoded[26 + value.len()..ROW_SIZE as usize - 5];
        assert!(padding.iter().all(|&b| b == 0));
    }

    #[test]
    fn frame_bytes_are_fixed() {
        let encoded = encode_null_row(ROW_SIZE).unwrap();
        assert_eq!(encoded[0], ROW_START);
        assert_eq!(encoded[ROW_SIZE as usize - 1], ROW_END);
    }

    #[test]
    fn rejects_empty_value() {
        let key = any_uuid_v7();
        let err = encode_data_row(
            ROW_SIZE,
            StartControl::Transaction,
            EndControl::Commit,
            &key,
            b"",
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }));
    }

    #[test]
    fn rejects_oversize_value() {
        let key = any_uuid_v7();
        let value = vec![b'a'; max_value_len(ROW_SIZE) + 1];
        let err = encode_data_row(
            ROW_SIZE,
            StartControl::Transaction,
            EndControl::Commit,
            &key,
            &value,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }));
    }

    #[test]
    fn detects_parity_mismatch() {
        let key = any_uuid_v7();
        let mut encoded = encode_data_row(
            ROW_SIZE,
            StartControl::Transaction,
            EndControl::Commit,
            &key,
            b"hello",
        )
        .unwrap();
        encoded[30] ^= 0xFF;
        let err = decode(ROW_SIZE, &encoded).unwrap_err();
        assert!(matches!(
            err,
            Error::CorruptDatabase {
                source: CorruptKind::ParityMismatch { .. }
            }
        ));
    }

    #[test]
    fn detects_unknown_end_control() {
        let key = any_uuid_v7();
        let mut encoded = encode_data_row(
            ROW_SIZE,
            StartControl::Transaction,
            EndControl::Commit,
            &key,
            b"hello",
        )
        .unwrap();
        let row_size = ROW_SIZE as usize;
        encoded[row_size - 5] = b'Z';
        encoded[row_size - 4] = b'Z';
        let lrc = compute_lrc(&encoded[..row_size - 3]);
        let hex = lrc_to_hex(lrc);
        encoded[row_size - 3] = hex[0];
        encoded[row_size - 2] = hex[1];
        let err = decode(ROW_SIZE, &encoded).unwrap_err();
        assert!(matches!(
            err,
            Error::CorruptDatabase {
                source: CorruptKind::UnknownEndControl { .. }
            }
        ));
    }

    proptest! {
        #[test]
        fn round_trip_prop(value_len in 1usize..(max_value_len(ROW_SIZE)), seed in any::<u128>()) {
            let key = Uuid::from_u128(seed | (0x7 << 76) | (0x8 << 60));
            let value = vec![b'a'; value_len];
            let encoded = encode_data_row(
                ROW_SIZE,
                StartControl::Transaction,
                EndControl::Commit,
                &key,
                &value,
            ).unwrap();
            prop_assert_eq!(encoded.len(), ROW_SIZE as usize);

            let decoded = decode(ROW_SIZE, &encoded).unwrap();
            match decoded {
                Row::Data(row) => {
                    prop_assert_eq!(row.value, value);
                }
                other => prop_assert!(false, "expected data row, got {:?}", other),
            }
        }

        #[test]
        fn parity_always_matches_xor(value_len in 1usize..(max_value_len(ROW_SIZE))) {
            let key = Uuid::now_v7();
            let value = vec![b'b'; value_len];
            let encoded = encode_data_row(
                ROW_SIZE,
                StartControl::Transaction,
                EndControl::Commit,
                &key,
                &value,
            ).unwrap();
            let row_size = ROW_SIZE as usize;
            let computed = compute_lrc(&encoded[..row_size - 3]);
            let expected = hex_to_byte([encoded[row_size - 3], encoded[row_size - 2]]).unwrap();
            prop_assert_eq!(computed, expected);
        }
    }
}
