//! 64-byte JSON header.
//!
//! On-disk layout: a JSON object, a single NUL terminator, zero or more NUL
//! padding bytes, and byte 63 is always `\n`. Immutable once created.

use serde::{Deserialize, Serialize};

use crate::error::{CorruptKind, Error, Result};

pub const HEADER_LEN: usize = 64;

const SIGNATURE: &str = "fDB";
const VERSION: u32 = 1;
const MIN_ROW_SIZE: u32 = 128;
const MAX_ROW_SIZE: u32 = 65536;
const MAX_SKEW_MS: u64 = 86_400_000;

#[derive(Serialize, Deserialize, Debug)]
struct HeaderJson {
    sig: String,
    ver: u32,
    row_size: u32,
    skew_ms: u64,
}

/// The fixed 64-byte database header.
///
/// Fully immutable after creation: there is no setter, only [`Header::new`]
/// (for provisioning a new database) and [`Header::parse`] (for loading an
/// existing one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    row_size: u32,
    skew_ms: u64,
}

impl Header {
    /// Builds a new header, validating `row_size` and `skew_ms` against
    /// their allowed ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if either value is out of range.
    pub fn new(row_size: u32, skew_ms: u64) -> Result<Self> {
        if !(MIN_ROW_SIZE..=MAX_ROW_SIZE).contains(&row_size) {
            return Err(Error::invalid_input(format!(
                "row_size {row_size} is out of range [{MIN_ROW_SIZE}, {MAX_ROW_SIZE}]"
            )));
        }
        if skew_ms > MAX_SKEW_MS {
            return Err(Error::invalid_input(format!(
                "skew_ms {skew_ms} is out of range [0, {MAX_SKEW_MS}]"
            )));
        }
        Ok(Self { row_size, skew_ms })
    }

    pub fn row_size(&self) -> u32 {
        self.row_size
    }

    pub fn skew_ms(&self) -> u64 {
        self.skew_ms
    }

    /// Serializes this header to exactly [`HEADER_LEN`] bytes.
    pub fn marshal(&self) -> [u8; HEADER_LEN] {
        let json = HeaderJson {
            sig: SIGNATURE.to_string(),
            ver: VERSION,
            row_size: self.row_size,
            skew_ms: self.skew_ms,
        };
        // Validated ranges keep this well within the 64-byte budget; the
        // largest legal values still fit in well under 63 bytes of JSON.
        let encoded = serde_json::to_vec(&json).expect("header always serializes to valid JSON");
        assert!(
            encoded.len() < HEADER_LEN - 1,
            "header JSON ({} bytes) does not fit the fixed 64-byte header",
            encoded.len()
        );

        let mut buf = [0u8; HEADER_LEN];
        buf[..encoded.len()].copy_from_slice(&encoded);
        // buf[encoded.len()] is already 0x00 (the terminator); the rest of
        // the padding region is already 0x00 too.
        buf[HEADER_LEN - 1] = b'\n';
        buf
    }

    /// Parses and validates a header from exactly [`HEADER_LEN`] bytes.
    ///
    /// # Errors
    ///
    /// Returns a discriminated [`Error::CorruptDatabase`] sub-kind for each
    /// distinct way the header can be invalid.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_LEN {
            return Err(Error::corrupt(CorruptKind::ShortFile));
        }
        if bytes[HEADER_LEN - 1] != b'\n' {
            return Err(Error::corrupt(CorruptKind::MissingNewline));
        }

        let json_and_padding = &bytes[..HEADER_LEN - 1];
        let terminator = json_and_padding
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::corrupt(CorruptKind::MissingTerminator))?;

        if json_and_padding[terminator + 1..]
            .iter()
            .any(|&b| b != 0)
        {
            return Err(Error::corrupt(CorruptKind::BadPadding));
        }

        let json: HeaderJson = serde_json::from_slice(&json_and_padding[..terminator])
            .map_err(|source| Error::corrupt(CorruptKind::MalformedJson { source }))?;

        if json.sig != SIGNATURE {
            return Err(Error::corrupt(CorruptKind::BadSignature));
        }
        if json.ver != VERSION {
            return Err(Error::corrupt(CorruptKind::BadVersion));
        }
        if !(MIN_ROW_SIZE..=MAX_ROW_SIZE).contains(&json.row_size) {
            return Err(Error::corrupt(CorruptKind::RowSizeOutOfRange {
                row_size: u64::from(json.row_size),
            }));
        }
        if json.skew_ms > MAX_SKEW_MS {
            return Err(Error::corrupt(CorruptKind::SkewOutOfRange {
                skew_ms: json.skew_ms,
            }));
        }

        Ok(Self {
            row_size: json.row_size,
            skew_ms: json.skew_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let header = Header::new(512, 5000).unwrap();
        let bytes = header.marshal();
        assert_eq!(bytes.len(), HEADER_LEN);
        let parsed = Header::parse(&bytes).unwrap();
        assert_eq!(header, parsed);
    }

    #[test]
    fn rejects_row_size_out_of_range() {
        assert!(Header::new(64, 0).is_err());
        assert!(Header::new(u32::MAX, 0).is_err());
    }

    #[test]
    fn rejects_skew_out_of_range() {
        assert!(Header::new(512, 86_400_001).is_err());
    }

    #[test]
    fn rejects_bad_signature() {
        let mut bytes = Header::new(512, 5000).unwrap().marshal();
        bytes[2] = b'x'; // corrupt the `B` in `"fDB"`
        let err = Header::parse(&bytes).unwrap_err();
        assert!(matches!(
            err,
            Error::CorruptDatabase {
                source: CorruptKind::MalformedJson { .. } | CorruptKind::BadSignature
            }
        ));
    }

    #[test]
    fn rejects_missing_newline() {
        let mut bytes = Header::new(512, 5000).unwrap().marshal();
        bytes[HEADER_LEN - 1] = 0;
        let err = Header::parse(&bytes).unwrap_err();
        assert!(matches!(
            err,
            Error::CorruptDatabase {
                source: CorruptKind::MissingNewline
            }
        ));
    }

    #[test]
    fn rejects_bad_padding() {
        let mut bytes = Header::new(512, 5000).unwrap().marshal();
        // Find the terminator and poke a non-NUL byte into the padding.
        let terminator = bytes[..HEADER_LEN - 1]
            .iter()
            .position(|&b| b == 0)
            .unwrap();
        bytes[terminator + 1] = b'!';
        let err = Header::parse(&bytes).unwrap_err();
        assert!(matches!(
            err,
            Error::CorruptDatabase {
                source: CorruptKind::BadPadding
            }
        ));
    }

    #[test]
    fn rejects_wrong_length() {
        let bytes = vec![0u8; 32];
        assert!(Header::parse(&bytes).is_err());
    }
}
