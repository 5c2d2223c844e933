//! Journal record framing.
//!
//! Each record is laid out as:
//!
//! ```text
//! | magic (4) | body length (u32 LE) | CRC32 of body (u32 LE) | body |
//! ```
//!
//! The body is the JSON encoding of the resolved ops of one store call.
//! Scanning stops at the first frame that is short, carries the wrong
//! magic, or fails its checksum; everything from there on is a torn tail.

use crate::error::{StorageError, StorageResult};
use crate::state::JournalOp;

/// Magic bytes opening every journal record.
pub const JOURNAL_MAGIC: [u8; 4] = *b"OSJ1";

const HEADER_LEN: usize = 12;

/// Computes the IEEE CRC32 of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

/// Frames the ops of one store call.
pub(crate) fn encode_record(ops: &[JournalOp]) -> StorageResult<Vec<u8>> {
    let body = serde_json::to_vec(ops)?;
    let len = u32::try_from(body.len())
        .map_err(|_| StorageError::Unavailable(format!("record too large: {} bytes", body.len())))?;

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&JOURNAL_MAGIC);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&compute_crc32(&body).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Result of scanning a journal image.
#[derive(Debug)]
pub(crate) struct ScanOutcome {
    /// Decoded records, in file order.
    pub records: Vec<Vec<JournalOp>>,
    /// Length of the intact prefix.
    pub valid_len: u64,
}

/// Decodes every intact record of `bytes`.
///
/// A frame whose checksum matches but whose body is not valid JSON was
/// written whole and then damaged, so it is reported as corruption rather
/// than silently dropped.
pub(crate) fn scan(bytes: &[u8]) -> StorageResult<ScanOutcome> {
    let mut records = Vec::new();
    let mut offset = 0usize;

    while bytes.len() - offset >= HEADER_LEN {
        let header = &bytes[offset..offset + HEADER_LEN];
        if header[0..4] != JOURNAL_MAGIC {
            break;
        }
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let crc = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);

        let body_start = offset + HEADER_LEN;
        let Some(body_end) = body_start.checked_add(len) else {
            break;
        };
        if body_end > bytes.len() {
            break;
        }
        let body = &bytes[body_start..body_end];
        if compute_crc32(body) != crc {
            break;
        }

        let ops: Vec<JournalOp> = serde_json::from_slice(body).map_err(|e| {
            StorageError::Corrupted(format!("undecodable record at offset {offset}: {e}"))
        })?;
        records.push(ops);
        offset = body_end;
    }

    Ok(ScanOutcome {
        records,
        valid_len: offset as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn meta(key: &str) -> Vec<JournalOp> {
        vec![JournalOp::SetMeta {
            key: key.into(),
            value: json!(1),
        }]
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn scan_reads_consecutive_records() {
        let mut bytes = encode_record(&meta("a")).unwrap();
        bytes.extend(encode_record(&meta("b")).unwrap());

        let outcome = scan(&bytes).unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.valid_len, bytes.len() as u64);
    }

    #[test]
    fn scan_stops_at_torn_tail() {
        let first = encode_record(&meta("a")).unwrap();
        let second = encode_record(&meta("b")).unwrap();
        let mut bytes = first.clone();
        bytes.extend_from_slice(&second[..second.len() - 3]);

        let outcome = scan(&bytes).unwrap();
        assert_eq!(outcome.records, vec![meta("a")]);
        assert_eq!(outcome.valid_len, first.len() as u64);
    }

    #[test]
    fn scan_stops_at_checksum_mismatch() {
        let mut bytes = encode_record(&meta("a")).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        let outcome = scan(&bytes).unwrap();
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.valid_len, 0);
    }

    #[test]
    fn scan_rejects_checksummed_garbage() {
        let body = b"not json";
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&JOURNAL_MAGIC);
        bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&compute_crc32(body).to_le_bytes());
        bytes.extend_from_slice(body);

        assert!(matches!(scan(&bytes), Err(StorageError::Corrupted(_))));
    }

    proptest! {
        #[test]
        fn any_cut_keeps_whole_records_only(cut in 0usize..200) {
            let mut bytes = Vec::new();
            let mut boundaries = vec![0u64];
            for key in ["a", "bb", "ccc", "dddd"] {
                bytes.extend(encode_record(&meta(key)).unwrap());
                boundaries.push(bytes.len() as u64);
            }
            let cut = cut.min(bytes.len());

            let outcome = scan(&bytes[..cut]).unwrap();
            prop_assert!(boundaries.contains(&outcome.valid_len));
            prop_assert!(outcome.valid_len <= cut as u64);
            prop_assert_eq!(
                boundaries.iter().position(|b| *b == outcome.valid_len),
                Some(outcome.records.len())
            );
        }
    }
}
