//! Out-of-band recovery tool for a damaged change log (§4.2 `repair`, §6
//! exit codes, §8 S6).

use super::{ChangeLogFile, RecordType};
use crate::errors::Result;
use std::path::Path;

/// Breakdown of why a record was discarded during repair.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardReasons {
    pub bad_magic: u64,
    pub bad_header_checksum: u64,
    pub bad_tail_checksum: u64,
    pub truncated: u64,
}

/// Counters produced by a repair pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct RepairStats {
    pub scanned: u64,
    pub healthy: u64,
    pub bytes_accepted: u64,
    pub bytes_discarded: u64,
    pub reasons: DiscardReasons,
}

/// Scan `src`, copy every well-formed record into a fresh log at `dst`,
/// skipping over corrupt spans by resynchronizing on the next record
/// magic. `feedback` is called after each record decision (accepted or
/// skipped) for progress reporting.
///
/// # Errors
/// Propagates I/O errors opening either file. Corrupt records are
/// recovered from, not propagated — that is the point of this tool.
pub fn repair<F: FnMut(&RepairStats)>(src_path: &Path, dst_path: &Path, mut feedback: F) -> Result<RepairStats> {
    let raw = std::fs::read(src_path)?;
    let dst = ChangeLogFile::open(dst_path)?;
    let mut stats = RepairStats::default();

    const FILE_HEADER_LEN: usize = 6;
    const RECORD_MAGIC: u16 = 0x4552;

    if raw.len() < FILE_HEADER_LEN {
        return Ok(stats);
    }

    let mut pos = FILE_HEADER_LEN;
    while pos < raw.len() {
        stats.scanned += 1;
        match try_read_one(&raw, pos) {
            Ok((rtype, payload, consumed)) => {
                dst.store_record(rtype, &payload)?;
                stats.healthy += 1;
                stats.bytes_accepted += consumed as u64;
                pos += consumed;
            }
            Err(reason) => {
                match reason {
                    BadRecord::BadMagic => stats.reasons.bad_magic += 1,
                    BadRecord::BadHeaderChecksum => stats.reasons.bad_header_checksum += 1,
                    BadRecord::BadTailChecksum => stats.reasons.bad_tail_checksum += 1,
                    BadRecord::Truncated => stats.reasons.truncated += 1,
                }
                // Resynchronize: look for the next occurrence of the record
                // magic after this position and retry there.
                let mut next = pos + 1;
                let mut found = None;
                while next + 1 < raw.len() {
                    let m = u16::from_le_bytes([raw[next], raw[next + 1]]);
                    if m == RECORD_MAGIC {
                        found = Some(next);
                        break;
                    }
                    next += 1;
                }
                match found {
                    Some(next) => {
                        stats.bytes_discarded += (next - pos) as u64;
                        pos = next;
                    }
                    None => {
                        stats.bytes_discarded += (raw.len() - pos) as u64;
                        pos = raw.len();
                    }
                }
            }
        }
        feedback(&stats);
    }
    dst.sync()?;
    Ok(stats)
}

enum BadRecord {
    BadMagic,
    BadHeaderChecksum,
    BadTailChecksum,
    Truncated,
}

fn try_read_one(raw: &[u8], pos: usize) -> std::result::Result<(RecordType, Vec<u8>, usize), BadRecord> {
    const RECORD_MAGIC: u16 = 0x4552;
    if pos + 9 > raw.len() {
        return Err(BadRecord::Truncated);
    }
    let head = &raw[pos..pos + 9];
    let magic = u16::from_le_bytes([head[0], head[1]]);
    if magic != RECORD_MAGIC {
        return Err(BadRecord::BadMagic);
    }
    let len = u16::from_le_bytes([head[2], head[3]]) as usize;
    let hcrc = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
    let rtype_byte = head[8];
    if hcrc != super::header_crc(magic, len as u16) {
        return Err(BadRecord::BadHeaderChecksum);
    }
    let total = 9 + len + 4;
    if pos + total > raw.len() {
        return Err(BadRecord::Truncated);
    }
    let payload = raw[pos + 9..pos + 9 + len].to_vec();
    let tcrc = u32::from_le_bytes([
        raw[pos + 9 + len],
        raw[pos + 9 + len + 1],
        raw[pos + 9 + len + 2],
        raw[pos + 9 + len + 3],
    ]);
    if tcrc != super::tail_crc(rtype_byte, &payload) {
        return Err(BadRecord::BadTailChecksum);
    }
    let rtype = RecordType::from_u8(rtype_byte).map_err(|_| BadRecord::BadMagic)?;
    Ok((rtype, payload, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::{ChangeLogFile, RecordType};
    use tempfile::tempdir;

    #[test]
    fn s6_repair_skips_one_corrupt_record() {
        let dir = tempdir().unwrap();
        let src_path = dir.path().join("src.clf");
        let dst_path = dir.path().join("dst.clf");
        {
            let log = ChangeLogFile::open(&src_path).unwrap();
            log.store_record(RecordType::Update, b"one").unwrap();
            log.store_record(RecordType::Update, b"two").unwrap();
            log.store_record(RecordType::Update, b"three").unwrap();
        }
        // Corrupt the tail CRC of the second record.
        let mut raw = std::fs::read(&src_path).unwrap();
        let first_len = 9 + 3 + 4; // header(9) + "one"(3) + tail(4)
        let second_start = 6 + first_len;
        let corrupt_at = second_start + 9 + 3; // into the tail CRC of "two"
        raw[corrupt_at] ^= 0xFF;
        std::fs::write(&src_path, &raw).unwrap();

        let stats = repair(&src_path, &dst_path, |_| {}).unwrap();
        assert_eq!(stats.healthy, 2);
        assert_eq!(stats.reasons.bad_tail_checksum, 1);

        let mut payloads = Vec::new();
        let dst = ChangeLogFile::open(&dst_path).unwrap();
        dst.scan_all_records(|_, _, p| {
            payloads.push(p.to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(payloads, vec![b"one".to_vec(), b"three".to_vec()]);
    }
}
