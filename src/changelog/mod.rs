//! Append-only record journal (§4.2, §6).
//!
//! On-disk layout:
//!   file prefix:  `magic(u32) | version(u16)`
//!   each record:  `magic(u16) | payloadLen(u16) | headerCRC(u32) | type(u8)
//!                  | payload[payloadLen] | tailCRC(u32)`
//! All integers are little-endian. `headerCRC` covers `magic|payloadLen`;
//! `tailCRC` covers `type|payload`. Scanner stride past one record is
//! `13 + payloadLen`.

pub mod repair;

use crate::errors::{NsError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

const FILE_MAGIC: u32 = 0x4543_4847;
const RECORD_MAGIC: u16 = 0x4552;
const FILE_HEADER_LEN: u64 = 6;
const RECORD_OVERHEAD: u64 = 13;
const MAX_SUPPORTED_VERSION: u16 = 1;

/// The two record types a change log carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Update = 1,
    Delete = 2,
}

impl RecordType {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(RecordType::Update),
            2 => Ok(RecordType::Delete),
            other => Err(NsError::Corrupt(format!("unknown record type {other}"))),
        }
    }
}

fn header_crc(magic: u16, len: u16) -> u32 {
    let mut bytes = [0u8; 4];
    bytes[0..2].copy_from_slice(&magic.to_le_bytes());
    bytes[2..4].copy_from_slice(&len.to_le_bytes());
    crc32fast::hash(&bytes)
}

fn tail_crc(rtype: u8, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[rtype]);
    hasher.update(payload);
    hasher.finalize()
}

/// Append-only, checksummed record journal. See the module docs for the
/// on-disk format.
pub struct ChangeLogFile {
    file: Mutex<File>,
    version: u16,
}

impl ChangeLogFile {
    /// Open an existing log, validating its header, or create a fresh one.
    ///
    /// # Errors
    /// `NsError::Unsupported` if an existing file's version is newer than
    /// this implementation understands; `NsError::Io` on filesystem errors.
    pub fn open(path: &Path) -> Result<Self> {
        if path.exists() {
            let mut file = OpenOptions::new().read(true).write(true).open(path)?;
            let mut hdr = [0u8; 6];
            file.read_exact(&mut hdr)?;
            let magic = u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
            if magic != FILE_MAGIC {
                return Err(NsError::Corrupt(format!(
                    "unrecognized changelog header in {}",
                    path.display()
                )));
            }
            let version = u16::from_le_bytes([hdr[4], hdr[5]]);
            if version > MAX_SUPPORTED_VERSION {
                return Err(NsError::Unsupported(format!(
                    "changelog version {version} is newer than supported"
                )));
            }
            file.seek(SeekFrom::End(0))?;
            Ok(Self { file: Mutex::new(file), version })
        } else {
            let mut file = OpenOptions::new().read(true).write(true).create_new(true).open(path)?;
            file.write_all(&FILE_MAGIC.to_le_bytes())?;
            file.write_all(&1u16.to_le_bytes())?;
            file.flush()?;
            Ok(Self { file: Mutex::new(file), version: 1 })
        }
    }

    #[must_use]
    pub fn version(&self) -> u16 {
        self.version
    }

    /// Append one record. Returns the byte offset at which it begins.
    ///
    /// # Errors
    /// `NsError::Range` if the payload exceeds `u16::MAX` bytes;
    /// `NsError::Io` if the write is short or fails.
    pub fn store_record(&self, rtype: RecordType, payload: &[u8]) -> Result<u64> {
        if payload.len() > u16::MAX as usize {
            return Err(NsError::Range(format!("payload too large: {} bytes", payload.len())));
        }
        let len = payload.len() as u16;
        let hcrc = header_crc(RECORD_MAGIC, len);
        let tcrc = tail_crc(rtype as u8, payload);

        let mut buf = Vec::with_capacity(13 + payload.len());
        buf.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&hcrc.to_le_bytes());
        buf.push(rtype as u8);
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&tcrc.to_le_bytes());

        let mut file = self.file.lock();
        let offset = file.seek(SeekFrom::End(0))?;
        let written = file.write(&buf)?;
        if written != buf.len() {
            return Err(NsError::Io(format!(
                "short write at offset {offset}: wrote {written} of {} bytes",
                buf.len()
            )));
        }
        Ok(offset)
    }

    /// Random read of the record at `offset`. Returns its type; fills
    /// `out` with the payload.
    ///
    /// # Errors
    /// `NsError::Corrupt` on magic or checksum mismatch; `NsError::Io` on
    /// a short read.
    pub fn read_record(&self, offset: u64, out: &mut Vec<u8>) -> Result<RecordType> {
        let mut file = self.file.lock();
        read_record_locked(&mut file, offset, out)
    }

    /// Sequential scan from the first record to the current end of file.
    /// Calls `visitor(offset, type, payload)` for each record in order.
    /// Stops and propagates the first corruption encountered.
    ///
    /// # Errors
    /// `NsError::Corrupt` on the first malformed record.
    pub fn scan_all_records<F>(&self, mut visitor: F) -> Result<()>
    where
        F: FnMut(u64, RecordType, &[u8]) -> Result<()>,
    {
        let mut file = self.file.lock();
        let len = file.seek(SeekFrom::End(0))?;
        let mut offset = FILE_HEADER_LEN;
        let mut payload = Vec::new();
        while offset < len {
            let rtype = read_record_locked(&mut file, offset, &mut payload)?;
            visitor(offset, rtype, &payload)?;
            offset += RECORD_OVERHEAD + payload.len() as u64;
        }
        if offset != len {
            return Err(NsError::Corrupt(format!(
                "trailing garbage at offset {offset}, file length {len}"
            )));
        }
        Ok(())
    }

    /// Like `scan_all_records`, but upon reaching EOF, polls every
    /// `poll_micros` microseconds and keeps going as new records are
    /// appended. Returns when `cancel` is set, or on fatal error.
    pub fn follow<F>(
        &self,
        mut visitor: F,
        poll_micros: u64,
        cancel: &std::sync::atomic::AtomicBool,
    ) -> Result<()>
    where
        F: FnMut(u64, RecordType, &[u8]) -> Result<()>,
    {
        use std::sync::atomic::Ordering;
        let mut offset = FILE_HEADER_LEN;
        let mut payload = Vec::new();
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Ok(());
            }
            let len = {
                let mut file = self.file.lock();
                file.seek(SeekFrom::End(0))?
            };
            if offset >= len {
                std::thread::sleep(std::time::Duration::from_micros(poll_micros));
                continue;
            }
            let rtype = {
                let mut file = self.file.lock();
                read_record_locked(&mut file, offset, &mut payload)?
            };
            visitor(offset, rtype, &payload)?;
            offset += RECORD_OVERHEAD + payload.len() as u64;
        }
    }

    /// Flush a durability barrier: writes issued before this call are
    /// durable after it returns.
    ///
    /// # Errors
    /// `NsError::Io` if the underlying `fsync` fails.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }
}

fn read_record_locked(file: &mut File, offset: u64, out: &mut Vec<u8>) -> Result<RecordType> {
    file.seek(SeekFrom::Start(offset))?;
    let mut head = [0u8; 9];
    file.read_exact(&mut head).map_err(|e| {
        NsError::Io(format!("reading record header at offset {offset}: {e}"))
    })?;
    let magic = u16::from_le_bytes([head[0], head[1]]);
    if magic != RECORD_MAGIC {
        return Err(NsError::Corrupt(format!("bad record magic at offset {offset}")));
    }
    let len = u16::from_le_bytes([head[2], head[3]]);
    let hcrc = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
    let rtype_byte = head[8];
    if hcrc != header_crc(magic, len) {
        return Err(NsError::Corrupt(format!("bad header checksum at offset {offset}")));
    }
    out.resize(len as usize, 0);
    file.read_exact(out).map_err(|e| {
        NsError::Io(format!("reading record payload at offset {offset}: {e}"))
    })?;
    let mut tcrc_bytes = [0u8; 4];
    file.read_exact(&mut tcrc_bytes).map_err(|e| {
        NsError::Io(format!("reading record tail checksum at offset {offset}: {e}"))
    })?;
    let tcrc = u32::from_le_bytes(tcrc_bytes);
    if tcrc != tail_crc(rtype_byte, out) {
        return Err(NsError::Corrupt(format!("bad tail checksum at offset {offset}")));
    }
    RecordType::from_u8(rtype_byte)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn s1_store_and_scan_offsets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.clf");
        let log = ChangeLogFile::open(&path).unwrap();
        let off_a = log.store_record(RecordType::Update, b"A").unwrap();
        assert_eq!(off_a, FILE_HEADER_LEN);
        let off_bc = log.store_record(RecordType::Update, b"BC").unwrap();
        assert_eq!(off_bc, FILE_HEADER_LEN + RECORD_OVERHEAD + 1);

        let mut seen = Vec::new();
        log.scan_all_records(|off, rtype, payload| {
            seen.push((off, rtype, payload.to_vec()));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, off_a);
        assert_eq!(seen[0].2, b"A");
        assert_eq!(seen[1].0, off_bc);
        assert_eq!(seen[1].2, b"BC");
    }

    #[test]
    fn reopen_validates_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.clf");
        {
            let log = ChangeLogFile::open(&path).unwrap();
            log.store_record(RecordType::Update, b"x").unwrap();
        }
        let log2 = ChangeLogFile::open(&path).unwrap();
        assert_eq!(log2.version(), 1);
        let mut seen = 0;
        log2.scan_all_records(|_, _, _| {
            seen += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn corrupt_tail_checksum_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.clf");
        let log = ChangeLogFile::open(&path).unwrap();
        log.store_record(RecordType::Update, b"hello").unwrap();
        drop(log);

        // Flip a payload byte in place.
        use std::io::{Seek, SeekFrom, Write};
        let mut f = OpenOptions::new().write(true).open(&path).unwrap();
        f.seek(SeekFrom::Start(FILE_HEADER_LEN + 9)).unwrap();
        f.write_all(&[b'H']).unwrap();
        drop(f);

        let log = ChangeLogFile::open(&path).unwrap();
        let mut out = Vec::new();
        let err = log.read_record(FILE_HEADER_LEN, &mut out).unwrap_err();
        assert!(matches!(err, NsError::Corrupt(_)));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.clf");
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&FILE_MAGIC.to_le_bytes()).unwrap();
            f.write_all(&2u16.to_le_bytes()).unwrap();
        }
        let err = ChangeLogFile::open(&path).unwrap_err();
        assert!(matches!(err, NsError::Unsupported(_)));
    }
}
