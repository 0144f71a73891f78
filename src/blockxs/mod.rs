//! Per-file block-checksum side file, mmap'd for random access (§4.6).
//!
//! Block *i* covers payload bytes `[i*B, (i+1)*B)`. The final block may be
//! short; it is treated as zero-padded to `B` for checksum purposes.

use crate::checksum;
use crate::config::ChecksumKind;
use crate::errors::{NsError, Result};
use memmap2::MmapMut;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Grow the backing file by at least this much whenever it must grow, to
/// avoid thrashing on small, frequent extensions.
const GROWTH_HYSTERESIS: u64 = 128 * 1024;

const XATTR_BLOCKSIZE: &str = "user.blocksize";
const XATTR_BLOCKCHECKSUM: &str = "user.blockchecksum";

fn side_path(payload_path: &Path) -> PathBuf {
    let mut s = payload_path.as_os_str().to_owned();
    s.push(".xsmap");
    PathBuf::from(s)
}

fn blocks_for(size: u64, block_size: u64) -> u64 {
    size.div_ceil(block_size)
}

/// An open per-file block-checksum map.
pub struct BlockXSMap {
    file: File,
    mmap: RwLock<MmapMut>,
    block_size: u64,
    kind: ChecksumKind,
    len: RwLock<u64>,
}

impl BlockXSMap {
    /// Open (creating if needed) the side file for `payload_path`.
    ///
    /// First writer wins on the xattrs; a reader validates against
    /// whatever is already stored.
    ///
    /// # Errors
    /// `NsError::Io` on filesystem failure; `NsError::Invalid` if a
    /// reader finds no xattrs to validate against, or they mismatch.
    pub fn open_map(
        payload_path: &Path,
        max_file_size: u64,
        block_size: u64,
        kind: ChecksumKind,
        is_write: bool,
    ) -> Result<Self> {
        let path = side_path(payload_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let is_new = !path.exists();
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;

        if is_new || is_write {
            set_xattr_if_absent(&path, XATTR_BLOCKSIZE, &block_size.to_le_bytes())?;
            set_xattr_if_absent(&path, XATTR_BLOCKCHECKSUM, kind.as_str().as_bytes())?;
        } else {
            validate_xattrs(&path, block_size, kind)?;
        }

        let required = blocks_for(max_file_size, block_size) * kind.width() as u64;
        let current_len = file.metadata()?.len();
        if is_write && required > current_len {
            file.set_len(required)?;
        }
        let len = file.metadata()?.len().max(required);
        if len == 0 {
            file.set_len(kind.width() as u64)?;
        }
        let mmap = mmap_file(&file)?;

        Ok(Self {
            file,
            mmap: RwLock::new(mmap),
            block_size,
            kind,
            len: RwLock::new(len.max(kind.width() as u64)),
        })
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    #[must_use]
    pub fn kind(&self) -> ChecksumKind {
        self.kind
    }

    fn block_range(&self, block: u64) -> (usize, usize) {
        let w = self.kind.width();
        let start = block as usize * w;
        (start, start + w)
    }

    /// Compute and store checksums for every block fully covered by
    /// `[offset, offset+length)`. Blocks only partially covered by the
    /// caller-provided range are zeroed, to be filled later by a full
    /// write or by `add_block_sum_holes`.
    ///
    /// # Errors
    /// `NsError::Range` if the map is too small for the addressed blocks.
    pub fn add_block_sum(&self, offset: u64, buffer: &[u8], length: usize) -> Result<()> {
        let b = self.block_size;
        let data = &buffer[..length.min(buffer.len())];
        let first_block = offset / b;
        let last_byte = offset + data.len() as u64;
        let last_block = if last_byte == 0 { 0 } else { (last_byte - 1) / b };

        let mut mmap = self.mmap.write();
        for block in first_block..=last_block {
            let block_start = block * b;
            let block_end = block_start + b;
            let covers_fully = offset <= block_start && last_byte >= block_end;
            let (lo, hi) = self.block_range(block);
            self.ensure_capacity(&mut mmap, hi)?;
            if covers_fully {
                let rel_start = (block_start - offset) as usize;
                let rel_end = (block_end - offset) as usize;
                let sum = checksum::compute(self.kind, &data[rel_start..rel_end]);
                mmap[lo..hi].copy_from_slice(&sum);
            } else {
                mmap[lo..hi].fill(0);
            }
        }
        Ok(())
    }

    /// Verify checksums over the aligned-shrink of `[offset, offset+length)`.
    /// Returns `false` on the first mismatch (callers surface this as an
    /// *IO* error, per §7).
    ///
    /// # Errors
    /// `NsError::Range` if the map does not cover the addressed blocks.
    pub fn check_block_sum(&self, offset: u64, buffer: &[u8], length: usize) -> Result<bool> {
        let b = self.block_size;
        let data = &buffer[..length.min(buffer.len())];
        let aligned_start = offset.next_multiple_of(b).min(offset + data.len() as u64);
        let end = offset + data.len() as u64;
        if aligned_start >= end {
            return Ok(true);
        }
        let aligned_end = (end / b) * b;
        if aligned_end <= aligned_start {
            return Ok(true);
        }

        let mmap = self.mmap.read();
        let mut block_start = aligned_start;
        while block_start < aligned_end {
            let block = block_start / b;
            let (lo, hi) = self.block_range(block);
            if hi > mmap.len() {
                return Err(NsError::Range(format!("block {block} outside map")));
            }
            let rel = (block_start - offset) as usize;
            let computed = checksum::compute(self.kind, &data[rel..rel + b as usize]);
            if mmap[lo..hi] != computed[..] {
                return Ok(false);
            }
            block_start += b;
        }
        Ok(true)
    }

    /// Grow (or, if `shrink` is set, shrink) the map to cover `new_size`
    /// payload bytes. Callers must hold their own writer lock over the
    /// enclosing `BlockXSMap` when shrinking — shrinking concurrently with
    /// an in-flight read is unsafe.
    ///
    /// # Errors
    /// `NsError::Io` on a filesystem failure while resizing or remapping.
    pub fn change_map(&self, new_size: u64, shrink: bool) -> Result<()> {
        let required = blocks_for(new_size, self.block_size) * self.kind.width() as u64;
        let mut len = self.len.write();
        if required > *len {
            let grown = required.max(*len + GROWTH_HYSTERESIS);
            self.file.set_len(grown)?;
            *self.mmap.write() = mmap_file(&self.file)?;
            *len = grown;
        } else if shrink && required < *len {
            self.file.set_len(required)?;
            *self.mmap.write() = mmap_file(&self.file)?;
            *len = required;
        }
        Ok(())
    }

    fn ensure_capacity(&self, mmap: &mut MmapMut, needed: usize) -> Result<()> {
        if needed <= mmap.len() {
            return Ok(());
        }
        let grown = (needed as u64).max(*self.len.read() + GROWTH_HYSTERESIS);
        self.file.set_len(grown)?;
        *mmap = mmap_file(&self.file)?;
        *self.len.write() = grown;
        Ok(())
    }

    /// Fill every block whose stored checksum is all-zero by reading the
    /// corresponding bytes from `payload` (zero-padding a short tail).
    /// Used on close to seal gaps left by misaligned writes.
    ///
    /// # Errors
    /// `NsError::Io` on a read failure against `payload`.
    pub fn add_block_sum_holes(&self, payload: &mut File) -> Result<()> {
        let w = self.kind.width();
        let mut mmap = self.mmap.write();
        let total_blocks = mmap.len() / w;
        let mut scratch = vec![0u8; self.block_size as usize];
        for block in 0..total_blocks {
            let lo = block * w;
            let hi = lo + w;
            if mmap[lo..hi].iter().all(|&b| b == 0) {
                let file_offset = block as u64 * self.block_size;
                payload.seek(SeekFrom::Start(file_offset))?;
                scratch.fill(0);
                let n = read_best_effort(payload, &mut scratch)?;
                if n == 0 {
                    continue;
                }
                let sum = checksum::compute(self.kind, &scratch);
                mmap[lo..hi].copy_from_slice(&sum);
            }
        }
        Ok(())
    }

    /// Flush the map to disk. Subsequent use of `self` after this call is
    /// still valid; this does not unmap.
    ///
    /// # Errors
    /// `NsError::Io` if `msync` fails.
    pub fn close_map(&self) -> Result<()> {
        self.mmap.read().flush()?;
        Ok(())
    }
}

fn read_best_effort(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    loop {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) => return Err(NsError::Io(e.to_string())),
        }
        if total == buf.len() {
            break;
        }
    }
    Ok(total)
}

fn mmap_file(file: &File) -> Result<MmapMut> {
    // SAFETY: the side file is exclusively owned by this map for its
    // lifetime; no other process is expected to mutate it concurrently.
    unsafe { MmapMut::map_mut(file) }.map_err(|e| NsError::Io(e.to_string()))
}

#[cfg(unix)]
fn set_xattr_if_absent(path: &Path, name: &str, value: &[u8]) -> Result<()> {
    if xattr::get(path, name)?.is_none() {
        xattr::set(path, name, value)?;
    }
    Ok(())
}

#[cfg(unix)]
fn validate_xattrs(path: &Path, block_size: u64, kind: ChecksumKind) -> Result<()> {
    let stored_block_size = xattr::get(path, XATTR_BLOCKSIZE)?
        .ok_or_else(|| NsError::Invalid("side file missing blocksize xattr".into()))?;
    let stored_kind = xattr::get(path, XATTR_BLOCKCHECKSUM)?
        .ok_or_else(|| NsError::Invalid("side file missing blockchecksum xattr".into()))?;
    if stored_block_size != block_size.to_le_bytes() {
        return Err(NsError::Invalid("side file blocksize mismatch".into()));
    }
    if stored_kind != kind.as_str().as_bytes() {
        return Err(NsError::Invalid("side file blockchecksum mismatch".into()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_xattr_if_absent(_path: &Path, _name: &str, _value: &[u8]) -> Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn validate_xattrs(_path: &Path, _block_size: u64, _kind: ChecksumKind) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn add_and_check_aligned_block() {
        let dir = tempdir().unwrap();
        let payload = dir.path().join("data.bin");
        std::fs::write(&payload, vec![0u8; 8]).unwrap();
        let map = BlockXSMap::open_map(&payload, 4096, 4, ChecksumKind::Crc32c, true).unwrap();
        let buf = [1u8, 2, 3, 4];
        map.add_block_sum(0, &buf, 4).unwrap();
        assert!(map.check_block_sum(0, &buf, 4).unwrap());
        assert!(!map.check_block_sum(0, &[9, 9, 9, 9], 4).unwrap());
    }

    #[test]
    fn holes_are_filled_from_payload() {
        let dir = tempdir().unwrap();
        let payload_path = dir.path().join("data.bin");
        std::fs::write(&payload_path, vec![7u8; 8]).unwrap();
        let map = BlockXSMap::open_map(&payload_path, 4096, 4, ChecksumKind::Crc32c, true).unwrap();
        // Write touching only part of block 1, leaving it a hole.
        map.add_block_sum(4, &[7, 7], 2).unwrap();
        let mut payload = OpenOptions::new().read(true).open(&payload_path).unwrap();
        map.add_block_sum_holes(&mut payload).unwrap();
        assert!(map.check_block_sum(4, &[7, 7, 7, 7], 4).unwrap());
    }
}
