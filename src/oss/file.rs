use super::layer::{OssLayer, XsEntry};
use crate::blockxs::BlockXSMap;
use crate::config::ChecksumKind;
use crate::errors::{NsError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Per-open payload file state: descriptor, direction, and a shared handle
/// on its block-checksum object (§4.7).
pub struct OssFile {
    path: PathBuf,
    file: File,
    is_write: bool,
    xs: Arc<XsEntry>,
}

impl OssFile {
    /// Open `path` for read or write, resolving its block-checksum object
    /// through `layer`.
    ///
    /// # Errors
    /// Propagates filesystem and block-xs-map open errors.
    pub fn open(
        layer: &OssLayer,
        path: &Path,
        is_write: bool,
        max_file_size: u64,
        block_size: u64,
        kind: ChecksumKind,
    ) -> Result<Self> {
        let mut opts = OpenOptions::new();
        opts.read(true);
        if is_write {
            opts.write(true).create(true);
        }
        let file = opts.open(path)?;
        let xs = layer.get_xs(path, is_write, || {
            BlockXSMap::open_map(path, max_file_size, block_size, kind, is_write)
        })?;
        Ok(Self { path: path.to_path_buf(), file, is_write, xs })
    }

    /// Read `buf.len()` bytes starting at `offset`, verifying every block
    /// touched against the block-checksum map before returning. Issues up
    /// to three sub-reads: an aligned head block, the already-aligned
    /// body, and an aligned tail block (§4.7).
    ///
    /// # Errors
    /// `NsError::Io` if any touched block fails verification, or on a
    /// short underlying read.
    pub fn read_verified(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let map = self.xs.xs.read();
        let b = map.block_size();
        let end = offset + buf.len() as u64;
        let aligned_start = (offset / b) * b;
        let aligned_end = end.next_multiple_of(b);

        if aligned_start == offset && aligned_end == end {
            read_at(&mut self.file, offset, buf)?;
            if !map.check_block_sum(offset, buf, buf.len())? {
                return Err(NsError::Io(format!("block checksum mismatch in {}", self.path.display())));
            }
            return Ok(buf.len());
        }

        let mut written = 0usize;
        let mut cursor = aligned_start;

        if offset > aligned_start {
            let mut scratch = vec![0u8; b as usize];
            read_at(&mut self.file, aligned_start, &mut scratch)?;
            if !map.check_block_sum(aligned_start, &scratch, scratch.len())? {
                return Err(NsError::Io(format!("block checksum mismatch in {}", self.path.display())));
            }
            let rel_start = (offset - aligned_start) as usize;
            let rel_end = ((aligned_start + b).min(end) - aligned_start) as usize;
            let n = rel_end - rel_start;
            buf[..n].copy_from_slice(&scratch[rel_start..rel_end]);
            written += n;
            cursor = aligned_start + b;
        }

        let body_end = (end / b) * b;
        if body_end > cursor {
            let body_len = (body_end - cursor) as usize;
            read_at(&mut self.file, cursor, &mut buf[written..written + body_len])?;
            if !map.check_block_sum(cursor, &buf[written..written + body_len], body_len)? {
                return Err(NsError::Io(format!("block checksum mismatch in {}", self.path.display())));
            }
            written += body_len;
            cursor = body_end;
        }

        if cursor < end {
            let mut scratch = vec![0u8; b as usize];
            read_at(&mut self.file, cursor, &mut scratch)?;
            if !map.check_block_sum(cursor, &scratch, scratch.len())? {
                return Err(NsError::Io(format!("block checksum mismatch in {}", self.path.display())));
            }
            let n = (end - cursor) as usize;
            buf[written..written + n].copy_from_slice(&scratch[..n]);
            written += n;
        }

        Ok(written)
    }

    /// Write `data` at `offset`: updates the block-checksum map first,
    /// then the payload bytes.
    ///
    /// # Errors
    /// `NsError::Io` on a write failure; propagates map growth errors.
    pub fn write_verified(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.is_write {
            return Err(NsError::Invalid("file not opened for write".into()));
        }
        {
            let map = self.xs.xs.read();
            map.add_block_sum(offset, data, data.len())?;
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// On last close: if this was a writer, resize the map to the payload
    /// size and seal holes, then flush. Drops this entry from the process
    /// registry if its refcount reached zero.
    ///
    /// # Errors
    /// Reported but non-fatal to the fd close, per §4.7's close contract;
    /// here that is modeled by still dropping the mapping even on error.
    pub fn close(mut self, layer: &OssLayer) -> Result<()> {
        let result = (|| -> Result<()> {
            if self.is_write {
                let size = self.file.metadata()?.len();
                let map = self.xs.xs.read();
                map.change_map(size, false)?;
                map.add_block_sum_holes(&mut self.file)?;
                map.close_map()?;
            }
            Ok(())
        })();
        layer.drop_xs(&self.path, self.is_write, false);
        result
    }
}

fn read_at(file: &mut File, offset: u64, buf: &mut [u8]) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf).map_err(|e| NsError::Io(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_verified_roundtrip() {
        let dir = tempdir().unwrap();
        let payload = dir.path().join("data.bin");
        std::fs::write(&payload, vec![0u8; 16]).unwrap();
        let layer = OssLayer::new();

        let mut writer =
            OssFile::open(&layer, &payload, true, 4096, 4, ChecksumKind::Crc32c).unwrap();
        writer.write_verified(0, b"abcdefgh").unwrap();
        writer.close(&layer).unwrap();

        let mut reader =
            OssFile::open(&layer, &payload, false, 4096, 4, ChecksumKind::Crc32c).unwrap();
        let mut buf = vec![0u8; 5];
        reader.read_verified(1, &mut buf).unwrap();
        assert_eq!(&buf, b"bcdef");
    }
}
