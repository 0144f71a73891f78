use crate::blockxs::BlockXSMap;
use crate::errors::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// A shared block-checksum object plus per-direction open counts.
pub struct XsEntry {
    pub xs: Arc<RwLock<BlockXSMap>>,
    read_refs: AtomicU32,
    write_refs: AtomicU32,
}

impl XsEntry {
    fn new(xs: BlockXSMap) -> Self {
        Self { xs: Arc::new(RwLock::new(xs)), read_refs: AtomicU32::new(0), write_refs: AtomicU32::new(0) }
    }

    fn total_refs(&self) -> u32 {
        self.read_refs.load(Ordering::SeqCst) + self.write_refs.load(Ordering::SeqCst)
    }

    fn incr(&self, is_write: bool) {
        if is_write {
            self.write_refs.fetch_add(1, Ordering::SeqCst);
        } else {
            self.read_refs.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn decr(&self, is_write: bool) {
        if is_write {
            self.write_refs.fetch_sub(1, Ordering::SeqCst);
        } else {
            self.read_refs.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Process-wide `path -> block-checksum object` registry, matching §4.7's
/// `getXs` / `addMapping` / `dropXs` contract.
#[derive(Default)]
pub struct OssLayer {
    entries: RwLock<HashMap<PathBuf, Arc<XsEntry>>>,
}

impl OssLayer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic insert-or-lookup. If a live entry exists, it is returned and
    /// the appropriate refcount bumped. A refcount-zero tombstone is
    /// dropped and replaced. `build` runs only when a fresh object is
    /// actually needed.
    ///
    /// # Errors
    /// Propagates whatever `build` returns.
    pub fn get_xs<F>(&self, path: &Path, is_write: bool, build: F) -> Result<Arc<XsEntry>>
    where
        F: FnOnce() -> Result<BlockXSMap>,
    {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(path) {
            if entry.total_refs() > 0 {
                entry.incr(is_write);
                return Ok(entry.clone());
            }
            entries.remove(path);
        }
        let entry = Arc::new(XsEntry::new(build()?));
        entry.incr(is_write);
        entries.insert(path.to_path_buf(), entry.clone());
        Ok(entry)
    }

    /// Install a caller-constructed block-checksum object, e.g. because
    /// the caller raced `get_xs` and built its own before finding none
    /// present. If another object was installed first, that one wins and
    /// is returned instead.
    pub fn add_mapping(&self, path: &Path, xs: BlockXSMap, is_write: bool) -> Arc<XsEntry> {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(path) {
            if existing.total_refs() > 0 {
                existing.incr(is_write);
                return existing.clone();
            }
        }
        let entry = Arc::new(XsEntry::new(xs));
        entry.incr(is_write);
        entries.insert(path.to_path_buf(), entry.clone());
        entry
    }

    /// Called on close. Decrements the relevant refcount; removes the
    /// entry if it reached zero, or unconditionally if `force` is set.
    pub fn drop_xs(&self, path: &Path, is_write: bool, force: bool) {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get(path) else { return };
        entry.decr(is_write);
        if force || entry.total_refs() == 0 {
            entries.remove(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChecksumKind;
    use tempfile::tempdir;

    fn map(path: &Path) -> BlockXSMap {
        BlockXSMap::open_map(path, 4096, 4, ChecksumKind::Crc32c, true).unwrap()
    }

    #[test]
    fn concurrent_opens_share_the_same_entry() {
        let dir = tempdir().unwrap();
        let payload = dir.path().join("data.bin");
        std::fs::write(&payload, vec![0u8; 8]).unwrap();
        let layer = OssLayer::new();

        let first = layer.get_xs(&payload, true, || Ok(map(&payload))).unwrap();
        let second = layer.get_xs(&payload, false, || Ok(map(&payload))).unwrap();
        assert!(Arc::ptr_eq(&first.xs, &second.xs));

        layer.drop_xs(&payload, true, false);
        layer.drop_xs(&payload, false, false);
        // Both refs dropped: next get_xs should build a fresh entry.
        let third = layer.get_xs(&payload, true, || Ok(map(&payload))).unwrap();
        assert!(!Arc::ptr_eq(&first.xs, &third.xs));
    }
}
