//! Read-ahead prefetch: a sorted map of blocks keyed by starting offset,
//! bounded to a configurable number of entries, plus the `readPrefetch`
//! operation that drives it (§4.8, §5).

use super::meta_handler::MetaHandler;
use super::transport::Transport;
use crate::errors::Result;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::OnceCell;

/// One block slot: absent while unarmed, a pending `OnceCell` while a
/// background fetch is running, and holding `Some(data)`/`None` once that
/// fetch lands (`None` records a failed fetch without re-running it).
type Slot = Arc<OnceCell<Option<Vec<u8>>>>;

/// Blocks kept in a `BTreeMap` sorted by starting offset, guarded by a
/// single mutex, matching §5's "prefetch map is guarded by a mutex"
/// requirement exactly. Concurrent access to one in-flight slot is
/// resolved by the `OnceCell` itself rather than a second lock.
pub struct PrefetchCache {
    blocks: Mutex<BTreeMap<u64, Slot>>,
    capacity: usize,
}

impl PrefetchCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { blocks: Mutex::new(BTreeMap::new()), capacity }
    }

    /// Return the slot for `offset`, creating it (and evicting the
    /// lowest-offset slot if at capacity) when absent. The bool is `true`
    /// when a fresh slot was created, telling the caller it owns arming it.
    fn slot(&self, offset: u64) -> (Slot, bool) {
        let mut blocks = self.blocks.lock();
        if let Some(existing) = blocks.get(&offset) {
            return (existing.clone(), false);
        }
        if blocks.len() >= self.capacity {
            if let Some(&lowest) = blocks.keys().next() {
                blocks.remove(&lowest);
            }
        }
        let slot: Slot = Arc::new(OnceCell::new());
        blocks.insert(offset, slot.clone());
        (slot, true)
    }

    fn contains(&self, offset: u64) -> bool {
        self.blocks.lock().contains_key(&offset)
    }

    fn remove(&self, offset: u64) {
        self.blocks.lock().remove(&offset);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.blocks.lock().clear();
    }
}

/// Drives `readPrefetch` (§4.8) for one open file: reads go through the
/// block cache first, a background task keeps the next block warm, and a
/// failed or misaligned access permanently disables further prefetch for
/// this handle.
pub struct PrefetchingFile<T: Transport> {
    meta: Arc<MetaHandler<T>>,
    block_size: u64,
    cache: PrefetchCache,
    enabled: AtomicBool,
}

impl<T: Transport + 'static> PrefetchingFile<T> {
    #[must_use]
    pub fn new(meta: Arc<MetaHandler<T>>, block_size: u64, capacity: usize) -> Arc<Self> {
        Arc::new(Self { meta, block_size, cache: PrefetchCache::new(capacity), enabled: AtomicBool::new(true) })
    }

    #[must_use]
    pub fn prefetch_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn is_aligned_prefix(off: u64, block_size: u64) -> bool {
        off == 0 || off % block_size == 0
    }

    /// Step 1/2 of §4.8: serve `off` from the cache if warm, waiting out an
    /// in-flight fetch if one is running; otherwise fall back to a direct
    /// read. Step 3/4 (slice out, kick off the next block, short-block EOF)
    /// happen in `serve_block`.
    ///
    /// # Errors
    /// Propagates the meta-handler's read errors (`NsError::Expired` on a
    /// timeout, or whatever the transport itself returns).
    pub async fn read_prefetch(self: &Arc<Self>, off: u64, buf: &mut [u8]) -> Result<usize> {
        if !self.prefetch_enabled() {
            return self.meta.read(off, buf).await;
        }

        if self.cache.contains(off) {
            let (slot, _fresh) = self.cache.slot(off);
            let value = slot
                .get_or_init(|| async {
                    let mut block = vec![0u8; self.block_size as usize];
                    match self.meta.read(off, &mut block).await {
                        Ok(n) => {
                            block.truncate(n);
                            Some(block)
                        }
                        Err(_) => None,
                    }
                })
                .await
                .clone();
            self.cache.remove(off);
            return match value {
                Some(block) => Ok(self.serve_block(off, block, buf)),
                None => {
                    self.enabled.store(false, Ordering::SeqCst);
                    self.meta.read(off, buf).await
                }
            };
        }

        let n = self.meta.read(off, buf).await?;
        if Self::is_aligned_prefix(off, self.block_size) {
            self.arm_prefetch(off + n as u64);
        } else {
            self.enabled.store(false, Ordering::SeqCst);
        }
        Ok(n)
    }

    /// Copy the served slice into `buf` and kick off the next block's
    /// prefetch (§4.8 step 3). A block shorter than `block_size` is never
    /// followed by another prefetch: its own shortness already signals EOF
    /// to the caller once `off + copy_len` reaches the block's end (step 4).
    fn serve_block(self: &Arc<Self>, key: u64, block: Vec<u8>, buf: &mut [u8]) -> usize {
        let copy_len = block.len().min(buf.len());
        buf[..copy_len].copy_from_slice(&block[..copy_len]);
        if block.len() as u64 == self.block_size {
            self.arm_prefetch(key + self.block_size);
        }
        copy_len
    }

    fn arm_prefetch(self: &Arc<Self>, key: u64) {
        let (slot, fresh) = self.cache.slot(key);
        if !fresh {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _ = slot
                .get_or_init(|| async {
                    let mut block = vec![0u8; this.block_size as usize];
                    match this.meta.read(key, &mut block).await {
                        Ok(n) => {
                            block.truncate(n);
                            Some(block)
                        }
                        Err(_) => None,
                    }
                })
                .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aio::transport::TokioFileTransport;
    use std::time::Duration;
    use tempfile::tempdir;

    fn meta(path: std::path::PathBuf) -> Arc<MetaHandler<TokioFileTransport>> {
        Arc::new(MetaHandler::new(path, Arc::new(TokioFileTransport), Duration::from_secs(5)))
    }

    #[test]
    fn cache_evicts_lowest_offset_when_full() {
        let cache = PrefetchCache::new(2);
        cache.slot(0);
        cache.slot(4);
        cache.slot(8);
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(0));
        assert!(cache.contains(4));
        assert!(cache.contains(8));
    }

    #[tokio::test]
    async fn reads_sequential_blocks_through_prefetch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let data: Vec<u8> = (0..16u8).collect();
        std::fs::write(&path, &data).unwrap();

        let file = PrefetchingFile::new(meta(path), 4, 4);
        let mut buf = vec![0u8; 4];
        for (i, chunk) in data.chunks(4).enumerate() {
            let n = file.read_prefetch(i as u64 * 4, &mut buf).await.unwrap();
            assert_eq!(n, 4);
            assert_eq!(&buf[..n], chunk);
        }
    }

    #[tokio::test]
    async fn short_last_block_signals_eof() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, vec![1u8; 6]).unwrap();

        let file = PrefetchingFile::new(meta(path), 4, 4);
        let mut buf = vec![0u8; 4];
        assert_eq!(file.read_prefetch(0, &mut buf).await.unwrap(), 4);
        let n = file.read_prefetch(4, &mut buf).await.unwrap();
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn misaligned_offset_disables_further_prefetch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, vec![7u8; 16]).unwrap();

        let file = PrefetchingFile::new(meta(path), 4, 4);
        let mut buf = vec![0u8; 4];
        file.read_prefetch(1, &mut buf).await.unwrap();
        assert!(!file.prefetch_enabled());
    }

    #[tokio::test]
    async fn prefetch_past_eof_yields_empty_block_without_disabling() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, vec![3u8; 4]).unwrap();

        let file = PrefetchingFile::new(meta(path.clone()), 4, 4);
        let mut buf = vec![0u8; 4];
        // Block 0 is served directly and arms a prefetch for offset 4,
        // one block past the 4-byte file's end.
        file.read_prefetch(0, &mut buf).await.unwrap();
        // Give the background prefetch a chance to land before reading it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let n = file.read_prefetch(4, &mut buf).await.unwrap();
        assert_eq!(n, 0);
        assert!(file.prefetch_enabled());
    }
}
