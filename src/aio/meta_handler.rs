//! Per-file handler tracking every in-flight request, the first timeout
//! ever observed, and sticky write-failure poisoning (§4.8, §7).

use super::transport::{ReadSegment, Transport};
use crate::errors::{NsError, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Implementation-defined cap on concurrent outstanding requests per file
/// (§4.8: "up to an implementation-defined cap (≈20)").
pub const MAX_IN_FLIGHT: usize = 20;

struct State {
    in_flight: Mutex<HashSet<u64>>,
    next_id: AtomicU64,
    expired: AtomicBool,
    write_poisoned: AtomicBool,
}

/// Schedules chunk and vector requests against one open file, pooling
/// in-flight tracking behind a single shared handle.
pub struct MetaHandler<T: Transport> {
    path: PathBuf,
    transport: Arc<T>,
    timeout: Duration,
    state: Arc<State>,
}

impl<T: Transport> MetaHandler<T> {
    #[must_use]
    pub fn new(path: PathBuf, transport: Arc<T>, timeout: Duration) -> Self {
        Self {
            path,
            transport,
            timeout,
            state: Arc::new(State {
                in_flight: Mutex::new(HashSet::new()),
                next_id: AtomicU64::new(1),
                expired: AtomicBool::new(false),
                write_poisoned: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.state.in_flight.lock().len()
    }

    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.state.write_poisoned.load(Ordering::SeqCst)
    }

    fn begin(&self) -> Result<u64> {
        if self.state.expired.load(Ordering::SeqCst) {
            return Err(NsError::Expired);
        }
        let mut in_flight = self.state.in_flight.lock();
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        in_flight.insert(id);
        Ok(id)
    }

    fn end(&self, id: u64) {
        self.state.in_flight.lock().remove(&id);
    }

    async fn with_tracking<F, Fut, R>(&self, fut_fn: F) -> Result<R>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<R>>,
    {
        let id = self.begin()?;
        let outcome = tokio::time::timeout(self.timeout, fut_fn()).await;
        self.end(id);
        match outcome {
            Ok(result) => result,
            Err(_) => {
                self.state.expired.store(true, Ordering::SeqCst);
                Err(NsError::Expired)
            }
        }
    }

    /// # Errors
    /// `NsError::Expired` if this or a prior request on this handler timed
    /// out; otherwise propagates the transport's result.
    pub async fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let transport = self.transport.clone();
        let path = self.path.clone();
        let len = buf.len();
        let out = self
            .with_tracking(|| async move {
                let mut scratch = vec![0u8; len];
                let n = transport.read(&path, offset, &mut scratch).await?;
                Ok((scratch, n))
            })
            .await?;
        buf[..out.1].copy_from_slice(&out.0[..out.1]);
        Ok(out.1)
    }

    /// Once poisoned by a prior write failure, every subsequent write and
    /// the final `close` fail locally without reaching the transport
    /// (§7: "the meta-handler is poisoned").
    ///
    /// # Errors
    /// `NsError::Io` if poisoned; `NsError::Expired` on timeout;
    /// otherwise propagates the transport's result.
    pub async fn write(&self, offset: u64, data: Vec<u8>) -> Result<usize> {
        if self.is_poisoned() {
            return Err(NsError::Io(format!("{} is poisoned by a prior write failure", self.path.display())));
        }
        let transport = self.transport.clone();
        let path = self.path.clone();
        let result = self.with_tracking(|| async move { transport.write(&path, offset, &data).await }).await;
        if result.is_err() {
            self.state.write_poisoned.store(true, Ordering::SeqCst);
        }
        result
    }

    /// # Errors
    /// Same as `read`, applied independently to each segment.
    pub async fn vector_read(&self, segments: Vec<ReadSegment>) -> Result<Vec<Vec<u8>>> {
        let transport = self.transport.clone();
        let path = self.path.clone();
        self.with_tracking(|| async move { transport.vector_read(&path, &segments).await }).await
    }

    /// # Errors
    /// Same as `write`: fails immediately if poisoned.
    pub async fn truncate(&self, size: u64) -> Result<()> {
        if self.is_poisoned() {
            return Err(NsError::Io(format!("{} is poisoned by a prior write failure", self.path.display())));
        }
        let transport = self.transport.clone();
        let path = self.path.clone();
        let result = self.with_tracking(|| async move { transport.truncate(&path, size).await }).await;
        if result.is_err() {
            self.state.write_poisoned.store(true, Ordering::SeqCst);
        }
        result
    }

    /// # Errors
    /// `NsError::Io` if this handler was poisoned by an earlier write
    /// failure; the close is not attempted against the transport in that
    /// case.
    pub async fn close(&self) -> Result<()> {
        if self.is_poisoned() {
            return Err(NsError::Io(format!("{} close failed: poisoned by a prior write failure", self.path.display())));
        }
        self.transport.close(&self.path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aio::transport::TokioFileTransport;
    use tempfile::tempdir;

    #[tokio::test]
    async fn write_failure_poisons_subsequent_writes_and_close() {
        let dir = tempdir().unwrap();
        // A path inside a nonexistent directory: every write fails.
        let path = dir.path().join("missing-dir").join("f.bin");
        let handler = MetaHandler::new(path, Arc::new(TokioFileTransport), Duration::from_secs(5));

        assert!(handler.write(0, b"x".to_vec()).await.is_err());
        assert!(handler.is_poisoned());
        let err = handler.write(0, b"y".to_vec()).await.unwrap_err();
        assert!(matches!(err, NsError::Io(_)));
        let err = handler.close().await.unwrap_err();
        assert!(matches!(err, NsError::Io(_)));
    }

    #[tokio::test]
    async fn read_write_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, vec![0u8; 8]).unwrap();
        let handler = MetaHandler::new(path, Arc::new(TokioFileTransport), Duration::from_secs(5));

        handler.write(0, b"hello!!!".to_vec()).await.unwrap();
        let mut buf = vec![0u8; 5];
        handler.read(0, &mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }
}
