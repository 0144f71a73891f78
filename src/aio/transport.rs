//! The five transport-level operations a `MetaHandler` schedules against:
//! open, read, write, vector-read, truncate, close (§4.8).

use crate::errors::Result;
use async_trait::async_trait;
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

/// Kind of outstanding request a `MetaHandler` is tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportOp {
    Open,
    Read,
    Write,
    VectorRead,
    Truncate,
    Close,
}

/// One `(offset, length)` segment of a vector read.
#[derive(Debug, Clone, Copy)]
pub struct ReadSegment {
    pub offset: u64,
    pub length: usize,
}

/// The underlying data-movement primitives the async I/O core schedules.
/// Implementations are expected to be cheap to clone/share (e.g. an `Arc`
/// around a connection pool) since one is held per open file.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, path: &Path, write: bool) -> Result<()>;
    async fn read(&self, path: &Path, offset: u64, buf: &mut [u8]) -> Result<usize>;
    async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> Result<usize>;
    async fn vector_read(&self, path: &Path, segments: &[ReadSegment]) -> Result<Vec<Vec<u8>>>;
    async fn truncate(&self, path: &Path, size: u64) -> Result<()>;
    async fn close(&self, path: &Path) -> Result<()>;
}

/// Default transport: plain local-disk `tokio::fs` operations.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioFileTransport;

#[async_trait]
impl Transport for TokioFileTransport {
    async fn open(&self, path: &Path, write: bool) -> Result<()> {
        let mut opts = OpenOptions::new();
        opts.read(true);
        if write {
            opts.write(true).create(true);
        }
        opts.open(path).await?;
        Ok(())
    }

    async fn read(&self, path: &Path, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut file = OpenOptions::new().read(true).open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(file.read(buf).await?)
    }

    async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> Result<usize> {
        let mut file = OpenOptions::new().write(true).create(true).open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        Ok(data.len())
    }

    async fn vector_read(&self, path: &Path, segments: &[ReadSegment]) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::with_capacity(segments.len());
        for seg in segments {
            let mut buf = vec![0u8; seg.length];
            let n = self.read(path, seg.offset, &mut buf).await?;
            buf.truncate(n);
            out.push(buf);
        }
        Ok(out)
    }

    async fn truncate(&self, path: &Path, size: u64) -> Result<()> {
        let file = OpenOptions::new().write(true).open(path).await?;
        file.set_len(size).await?;
        Ok(())
    }

    async fn close(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}
