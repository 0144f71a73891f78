//! `GroupDrainer`: per-space driver loop that schedules file transfers
//! off draining filesystems (§4.11).

pub mod progress;
pub mod retry;
pub mod status;

pub use progress::DrainProgressTracker;
pub use retry::RetryTracker;
pub use status::{group_status, DrainState, FsStatus, GroupStatus};

use crate::errors::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// A `(fsid, file id)` transfer identity, used as the in-flight/failed
/// tracking key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId {
    pub fsid: u32,
    pub file_id: u64,
}

/// Source of truth for group membership and per-FSID drain status.
/// Implementations typically wrap a namespace view plus the geo-tree.
#[async_trait]
pub trait GroupSource: Send + Sync {
    /// Current FSID membership and status for every group in the space.
    async fn groups(&self, space: &str) -> Result<HashMap<String, Vec<(u32, FsStatus)>>>;

    /// Pull up to `limit` file ids residing on `fsid` that still need a
    /// transfer scheduled.
    async fn pull_batch(&self, fsid: u32, limit: usize) -> Result<Vec<u64>>;

    /// Total known file count on `fsid`, for progress reporting.
    async fn total_files(&self, fsid: u32) -> Result<u64>;
}

/// Submits one transfer and reports whether it was accepted. Actual
/// replica movement is out of scope; this is the seam a caller's
/// transfer engine plugs into.
#[async_trait]
pub trait TransferSubmitter: Send + Sync {
    async fn submit(&self, id: TransferId) -> Result<()>;
}

struct GroupState {
    fsid_status: HashMap<String, Vec<(u32, FsStatus)>>,
    last_refresh: Instant,
}

/// Drives one space's groups through their drain lifecycle.
pub struct GroupDrainer<G: GroupSource, T: TransferSubmitter> {
    space: String,
    source: G,
    submitter: T,
    cache_expiry: Duration,
    max_in_flight: usize,
    fid_batch_size: usize,
    retries: RetryTracker,
    progress: DrainProgressTracker,
    state: Mutex<GroupState>,
    in_flight: Mutex<HashSet<TransferId>>,
    failed: Mutex<HashMap<TransferId, Instant>>,
}

impl<G: GroupSource, T: TransferSubmitter> GroupDrainer<G, T> {
    #[must_use]
    pub fn new(
        space: impl Into<String>,
        source: G,
        submitter: T,
        cache_expiry: Duration,
        max_retries: u32,
        retry_backoff: Duration,
        max_in_flight: usize,
        fid_batch_size: usize,
    ) -> Self {
        Self {
            space: space.into(),
            source,
            submitter,
            cache_expiry,
            max_in_flight,
            fid_batch_size,
            retries: RetryTracker::new(max_retries, retry_backoff),
            progress: DrainProgressTracker::new(),
            state: Mutex::new(GroupState { fsid_status: HashMap::new(), last_refresh: Instant::now() - cache_expiry - Duration::from_secs(1) }),
            in_flight: Mutex::new(HashSet::new()),
            failed: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn progress_tracker(&self) -> &DrainProgressTracker {
        &self.progress
    }

    /// Force the next `tick()` to refresh the group map regardless of
    /// the cache expiry, mirroring an external reconfigure request.
    pub fn request_refresh(&self) {
        let mut state = self.state.lock();
        state.last_refresh = Instant::now() - self.cache_expiry - Duration::from_secs(1);
    }

    async fn refresh_if_stale(&self) -> Result<()> {
        let stale = {
            let state = self.state.lock();
            state.last_refresh.elapsed() >= self.cache_expiry
        };
        if !stale {
            return Ok(());
        }
        let groups = self.source.groups(&self.space).await?;
        let mut state = self.state.lock();
        state.fsid_status = groups;
        state.last_refresh = Instant::now();
        Ok(())
    }

    /// Group-level status for `name`, or `None` if the group is unknown.
    #[must_use]
    pub fn status_of(&self, name: &str) -> Option<GroupStatus> {
        let state = self.state.lock();
        let members = state.fsid_status.get(name)?;
        Some(group_status(&members.iter().map(|(_, s)| *s).collect::<Vec<_>>()))
    }

    fn draining_fsids(&self) -> Vec<u32> {
        let state = self.state.lock();
        let mut out = Vec::new();
        for members in state.fsid_status.values() {
            for &(fsid, status) in members {
                if status.online && status.drain == DrainState::Draining {
                    out.push(fsid);
                }
            }
        }
        out
    }

    fn may_schedule(&self, id: TransferId) -> bool {
        if self.in_flight.lock().contains(&id) {
            return false;
        }
        match self.failed.lock().get(&id) {
            None => true,
            Some(&failed_at) => failed_at.elapsed() >= self.retries.backoff(),
        }
    }

    /// Run one iteration of the driver loop: refresh membership if
    /// stale, then for each draining FSID pull a batch, filter already
    /// tracked ids, and submit transfers until the in-flight cap holds.
    pub async fn tick(&self) -> Result<()> {
        self.refresh_if_stale().await?;

        for fsid in self.draining_fsids() {
            if self.in_flight.lock().len() >= self.max_in_flight {
                break;
            }
            if let Ok(total) = self.source.total_files(fsid).await {
                self.progress.record_total(fsid, total);
            }
            let batch = self.source.pull_batch(fsid, self.fid_batch_size).await?;
            let mut scheduled_here = 0u64;
            for file_id in batch {
                if self.in_flight.lock().len() >= self.max_in_flight {
                    break;
                }
                let id = TransferId { fsid, file_id };
                if !self.may_schedule(id) {
                    continue;
                }
                self.in_flight.lock().insert(id);
                match self.submitter.submit(id).await {
                    Ok(()) => {
                        scheduled_here += 1;
                        self.retries.reset(fsid);
                    }
                    Err(_) => {
                        self.in_flight.lock().remove(&id);
                        self.failed.lock().insert(id, Instant::now());
                        self.retries.record_failure(fsid);
                    }
                }
            }
            if scheduled_here > 0 {
                self.progress.record_scheduled(fsid, scheduled_here);
            }
        }
        Ok(())
    }

    /// Mark a previously submitted transfer as completed, freeing its
    /// in-flight slot.
    pub fn complete(&self, id: TransferId) {
        self.in_flight.lock().remove(&id);
        self.failed.lock().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FixedSource {
        groups: HashMap<String, Vec<(u32, FsStatus)>>,
        files: Vec<u64>,
    }

    #[async_trait]
    impl GroupSource for FixedSource {
        async fn groups(&self, _space: &str) -> Result<HashMap<String, Vec<(u32, FsStatus)>>> {
            Ok(self.groups.clone())
        }

        async fn pull_batch(&self, _fsid: u32, limit: usize) -> Result<Vec<u64>> {
            Ok(self.files.iter().take(limit).copied().collect())
        }

        async fn total_files(&self, _fsid: u32) -> Result<u64> {
            Ok(self.files.len() as u64)
        }
    }

    struct CountingSubmitter {
        count: AtomicU64,
    }

    #[async_trait]
    impl TransferSubmitter for CountingSubmitter {
        async fn submit(&self, _id: TransferId) -> Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn draining_status() -> FsStatus {
        FsStatus { online: true, drain: DrainState::Draining }
    }

    #[tokio::test]
    async fn tick_schedules_files_from_draining_fsids() {
        let mut groups = HashMap::new();
        groups.insert("grp1".to_string(), vec![(1, draining_status())]);
        let source = FixedSource { groups, files: vec![10, 11, 12] };
        let submitter = CountingSubmitter { count: AtomicU64::new(0) };
        let drainer = GroupDrainer::new(
            "space1",
            source,
            submitter,
            Duration::from_secs(0),
            5,
            Duration::from_secs(60),
            100,
            1000,
        );
        drainer.tick().await.unwrap();
        assert_eq!(drainer.submitter.count.load(Ordering::SeqCst), 3);
        assert_eq!(drainer.progress_tracker().progress(1), (3, 3));
    }

    #[tokio::test]
    async fn tick_does_not_reschedule_in_flight_transfers() {
        let mut groups = HashMap::new();
        groups.insert("grp1".to_string(), vec![(1, draining_status())]);
        let source = FixedSource { groups, files: vec![10] };
        let submitter = CountingSubmitter { count: AtomicU64::new(0) };
        let drainer = GroupDrainer::new(
            "space1",
            source,
            submitter,
            Duration::from_secs(3600),
            5,
            Duration::from_secs(60),
            100,
            1000,
        );
        drainer.tick().await.unwrap();
        drainer.tick().await.unwrap();
        assert_eq!(drainer.submitter.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn status_of_reflects_group_source() {
        let mut groups = HashMap::new();
        groups.insert(
            "grp1".to_string(),
            vec![
                (1, FsStatus { online: true, drain: DrainState::Drained }),
                (2, FsStatus { online: true, drain: DrainState::Drained }),
            ],
        );
        let source = FixedSource { groups, files: vec![] };
        let drainer = GroupDrainer::new(
            "space1",
            source,
            CountingSubmitter { count: AtomicU64::new(0) },
            Duration::from_secs(0),
            5,
            Duration::from_secs(60),
            100,
            1000,
        );
        drainer.tick().await.unwrap();
        assert_eq!(drainer.status_of("grp1"), Some(GroupStatus::DrainComplete));
    }
}
