//! Per-FSID retry accounting: a maximum retry count and a backoff
//! interval between attempts (§4.11 item 2).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct RetryState {
    count: u32,
    last_attempt: Instant,
}

/// Tracks (count, last-attempt-timestamp) per FSID, independently of the
/// driver loop that consumes it.
pub struct RetryTracker {
    max_retries: u32,
    backoff: Duration,
    states: Mutex<HashMap<u32, RetryState>>,
}

impl RetryTracker {
    #[must_use]
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self { max_retries, backoff, states: Mutex::new(HashMap::new()) }
    }

    /// True if `fsid` may be attempted now: it has never failed, or its
    /// failure count is under the cap and the backoff interval has
    /// elapsed since its last attempt.
    #[must_use]
    pub fn should_retry(&self, fsid: u32) -> bool {
        let states = self.states.lock();
        match states.get(&fsid) {
            None => true,
            Some(state) => state.count < self.max_retries && state.last_attempt.elapsed() >= self.backoff,
        }
    }

    #[must_use]
    pub fn is_exhausted(&self, fsid: u32) -> bool {
        self.states.lock().get(&fsid).is_some_and(|s| s.count >= self.max_retries)
    }

    pub fn record_failure(&self, fsid: u32) {
        let mut states = self.states.lock();
        let state = states.entry(fsid).or_insert(RetryState { count: 0, last_attempt: Instant::now() });
        state.count += 1;
        state.last_attempt = Instant::now();
    }

    pub fn reset(&self, fsid: u32) {
        self.states.lock().remove(&fsid);
    }

    #[must_use]
    pub fn retry_count(&self, fsid: u32) -> u32 {
        self.states.lock().get(&fsid).map_or(0, |s| s.count)
    }

    #[must_use]
    pub fn backoff(&self) -> Duration {
        self.backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_after_max_retries() {
        let tracker = RetryTracker::new(2, Duration::from_secs(0));
        assert!(tracker.should_retry(1));
        tracker.record_failure(1);
        assert!(tracker.should_retry(1));
        tracker.record_failure(1);
        assert!(!tracker.should_retry(1));
        assert!(tracker.is_exhausted(1));
    }

    #[test]
    fn backoff_blocks_immediate_retry() {
        let tracker = RetryTracker::new(5, Duration::from_secs(60));
        tracker.record_failure(1);
        assert!(!tracker.should_retry(1));
    }

    #[test]
    fn reset_clears_state() {
        let tracker = RetryTracker::new(1, Duration::from_secs(0));
        tracker.record_failure(1);
        tracker.reset(1);
        assert!(tracker.should_retry(1));
        assert_eq!(tracker.retry_count(1), 0);
    }
}
