//! Per-share back-off after failed passes.

use std::time::Duration;
use tokio::time::Instant;

/// Waiting time after the n-th consecutive failure. Saturates at 30 minutes.
pub fn stride(failure_count: u32) -> Duration {
    const STRIDES_SECS: [u64; 11] = [0, 1, 2, 5, 10, 30, 60, 120, 300, 600, 1800];
    let index = (failure_count as usize).min(STRIDES_SECS.len() - 1);
    Duration::from_secs(STRIDES_SECS[index])
}

#[derive(Debug, Clone, Default)]
pub struct BackOffManager {
    failures: u32,
    last_failure: Option<Instant>,
}

impl BackOffManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.failures = self.failures.saturating_add(1);
        self.last_failure = Some(now);
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.last_failure = None;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Earliest instant the next pass may start.
    pub fn retry_at(&self) -> Option<Instant> {
        self.last_failure.map(|at| at + stride(self.failures))
    }

    pub fn can_proceed(&self, now: Instant) -> bool {
        self.retry_at().map_or(true, |at| now >= at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_table() {
        let expected = [0, 1, 2, 5, 10, 30, 60, 120, 300, 600, 1800, 1800, 1800];
        for (count, secs) in expected.iter().enumerate() {
            assert_eq!(stride(count as u32), Duration::from_secs(*secs), "failure {}", count);
        }
    }

    #[test]
    fn no_failures_no_need_to_back_off() {
        let manager = BackOffManager::new();
        assert!(manager.can_proceed(Instant::now()));
        assert!(manager.retry_at().is_none());
    }

    #[test]
    fn one_failure_backs_off_one_second() {
        let mut manager = BackOffManager::new();
        let at = Instant::now();
        manager.record_failure(at);

        assert!(!manager.can_proceed(at));
        assert!(!manager.can_proceed(at + Duration::from_millis(999)));
        assert!(manager.can_proceed(at + Duration::from_secs(1)));
    }

    #[test]
    fn three_failures_back_off_five_seconds_from_the_last() {
        let mut manager = BackOffManager::new();
        let start = Instant::now();
        manager.record_failure(start);
        manager.record_failure(start + Duration::from_secs(2));
        let last = start + Duration::from_secs(5);
        manager.record_failure(last);

        assert!(!manager.can_proceed(last + Duration::from_secs(4)));
        assert!(manager.can_proceed(last + Duration::from_secs(5)));
    }

    #[test]
    fn success_resets() {
        let mut manager = BackOffManager::new();
        let at = Instant::now();
        manager.record_failure(at);
        manager.record_failure(at);
        manager.record_success();

        assert_eq!(manager.failures(), 0);
        assert!(manager.can_proceed(at));
    }
}
