//! # Sliding Rate Window
//!
//! Tracks dispatch timestamps over a trailing window. A call may go out only while fewer
//! than `limit` timestamps fall inside the window; when the window is full, the next slot
//! opens exactly when the oldest timestamp ages out.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Trailing-window dispatch history for one source
#[derive(Debug, Clone)]
pub struct RateWindow {
    limit: u32,
    window: Duration,
    history: VecDeque<Instant>,
}

impl RateWindow {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            history: VecDeque::with_capacity(limit as usize),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Drop timestamps that are no longer inside the trailing window.
    ///
    /// A timestamp `t` is inside while `now - t < window`.
    pub fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.history.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Prune, then report whether another dispatch fits in the window
    pub fn has_capacity(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.history.len() < self.limit as usize
    }

    /// Time until the next slot opens, zero when one is already free
    pub fn wait_time(&mut self, now: Instant) -> Duration {
        if self.has_capacity(now) {
            return Duration::ZERO;
        }

        // Full window: timestamps are recorded in order, so the front is the oldest
        match self.history.front() {
            Some(&oldest) => (oldest + self.window).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Record a dispatch at `now`
    pub fn record(&mut self, now: Instant) {
        self.history.push_back(now);
    }

    /// Number of dispatches inside the window as of `now`, without mutating the history
    pub fn in_window(&self, now: Instant) -> usize {
        self.history
            .iter()
            .filter(|&&t| now.saturating_duration_since(t) < self.window)
            .count()
    }

    /// Dispatch timestamps currently retained, oldest first
    pub fn history(&self) -> impl Iterator<Item = Instant> + '_ {
        self.history.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_capacity_until_limit() {
        let mut window = RateWindow::new(3, Duration::from_secs(60));
        let now = Instant::now();

        for _ in 0..3 {
            assert!(window.has_capacity(now));
            window.record(now);
        }
        assert!(!window.has_capacity(now));
        assert_eq!(window.in_window(now), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_oldest_ages_out() {
        let mut window = RateWindow::new(2, Duration::from_secs(60));
        let start = Instant::now();

        window.record(start);
        window.record(start + Duration::from_secs(10));

        let now = start + Duration::from_secs(15);
        assert_eq!(window.wait_time(now), Duration::from_secs(45));

        // Exactly one window after the oldest dispatch, its slot is free again
        let later = start + Duration::from_secs(60);
        assert!(window.has_capacity(later));
        assert_eq!(window.wait_time(later), Duration::ZERO);
        assert_eq!(window.in_window(later), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_keeps_recent_entries() {
        let mut window = RateWindow::new(5, Duration::from_secs(12));
        let start = Instant::now();

        window.record(start);
        window.record(start + Duration::from_secs(5));
        window.record(start + Duration::from_secs(11));

        window.prune(start + Duration::from_secs(13));
        let kept: Vec<_> = window.history().collect();
        assert_eq!(
            kept,
            vec![start + Duration::from_secs(5), start + Duration::from_secs(11)]
        );
    }
}
