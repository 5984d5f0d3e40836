// ABOUTME: Timer-driven bytes-per-second sampling and percent-complete tracking for transfers
// ABOUTME: A guard type whose Drop stops the sampler, since Rust has no `finally`

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Tracks bytes transferred against an optional known total, sampling a
/// bytes-per-second rate once per second while running.
///
/// Stopping is tied to the value's lifetime: dropping a `ProgressMonitor` stops its
/// sampler task, so callers don't need to remember to call `stop()` on every exit path
/// (including cancellation and error returns) of a transfer loop.
pub struct ProgressMonitor {
    total_length: Option<u64>,
    current_count: Arc<AtomicU64>,
    bytes_per_second: Arc<AtomicU64>,
    rate_tx: watch::Sender<u64>,
    sampler_task: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    pub fn new(total_length: Option<u64>) -> Self {
        let (rate_tx, _rate_rx) = watch::channel(0);
        ProgressMonitor {
            total_length,
            current_count: Arc::new(AtomicU64::new(0)),
            bytes_per_second: Arc::new(AtomicU64::new(0)),
            rate_tx,
            sampler_task: None,
        }
    }

    /// Begin 1-second rate sampling. Calling this more than once is a no-op.
    pub fn start(&mut self) {
        if self.sampler_task.is_some() {
            return;
        }
        let current_count = self.current_count.clone();
        let bytes_per_second = self.bytes_per_second.clone();
        let rate_tx = self.rate_tx.clone();
        self.sampler_task = Some(tokio::spawn(async move {
            let mut last = 0u64;
            let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
            loop {
                ticker.tick().await;
                let now = current_count.load(Ordering::Relaxed);
                let rate = now.saturating_sub(last);
                last = now;
                bytes_per_second.store(rate, Ordering::Relaxed);
                // A closed receiver (no one watching) is not an error for the sampler.
                let _ = rate_tx.send(rate);
            }
        }));
    }

    /// Record `n` additional bytes transferred.
    pub fn add(&self, n: u64) {
        self.current_count.fetch_add(n, Ordering::Relaxed);
    }

    pub fn current_count(&self) -> u64 {
        self.current_count.load(Ordering::Relaxed)
    }

    pub fn total_length(&self) -> Option<u64> {
        self.total_length
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.bytes_per_second.load(Ordering::Relaxed)
    }

    /// Subscribe to rate updates as they're sampled.
    pub fn subscribe_rate(&self) -> watch::Receiver<u64> {
        self.rate_tx.subscribe()
    }

    /// Percent complete, floored, or `-1` if the total is unknown.
    pub fn percent(&self) -> i32 {
        match self.total_length {
            None => -1,
            Some(0) => 100,
            Some(total) => ((self.current_count() as u128 * 100) / total as u128) as i32,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.total_length.is_some_and(|total| self.current_count() == total)
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.sampler_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_unknown_total_is_negative_one() {
        let monitor = ProgressMonitor::new(None);
        assert_eq!(monitor.percent(), -1);
    }

    #[test]
    fn percent_is_monotonic_and_reaches_100() {
        let monitor = ProgressMonitor::new(Some(200));
        assert_eq!(monitor.percent(), 0);
        monitor.add(100);
        assert_eq!(monitor.percent(), 50);
        monitor.add(100);
        assert_eq!(monitor.percent(), 100);
        assert!(monitor.is_completed());
    }
}
