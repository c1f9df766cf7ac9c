//! Daemon-observable counters.
//!
//! Everything here is observable from the polling loop and the scheduler
//! frontend running in this process; counters are atomics updated from the
//! hot path, rolled up once per tick, and exposed read-only through
//! [`Metrics::snapshot`] for `neon-cli status` and tests. There is no HTTP
//! exporter — metrics export is ambient plumbing, not a feature this crate
//! asks for.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub use neon_proto::MetricsSnapshot;

/// Global counters for the scheduler daemon.
pub struct Metrics {
    pub submit_total: AtomicU64,
    pub issue_total: AtomicU64,
    pub complete_total: AtomicU64,
    pub poll_ticks_total: AtomicU64,
    pub malicious_kills_total: AtomicU64,
    poll_tick_nanos_total: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            submit_total: AtomicU64::new(0),
            issue_total: AtomicU64::new(0),
            complete_total: AtomicU64::new(0),
            poll_ticks_total: AtomicU64::new(0),
            malicious_kills_total: AtomicU64::new(0),
            poll_tick_nanos_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn inc_submit(&self) {
        self.submit_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_issue(&self) {
        self.issue_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_complete(&self) {
        self.complete_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_malicious_kill(&self) {
        self.malicious_kills_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one polling-tick's wall-clock cost, rolling it into the
    /// running average `snapshot()` reports.
    pub fn record_poll_tick(&self, elapsed: Duration) {
        self.poll_ticks_total.fetch_add(1, Ordering::Relaxed);
        self.poll_tick_nanos_total.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn avg_poll_tick_micros(&self) -> u64 {
        let ticks = self.poll_ticks_total.load(Ordering::Relaxed);
        if ticks == 0 {
            return 0;
        }
        self.poll_tick_nanos_total.load(Ordering::Relaxed) / ticks / 1000
    }

    /// A point-in-time, serializable copy for the status surface.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submit_total: self.submit_total.load(Ordering::Relaxed),
            issue_total: self.issue_total.load(Ordering::Relaxed),
            complete_total: self.complete_total.load(Ordering::Relaxed),
            poll_ticks_total: self.poll_ticks_total.load(Ordering::Relaxed),
            malicious_kills_total: self.malicious_kills_total.load(Ordering::Relaxed),
            avg_poll_tick_micros: self.avg_poll_tick_micros(),
            uptime_seconds: self.uptime_seconds(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = Metrics::new();
        let snap = m.snapshot();
        assert_eq!(snap.submit_total, 0);
        assert_eq!(snap.poll_ticks_total, 0);
    }

    #[test]
    fn poll_tick_rollup_tracks_a_running_average() {
        let m = Metrics::new();
        m.record_poll_tick(Duration::from_micros(100));
        m.record_poll_tick(Duration::from_micros(300));
        let snap = m.snapshot();
        assert_eq!(snap.poll_ticks_total, 2);
        assert_eq!(snap.avg_poll_tick_micros, 200);
    }

    #[test]
    fn inc_helpers_accumulate() {
        let m = Metrics::new();
        m.inc_submit();
        m.inc_submit();
        m.inc_issue();
        m.inc_complete();
        m.inc_malicious_kill();
        let snap = m.snapshot();
        assert_eq!(snap.submit_total, 2);
        assert_eq!(snap.issue_total, 1);
        assert_eq!(snap.complete_total, 1);
        assert_eq!(snap.malicious_kills_total, 1);
    }
}
