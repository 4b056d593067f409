//! Process-wide observability counters.
//!
//! Cheap atomic counters incremented from the hot media paths and
//! reported through logs and the health endpoint. Counters only ever
//! go up; rates are derived by the consumer.

use std::sync::atomic::{AtomicU64, Ordering};

/// Gateway-wide metrics. One instance, shared via `Arc`.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Stills emitted by samplers across all sessions.
    pub stills_sampled: AtomicU64,
    /// Stills dropped because downstream was busy (newest-wins policy).
    pub stills_dropped: AtomicU64,
    /// Frames blocked by the privacy shield.
    pub frames_blocked: AtomicU64,
    /// Frames blurred by the privacy shield.
    pub frames_blurred: AtomicU64,
    /// Audio chunks forwarded upstream.
    pub audio_forwarded: AtomicU64,
    /// Audio chunks dropped while the bridge was reconnecting.
    pub audio_dropped: AtomicU64,
    /// Upstream reconnect attempts.
    pub reconnects: AtomicU64,
    /// Turns cancelled by barge-in.
    pub turns_interrupted: AtomicU64,
    /// Sessions opened since boot.
    pub sessions_opened: AtomicU64,
    /// Sessions closed since boot.
    pub sessions_closed: AtomicU64,
    /// HTTP requests rejected by the rate limiter.
    pub rate_limited: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Point-in-time snapshot for the health endpoint.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            stills_sampled: Self::get(&self.stills_sampled),
            stills_dropped: Self::get(&self.stills_dropped),
            frames_blocked: Self::get(&self.frames_blocked),
            frames_blurred: Self::get(&self.frames_blurred),
            audio_forwarded: Self::get(&self.audio_forwarded),
            audio_dropped: Self::get(&self.audio_dropped),
            reconnects: Self::get(&self.reconnects),
            turns_interrupted: Self::get(&self.turns_interrupted),
            sessions_open: Self::get(&self.sessions_opened)
                .saturating_sub(Self::get(&self.sessions_closed)),
            rate_limited: Self::get(&self.rate_limited),
        }
    }
}

/// Serializable counter snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub stills_sampled: u64,
    pub stills_dropped: u64,
    pub frames_blocked: u64,
    pub frames_blurred: u64,
    pub audio_forwarded: u64,
    pub audio_dropped: u64,
    pub reconnects: u64,
    pub turns_interrupted: u64,
    pub sessions_open: u64,
    pub rate_limited: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::new();
        Metrics::incr(&m.stills_sampled);
        Metrics::incr(&m.stills_sampled);
        Metrics::add(&m.audio_forwarded, 5);
        let snap = m.snapshot();
        assert_eq!(snap.stills_sampled, 2);
        assert_eq!(snap.audio_forwarded, 5);
        assert_eq!(snap.stills_dropped, 0);
    }

    #[test]
    fn open_sessions_never_underflow() {
        let m = Metrics::new();
        Metrics::incr(&m.sessions_closed);
        assert_eq!(m.snapshot().sessions_open, 0);
    }
}
