//! Frame sampling: decouples ingest cadence from upstream cadence.
//!
//! Video arrives at whatever rate the browser encodes (typically 30 fps)
//! but the upstream contract is one still per sampling interval
//! (default 1000 ms). The [`SampleGate`] makes the cadence decision;
//! the [`StillMailbox`] hands stills to the screening stage with
//! newest-wins semantics: an unconsumed still is replaced, never queued.
//! Audio is not sampled; it passes through the pipeline unchanged.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::StillFrame;

// ── Cadence gate ───────────────────────────────────────────────────

/// Decides whether an incoming video frame becomes a still.
///
/// At most one frame passes per interval; all others within the same
/// interval are rejected. The decision is purely time-based so ingest
/// jitter cannot produce two stills in one interval.
#[derive(Debug)]
pub struct SampleGate {
    interval: Duration,
    last_emit: Option<Instant>,
}

impl SampleGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
        }
    }

    /// Whether a frame observed now should be emitted as a still.
    pub fn should_emit(&mut self, now: Instant) -> bool {
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}

// ── Newest-wins handoff ────────────────────────────────────────────

/// Single-slot handoff between the sampler and the screening stage.
///
/// `put` replaces any unconsumed still (the stale one is the drop, so
/// the newest capture always wins); `take` waits for the next still.
#[derive(Debug, Default)]
pub struct StillMailbox {
    slot: Mutex<Option<StillFrame>>,
    notify: Notify,
}

impl StillMailbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deposit a still. Returns `true` if an unconsumed still was
    /// displaced (an observable drop).
    pub fn put(&self, still: StillFrame) -> bool {
        let dropped = {
            let mut slot = self.slot.lock();
            let dropped = slot.is_some();
            *slot = Some(still);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    /// Wait for and take the next still. Returns `None` once `closed`
    /// is cancelled and no still is pending.
    pub async fn take(&self, closed: &tokio_util::sync::CancellationToken) -> Option<StillFrame> {
        loop {
            if let Some(still) = self.slot.lock().take() {
                return Some(still);
            }
            tokio::select! {
                _ = closed.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Non-blocking take, used by tests and drain-on-shutdown.
    pub fn try_take(&self) -> Option<StillFrame> {
        self.slot.lock().take()
    }
}
