//! Shared test fakes for the collaborator traits.
//!
//! Compiled for tests only. Fakes implement the same traits as the
//! production wirings so pipelines are exercised unchanged.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::shield::detector::{FaceBox, FaceDetector};
use crate::upstream::bridge::{LiveClient, LiveConnection};
use crate::upstream::events::LiveEvent;

// ── Face detector fakes ────────────────────────────────────────────

/// A detector that always returns the same faces (or always fails).
pub struct FakeDetector {
    faces: Vec<FaceBox>,
    fail: bool,
}

impl FakeDetector {
    pub fn with_faces(faces: Vec<FaceBox>) -> Self {
        Self { faces, fail: false }
    }

    pub fn failing() -> Self {
        Self {
            faces: Vec::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl FaceDetector for FakeDetector {
    async fn detect(&self, _jpeg: &[u8]) -> Result<Vec<FaceBox>> {
        if self.fail {
            anyhow::bail!("detector offline");
        }
        Ok(self.faces.clone())
    }
}

// ── Live client fakes ──────────────────────────────────────────────

/// Something the fake connection recorded as sent upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentItem {
    Audio(Vec<u8>),
    Image(Vec<u8>),
    EndTurn,
}

struct FakeLiveState {
    fail_remaining: u32,
    connect_attempts: u32,
    sent: Vec<SentItem>,
    event_tx: Option<mpsc::Sender<LiveEvent>>,
    queued_events: Vec<LiveEvent>,
}

/// Scriptable in-memory Live service.
pub struct FakeLiveClient {
    state: Arc<Mutex<FakeLiveState>>,
    sent_notify: Arc<Notify>,
}

impl FakeLiveClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(FakeLiveState {
                fail_remaining: 0,
                connect_attempts: 0,
                sent: Vec::new(),
                event_tx: None,
                queued_events: Vec::new(),
            })),
            sent_notify: Arc::new(Notify::new()),
        })
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_connects(&self, n: u32) {
        self.state.lock().fail_remaining = n;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    /// Queue events for delivery through the (current or next) connection.
    pub fn script_events(&self, events: Vec<LiveEvent>) {
        let mut state = self.state.lock();
        if let Some(tx) = &state.event_tx {
            for event in events {
                let _ = tx.try_send(event);
            }
        } else {
            state.queued_events.extend(events);
        }
    }

    /// Everything sent upstream so far, in order.
    pub fn sent(&self) -> Vec<SentItem> {
        self.state.lock().sent.clone()
    }

    /// Wait until at least `n` items were sent.
    pub async fn wait_for_sent(&self, n: usize) {
        loop {
            // Register interest before checking, or a send that lands
            // between the check and the wait is missed.
            let notified = self.sent_notify.notified();
            if self.state.lock().sent.len() >= n {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl LiveClient for FakeLiveClient {
    async fn connect(&self, _session_id: &str) -> Result<Box<dyn LiveConnection>> {
        let event_rx = {
            let mut state = self.state.lock();
            state.connect_attempts += 1;
            if state.fail_remaining > 0 {
                state.fail_remaining -= 1;
                anyhow::bail!("connection refused");
            }
            let (tx, rx) = mpsc::channel(1024);
            for event in state.queued_events.drain(..) {
                let _ = tx.try_send(event);
            }
            state.event_tx = Some(tx);
            rx
        };
        Ok(Box::new(FakeLiveConnection {
            state: Arc::clone(&self.state),
            sent_notify: Arc::clone(&self.sent_notify),
            event_rx: Some(event_rx),
        }))
    }
}

struct FakeLiveConnection {
    state: Arc<Mutex<FakeLiveState>>,
    sent_notify: Arc<Notify>,
    event_rx: Option<mpsc::Receiver<LiveEvent>>,
}

impl FakeLiveConnection {
    fn record(&self, item: SentItem) {
        self.state.lock().sent.push(item);
        self.sent_notify.notify_waiters();
    }
}

#[async_trait]
impl LiveConnection for FakeLiveConnection {
    async fn send_audio(&mut self, pcm: &[u8]) -> Result<()> {
        self.record(SentItem::Audio(pcm.to_vec()));
        Ok(())
    }

    async fn send_image(&mut self, jpeg: &[u8]) -> Result<()> {
        self.record(SentItem::Image(jpeg.to_vec()));
        Ok(())
    }

    async fn end_turn(&mut self) -> Result<()> {
        self.record(SentItem::EndTurn);
        Ok(())
    }

    fn take_events(&mut self) -> mpsc::Receiver<LiveEvent> {
        self.event_rx.take().expect("event stream already taken")
    }

    async fn close(&mut self) {}
}
