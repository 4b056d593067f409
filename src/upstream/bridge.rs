//! Bidirectional bridge to the upstream Live service.
//!
//! One bridge per client session. The bridge owns the WebSocket
//! connection lifecycle; the session task owns the policy of whether a
//! given chunk or still may be forwarded at all (the conversation FSM
//! and the privacy shield decide that).
//!
//! ## Reconnection
//!
//! Transient failures are retried with exponential backoff (base
//! 500 ms, cap 10 s, at most 5 attempts). While reconnecting, audio is
//! buffered up to 2 s then dropped oldest-first; stills are held
//! newest-wins (at most one). Exhausting the retry budget emits
//! [`BridgeEvent::Fatal`] and ends the bridge task.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::telemetry::Metrics;

use super::events::{
    build_audio_message, build_audio_stream_end_message, build_image_message,
    build_setup_message, parse_server_message, LiveEvent,
};

/// Default Live WebSocket endpoint.
const LIVE_WS_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Budget for one connection attempt, setup handshake included.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconnect backoff: base delay.
const BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Reconnect backoff: delay cap.
const BACKOFF_CAP: Duration = Duration::from_secs(10);
/// Reconnect attempts before the bridge gives up.
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Audio buffered while reconnecting: 2 s of 20 ms chunks.
const AUDIO_BUFFER_CHUNKS: usize = 100;

// ── Traits ─────────────────────────────────────────────────────────

/// Factory for live connections. Production dials the WebSocket;
/// tests substitute scripted fakes.
#[async_trait]
pub trait LiveClient: Send + Sync {
    async fn connect(&self, session_id: &str) -> Result<Box<dyn LiveConnection>>;
}

/// One established live session with the upstream service.
#[async_trait]
pub trait LiveConnection: Send {
    async fn send_audio(&mut self, pcm: &[u8]) -> Result<()>;
    async fn send_image(&mut self, jpeg: &[u8]) -> Result<()>;
    /// Explicit end-of-turn signal; the service stops waiting for more
    /// input audio and finishes its response.
    async fn end_turn(&mut self) -> Result<()>;
    /// Take the inbound event stream (events in source order; the
    /// channel closes when the connection is gone). Callable once per
    /// connection; a second take is an invariant violation.
    fn take_events(&mut self) -> mpsc::Receiver<LiveEvent>;
    async fn close(&mut self);
}

// ── Bridge input / output ──────────────────────────────────────────

/// What the session feeds into the bridge.
#[derive(Debug)]
pub enum BridgeInput {
    /// 20 ms of PCM16 mono 16 kHz.
    Audio(Bytes),
    /// A screened JPEG still (verdict safe or blurred).
    Image(Bytes),
    /// Cancel the current turn: tell the service input ended and stop
    /// forwarding its remaining response events for this turn.
    EndTurn,
}

/// What the bridge reports back to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Live(LiveEvent),
    /// The reconnect budget is exhausted; the session must tear down.
    Fatal { message: String },
}

// ── Backoff ────────────────────────────────────────────────────────

/// Exponential backoff schedule with jitter.
#[derive(Debug)]
pub struct Backoff {
    current: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            current: BACKOFF_BASE,
        }
    }

    /// The delay to sleep before the next attempt, advancing the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(BACKOFF_CAP);
        delay
    }

    /// Small random jitter so a fleet of sessions does not thunder.
    pub fn jitter() -> Duration {
        Duration::from_millis(rand::thread_rng().gen_range(0..100))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

// ── The bridge task ────────────────────────────────────────────────

/// Runs the per-session bridge until cancellation or a fatal error.
pub struct UpstreamBridge {
    client: Arc<dyn LiveClient>,
    session_id: String,
    metrics: Arc<Metrics>,
}

impl UpstreamBridge {
    pub fn new(client: Arc<dyn LiveClient>, session_id: String, metrics: Arc<Metrics>) -> Self {
        Self {
            client,
            session_id,
            metrics,
        }
    }

    /// Bridge loop: owns the connection, relays inputs and events.
    ///
    /// `input_rx` is the bounded channel fed by the session (audio send
    /// blocks the producer by design); `event_tx` delivers upstream
    /// events in arrival order.
    pub async fn run(
        self,
        mut input_rx: mpsc::Receiver<BridgeInput>,
        event_tx: mpsc::Sender<BridgeEvent>,
        cancel: CancellationToken,
    ) {
        let mut audio_buffer: VecDeque<Bytes> = VecDeque::new();
        let mut pending_image: Option<Bytes> = None;
        let mut drain_turn = false;

        'connection: loop {
            let (mut conn, mut events) = match self
                .connect_with_retry(&mut input_rx, &mut audio_buffer, &mut pending_image, &cancel)
                .await
            {
                Some(mut conn) => {
                    let events = conn.take_events();
                    (conn, events)
                }
                None => {
                    if !cancel.is_cancelled() {
                        let _ = event_tx
                            .send(BridgeEvent::Fatal {
                                message: "upstream reconnect budget exhausted".into(),
                            })
                            .await;
                    }
                    return;
                }
            };

            // Flush whatever survived the outage, oldest first.
            while let Some(pcm) = audio_buffer.pop_front() {
                if let Err(e) = conn.send_audio(&pcm).await {
                    tracing::warn!(session_id = %self.session_id, error = %e, "flush failed, reconnecting");
                    audio_buffer.push_front(pcm);
                    continue 'connection;
                }
                Metrics::incr(&self.metrics.audio_forwarded);
            }
            if let Some(jpeg) = pending_image.take() {
                if conn.send_image(&jpeg).await.is_err() {
                    pending_image = Some(jpeg);
                    continue 'connection;
                }
            }

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        conn.close().await;
                        return;
                    }
                    input = input_rx.recv() => {
                        let Some(input) = input else {
                            conn.close().await;
                            return;
                        };
                        match input {
                            BridgeInput::Audio(pcm) => {
                                if let Err(e) = conn.send_audio(&pcm).await {
                                    tracing::warn!(session_id = %self.session_id, error = %e, "audio send failed");
                                    audio_buffer.push_back(pcm);
                                    continue 'connection;
                                }
                                Metrics::incr(&self.metrics.audio_forwarded);
                            }
                            BridgeInput::Image(jpeg) => {
                                if let Err(e) = conn.send_image(&jpeg).await {
                                    tracing::warn!(session_id = %self.session_id, error = %e, "image send failed");
                                    pending_image = Some(jpeg);
                                    continue 'connection;
                                }
                            }
                            BridgeInput::EndTurn => {
                                drain_turn = true;
                                if conn.end_turn().await.is_err() {
                                    continue 'connection;
                                }
                            }
                        }
                    }
                    event = events.recv() => {
                        let Some(event) = event else {
                            tracing::warn!(session_id = %self.session_id, "upstream connection lost");
                            continue 'connection;
                        };
                        if drain_turn {
                            // A cancelled turn's trailing response is not
                            // forwarded; turn boundaries re-open the tap.
                            match &event {
                                LiveEvent::TurnComplete | LiveEvent::Interrupted => {
                                    drain_turn = false;
                                }
                                LiveEvent::AudioChunk { .. } | LiveEvent::TextDelta { .. } => {
                                    continue;
                                }
                                _ => {}
                            }
                        }
                        if let LiveEvent::Error { message } = &event {
                            tracing::warn!(session_id = %self.session_id, error = %message, "upstream error event");
                        }
                        if event_tx.send(BridgeEvent::Live(event)).await.is_err() {
                            conn.close().await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Dial with bounded exponential backoff. While waiting, keep
    /// consuming session input so producers do not stall: audio buffers
    /// (2 s, drop-oldest), stills collapse to the newest.
    async fn connect_with_retry(
        &self,
        input_rx: &mut mpsc::Receiver<BridgeInput>,
        audio_buffer: &mut VecDeque<Bytes>,
        pending_image: &mut Option<Bytes>,
        cancel: &CancellationToken,
    ) -> Option<Box<dyn LiveConnection>> {
        let mut backoff = Backoff::new();

        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            if cancel.is_cancelled() {
                return None;
            }
            Metrics::incr(&self.metrics.reconnects);

            match tokio::time::timeout(CONNECT_TIMEOUT, self.client.connect(&self.session_id))
                .await
            {
                Ok(Ok(conn)) => {
                    tracing::info!(
                        session_id = %self.session_id,
                        attempt,
                        "upstream connected"
                    );
                    return Some(conn);
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        attempt,
                        error = %e,
                        "upstream connect failed"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        attempt,
                        "upstream connect timed out"
                    );
                }
            }

            if attempt == MAX_RECONNECT_ATTEMPTS {
                break;
            }

            let delay = backoff.next_delay() + Backoff::jitter();
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = &mut sleep => break,
                    input = input_rx.recv() => {
                        match input {
                            None => return None,
                            Some(BridgeInput::Audio(pcm)) => {
                                audio_buffer.push_back(pcm);
                                while audio_buffer.len() > AUDIO_BUFFER_CHUNKS {
                                    audio_buffer.pop_front();
                                    Metrics::incr(&self.metrics.audio_dropped);
                                }
                            }
                            Some(BridgeInput::Image(jpeg)) => {
                                *pending_image = Some(jpeg);
                            }
                            Some(BridgeInput::EndTurn) => {}
                        }
                    }
                }
            }
        }

        None
    }
}

// ── Production WebSocket client ────────────────────────────────────

/// Dials the Live WebSocket and performs the setup handshake.
pub struct WsLiveClient {
    endpoint: String,
    api_key: String,
    model: String,
}

impl WsLiveClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            endpoint: LIVE_WS_URL.to_string(),
            api_key,
            model,
        }
    }

    /// Point at a different endpoint (local test servers).
    pub fn with_endpoint(mut self, endpoint: String) -> Self {
        self.endpoint = endpoint;
        self
    }
}

#[async_trait]
impl LiveClient for WsLiveClient {
    async fn connect(&self, session_id: &str) -> Result<Box<dyn LiveConnection>> {
        let url = format!("{}?key={}", self.endpoint, self.api_key);

        tracing::info!(session_id = %session_id, model = %self.model, "connecting to live service");

        let (mut ws, _response) = tokio_tungstenite::connect_async(&url)
            .await
            .context("dial live websocket")?;

        let setup = build_setup_message(&self.model);
        ws.send(WsMessage::Text(serde_json::to_string(&setup)?))
            .await
            .context("send setup message")?;

        // Wait for setupComplete before splitting the stream. The
        // service sends JSON inside Binary frames, so sniff both.
        loop {
            let frame = ws.next().await.context("stream ended before setup")??;
            match frame {
                WsMessage::Text(text) if text.contains("setupComplete") => break,
                WsMessage::Binary(data) if data.first() == Some(&b'{') => {
                    if std::str::from_utf8(&data)
                        .map(|t| t.contains("setupComplete"))
                        .unwrap_or(false)
                    {
                        break;
                    }
                }
                WsMessage::Close(frame) => {
                    anyhow::bail!("closed before setup complete: {frame:?}");
                }
                _ => {}
            }
        }

        tracing::info!(session_id = %session_id, "live setup complete");

        let (sink, mut stream) = ws.split();
        let (event_tx, event_rx) = mpsc::channel::<LiveEvent>(256);

        let sid = session_id.to_string();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let events = match frame {
                    Ok(WsMessage::Text(text)) => parse_server_message(&text),
                    Ok(WsMessage::Binary(data)) if data.first() == Some(&b'{') => {
                        match std::str::from_utf8(&data) {
                            Ok(text) => parse_server_message(text),
                            Err(_) => continue,
                        }
                    }
                    Ok(WsMessage::Binary(data)) => {
                        // All known responses are JSON-in-Binary; a raw
                        // binary frame is unexpected. Skip it.
                        tracing::warn!(session_id = %sid, len = data.len(), "unexpected raw binary frame");
                        continue;
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = event_tx
                            .send(LiveEvent::Error {
                                message: format!("websocket error: {e}"),
                            })
                            .await;
                        break;
                    }
                };
                for event in events {
                    if event_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Box::new(WsLiveConnection {
            sink,
            event_rx: Some(event_rx),
        }))
    }
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    WsMessage,
>;

struct WsLiveConnection {
    sink: WsSink,
    event_rx: Option<mpsc::Receiver<LiveEvent>>,
}

#[async_trait]
impl LiveConnection for WsLiveConnection {
    async fn send_audio(&mut self, pcm: &[u8]) -> Result<()> {
        let msg = build_audio_message(pcm);
        self.sink
            .send(WsMessage::Text(serde_json::to_string(&msg)?))
            .await
            .context("send audio frame")
    }

    async fn send_image(&mut self, jpeg: &[u8]) -> Result<()> {
        let msg = build_image_message(jpeg);
        self.sink
            .send(WsMessage::Text(serde_json::to_string(&msg)?))
            .await
            .context("send image frame")
    }

    async fn end_turn(&mut self) -> Result<()> {
        let msg = build_audio_stream_end_message();
        self.sink
            .send(WsMessage::Text(msg.to_string()))
            .await
            .context("send end-of-turn")
    }

    fn take_events(&mut self) -> mpsc::Receiver<LiveEvent> {
        self.event_rx.take().expect("event stream already taken")
    }

    async fn close(&mut self) {
        let _ = self.sink.send(WsMessage::Close(None)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeLiveClient, SentItem};

    fn bridge_parts(
        client: Arc<FakeLiveClient>,
    ) -> (
        mpsc::Sender<BridgeInput>,
        mpsc::Receiver<BridgeEvent>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let metrics = Arc::new(Metrics::new());
        let bridge = UpstreamBridge::new(client, "s-1".into(), metrics);
        let (input_tx, input_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(bridge.run(input_rx, event_tx, cancel.clone()));
        (input_tx, event_rx, cancel, handle)
    }

    #[test]
    fn backoff_schedule_doubles_and_caps() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn forwards_audio_and_images_in_order() {
        let client = FakeLiveClient::new();
        let (input_tx, _event_rx, cancel, handle) = bridge_parts(Arc::clone(&client));

        input_tx
            .send(BridgeInput::Audio(Bytes::from_static(b"aaaa")))
            .await
            .unwrap();
        input_tx
            .send(BridgeInput::Image(Bytes::from_static(b"jjjj")))
            .await
            .unwrap();
        input_tx
            .send(BridgeInput::Audio(Bytes::from_static(b"bbbb")))
            .await
            .unwrap();

        client.wait_for_sent(3).await;
        let sent = client.sent();
        assert_eq!(
            sent,
            vec![
                SentItem::Audio(b"aaaa".to_vec()),
                SentItem::Image(b"jjjj".to_vec()),
                SentItem::Audio(b"bbbb".to_vec()),
            ]
        );

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn delivers_events_in_arrival_order() {
        let client = FakeLiveClient::new();
        client.script_events(vec![
            LiveEvent::AudioChunk { pcm: vec![1] },
            LiveEvent::TextDelta { text: "hi".into() },
            LiveEvent::TurnComplete,
        ]);
        let (_input_tx, mut event_rx, cancel, handle) = bridge_parts(Arc::clone(&client));

        assert_eq!(
            event_rx.recv().await,
            Some(BridgeEvent::Live(LiveEvent::AudioChunk { pcm: vec![1] }))
        );
        assert_eq!(
            event_rx.recv().await,
            Some(BridgeEvent::Live(LiveEvent::TextDelta { text: "hi".into() }))
        );
        assert_eq!(
            event_rx.recv().await,
            Some(BridgeEvent::Live(LiveEvent::TurnComplete))
        );

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn end_turn_drops_trailing_response_events() {
        let client = FakeLiveClient::new();
        let (input_tx, mut event_rx, cancel, handle) = bridge_parts(Arc::clone(&client));

        input_tx.send(BridgeInput::EndTurn).await.unwrap();
        client.wait_for_sent(1).await;

        // Events that belong to the cancelled turn are swallowed until
        // the turn boundary.
        client.script_events(vec![
            LiveEvent::AudioChunk { pcm: vec![9] },
            LiveEvent::TextDelta {
                text: "stale".into(),
            },
            LiveEvent::TurnComplete,
            LiveEvent::AudioChunk { pcm: vec![7] },
        ]);

        assert_eq!(
            event_rx.recv().await,
            Some(BridgeEvent::Live(LiveEvent::TurnComplete))
        );
        assert_eq!(
            event_rx.recv().await,
            Some(BridgeEvent::Live(LiveEvent::AudioChunk { pcm: vec![7] }))
        );

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnects_report_fatal() {
        let client = FakeLiveClient::new();
        client.fail_connects(u32::MAX);
        let (_input_tx, mut event_rx, _cancel, handle) = bridge_parts(Arc::clone(&client));

        // Paused time auto-advances through the backoff sleeps.
        let event = event_rx.recv().await.unwrap();
        assert!(matches!(event, BridgeEvent::Fatal { .. }));
        assert_eq!(client.connect_attempts(), MAX_RECONNECT_ATTEMPTS);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn audio_buffered_during_reconnect_is_flushed_oldest_first() {
        let client = FakeLiveClient::new();
        client.fail_connects(2);
        let (input_tx, _event_rx, cancel, handle) = bridge_parts(Arc::clone(&client));

        for i in 0..3u8 {
            input_tx
                .send(BridgeInput::Audio(Bytes::from(vec![i; 4])))
                .await
                .unwrap();
        }

        client.wait_for_sent(3).await;
        let sent = client.sent();
        assert_eq!(
            sent,
            vec![
                SentItem::Audio(vec![0; 4]),
                SentItem::Audio(vec![1; 4]),
                SentItem::Audio(vec![2; 4]),
            ]
        );

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn audio_buffer_drops_oldest_beyond_two_seconds() {
        let client = FakeLiveClient::new();
        client.fail_connects(3);
        let (input_tx, _event_rx, cancel, handle) = bridge_parts(Arc::clone(&client));

        // 120 chunks = 2.4 s; only the trailing 100 (2 s) survive.
        for i in 0..120u32 {
            input_tx
                .send(BridgeInput::Audio(Bytes::from(i.to_le_bytes().to_vec())))
                .await
                .unwrap();
        }

        client.wait_for_sent(100).await;
        let sent = client.sent();
        let audio: Vec<u32> = sent
            .iter()
            .filter_map(|s| match s {
                SentItem::Audio(b) => {
                    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                }
                _ => None,
            })
            .collect();
        assert_eq!(audio.len(), 100);
        assert_eq!(audio[0], 20);
        assert_eq!(*audio.last().unwrap(), 119);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_stops_the_bridge() {
        let client = FakeLiveClient::new();
        let (_input_tx, _event_rx, cancel, handle) = bridge_parts(Arc::clone(&client));
        cancel.cancel();
        handle.await.unwrap();
    }
}
