//! Session lifecycle: creation, the conversation loop, and teardown.
//!
//! The manager is the only place sessions are created or destroyed.
//! Each session owns its peer connection, upstream bridge, FSM, and a
//! cancellation token that parents every turn token. Callbacks wired
//! into the peer connection hold the session id and a weak manager
//! reference, never an owning handle.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::signal::{CandidatePayload, SignalMessage};

use crate::config::Config;
use crate::media::codec::{bytes_to_pcm, resample_linear, PcmChunker};
use crate::media::sampler::StillMailbox;
use crate::media::{AudioChunk, UPSTREAM_SAMPLE_RATE};
use crate::shield::{PrivacyShield, PrivacyVerdict};
use crate::telemetry::Metrics;
use crate::upstream::bridge::{BridgeEvent, BridgeInput, LiveClient, UpstreamBridge};
use crate::upstream::events::LiveEvent;
use crate::upstream::OUTPUT_SAMPLE_RATE;

use super::fsm::{ConversationFsm, ConversationState, Effect, FsmEvent};
use super::peer::{self, EgressQueue};

/// How often the watchdog sweeps sessions.
const WATCHDOG_SWEEP: Duration = Duration::from_secs(10);
/// Negotiation budget for ICE gathering before the answer is returned;
/// remaining candidates trickle over the signal channel.
const GATHER_WAIT: Duration = Duration::from_secs(2);

/// Out-of-band controls routed into the session task.
#[derive(Debug, Clone, Copy)]
pub enum SessionControl {
    /// The client asked a spatial question alongside the live session.
    SpatialQuery,
    /// Explicit interrupt request from the client.
    Interrupt,
}

/// Manager-side record of one active session.
struct SessionHandle {
    cancel: CancellationToken,
    pc: Arc<RTCPeerConnection>,
    /// Server-side ICE candidates awaiting the signal channel; taken by
    /// the first WebSocket that attaches.
    candidate_rx: Option<mpsc::UnboundedReceiver<String>>,
    control_tx: mpsc::Sender<SessionControl>,
    state_rx: watch::Receiver<ConversationState>,
    created_at: Instant,
    activity: Arc<Mutex<Instant>>,
}

/// Creates, tracks, and destroys sessions.
pub struct SessionManager {
    api: API,
    config: Config,
    live_client: Arc<dyn LiveClient>,
    shield: Arc<PrivacyShield>,
    metrics: Arc<Metrics>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionManager {
    pub fn new(
        config: Config,
        live_client: Arc<dyn LiveClient>,
        shield: Arc<PrivacyShield>,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>> {
        let api = peer::build_api()?;
        Ok(Arc::new(Self {
            api,
            config,
            live_client,
            shield,
            metrics,
            sessions: Mutex::new(HashMap::new()),
        }))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Conversation state of a session, if it exists.
    pub fn session_state(&self, id: &str) -> Option<ConversationState> {
        self.sessions.lock().get(id).map(|h| *h.state_rx.borrow())
    }

    /// Negotiate a new session: apply the remote offer, wire the media
    /// pipeline, and return `(session_id, answer_sdp)`.
    pub async fn create(self: &Arc<Self>, offer_sdp: String) -> Result<(String, String)> {
        let session_id = Uuid::new_v4().to_string();
        let offer = RTCSessionDescription::offer(offer_sdp).context("parse offer sdp")?;

        let pc = Arc::new(
            self.api
                .new_peer_connection(peer::peer_config())
                .await
                .context("allocate peer connection")?,
        );

        let cancel = CancellationToken::new();
        // If negotiation is abandoned (caller timeout drops this future),
        // the guard cancels every task spawned below.
        let guard = cancel.clone().drop_guard();
        let activity = Arc::new(Mutex::new(Instant::now()));
        let mailbox = StillMailbox::new();
        let egress_queue = EgressQueue::new();

        let (chunk_tx, chunk_rx) = mpsc::channel::<AudioChunk>(256);
        let (unit_tx, unit_rx) = mpsc::channel::<(Bytes, Duration)>(16);
        let (control_tx, control_rx) = mpsc::channel::<SessionControl>(8);
        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel::<String>();
        let (bridge_tx, bridge_rx) = mpsc::channel::<BridgeInput>(64);
        let (event_tx, event_rx) = mpsc::channel::<BridgeEvent>(64);

        // Egress: one audio track back to the client.
        let track = peer::egress_track();
        pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("add egress track")?;
        tokio::spawn(peer::run_egress(
            track,
            Arc::clone(&egress_queue),
            cancel.clone(),
        ));

        // Ingress: track callbacks spawn channel-fed reader tasks.
        let unit_rx_slot = Arc::new(Mutex::new(Some(unit_rx)));
        {
            let chunk_tx = chunk_tx.clone();
            let cancel = cancel.clone();
            let activity = Arc::clone(&activity);
            let mailbox = Arc::clone(&mailbox);
            let metrics = Arc::clone(&self.metrics);
            let sample_interval = self.config.sample_interval;
            let sid = session_id.clone();
            pc.on_track(Box::new(move |track: Arc<TrackRemote>,
                                       _receiver: Arc<RTCRtpReceiver>,
                                       _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = track.kind();
                tracing::info!(session_id = %sid, kind = %kind, "ingress track attached");
                match kind {
                    RTPCodecType::Audio => {
                        tokio::spawn(peer::run_audio_ingest(
                            track,
                            chunk_tx.clone(),
                            Arc::clone(&activity),
                            cancel.clone(),
                        ));
                    }
                    RTPCodecType::Video => {
                        tokio::spawn(peer::run_video_ingest(
                            track,
                            unit_tx.clone(),
                            Arc::clone(&activity),
                            cancel.clone(),
                        ));
                        if let Some(unit_rx) = unit_rx_slot.lock().take() {
                            let mailbox = Arc::clone(&mailbox);
                            let metrics = Arc::clone(&metrics);
                            tokio::task::spawn_blocking(move || {
                                peer::run_video_decode_worker(
                                    unit_rx,
                                    mailbox,
                                    sample_interval,
                                    metrics,
                                );
                            });
                        }
                    }
                    _ => {}
                }
                Box::pin(async {})
            }));
        }

        // Trickle server-side candidates to the signal channel.
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let msg = SignalMessage::Candidate {
                            candidate: CandidatePayload {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            },
                        };
                        if let Ok(json) = serde_json::to_string(&msg) {
                            let _ = candidate_tx.send(json);
                        }
                    }
                    Err(e) => tracing::debug!(error = %e, "candidate serialization failed"),
                }
            })
        }));

        // Peer failure tears the session down through the manager, via
        // the session id only.
        {
            let manager = Arc::downgrade(self);
            let sid = session_id.clone();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let manager = manager.clone();
                let sid = sid.clone();
                Box::pin(async move {
                    tracing::debug!(session_id = %sid, state = %state, "peer state change");
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed
                            | RTCPeerConnectionState::Closed
                            | RTCPeerConnectionState::Disconnected
                    ) {
                        if let Some(manager) = manager.upgrade() {
                            manager.close(&sid, "peer connection lost").await;
                        }
                    }
                })
            }));
        }

        // Upstream bridge.
        let bridge = UpstreamBridge::new(
            Arc::clone(&self.live_client),
            session_id.clone(),
            Arc::clone(&self.metrics),
        );
        tokio::spawn(bridge.run(bridge_rx, event_tx, cancel.clone()));

        // Conversation loop.
        let (fsm, state_rx) = ConversationFsm::new(
            cancel.clone(),
            self.config.interrupt_rms,
            self.config.interrupt_min,
        );
        tokio::spawn(run_session(SessionTask {
            session_id: session_id.clone(),
            fsm,
            chunk_rx,
            mailbox: Arc::clone(&mailbox),
            control_rx,
            bridge_tx,
            event_rx,
            egress_queue,
            shield: Arc::clone(&self.shield),
            metrics: Arc::clone(&self.metrics),
            cancel: cancel.clone(),
            manager: Arc::downgrade(self),
        }));

        // SDP exchange. A failure here tears the partial session down.
        let answer_sdp = match negotiate(&pc, offer).await {
            Ok(sdp) => sdp,
            Err(e) => {
                cancel.cancel();
                let _ = pc.close().await;
                return Err(e);
            }
        };

        let _ = guard.disarm();
        self.sessions.lock().insert(
            session_id.clone(),
            SessionHandle {
                cancel,
                pc,
                candidate_rx: Some(candidate_rx),
                control_tx,
                state_rx,
                created_at: Instant::now(),
                activity,
            },
        );
        Metrics::incr(&self.metrics.sessions_opened);
        tracing::info!(session_id = %session_id, "session created");

        Ok((session_id, answer_sdp))
    }

    /// Apply a trickled ICE candidate from the client.
    pub async fn apply_candidate(&self, id: &str, candidate: RTCIceCandidateInit) -> Result<()> {
        let pc = {
            let sessions = self.sessions.lock();
            let handle = sessions
                .get(id)
                .with_context(|| format!("unknown session: {id}"))?;
            Arc::clone(&handle.pc)
        };
        pc.add_ice_candidate(candidate)
            .await
            .context("add ice candidate")
    }

    /// Take the server->client candidate stream for the signal channel.
    pub fn take_candidate_rx(&self, id: &str) -> Option<mpsc::UnboundedReceiver<String>> {
        self.sessions.lock().get_mut(id)?.candidate_rx.take()
    }

    /// Route an out-of-band control into the session task.
    pub async fn control(&self, id: &str, control: SessionControl) -> Result<()> {
        let tx = {
            let sessions = self.sessions.lock();
            let handle = sessions
                .get(id)
                .with_context(|| format!("unknown session: {id}"))?;
            handle.control_tx.clone()
        };
        tx.send(control).await.context("session task gone")
    }

    pub fn exists(&self, id: &str) -> bool {
        self.sessions.lock().contains_key(id)
    }

    /// Cancel a session, close its peer connection, and forget it.
    pub async fn close(&self, id: &str, reason: &str) {
        let handle = self.sessions.lock().remove(id);
        let Some(handle) = handle else { return };
        tracing::info!(session_id = %id, reason, "closing session");
        handle.cancel.cancel();
        if let Err(e) = handle.pc.close().await {
            tracing::debug!(session_id = %id, error = %e, "peer close error");
        }
        Metrics::incr(&self.metrics.sessions_closed);
    }

    /// Watchdog: enforce the idle timeout and the wall-clock cap.
    pub async fn run_watchdog(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(WATCHDOG_SWEEP);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            let now = Instant::now();
            let expired: Vec<(String, &'static str)> = {
                let sessions = self.sessions.lock();
                sessions
                    .iter()
                    .filter_map(|(id, handle)| {
                        if now.duration_since(*handle.activity.lock()) > self.config.session_idle {
                            Some((id.clone(), "idle timeout"))
                        } else if now.duration_since(handle.created_at) > self.config.session_max {
                            Some((id.clone(), "session wall-clock cap"))
                        } else {
                            None
                        }
                    })
                    .collect()
            };
            for (id, reason) in expired {
                self.close(&id, reason).await;
            }
        }
    }
}

/// Run the offer/answer exchange on a fresh peer connection.
///
/// Returns the answer SDP once enough candidates gathered; stragglers
/// trickle over the signal channel.
async fn negotiate(pc: &RTCPeerConnection, offer: RTCSessionDescription) -> Result<String> {
    pc.set_remote_description(offer)
        .await
        .context("set remote description")?;
    let answer = pc.create_answer(None).await.context("create answer")?;
    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(answer)
        .await
        .context("set local description")?;
    let _ = tokio::time::timeout(GATHER_WAIT, gather_complete.recv()).await;

    pc.local_description()
        .await
        .map(|d| d.sdp)
        .context("missing local description")
}

// ── The conversation loop ──────────────────────────────────────────

/// Everything the session task owns.
pub(crate) struct SessionTask {
    pub session_id: String,
    pub fsm: ConversationFsm,
    pub chunk_rx: mpsc::Receiver<AudioChunk>,
    pub mailbox: Arc<StillMailbox>,
    pub control_rx: mpsc::Receiver<SessionControl>,
    pub bridge_tx: mpsc::Sender<BridgeInput>,
    pub event_rx: mpsc::Receiver<BridgeEvent>,
    pub egress_queue: Arc<EgressQueue>,
    pub shield: Arc<PrivacyShield>,
    pub metrics: Arc<Metrics>,
    pub cancel: CancellationToken,
    pub manager: Weak<SessionManager>,
}

/// Mutable loop context, kept separate from the channels so the
/// select arms and the handlers borrow disjoint locals.
struct LoopCtx {
    session_id: String,
    fsm: ConversationFsm,
    bridge_tx: mpsc::Sender<BridgeInput>,
    egress_queue: Arc<EgressQueue>,
    shield: Arc<PrivacyShield>,
    metrics: Arc<Metrics>,
    manager: Weak<SessionManager>,
    /// Re-chunker for upstream audio after 24 k -> 16 k resampling.
    egress_chunker: PcmChunker,
}

/// Single-task conversation loop: the only mutator of the FSM, so
/// state changes are totally ordered.
pub(crate) async fn run_session(task: SessionTask) {
    let SessionTask {
        session_id,
        fsm,
        mut chunk_rx,
        mailbox,
        mut control_rx,
        bridge_tx,
        mut event_rx,
        egress_queue,
        shield,
        metrics,
        cancel,
        manager,
    } = task;

    let mut ctx = LoopCtx {
        session_id,
        fsm,
        bridge_tx,
        egress_queue,
        shield,
        metrics,
        manager,
        egress_chunker: PcmChunker::new(),
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            chunk = chunk_rx.recv() => {
                let Some(chunk) = chunk else { break };
                let rms = chunk.rms();
                let effects = ctx.fsm.apply(FsmEvent::UserAudio { rms }, Instant::now());
                if run_effects(&mut ctx, &effects).await {
                    break;
                }
                if ctx.fsm.should_forward_audio() {
                    // Block-the-producer policy: audio is never dropped here.
                    if ctx.bridge_tx.send(BridgeInput::Audio(chunk.pcm)).await.is_err() {
                        break;
                    }
                }
            }

            still = mailbox.take(&cancel) => {
                let Some(still) = still else { break };
                if handle_still(&mut ctx, still).await {
                    break;
                }
            }

            control = control_rx.recv() => {
                let Some(control) = control else { break };
                let event = match control {
                    SessionControl::SpatialQuery => FsmEvent::SpatialQuery,
                    SessionControl::Interrupt => FsmEvent::ClientInterrupt,
                };
                let effects = ctx.fsm.apply(event, Instant::now());
                if run_effects(&mut ctx, &effects).await {
                    break;
                }
            }

            event = event_rx.recv() => {
                let Some(event) = event else { break };
                if handle_bridge_event(&mut ctx, event).await {
                    break;
                }
            }
        }
    }

    tracing::debug!(session_id = %ctx.session_id, "session task finished");
}

/// Screen one still and forward it if its verdict allows.
/// Returns `true` when the session must tear down.
async fn handle_still(ctx: &mut LoopCtx, still: crate::media::StillFrame) -> bool {
    let verdict = ctx.shield.screen(&still.jpeg).await;
    match &verdict {
        PrivacyVerdict::Blocked { reason, face_count } => {
            Metrics::incr(&ctx.metrics.frames_blocked);
            tracing::info!(
                session_id = %ctx.session_id,
                seq = still.seq,
                face_count,
                reason = reason.as_str(),
                "frame blocked"
            );
        }
        PrivacyVerdict::Blurred { face_count, .. } => {
            Metrics::incr(&ctx.metrics.frames_blurred);
            tracing::debug!(
                session_id = %ctx.session_id,
                seq = still.seq,
                face_count,
                "frame blurred"
            );
        }
        PrivacyVerdict::Safe => {}
    }

    let effects = ctx.fsm.apply(
        FsmEvent::PrivacyVerdict {
            forwardable: verdict.forwardable(),
        },
        Instant::now(),
    );
    if run_effects(ctx, &effects).await {
        return true;
    }

    if ctx.fsm.state() != ConversationState::Fatal {
        let jpeg = match verdict {
            PrivacyVerdict::Safe => Some(still.jpeg),
            PrivacyVerdict::Blurred { processed, .. } => Some(processed),
            PrivacyVerdict::Blocked { .. } => None,
        };
        if let Some(jpeg) = jpeg {
            if ctx.bridge_tx.send(BridgeInput::Image(jpeg)).await.is_err() {
                return true;
            }
        }
    }
    false
}

/// Returns `true` when the session must tear down.
async fn handle_bridge_event(ctx: &mut LoopCtx, event: BridgeEvent) -> bool {
    let now = Instant::now();
    match event {
        BridgeEvent::Live(LiveEvent::SetupComplete) => false,

        BridgeEvent::Live(LiveEvent::AudioChunk { pcm }) => {
            let effects = ctx.fsm.apply(FsmEvent::UpstreamAudio, now);
            let teardown = run_effects(ctx, &effects).await;

            // Chunks that straggle in after a cancelled turn stay out
            // of the client's ears.
            if ctx.fsm.state() != ConversationState::Speaking {
                return teardown;
            }

            // Upstream speaks at 24 kHz; the client contract is 16 kHz.
            let samples = bytes_to_pcm(&pcm);
            let resampled = resample_linear(&samples, OUTPUT_SAMPLE_RATE, UPSTREAM_SAMPLE_RATE);
            for chunk in ctx.egress_chunker.push(&resampled) {
                let dropped = ctx.egress_queue.push(chunk);
                if dropped > 0 {
                    tracing::debug!(
                        session_id = %ctx.session_id,
                        dropped,
                        "egress queue overflow, oldest dropped"
                    );
                }
            }
            teardown
        }

        BridgeEvent::Live(LiveEvent::TextDelta { text }) => {
            tracing::debug!(session_id = %ctx.session_id, delta = %text, "upstream text");
            let effects = ctx.fsm.apply(FsmEvent::UpstreamResponseStarted, now);
            run_effects(ctx, &effects).await
        }

        BridgeEvent::Live(LiveEvent::TurnComplete) => {
            let effects = ctx.fsm.apply(FsmEvent::UpstreamTurnComplete, now);
            run_effects(ctx, &effects).await
        }

        BridgeEvent::Live(LiveEvent::Interrupted) => {
            let effects = ctx.fsm.apply(FsmEvent::UpstreamInterrupted, now);
            run_effects(ctx, &effects).await
        }

        BridgeEvent::Live(LiveEvent::Error { message }) => {
            // Transient: the bridge owns retries. Only Fatal ends us.
            tracing::warn!(session_id = %ctx.session_id, error = %message, "upstream error");
            false
        }

        BridgeEvent::Fatal { message } => {
            tracing::error!(session_id = %ctx.session_id, error = %message, "upstream fatal");
            let effects = ctx.fsm.apply(FsmEvent::Fatal, now);
            run_effects(ctx, &effects).await
        }
    }
}

/// Carry out FSM effects. Returns `true` when the session must tear down.
async fn run_effects(ctx: &mut LoopCtx, effects: &[Effect]) -> bool {
    for effect in effects {
        match effect {
            Effect::OpenTurn => {
                tracing::debug!(
                    session_id = %ctx.session_id,
                    turn = ?ctx.fsm.current_turn_id(),
                    "turn opened"
                );
            }
            Effect::CancelTurn => {
                Metrics::incr(&ctx.metrics.turns_interrupted);
                if ctx.bridge_tx.send(BridgeInput::EndTurn).await.is_err() {
                    return true;
                }
            }
            Effect::FlushEgress => {
                let flushed = ctx.egress_queue.clear();
                ctx.egress_chunker = PcmChunker::new();
                tracing::debug!(
                    session_id = %ctx.session_id,
                    flushed,
                    "egress flushed on interruption"
                );
            }
            Effect::AudioPaused => {
                tracing::warn!(session_id = %ctx.session_id, "audio paused by privacy halt");
            }
            Effect::AudioResumed => {
                tracing::info!(session_id = %ctx.session_id, "audio resumed");
            }
            Effect::TearDown => {
                if let Some(manager) = ctx.manager.upgrade() {
                    let id = ctx.session_id.clone();
                    tokio::spawn(async move {
                        manager.close(&id, "fatal").await;
                    });
                }
                return true;
            }
        }
    }
    false
}
