//! WebRTC peer-connection wiring.
//!
//! Track callbacks do no work themselves: they spawn ingest tasks that
//! read RTP from the remote track, decode, and feed bounded channels,
//! restoring ordering and backpressure control to the pipeline. The
//! egress task runs at a fixed 20 ms cadence and writes Opus samples
//! (or silence) onto the client's audio track.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::media::codec::{self, OpusEgress, OpusIngress, PcmChunker, VideoIngress};
use crate::media::sampler::{SampleGate, StillMailbox};
use crate::media::{AudioChunk, SequenceCounter, StillFrame, AUDIO_FRAME_MS};
use crate::telemetry::Metrics;

/// Maximum RTP reorder window the video sample builder absorbs.
const SAMPLE_BUILDER_MAX_LATE: u16 = 64;
/// Egress buffer bound: 4 s of 20 ms chunks, drop-oldest beyond.
const EGRESS_QUEUE_CHUNKS: usize = 200;

// ── API construction ───────────────────────────────────────────────

/// Build the shared WebRTC API: Opus for audio, H.264 for video.
///
/// Video is pinned to H.264 because that is what the gateway can
/// decode; the browser falls back to it during negotiation.
pub fn build_api() -> Result<API> {
    let mut media_engine = MediaEngine::default();

    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48_000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )
        .context("register opus")?;

    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_owned(),
                    clock_rate: 90_000,
                    channels: 0,
                    sdp_fmtp_line:
                        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                            .to_owned(),
                    rtcp_feedback: vec![],
                },
                payload_type: 102,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .context("register h264")?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .context("register interceptors")?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Peer-connection configuration with a public STUN server.
pub fn peer_config() -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec!["stun:stun.l.google.com:19302".to_owned()],
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// Create the egress audio track added to every peer connection.
pub fn egress_track() -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        "audio".to_owned(),
        "atelier-live".to_owned(),
    ))
}

// ── RTP clock ──────────────────────────────────────────────────────

/// Converts wrapping RTP timestamps into offsets from the first packet.
#[derive(Debug)]
pub struct RtpClock {
    clock_rate: u32,
    first: Option<u32>,
}

impl RtpClock {
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate,
            first: None,
        }
    }

    /// Offset of `timestamp` from the first observed timestamp.
    pub fn offset(&mut self, timestamp: u32) -> Duration {
        let first = *self.first.get_or_insert(timestamp);
        let ticks = timestamp.wrapping_sub(first);
        Duration::from_micros(ticks as u64 * 1_000_000 / self.clock_rate as u64)
    }
}

// ── Egress queue ───────────────────────────────────────────────────

/// Bounded queue of 20 ms PCM chunks awaiting egress encoding.
///
/// Policy: drop-oldest on overflow (stale audio is worthless after a
/// reconnect), full clear on barge-in flush.
#[derive(Debug)]
pub struct EgressQueue {
    inner: Mutex<VecDeque<Bytes>>,
    cap: usize,
}

impl EgressQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::new()),
            cap: EGRESS_QUEUE_CHUNKS,
        })
    }

    /// Push a chunk, dropping the oldest if full. Returns the number
    /// of chunks dropped.
    pub fn push(&self, chunk: Bytes) -> usize {
        let mut queue = self.inner.lock();
        let mut dropped = 0;
        queue.push_back(chunk);
        while queue.len() > self.cap {
            queue.pop_front();
            dropped += 1;
        }
        dropped
    }

    pub fn pop(&self) -> Option<Bytes> {
        self.inner.lock().pop_front()
    }

    /// Drop everything queued (barge-in flush).
    pub fn clear(&self) -> usize {
        let mut queue = self.inner.lock();
        let n = queue.len();
        queue.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

// ── Ingest: audio ──────────────────────────────────────────────────

/// Read the remote Opus track, decode to 16 kHz mono, and emit 20 ms
/// [`AudioChunk`]s. Sends block when the session is behind: audio is
/// never dropped at this stage.
pub async fn run_audio_ingest(
    track: Arc<TrackRemote>,
    chunk_tx: mpsc::Sender<AudioChunk>,
    activity: Arc<Mutex<tokio::time::Instant>>,
    cancel: CancellationToken,
) {
    let mut ingress = match OpusIngress::new() {
        Ok(i) => i,
        Err(e) => {
            tracing::error!(error = %e, "opus ingress init failed");
            return;
        }
    };
    let mut chunker = PcmChunker::new();
    let mut clock = RtpClock::new(48_000);
    let seq = SequenceCounter::new();

    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            result = track.read_rtp() => match result {
                Ok((packet, _)) => packet,
                Err(e) => {
                    tracing::debug!(error = %e, "audio track ended");
                    break;
                }
            },
        };

        *activity.lock() = tokio::time::Instant::now();
        let captured_at = clock.offset(packet.header.timestamp);

        let pcm = match ingress.decode(&packet.payload) {
            Ok(pcm) => pcm,
            Err(e) => {
                tracing::debug!(error = %e, "undecodable audio packet");
                continue;
            }
        };

        for chunk in chunker.push(&pcm) {
            let chunk = AudioChunk {
                seq: seq.next(),
                captured_at,
                pcm: chunk,
            };
            if chunk_tx.send(chunk).await.is_err() {
                return;
            }
        }
    }
}

// ── Ingest: video ──────────────────────────────────────────────────

/// Read the remote H.264 track, reassemble access units, and hand them
/// to the decode worker. Every access unit is forwarded: skipping one
/// would break the decoder's reference chain.
pub async fn run_video_ingest(
    track: Arc<TrackRemote>,
    unit_tx: mpsc::Sender<(Bytes, Duration)>,
    activity: Arc<Mutex<tokio::time::Instant>>,
    cancel: CancellationToken,
) {
    let mut builder: SampleBuilder<H264Packet> =
        SampleBuilder::new(SAMPLE_BUILDER_MAX_LATE, H264Packet::default(), 90_000);
    let mut clock = RtpClock::new(90_000);
    let mut latest_offset = Duration::ZERO;

    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            result = track.read_rtp() => match result {
                Ok((packet, _)) => packet,
                Err(e) => {
                    tracing::debug!(error = %e, "video track ended");
                    break;
                }
            },
        };

        *activity.lock() = tokio::time::Instant::now();
        latest_offset = clock.offset(packet.header.timestamp);

        builder.push(packet);
        while let Some(sample) = builder.pop() {
            if unit_tx.send((sample.data, latest_offset)).await.is_err() {
                return;
            }
        }
    }
}

/// Decode worker: H.264 access units -> RGB -> sampled JPEG stills.
///
/// Runs on the blocking pool; decode and JPEG encode are CPU-bound.
/// Every unit is decoded to keep the reference chain intact, but only
/// gate-approved frames are encoded and deposited in the mailbox.
pub fn run_video_decode_worker(
    mut unit_rx: mpsc::Receiver<(Bytes, Duration)>,
    mailbox: Arc<StillMailbox>,
    sample_interval: Duration,
    metrics: Arc<Metrics>,
) {
    let mut ingress = match VideoIngress::new() {
        Ok(i) => i,
        Err(e) => {
            tracing::error!(error = %e, "h264 decoder init failed");
            return;
        }
    };
    let mut gate = SampleGate::new(sample_interval);
    let seq = SequenceCounter::new();

    while let Some((unit, captured_at)) = unit_rx.blocking_recv() {
        let image = match ingress.decode(&unit) {
            Ok(Some(image)) => image,
            // No picture yet (waiting for a keyframe).
            Ok(None) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "h264 decode error");
                continue;
            }
        };
        let frame_seq = seq.next();

        if !gate.should_emit(tokio::time::Instant::now()) {
            continue;
        }

        match codec::encode_still(&image) {
            Ok(jpeg) => {
                Metrics::incr(&metrics.stills_sampled);
                let displaced = mailbox.put(StillFrame {
                    seq: frame_seq,
                    captured_at,
                    jpeg,
                });
                if displaced {
                    Metrics::incr(&metrics.stills_dropped);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "still encode failed");
            }
        }
    }
}

// ── Egress ─────────────────────────────────────────────────────────

/// Egress task: every 20 ms, encode the next queued chunk (or silence)
/// and write it onto the client audio track.
pub async fn run_egress(
    track: Arc<TrackLocalStaticSample>,
    queue: Arc<EgressQueue>,
    cancel: CancellationToken,
) {
    let mut egress = match OpusEgress::new() {
        Ok(e) => e,
        Err(e) => {
            tracing::error!(error = %e, "opus egress init failed");
            return;
        }
    };
    let mut interval = tokio::time::interval(Duration::from_millis(AUDIO_FRAME_MS));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let packet = match queue.pop() {
            Some(pcm) => {
                let samples = codec::bytes_to_pcm(&pcm);
                egress.encode(&samples)
            }
            None => egress.encode_silence(),
        };

        let packet = match packet {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "egress encode failed");
                continue;
            }
        };

        if let Err(e) = track
            .write_sample(&Sample {
                data: Bytes::from(packet),
                duration: Duration::from_millis(AUDIO_FRAME_MS),
                ..Default::default()
            })
            .await
        {
            tracing::debug!(error = %e, "egress write failed; client track gone");
            break;
        }
    }
}
