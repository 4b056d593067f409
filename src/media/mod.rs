//! Media value types flowing through the per-session pipeline.
//!
//! Frames move by value between pipeline stages over bounded channels;
//! the stage currently holding a frame owns it. Sequence ids are
//! per-track, per-session, strictly monotone.

pub mod codec;
pub mod sampler;

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Audio wire contract sent upstream: PCM16 mono at 16 kHz.
pub const UPSTREAM_SAMPLE_RATE: u32 = 16_000;
/// Audio framing: 20 ms per chunk.
pub const AUDIO_FRAME_MS: u64 = 20;
/// Samples per 20 ms chunk at 16 kHz.
pub const SAMPLES_PER_CHUNK: usize = (UPSTREAM_SAMPLE_RATE as usize / 1000) * AUDIO_FRAME_MS as usize;
/// Longest image side sent upstream, in pixels.
pub const MAX_IMAGE_SIDE: u32 = 768;
/// JPEG quality for upstream stills (must stay within 70..=85).
pub const JPEG_QUALITY: u8 = 80;

/// Which ingress track a frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// Strictly monotone per-track sequence id allocator.
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU64);

impl SequenceCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Decoded media payload.
#[derive(Debug, Clone)]
pub enum FramePayload {
    /// Raw RGB8 pixels, row-major.
    Image {
        width: u32,
        height: u32,
        rgb: Bytes,
    },
    /// PCM16 little-endian mono samples.
    Pcm { sample_rate: u32, samples: Bytes },
}

/// One decoded frame produced by the media codec.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    /// Per-track, per-session monotone sequence id.
    pub seq: u64,
    /// Capture timestamp offset from session start (from RTP).
    pub captured_at: Duration,
    /// Source track kind.
    pub track: TrackKind,
    pub payload: FramePayload,
}

/// A JPEG still selected by the sampler for privacy screening and upstream.
///
/// Invariant: at most one per session per sampling interval.
#[derive(Debug, Clone)]
pub struct StillFrame {
    /// Sequence id of the source video frame.
    pub seq: u64,
    pub captured_at: Duration,
    /// JPEG bytes, already bounded to [`MAX_IMAGE_SIDE`].
    pub jpeg: Bytes,
}

/// One 20 ms chunk of PCM16 mono 16 kHz audio.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub seq: u64,
    pub captured_at: Duration,
    /// Exactly [`SAMPLES_PER_CHUNK`] samples, little-endian bytes.
    pub pcm: Bytes,
}

impl AudioChunk {
    /// Root-mean-square energy of the chunk, used for barge-in detection.
    pub fn rms(&self) -> u32 {
        let samples: Vec<i16> = self
            .pcm
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        if samples.is_empty() {
            return 0;
        }
        let sum_sq: u64 = samples.iter().map(|&s| (s as i64 * s as i64) as u64).sum();
        (sum_sq / samples.len() as u64).isqrt() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_ids_are_strictly_monotone() {
        let counter = SequenceCounter::new();
        let a = counter.next();
        let b = counter.next();
        let c = counter.next();
        assert!(a < b && b < c);
    }

    #[test]
    fn chunk_constant_is_20ms_at_16khz() {
        assert_eq!(SAMPLES_PER_CHUNK, 320);
    }

    #[test]
    fn rms_of_silence_is_zero() {
        let chunk = AudioChunk {
            seq: 0,
            captured_at: Duration::ZERO,
            pcm: Bytes::from(vec![0u8; SAMPLES_PER_CHUNK * 2]),
        };
        assert_eq!(chunk.rms(), 0);
    }

    #[test]
    fn rms_of_constant_signal() {
        let sample: i16 = 1000;
        let mut pcm = Vec::with_capacity(SAMPLES_PER_CHUNK * 2);
        for _ in 0..SAMPLES_PER_CHUNK {
            pcm.extend_from_slice(&sample.to_le_bytes());
        }
        let chunk = AudioChunk {
            seq: 0,
            captured_at: Duration::ZERO,
            pcm: Bytes::from(pcm),
        };
        assert_eq!(chunk.rms(), 1000);
    }

    #[test]
    fn jpeg_quality_within_mandated_band() {
        assert!((70..=85).contains(&JPEG_QUALITY));
    }

    #[test]
    fn media_frame_carries_track_and_payload() {
        let frame = MediaFrame {
            seq: 3,
            captured_at: Duration::from_millis(99),
            track: TrackKind::Video,
            payload: FramePayload::Image {
                width: 2,
                height: 2,
                rgb: Bytes::from(vec![0u8; 12]),
            },
        };
        assert_eq!(frame.track.as_str(), "video");
        assert_eq!(TrackKind::Audio.as_str(), "audio");
        match frame.payload {
            FramePayload::Image { width, height, .. } => assert_eq!((width, height), (2, 2)),
            FramePayload::Pcm { .. } => panic!("expected an image payload"),
        }
    }
}
