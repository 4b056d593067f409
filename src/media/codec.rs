//! Media codecs for the per-session pipeline.
//!
//! Ingress audio is Opus over RTP; libopus decodes straight to the
//! upstream contract (16 kHz mono PCM16) regardless of what the browser
//! negotiated. Ingress video is H.264; decoded to RGB and re-encoded as
//! bounded JPEG stills. Egress audio is PCM16 encoded back to Opus for
//! the client track.
//!
//! All types here are used from dedicated ingest/egress tasks; heavier
//! operations (H.264 decode, JPEG encode, blurring) are run under
//! `spawn_blocking` by the callers so media tasks never stall the
//! runtime.

use anyhow::{Context, Result};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, ImageFormat, RgbImage};
use openh264::decoder::Decoder as H264Decoder;
use openh264::formats::YUVSource;

use super::{JPEG_QUALITY, MAX_IMAGE_SIDE, SAMPLES_PER_CHUNK, UPSTREAM_SAMPLE_RATE};

// ── Audio: Opus ingress ────────────────────────────────────────────

/// Decodes ingress Opus packets directly to 16 kHz mono PCM.
pub struct OpusIngress {
    decoder: opus::Decoder,
    /// Scratch buffer sized for the longest legal Opus frame (120 ms).
    scratch: Vec<i16>,
}

impl OpusIngress {
    pub fn new() -> Result<Self> {
        let decoder = opus::Decoder::new(UPSTREAM_SAMPLE_RATE, opus::Channels::Mono)
            .context("create opus decoder")?;
        Ok(Self {
            decoder,
            scratch: vec![0i16; (UPSTREAM_SAMPLE_RATE as usize * 120) / 1000],
        })
    }

    /// Decode one RTP payload into PCM samples at 16 kHz mono.
    pub fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>> {
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        let n = self
            .decoder
            .decode(payload, &mut self.scratch, false)
            .context("opus decode")?;
        Ok(self.scratch[..n].to_vec())
    }
}

// ── Audio: Opus egress ─────────────────────────────────────────────

/// Encodes 16 kHz mono PCM back to Opus for the client audio track.
pub struct OpusEgress {
    encoder: opus::Encoder,
}

impl OpusEgress {
    pub fn new() -> Result<Self> {
        let encoder = opus::Encoder::new(
            UPSTREAM_SAMPLE_RATE,
            opus::Channels::Mono,
            opus::Application::Voip,
        )
        .context("create opus encoder")?;
        Ok(Self { encoder })
    }

    /// Encode exactly one 20 ms chunk ([`SAMPLES_PER_CHUNK`] samples).
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        anyhow::ensure!(
            pcm.len() == SAMPLES_PER_CHUNK,
            "egress chunk must be {SAMPLES_PER_CHUNK} samples, got {}",
            pcm.len()
        );
        self.encoder
            .encode_vec(pcm, 1500)
            .context("opus encode")
    }

    /// One encoded chunk of silence, emitted when no upstream audio is
    /// available at frame cadence.
    pub fn encode_silence(&mut self) -> Result<Vec<u8>> {
        self.encode(&[0i16; SAMPLES_PER_CHUNK])
    }
}

// ── Audio: PCM utilities ───────────────────────────────────────────

/// Linear resampler for PCM16 mono. Good enough for 24 k -> 16 k speech;
/// the ingress path never needs it (libopus resamples on decode).
pub fn resample_linear(input: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }
    let out_len = (input.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let mut out = Vec::with_capacity(out_len);
    let step = from_rate as f64 / to_rate as f64;
    for i in 0..out_len {
        let pos = i as f64 * step;
        let idx = pos as usize;
        let frac = pos - idx as f64;
        let a = input[idx.min(input.len() - 1)] as f64;
        let b = input[(idx + 1).min(input.len() - 1)] as f64;
        out.push((a + (b - a) * frac).round() as i16);
    }
    out
}

/// Accumulates arbitrary-length PCM into exact 20 ms chunks.
///
/// The remainder stays buffered until the next push; chunk boundaries
/// therefore preserve capture order with no samples lost.
#[derive(Debug, Default)]
pub struct PcmChunker {
    buf: Vec<i16>,
}

impl PcmChunker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push decoded samples, returning every completed 20 ms chunk.
    pub fn push(&mut self, samples: &[i16]) -> Vec<Bytes> {
        self.buf.extend_from_slice(samples);
        let mut chunks = Vec::new();
        while self.buf.len() >= SAMPLES_PER_CHUNK {
            let chunk: Vec<i16> = self.buf.drain(..SAMPLES_PER_CHUNK).collect();
            chunks.push(pcm_to_bytes(&chunk));
        }
        chunks
    }

    /// Samples currently waiting for a chunk boundary.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// PCM16 samples -> little-endian bytes.
pub fn pcm_to_bytes(samples: &[i16]) -> Bytes {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    Bytes::from(out)
}

/// Little-endian bytes -> PCM16 samples. Odd trailing bytes are dropped.
pub fn bytes_to_pcm(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

// ── Video: H.264 ingress ───────────────────────────────────────────

/// Decodes depacketized H.264 access units (Annex B) to RGB frames.
pub struct VideoIngress {
    decoder: H264Decoder,
}

impl VideoIngress {
    pub fn new() -> Result<Self> {
        let decoder = H264Decoder::new().context("create h264 decoder")?;
        Ok(Self { decoder })
    }

    /// Decode one access unit. Returns `None` until the decoder has
    /// enough context to emit a picture (e.g. before the first keyframe).
    pub fn decode(&mut self, annex_b: &[u8]) -> Result<Option<RgbImage>> {
        let Some(yuv) = self.decoder.decode(annex_b).context("h264 decode")? else {
            return Ok(None);
        };
        let (width, height) = yuv.dimensions();
        let mut rgb = vec![0u8; width * height * 3];
        yuv.write_rgb8(&mut rgb);
        let image = RgbImage::from_raw(width as u32, height as u32, rgb)
            .context("assemble rgb frame")?;
        Ok(Some(image))
    }
}

// ── Video: JPEG stills ─────────────────────────────────────────────

/// Resize so the longest side is at most [`MAX_IMAGE_SIDE`] and encode
/// as JPEG at the mandated quality. No-op resize for small frames.
pub fn encode_still(image: &RgbImage) -> Result<Bytes> {
    let (w, h) = image.dimensions();
    let long_side = w.max(h);
    let resized;
    let source = if long_side > MAX_IMAGE_SIDE {
        let scale = MAX_IMAGE_SIDE as f64 / long_side as f64;
        let nw = ((w as f64 * scale).round() as u32).max(1);
        let nh = ((h as f64 * scale).round() as u32).max(1);
        resized = image::imageops::resize(image, nw, nh, FilterType::Lanczos3);
        &resized
    } else {
        image
    };
    encode_jpeg(source)
}

/// Encode RGB pixels as JPEG at the pipeline quality setting.
pub fn encode_jpeg(image: &RgbImage) -> Result<Bytes> {
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    encoder
        .encode(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgb8,
        )
        .context("jpeg encode")?;
    Ok(Bytes::from(out))
}

/// Decode JPEG bytes into an RGB image.
pub fn decode_jpeg(jpeg: &[u8]) -> Result<RgbImage> {
    let img = image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)
        .context("jpeg decode")?;
    Ok(img.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_image(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    #[test]
    fn chunker_emits_exact_chunks_and_keeps_remainder() {
        let mut chunker = PcmChunker::new();
        // 1.5 chunks worth of samples
        let samples = vec![7i16; SAMPLES_PER_CHUNK + SAMPLES_PER_CHUNK / 2];
        let chunks = chunker.push(&samples);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), SAMPLES_PER_CHUNK * 2);
        assert_eq!(chunker.pending(), SAMPLES_PER_CHUNK / 2);

        // Completing the second chunk flushes it.
        let chunks = chunker.push(&vec![7i16; SAMPLES_PER_CHUNK / 2]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunker.pending(), 0);
    }

    #[test]
    fn chunker_preserves_sample_order() {
        let mut chunker = PcmChunker::new();
        let samples: Vec<i16> = (0..SAMPLES_PER_CHUNK as i16).collect();
        let chunks = chunker.push(&samples);
        let decoded = bytes_to_pcm(&chunks[0]);
        assert_eq!(decoded, samples);
    }

    #[test]
    fn pcm_bytes_roundtrip() {
        let samples = vec![-32768i16, -1, 0, 1, 32767];
        assert_eq!(bytes_to_pcm(&pcm_to_bytes(&samples)), samples);
    }

    #[test]
    fn resample_identity_when_rates_match() {
        let input = vec![1i16, 2, 3, 4];
        assert_eq!(resample_linear(&input, 16_000, 16_000), input);
    }

    #[test]
    fn resample_24k_to_16k_shrinks_by_two_thirds() {
        let input = vec![100i16; 2400]; // 100 ms at 24 kHz
        let out = resample_linear(&input, 24_000, 16_000);
        assert_eq!(out.len(), 1600); // 100 ms at 16 kHz
        assert!(out.iter().all(|&s| s == 100));
    }

    #[test]
    fn resample_preserves_dc_level() {
        let input = vec![-500i16; 480];
        let out = resample_linear(&input, 48_000, 16_000);
        assert_eq!(out.len(), 160);
        assert!(out.iter().all(|&s| s == -500));
    }

    #[test]
    fn still_respects_long_side_bound() {
        let image = gradient_image(1920, 1080);
        let jpeg = encode_still(&image).unwrap();
        let decoded = decode_jpeg(&jpeg).unwrap();
        assert!(decoded.width().max(decoded.height()) <= MAX_IMAGE_SIDE);
        // Aspect ratio survives within rounding.
        let ratio = decoded.width() as f64 / decoded.height() as f64;
        assert!((ratio - 1920.0 / 1080.0).abs() < 0.02);
    }

    #[test]
    fn small_still_is_not_upscaled() {
        let image = gradient_image(320, 240);
        let jpeg = encode_still(&image).unwrap();
        let decoded = decode_jpeg(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (320, 240));
    }

    #[test]
    fn jpeg_roundtrip_dimensions() {
        let image = gradient_image(64, 48);
        let jpeg = encode_jpeg(&image).unwrap();
        let decoded = decode_jpeg(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (64, 48));
    }

    #[test]
    fn opus_egress_silence_roundtrip() {
        let mut egress = OpusEgress::new().unwrap();
        let packet = egress.encode_silence().unwrap();
        assert!(!packet.is_empty());

        let mut ingress = OpusIngress::new().unwrap();
        let pcm = ingress.decode(&packet).unwrap();
        assert_eq!(pcm.len(), SAMPLES_PER_CHUNK);
    }

    #[test]
    fn opus_egress_rejects_wrong_chunk_size() {
        let mut egress = OpusEgress::new().unwrap();
        assert!(egress.encode(&[0i16; 100]).is_err());
    }
}
