//! Privacy shield: classifies stills before anything reaches upstream.
//!
//! Every still gets a [`PrivacyVerdict`]:
//! - `Safe` — no faces; the frame may be forwarded as-is.
//! - `Blurred` — faces found and blurred; the processed bytes may be
//!   forwarded.
//! - `Blocked` — a crowd, or the detector was unavailable; the frame is
//!   never forwarded, and sustained blocks make the conversation FSM
//!   pause audio too.
//!
//! The shield is stateless and never stores frames. Detector failure is
//! fail-closed: an unreachable detector blocks the frame.

pub mod blur;
pub mod detector;

use std::sync::Arc;

use bytes::Bytes;

use crate::media::codec;
use detector::FaceDetector;

/// Why a frame was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// More faces than the crowd threshold.
    Crowd,
    /// The detector failed or timed out; fail closed.
    DetectorUnavailable,
    /// The frame could not be decoded or re-encoded; fail closed.
    ProcessingFailed,
}

impl BlockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Crowd => "crowd",
            Self::DetectorUnavailable => "detector_unavailable",
            Self::ProcessingFailed => "processing_failed",
        }
    }
}

/// Classification of one still frame.
#[derive(Debug, Clone)]
pub enum PrivacyVerdict {
    Safe,
    Blurred {
        /// Re-encoded JPEG with face regions blurred.
        processed: Bytes,
        face_count: usize,
    },
    Blocked {
        face_count: usize,
        reason: BlockReason,
    },
}

impl PrivacyVerdict {
    /// Whether a frame with this verdict may be forwarded upstream.
    pub fn forwardable(&self) -> bool {
        !matches!(self, Self::Blocked { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Blurred { .. } => "blurred",
            Self::Blocked { .. } => "blocked",
        }
    }

    pub fn face_count(&self) -> usize {
        match self {
            Self::Safe => 0,
            Self::Blurred { face_count, .. } | Self::Blocked { face_count, .. } => *face_count,
        }
    }
}

/// The shield itself. Shared across the live pipeline and the
/// out-of-band `/process-frame` endpoint, so both consult one oracle.
pub struct PrivacyShield {
    detector: Arc<dyn FaceDetector>,
    crowd_threshold: usize,
    blur_radius_min: u32,
}

impl PrivacyShield {
    pub fn new(detector: Arc<dyn FaceDetector>, crowd_threshold: usize, blur_radius_min: u32) -> Self {
        Self {
            detector,
            crowd_threshold,
            blur_radius_min,
        }
    }

    /// Screen one JPEG still. Infallible by design: every failure mode
    /// maps to a `Blocked` verdict.
    pub async fn screen(&self, jpeg: &Bytes) -> PrivacyVerdict {
        let faces = match tokio::time::timeout(
            detector::RestFaceDetector::TIMEOUT,
            self.detector.detect(jpeg),
        )
        .await
        {
            Err(_) => {
                tracing::warn!("face detector timed out; blocking frame");
                return PrivacyVerdict::Blocked {
                    face_count: 0,
                    reason: BlockReason::DetectorUnavailable,
                };
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "face detector failed; blocking frame");
                return PrivacyVerdict::Blocked {
                    face_count: 0,
                    reason: BlockReason::DetectorUnavailable,
                };
            }
            Ok(Ok(faces)) => faces,
        };

        let face_count = faces.len();
        if face_count > self.crowd_threshold {
            return PrivacyVerdict::Blocked {
                face_count,
                reason: BlockReason::Crowd,
            };
        }
        if face_count == 0 {
            return PrivacyVerdict::Safe;
        }

        // Blur on the blocking pool; decode + gaussian + encode is CPU work.
        let jpeg = jpeg.clone();
        let min_radius = self.blur_radius_min;
        let blurred = tokio::task::spawn_blocking(move || -> anyhow::Result<Bytes> {
            let mut image = codec::decode_jpeg(&jpeg)?;
            blur::blur_faces(&mut image, &faces, min_radius);
            codec::encode_jpeg(&image)
        })
        .await;

        match blurred {
            Ok(Ok(processed)) => PrivacyVerdict::Blurred {
                processed,
                face_count,
            },
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "blur pipeline failed; blocking frame");
                PrivacyVerdict::Blocked {
                    face_count,
                    reason: BlockReason::ProcessingFailed,
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "blur task panicked; blocking frame");
                PrivacyVerdict::Blocked {
                    face_count,
                    reason: BlockReason::ProcessingFailed,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeDetector;
    use detector::FaceBox;

    fn test_jpeg() -> Bytes {
        let image = image::RgbImage::from_pixel(200, 160, image::Rgb([120, 120, 120]));
        codec::encode_jpeg(&image).unwrap()
    }

    fn face(x: u32, y: u32) -> FaceBox {
        FaceBox {
            x,
            y,
            width: 40,
            height: 40,
            confidence: 0.95,
        }
    }

    fn shield_with(faces: Vec<FaceBox>) -> PrivacyShield {
        PrivacyShield::new(Arc::new(FakeDetector::with_faces(faces)), 3, 15)
    }

    #[tokio::test]
    async fn zero_faces_is_safe() {
        let verdict = shield_with(vec![]).screen(&test_jpeg()).await;
        assert!(matches!(verdict, PrivacyVerdict::Safe));
        assert!(verdict.forwardable());
    }

    #[tokio::test]
    async fn one_face_is_blurred() {
        let verdict = shield_with(vec![face(10, 10)]).screen(&test_jpeg()).await;
        match verdict {
            PrivacyVerdict::Blurred {
                processed,
                face_count,
            } => {
                assert_eq!(face_count, 1);
                // Processed bytes are valid JPEG of the same size.
                let img = codec::decode_jpeg(&processed).unwrap();
                assert_eq!(img.dimensions(), (200, 160));
            }
            other => panic!("expected blurred, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn count_at_threshold_is_blurred() {
        let faces = vec![face(0, 0), face(50, 0), face(100, 0)];
        let verdict = shield_with(faces).screen(&test_jpeg()).await;
        assert!(matches!(
            verdict,
            PrivacyVerdict::Blurred { face_count: 3, .. }
        ));
    }

    #[tokio::test]
    async fn count_above_threshold_is_blocked() {
        let faces = vec![face(0, 0), face(50, 0), face(100, 0), face(150, 0)];
        let verdict = shield_with(faces).screen(&test_jpeg()).await;
        match verdict {
            PrivacyVerdict::Blocked { face_count, reason } => {
                assert_eq!(face_count, 4);
                assert_eq!(reason, BlockReason::Crowd);
            }
            other => panic!("expected blocked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn detector_failure_fails_closed() {
        let shield = PrivacyShield::new(Arc::new(FakeDetector::failing()), 3, 15);
        let verdict = shield.screen(&test_jpeg()).await;
        assert!(!verdict.forwardable());
        match verdict {
            PrivacyVerdict::Blocked { face_count, reason } => {
                assert_eq!(face_count, 0);
                assert_eq!(reason, BlockReason::DetectorUnavailable);
            }
            other => panic!("expected blocked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_jpeg_with_faces_fails_closed() {
        let shield = shield_with(vec![face(0, 0)]);
        let verdict = shield.screen(&Bytes::from_static(b"not a jpeg")).await;
        assert!(matches!(
            verdict,
            PrivacyVerdict::Blocked {
                reason: BlockReason::ProcessingFailed,
                ..
            }
        ));
    }

    #[test]
    fn verdict_strings() {
        assert_eq!(PrivacyVerdict::Safe.as_str(), "safe");
        assert_eq!(BlockReason::Crowd.as_str(), "crowd");
        assert_eq!(
            BlockReason::DetectorUnavailable.as_str(),
            "detector_unavailable"
        );
    }
}
