//! Face detection collaborator.
//!
//! The shield only needs detection: boxes and a confidence per face.
//! Identification is explicitly out of scope. The production client
//! speaks the Vision-style `images:annotate` REST protocol; tests wire
//! fakes through the same trait.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::Serialize;
use std::time::Duration;

/// One detected face, pixel coordinates in the submitted image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub confidence: f32,
}

/// Detection collaborator. Finer categories a backend may report
/// (occluded, profile) are all "present" for blur/block purposes.
#[async_trait]
pub trait FaceDetector: Send + Sync {
    /// Detect faces in the given JPEG bytes.
    async fn detect(&self, jpeg: &[u8]) -> Result<Vec<FaceBox>>;
}

// ── Vision REST client ─────────────────────────────────────────────

#[derive(Serialize)]
struct AnnotateRequest<'a> {
    requests: [AnnotateEntry<'a>; 1],
}

#[derive(Serialize)]
struct AnnotateEntry<'a> {
    image: ImageContent,
    features: [Feature<'a>; 1],
}

#[derive(Serialize)]
struct ImageContent {
    content: String,
}

#[derive(Serialize)]
struct Feature<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(rename = "maxResults")]
    max_results: u32,
}

/// Face detection over the Vision `images:annotate` REST endpoint.
pub struct RestFaceDetector {
    endpoint: String,
    api_key: String,
    http: reqwest::Client,
}

impl RestFaceDetector {
    /// The call budget; on expiry callers fail closed to `blocked`.
    pub const TIMEOUT: Duration = Duration::from_secs(2);

    pub fn new(endpoint: String, api_key: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Self::TIMEOUT)
            .build()
            .context("build face detector http client")?;
        Ok(Self {
            endpoint,
            api_key,
            http,
        })
    }

    fn parse_faces(body: &serde_json::Value) -> Vec<FaceBox> {
        let mut faces = Vec::new();
        let annotations = body
            .pointer("/responses/0/faceAnnotations")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        for annotation in &annotations {
            let confidence = annotation
                .get("detectionConfidence")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0) as f32;
            let Some(vertices) = annotation
                .pointer("/boundingPoly/vertices")
                .and_then(|v| v.as_array())
            else {
                continue;
            };
            let xs: Vec<i64> = vertices
                .iter()
                .map(|v| v.get("x").and_then(|x| x.as_i64()).unwrap_or(0))
                .collect();
            let ys: Vec<i64> = vertices
                .iter()
                .map(|v| v.get("y").and_then(|y| y.as_i64()).unwrap_or(0))
                .collect();
            let (Some(&min_x), Some(&max_x)) = (xs.iter().min(), xs.iter().max()) else {
                continue;
            };
            let (Some(&min_y), Some(&max_y)) = (ys.iter().min(), ys.iter().max()) else {
                continue;
            };
            if max_x <= min_x || max_y <= min_y {
                continue;
            }
            faces.push(FaceBox {
                x: min_x.max(0) as u32,
                y: min_y.max(0) as u32,
                width: (max_x - min_x) as u32,
                height: (max_y - min_y) as u32,
                confidence,
            });
        }
        faces
    }
}

#[async_trait]
impl FaceDetector for RestFaceDetector {
    async fn detect(&self, jpeg: &[u8]) -> Result<Vec<FaceBox>> {
        let request = AnnotateRequest {
            requests: [AnnotateEntry {
                image: ImageContent {
                    content: base64::engine::general_purpose::STANDARD.encode(jpeg),
                },
                features: [Feature {
                    kind: "FACE_DETECTION",
                    max_results: 50,
                }],
            }],
        };

        let response = self
            .http
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .context("face detector request")?;

        let status = response.status();
        anyhow::ensure!(status.is_success(), "face detector returned {status}");

        let body: serde_json::Value = response
            .json()
            .await
            .context("face detector response body")?;
        Ok(Self::parse_faces(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_faces_extracts_boxes() {
        let body = serde_json::json!({
            "responses": [{
                "faceAnnotations": [
                    {
                        "detectionConfidence": 0.97,
                        "boundingPoly": {
                            "vertices": [
                                {"x": 10, "y": 20},
                                {"x": 110, "y": 20},
                                {"x": 110, "y": 140},
                                {"x": 10, "y": 140}
                            ]
                        }
                    }
                ]
            }]
        });
        let faces = RestFaceDetector::parse_faces(&body);
        assert_eq!(faces.len(), 1);
        let face = faces[0];
        assert_eq!((face.x, face.y), (10, 20));
        assert_eq!((face.width, face.height), (100, 120));
        assert!((face.confidence - 0.97).abs() < 1e-6);
    }

    #[test]
    fn parse_faces_handles_missing_vertex_fields() {
        // Vision omits zero-valued coordinates.
        let body = serde_json::json!({
            "responses": [{
                "faceAnnotations": [{
                    "boundingPoly": {
                        "vertices": [
                            {},
                            {"x": 50},
                            {"x": 50, "y": 60},
                            {"y": 60}
                        ]
                    }
                }]
            }]
        });
        let faces = RestFaceDetector::parse_faces(&body);
        assert_eq!(faces.len(), 1);
        assert_eq!((faces[0].x, faces[0].y), (0, 0));
        assert_eq!((faces[0].width, faces[0].height), (50, 60));
    }

    #[test]
    fn parse_faces_empty_response() {
        let body = serde_json::json!({"responses": [{}]});
        assert!(RestFaceDetector::parse_faces(&body).is_empty());
    }

    #[test]
    fn parse_faces_skips_degenerate_boxes() {
        let body = serde_json::json!({
            "responses": [{
                "faceAnnotations": [{
                    "boundingPoly": {
                        "vertices": [
                            {"x": 30, "y": 30},
                            {"x": 30, "y": 30}
                        ]
                    }
                }]
            }]
        });
        assert!(RestFaceDetector::parse_faces(&body).is_empty());
    }
}
