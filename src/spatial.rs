//! Spatial analysis: surface attribution under a click coordinate.
//!
//! Given a still frame and a click, the analyzer names the surface
//! (wall, floor, ceiling, window, door), its material and color, and
//! the bounding box of the whole surface in normalized 0..1000
//! coordinates `[ymin, xmin, ymax, xmax]`. A whole-room structural
//! breakdown is also supported for the initial scene scan.
//!
//! The production implementation prompts a vision model over the
//! `generateContent` REST endpoint and extracts the JSON object from
//! its reply; the model is asked for JSON only, but replies are
//! treated as free text and mined with a regex.

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound of the normalized coordinate space.
pub const NORMALIZED_MAX: u32 = 1000;

/// Surface attribution for one click.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Surface {
    /// Surface class: wall, floor, ceiling, window, door.
    #[serde(rename = "type")]
    pub kind: String,
    pub material: String,
    pub color: String,
    /// `[ymin, xmin, ymax, xmax]`, normalized 0..1000.
    pub bounding_box: [u32; 4],
    pub reasoning: String,
}

/// Analyzer reply for `identify_surface`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SurfaceReport {
    pub surface: Surface,
}

/// Model-backed spatial analyzer.
#[async_trait]
pub trait SurfaceAnalyzer: Send + Sync {
    /// Attribute the surface under a normalized click point.
    async fn identify_surface(
        &self,
        jpeg_b64: &str,
        norm_x: u32,
        norm_y: u32,
    ) -> Result<SurfaceReport>;

    /// Whole-room structural breakdown; shape is model-defined JSON.
    async fn analyze_room(&self, jpeg_b64: &str) -> Result<serde_json::Value>;
}

/// Convert absolute click pixels to the normalized space.
pub fn normalize_click(x: f64, y: f64, width: f64, height: f64) -> (u32, u32) {
    let clamp = |v: f64| v.clamp(0.0, NORMALIZED_MAX as f64) as u32;
    if width <= 0.0 || height <= 0.0 {
        return (0, 0);
    }
    (
        clamp(x / width * NORMALIZED_MAX as f64),
        clamp(y / height * NORMALIZED_MAX as f64),
    )
}

/// Extract the first JSON object embedded in model prose.
pub fn extract_json(text: &str) -> Result<serde_json::Value> {
    let re = Regex::new(r"\{[\s\S]*\}").expect("static regex");
    let matched = re
        .find(text)
        .context("no JSON object in analyzer reply")?;
    serde_json::from_str(matched.as_str()).context("analyzer reply is not valid JSON")
}

/// Clamp a bounding box into the normalized space, fixing inverted
/// corners.
pub fn clamp_bounding_box(bounding_box: [i64; 4]) -> [u32; 4] {
    let clamp = |v: i64| v.clamp(0, NORMALIZED_MAX as i64) as u32;
    let (ymin, xmin, ymax, xmax) = (
        clamp(bounding_box[0]),
        clamp(bounding_box[1]),
        clamp(bounding_box[2]),
        clamp(bounding_box[3]),
    );
    [
        ymin.min(ymax),
        xmin.min(xmax),
        ymin.max(ymax),
        xmin.max(xmax),
    ]
}

// ── Production client ──────────────────────────────────────────────

const GENERATE_CONTENT_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Analyzer over the `generateContent` REST endpoint.
pub struct GenerativeAnalyzer {
    api_key: String,
    model: String,
    endpoint_base: String,
    http: reqwest::Client,
}

impl GenerativeAnalyzer {
    pub fn new(api_key: String, model: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .context("build analyzer http client")?;
        Ok(Self {
            api_key,
            model,
            endpoint_base: GENERATE_CONTENT_BASE.to_string(),
            http,
        })
    }

    fn identify_prompt(norm_x: u32, norm_y: u32) -> String {
        format!(
            "Identify the architectural surface at normalized coordinate [{norm_y}, {norm_x}] \
             in this room image. Is it a wall, floor, ceiling, window, or door?\n\
             Provide:\n\
             1. The bounding box of the entire surface in [ymin, xmin, ymax, xmax] format, \
             normalized to 0-1000.\n\
             2. Its material and color.\n\
             3. Why you believe this is the surface at that point.\n\
             Return ONLY a JSON object with the shape \
             {{\"surface\": {{\"type\", \"material\", \"color\", \"bounding_box\", \"reasoning\"}}}}."
        )
    }

    fn room_prompt() -> &'static str {
        "Analyze this room image for architectural transformation. Identify walls, \
         floor, ceiling, windows, and doors. For each element provide a bounding box \
         in [ymin, xmin, ymax, xmax] format normalized to 0-1000, the surface type, \
         the material, and a confidence between 0 and 1. Also estimate room \
         dimensions in meters and the lighting quality. Return ONLY a JSON object."
    }

    async fn generate(&self, prompt: &str, jpeg_b64: &str) -> Result<serde_json::Value> {
        let url = format!(
            "{}/{}:generateContent?key={}",
            self.endpoint_base, self.model, self.api_key
        );
        let body = serde_json::json!({
            "contents": [{
                "parts": [
                    { "text": prompt },
                    { "inline_data": { "mime_type": "image/jpeg", "data": jpeg_b64 } }
                ]
            }]
        });

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("analyzer request")?;
        let status = response.status();
        anyhow::ensure!(status.is_success(), "analyzer returned {status}");

        let reply: serde_json::Value = response.json().await.context("analyzer body")?;
        let text = reply
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(|v| v.as_str())
            .context("analyzer reply missing text part")?;
        extract_json(text)
    }
}

#[async_trait]
impl SurfaceAnalyzer for GenerativeAnalyzer {
    async fn identify_surface(
        &self,
        jpeg_b64: &str,
        norm_x: u32,
        norm_y: u32,
    ) -> Result<SurfaceReport> {
        let prompt = Self::identify_prompt(norm_x, norm_y);
        let value = self.generate(&prompt, jpeg_b64).await?;
        parse_surface_report(value)
    }

    async fn analyze_room(&self, jpeg_b64: &str) -> Result<serde_json::Value> {
        self.generate(Self::room_prompt(), jpeg_b64).await
    }
}

/// Parse and sanitize the model's surface report. Accepts `boundingBox`
/// as a fallback key since vision models drift on naming.
pub fn parse_surface_report(value: serde_json::Value) -> Result<SurfaceReport> {
    let surface = value.get("surface").context("reply missing surface")?;
    let bounding_box = surface
        .get("bounding_box")
        .or_else(|| surface.get("boundingBox"))
        .and_then(|v| v.as_array())
        .context("reply missing bounding box")?;
    anyhow::ensure!(bounding_box.len() == 4, "bounding box must have 4 entries");
    let mut coordinates = [0i64; 4];
    for (slot, v) in coordinates.iter_mut().zip(bounding_box) {
        *slot = v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)).context("non-numeric bound")?;
    }

    let text_field = |key: &str| -> String {
        surface
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string()
    };

    Ok(SurfaceReport {
        surface: Surface {
            kind: text_field("type"),
            material: text_field("material"),
            color: text_field("color"),
            bounding_box: clamp_bounding_box(coordinates),
            reasoning: text_field("reasoning"),
        },
    })
}
