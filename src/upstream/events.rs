//! Wire schema for the upstream Live service.
//!
//! The bidirectional protocol is JSON over WebSocket:
//!
//! 1. **Setup** — first frame configures model and modalities
//! 2. **Stream** — audio as `realtimeInput.audio`, stills as
//!    `realtimeInput.mediaChunks`, receive `serverContent`
//! 3. **Close** — graceful WebSocket close
//!
//! The service sends all of its messages as WebSocket *Binary* frames,
//! including JSON control messages like `setupComplete`; receivers must
//! sniff Binary payloads for JSON before treating them as opaque.

use base64::Engine;
use serde::Serialize;

/// MIME type for audio sent upstream (16 kHz mono PCM).
pub const INPUT_AUDIO_MIME: &str = "audio/pcm;rate=16000";
/// MIME type for stills sent upstream.
pub const INPUT_IMAGE_MIME: &str = "image/jpeg";
/// Sample rate of audio the service sends back.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

// ── Setup message ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct SetupMessage {
    pub setup: SetupPayload,
}

#[derive(Debug, Serialize)]
pub struct SetupPayload {
    pub model: String,
    #[serde(rename = "generationConfig")]
    pub generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
pub struct GenerationConfig {
    #[serde(rename = "responseModalities")]
    pub response_modalities: Vec<String>,
}

/// Build the setup message for a live session.
pub fn build_setup_message(model: &str) -> SetupMessage {
    SetupMessage {
        setup: SetupPayload {
            model: model.to_string(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
            },
        },
    }
}

// ── Input messages ─────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct RealtimeAudioMessage {
    #[serde(rename = "realtimeInput")]
    pub realtime_input: RealtimeAudio,
}

#[derive(Debug, Serialize)]
pub struct RealtimeAudio {
    pub audio: MediaBlob,
}

#[derive(Debug, Serialize)]
pub struct RealtimeImageMessage {
    #[serde(rename = "realtimeInput")]
    pub realtime_input: RealtimeImage,
}

#[derive(Debug, Serialize)]
pub struct RealtimeImage {
    #[serde(rename = "mediaChunks")]
    pub media_chunks: Vec<MediaBlob>,
}

#[derive(Debug, Serialize)]
pub struct MediaBlob {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    /// Base64-encoded payload.
    pub data: String,
}

/// Audio chunk -> `realtimeInput.audio` message.
pub fn build_audio_message(pcm: &[u8]) -> RealtimeAudioMessage {
    RealtimeAudioMessage {
        realtime_input: RealtimeAudio {
            audio: MediaBlob {
                mime_type: INPUT_AUDIO_MIME.to_string(),
                data: base64::engine::general_purpose::STANDARD.encode(pcm),
            },
        },
    }
}

/// JPEG still -> `realtimeInput.mediaChunks` message.
pub fn build_image_message(jpeg: &[u8]) -> RealtimeImageMessage {
    RealtimeImageMessage {
        realtime_input: RealtimeImage {
            media_chunks: vec![MediaBlob {
                mime_type: INPUT_IMAGE_MIME.to_string(),
                data: base64::engine::general_purpose::STANDARD.encode(jpeg),
            }],
        },
    }
}

/// Signal that the input audio stream ended for the current turn.
pub fn build_audio_stream_end_message() -> serde_json::Value {
    serde_json::json!({
        "realtimeInput": { "audioStreamEnd": true }
    })
}

// ── Server events ──────────────────────────────────────────────────

/// One parsed event from the Live service, delivered in source order.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// Setup acknowledged; streaming may begin.
    SetupComplete,
    /// Synthesized audio (PCM16 at [`OUTPUT_SAMPLE_RATE`]).
    AudioChunk { pcm: Vec<u8> },
    /// Token stream of the model's text, for observability.
    TextDelta { text: String },
    /// The model finished its response turn.
    TurnComplete,
    /// The model aborted its turn (it detected new user speech).
    Interrupted,
    /// Server-reported error.
    Error { message: String },
}

/// Parse one server frame into its events.
///
/// A single frame can carry several events (audio parts plus a text
/// part plus `turnComplete`, for instance).
pub fn parse_server_message(json_text: &str) -> Vec<LiveEvent> {
    let mut events = Vec::new();

    let value: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            events.push(LiveEvent::Error {
                message: format!("unparseable server message: {e}"),
            });
            return events;
        }
    };

    if value.get("setupComplete").is_some() {
        events.push(LiveEvent::SetupComplete);
    }

    if let Some(content) = value.get("serverContent") {
        if let Some(parts) = content
            .pointer("/modelTurn/parts")
            .and_then(|v| v.as_array())
        {
            for part in parts {
                if let Some(inline) = part.get("inlineData") {
                    if let Some(data_b64) = inline.get("data").and_then(|v| v.as_str()) {
                        if let Ok(pcm) =
                            base64::engine::general_purpose::STANDARD.decode(data_b64)
                        {
                            events.push(LiveEvent::AudioChunk { pcm });
                        }
                    }
                }
                if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                    if !text.is_empty() {
                        events.push(LiveEvent::TextDelta {
                            text: text.to_string(),
                        });
                    }
                }
            }
        }
        if content.get("interrupted").and_then(|v| v.as_bool()) == Some(true) {
            events.push(LiveEvent::Interrupted);
        }
        if content.get("turnComplete").and_then(|v| v.as_bool()) == Some(true) {
            events.push(LiveEvent::TurnComplete);
        }
    }

    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown server error");
        events.push(LiveEvent::Error {
            message: message.to_string(),
        });
    }

    events
}
