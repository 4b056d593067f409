//! Signal-channel message schema.
//!
//! After the `POST /webrtc` offer/answer exchange, each session keeps a
//! WebSocket open for trickled ICE candidates, in both directions, as
//! small JSON messages: `{"type": "candidate", "candidate": {...}}`.
//! Unknown message types are dropped with a warning; candidates apply
//! in arrival order.

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// Candidate payload as browsers produce it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl From<CandidatePayload> for RTCIceCandidateInit {
    fn from(payload: CandidatePayload) -> Self {
        RTCIceCandidateInit {
            candidate: payload.candidate,
            sdp_mid: payload.sdp_mid,
            sdp_mline_index: payload.sdp_mline_index,
            username_fragment: payload.username_fragment,
        }
    }
}

/// One signal-channel frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalMessage {
    #[serde(rename = "candidate")]
    Candidate { candidate: CandidatePayload },
}

/// Parse a signal frame; `None` for unknown or malformed messages.
pub fn parse_signal_message(text: &str) -> Option<SignalMessage> {
    match serde_json::from_str::<SignalMessage>(text) {
        Ok(msg) => Some(msg),
        Err(e) => {
            tracing::warn!(error = %e, "unparseable signal message dropped");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_browser_candidate() {
        let text = r#"{
            "type": "candidate",
            "candidate": {
                "candidate": "candidate:1 1 udp 2122260223 192.0.2.1 54400 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            }
        }"#;
        let msg = parse_signal_message(text).unwrap();
        let SignalMessage::Candidate { candidate } = msg;
        assert!(candidate.candidate.contains("typ host"));
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert_eq!(candidate.username_fragment, None);

        let init: RTCIceCandidateInit = candidate.into();
        assert_eq!(init.sdp_mline_index, Some(0));
    }

    #[test]
    fn unknown_type_is_dropped() {
        assert!(parse_signal_message(r#"{"type": "answer", "sdp": "v=0"}"#).is_none());
    }

    #[test]
    fn garbage_is_dropped() {
        assert!(parse_signal_message("not json").is_none());
    }

    #[test]
    fn roundtrip_serialization() {
        let msg = SignalMessage::Candidate {
            candidate: CandidatePayload {
                candidate: "candidate:2 1 udp 1 198.51.100.7 3478 typ srflx".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"candidate\""));
        assert!(json.contains("sdpMLineIndex"));
        assert!(!json.contains("usernameFragment"));
    }
}
