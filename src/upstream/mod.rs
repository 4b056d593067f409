//! Upstream Live service integration.

pub mod bridge;
pub mod events;

pub use bridge::{BridgeEvent, BridgeInput, LiveClient, LiveConnection, UpstreamBridge, WsLiveClient};
pub use events::{LiveEvent, OUTPUT_SAMPLE_RATE};
