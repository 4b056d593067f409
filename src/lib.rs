//! atelier-live: a real-time multimodal gateway.
//!
//! Bridges browser WebRTC clients to a generative Live service:
//! ingress camera/microphone media is decoded, sampled, screened by a
//! privacy shield, and forwarded upstream; synthesized audio flows
//! back to the client. Out-of-band HTTP endpoints offer per-frame
//! privacy screening, spatial surface analysis, and a snapshot
//! gallery backed by opaque blob/record stores.

pub mod config;
pub mod error;
pub mod gallery;
pub mod gateway;
pub mod media;
pub mod session;
pub mod shield;
pub mod signal;
pub mod spatial;
pub mod telemetry;
pub mod upstream;

#[cfg(test)]
pub mod testutil;

pub use config::Config;
pub use error::{ErrorKind, GatewayError};
