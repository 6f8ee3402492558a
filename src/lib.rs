//! # transcribe-relay
//!
//! Real-time speech transcription and translation relay. Accepts long-lived
//! WebSocket client connections streaming 16-bit PCM audio, proxies the audio
//! to an upstream streaming speech-to-text provider, fans the returned token
//! stream back to the client as structured events, and durably records the
//! transcript plus usage duration at session close.
//!
//! Module map:
//! - [`adapter`] — C1, the upstream STT connection
//! - [`accumulator`] — C2, speaker-attributed transcript/translation state
//! - [`meter`] — C3, recording-duration tracking
//! - [`quota`] — C4, subscription admission and usage recording
//! - [`queue`] — C5, the durable priority write queue
//! - [`gateway`] — C6, the per-connection session actor
//! - [`config`] — D1, environment-sourced startup configuration
//! - [`store`] — D2, the persistence pool

pub mod accumulator;
pub mod adapter;
pub mod config;
pub mod constants;
pub mod errors;
pub mod gateway;
pub mod meter;
pub mod model;
pub mod queue;
pub mod quota;
pub mod store;
