//! # Audio Module
//!
//! The client-side audio path of a voice call: microphone capture, the wire
//! encoding both legs share, and gapless playback of synthesized audio.
//!
//! ## Key Components:
//! - **Capture**: default input device at the call format, frames delivered
//!   to a caller-supplied callback (`audio/capture.rs`)
//! - **Encode**: f32 ↔ PCM16 ↔ base64 conversions (`audio/encode.rs`)
//! - **Playback**: sample-accurate sequential scheduling with speaking-state
//!   signals (`audio/playback.rs`)
//!
//! ## Audio Format:
//! PCM16 mono at 24 kHz on both legs of the relay — fixed, never negotiated
//! per call.

pub mod capture; // Microphone acquisition on a dedicated worker thread
pub mod encode; // Sample-format and wire-format conversions
pub mod playback; // Gapless scheduled playback with speaking signals
