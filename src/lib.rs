//! # NeuroConnect Voice Backend
//!
//! Realtime voice support for the NeuroConnect mental-wellness application:
//! a WebSocket relay that pairs each client with the upstream realtime voice
//! API, plus the client-side audio path (capture, playback, transcripts)
//! used by the native call client.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (TOML file + environment variables)
//! - **state**: shared application state and relay metrics
//! - **error**: error taxonomy and HTTP error responses
//! - **health**: health and metrics endpoints
//! - **middleware**: request logging and HTTP metrics collection
//! - **handlers**: runtime configuration endpoints
//! - **websocket**: the downstream leg of the relay (one actor per session)
//! - **relay**: wire envelopes, the session state machine, the upstream leg
//! - **audio**: capture pipeline, wire encoding, playback queue
//! - **call**: client-side call orchestration and transcript accumulation

pub mod audio;
pub mod call;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod relay;
pub mod state;
pub mod websocket;
