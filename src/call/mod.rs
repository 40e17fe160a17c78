//! # Call Module
//!
//! Client-side voice call orchestration: one [`session::CallSession`] per
//! call owns the relay socket, the capture pipeline and the playback queue,
//! and routes transcript/speaking/error events to the embedding UI through
//! explicit handlers.

pub mod session; // Call lifecycle and envelope dispatch
pub mod transcript; // Assistant-delta accumulation and user messages
