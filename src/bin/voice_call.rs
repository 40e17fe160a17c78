//! # voice-call - Terminal Voice Client
//!
//! Minimal native client for the voice relay: acquires the microphone,
//! streams to `/ws/voice`, plays the synthesized replies and prints the
//! conversation transcript. Ctrl-C ends the call.
//!
//! ## Usage:
//! ```text
//! voice-call [relay-url]
//! RELAY_URL=ws://host:8080/ws/voice voice-call
//! ```

use anyhow::Result;
use neuro_voice_backend::call::session::{CallHandlers, CallSession};
use neuro_voice_backend::call::transcript::TranscriptEvent;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8080/ws/voice";

/// The call audio format: PCM16 mono at 24 kHz, matching both relay legs.
const SAMPLE_RATE: u32 = 24_000;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_call=info,neuro_voice_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let relay_url = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("RELAY_URL").ok())
        .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string());

    let handlers = CallHandlers {
        on_transcript: Arc::new(|event| match event {
            TranscriptEvent::User(text) => println!("You:  {}", text),
            TranscriptEvent::AssistantFinal(text) => println!("Nara: {}", text),
            TranscriptEvent::AssistantPartial(text) => {
                debug!("assistant (partial): {}", text);
            }
        }),
        on_speaking: Arc::new(|speaking| {
            if speaking {
                debug!("assistant speaking");
            } else {
                debug!("assistant finished speaking");
            }
        }),
        on_error: Arc::new(|message| {
            eprintln!("error: {}", message);
        }),
    };

    println!("Connecting to {} ...", relay_url);
    let mut session = CallSession::connect(&relay_url, SAMPLE_RATE, handlers).await?;
    println!("Connected. Speak naturally; press Ctrl-C to hang up.");

    tokio::signal::ctrl_c().await?;

    session.teardown();
    let duration = session.duration();
    info!("Call ended after {}s", duration.as_secs());
    println!(
        "\nCall ended ({}:{:02})",
        duration.as_secs() / 60,
        duration.as_secs() % 60
    );

    Ok(())
}
