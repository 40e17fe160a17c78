//! # Call Session
//!
//! Client-side orchestration of one voice call: owns the relay socket, the
//! capture pipeline, the playback queue and the transcript accumulator, and
//! wires them together. Everything a call touches hangs off this one object
//! — collaborators receive what they need explicitly instead of reading
//! ambient connection state, so two calls can never interfere.
//!
//! ## Frame path:
//! capture callback → (drop unless socket open) → encode → `input_audio_buffer.append`
//! → relay. Inbound: envelope → dispatch (audio → playback queue, transcript
//! → accumulator, error → handler).
//!
//! ## Teardown:
//! `teardown` runs the fixed order — stop capture, close the socket (the
//! relay cascades that to the upstream leg), clear the playback queue — and
//! every step is idempotent, so unmount, explicit hangup and socket-error
//! callbacks can all race it safely.

use crate::audio::capture::CapturePipeline;
use crate::audio::encode;
use crate::audio::playback::{PlaybackQueue, SpeakingCallback};
use crate::call::transcript::{TranscriptAccumulator, TranscriptEvent};
use crate::error::{AppError, AppResult};
use crate::relay::envelope::{self, ServerEvent};

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, info, warn};

/// Callbacks the embedding UI supplies for one call.
#[derive(Clone)]
pub struct CallHandlers {
    /// Transcript updates (growing assistant bubble, finalized messages,
    /// complete user utterances)
    pub on_transcript: Arc<dyn Fn(TranscriptEvent) + Send + Sync>,

    /// Speaking-indicator transitions, driven by the playback queue
    pub on_speaking: Arc<dyn Fn(bool) + Send + Sync>,

    /// User-visible failures (retry is a fresh user action, never automatic)
    pub on_error: Arc<dyn Fn(String) + Send + Sync>,
}

impl CallHandlers {
    /// Handlers that discard every event; useful for tooling and tests.
    pub fn noop() -> Self {
        Self {
            on_transcript: Arc::new(|_| {}),
            on_speaking: Arc::new(|_| {}),
            on_error: Arc::new(|_| {}),
        }
    }
}

/// One live voice call from the client side.
pub struct CallSession {
    socket_open: Arc<AtomicBool>,
    outbound_tx: Option<UnboundedSender<WsMessage>>,
    capture: CapturePipeline,
    playback: Arc<PlaybackQueue>,
    reader_task: Option<JoinHandle<()>>,
    connected_at: Instant,
}

impl CallSession {
    /// Connect to the relay and start the full audio path (microphone and
    /// speaker devices attached).
    ///
    /// ## Errors:
    /// - `UpstreamUnavailable` when the relay socket cannot be established
    /// - `DeviceUnavailable` when either audio device cannot be acquired —
    ///   the socket is torn down again and the session never begins
    pub async fn connect(
        relay_url: &str,
        sample_rate: u32,
        handlers: CallHandlers,
    ) -> AppResult<Self> {
        Self::connect_inner(relay_url, sample_rate, handlers, true).await
    }

    /// Headless variant for tooling and tests: same socket and dispatch
    /// wiring, no audio devices (detached playback queue, capture never
    /// started).
    pub async fn connect_detached(
        relay_url: &str,
        sample_rate: u32,
        handlers: CallHandlers,
    ) -> AppResult<Self> {
        Self::connect_inner(relay_url, sample_rate, handlers, false).await
    }

    async fn connect_inner(
        relay_url: &str,
        sample_rate: u32,
        handlers: CallHandlers,
        attach_devices: bool,
    ) -> AppResult<Self> {
        info!("Connecting to voice relay at {}", relay_url);

        let (stream, _response) = connect_async(relay_url)
            .await
            .map_err(|e| AppError::UpstreamUnavailable(format!("relay connect failed: {}", e)))?;
        let (mut sink, mut reader) = stream.split();

        let socket_open = Arc::new(AtomicBool::new(true));
        let accumulator = Arc::new(Mutex::new(TranscriptAccumulator::new()));

        // The speaking signal both drives the UI indicator and finalizes the
        // assistant bubble when a burst ends.
        let speaking_cb: SpeakingCallback = {
            let accumulator = accumulator.clone();
            let on_transcript = handlers.on_transcript.clone();
            let on_speaking = handlers.on_speaking.clone();
            Arc::new(move |speaking| {
                if !speaking {
                    if let Some(text) = accumulator.lock().unwrap().end_assistant_turn() {
                        on_transcript(TranscriptEvent::AssistantFinal(text));
                    }
                }
                on_speaking(speaking);
            })
        };

        let playback = if attach_devices {
            PlaybackQueue::with_default_output(sample_rate, speaking_cb)?
        } else {
            PlaybackQueue::detached(sample_rate, speaking_cb)
        };
        let playback = Arc::new(playback);

        // Writer: drains the outbound channel into the socket. Dropping the
        // sender ends this task with a clean close frame.
        let (outbound_tx, mut outbound_rx) = unbounded_channel::<WsMessage>();
        {
            let socket_open = socket_open.clone();
            tokio::spawn(async move {
                loop {
                    match outbound_rx.recv().await {
                        Some(message) => {
                            if let Err(e) = sink.send(message).await {
                                warn!("Relay send failed: {}", e);
                                socket_open.store(false, Ordering::Relaxed);
                                break;
                            }
                        }
                        None => {
                            let _ = sink.send(WsMessage::Close(None)).await;
                            socket_open.store(false, Ordering::Relaxed);
                            break;
                        }
                    }
                }
            });
        }

        // Reader: dispatches inbound envelopes until the socket goes away.
        let reader_task = {
            let socket_open = socket_open.clone();
            let playback = playback.clone();
            let accumulator = accumulator.clone();
            let handlers = handlers.clone();
            tokio::spawn(async move {
                while let Some(message) = reader.next().await {
                    match message {
                        Ok(WsMessage::Text(text)) => {
                            dispatch_envelope(&text, &playback, &accumulator, &handlers);
                        }
                        Ok(WsMessage::Close(_)) => {
                            info!("Relay closed the connection");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("Relay socket error: {}", e);
                            (handlers.on_error)(format!("voice connection error: {}", e));
                            break;
                        }
                    }
                }
                socket_open.store(false, Ordering::Relaxed);
            })
        };

        // Capture starts last: frames produced while the socket is anything
        // but open are dropped at the gate below — no buffering, stale audio
        // has no value.
        let mut capture = CapturePipeline::new(sample_rate);
        if attach_devices {
            let gate = socket_open.clone();
            let tx = outbound_tx.clone();
            let started = capture.start(move |samples| {
                if !gate.load(Ordering::Relaxed) {
                    return;
                }
                let envelope = envelope::input_audio_append(&encode::encode_frame(samples));
                let _ = tx.send(WsMessage::Text(envelope));
            });

            if let Err(e) = started {
                // Session never begins: undo the socket before reporting.
                socket_open.store(false, Ordering::Relaxed);
                drop(outbound_tx);
                reader_task.abort();
                return Err(e);
            }
        }

        info!("Voice call connected");
        Ok(Self {
            socket_open,
            outbound_tx: Some(outbound_tx),
            capture,
            playback,
            reader_task: Some(reader_task),
            connected_at: Instant::now(),
        })
    }

    /// Whether the relay socket is still open.
    pub fn is_connected(&self) -> bool {
        self.socket_open.load(Ordering::Relaxed)
    }

    /// Elapsed call time (drives the on-screen call timer).
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// The playback queue serving this call.
    pub fn playback_queue(&self) -> &PlaybackQueue {
        &self.playback
    }

    /// End the call: stop capture, close the socket (the relay closes the
    /// upstream leg in response), clear the playback queue.
    ///
    /// Every step is idempotent and the whole sequence is safe to invoke
    /// redundantly from racing teardown triggers.
    pub fn teardown(&mut self) {
        self.capture.stop();

        self.socket_open.store(false, Ordering::Relaxed);
        // Dropping the sender makes the writer send a close frame and exit.
        self.outbound_tx.take();
        if let Some(reader) = self.reader_task.take() {
            reader.abort();
        }

        self.playback.clear();
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Route one inbound envelope to the component that acts on it.
///
/// Malformed payloads are logged and dropped; the call survives them.
fn dispatch_envelope(
    text: &str,
    playback: &PlaybackQueue,
    accumulator: &Mutex<TranscriptAccumulator>,
    handlers: &CallHandlers,
) {
    match envelope::parse_server_event(text) {
        Ok(ServerEvent::AudioDelta { delta }) => {
            if let Err(e) = playback.enqueue_wire(&delta) {
                warn!("Dropping undecodable audio delta: {}", e);
            }
        }
        Ok(ServerEvent::AudioDone) => {
            // Turn complete: finalize the bubble now if playback hasn't
            // already done it via the speaking-stopped signal.
            if let Some(text) = accumulator.lock().unwrap().end_assistant_turn() {
                (handlers.on_transcript)(TranscriptEvent::AssistantFinal(text));
            }
        }
        Ok(ServerEvent::UserTranscript { transcript }) => {
            (handlers.on_transcript)(TranscriptEvent::User(transcript));
        }
        Ok(ServerEvent::AssistantTranscriptDelta { delta }) => {
            let current = accumulator.lock().unwrap().push_delta(&delta).to_string();
            (handlers.on_transcript)(TranscriptEvent::AssistantPartial(current));
        }
        Ok(ServerEvent::ErrorNotice { message }) => {
            warn!("Error from relay: {}", message);
            (handlers.on_error)(message);
        }
        Ok(ServerEvent::Other { kind }) => {
            debug!(kind = %kind, "Ignoring unhandled envelope type");
        }
        Err(e) => {
            warn!("Dropping malformed envelope: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Recorded {
        transcripts: Arc<Mutex<Vec<TranscriptEvent>>>,
        speaking: Arc<Mutex<Vec<bool>>>,
        errors: Arc<Mutex<Vec<String>>>,
    }

    fn recording_handlers() -> (CallHandlers, Recorded) {
        let transcripts: Arc<Mutex<Vec<TranscriptEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let speaking: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
        let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let handlers = CallHandlers {
            on_transcript: {
                let transcripts = transcripts.clone();
                Arc::new(move |event| transcripts.lock().unwrap().push(event))
            },
            on_speaking: {
                let speaking = speaking.clone();
                Arc::new(move |state| speaking.lock().unwrap().push(state))
            },
            on_error: {
                let errors = errors.clone();
                Arc::new(move |message| errors.lock().unwrap().push(message))
            },
        };

        (
            handlers,
            Recorded {
                transcripts,
                speaking,
                errors,
            },
        )
    }

    /// Fake relay: accepts one connection, sends the given envelopes, then
    /// idles until the client goes away.
    async fn fake_relay(envelopes: Vec<String>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut sink, mut reader) = ws.split();

            for envelope in envelopes {
                sink.send(WsMessage::Text(envelope)).await.unwrap();
            }

            while let Some(Ok(_)) = reader.next().await {}
        });

        format!("ws://{}", addr)
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    /// Inbound envelopes reach the right component: deltas grow one bubble,
    /// the done marker finalizes it, a user transcript is one distinct
    /// complete message.
    #[tokio::test]
    async fn test_dispatch_from_relay() {
        let url = fake_relay(vec![
            json!({"type": "response.audio_transcript.delta", "delta": "Hel"}).to_string(),
            json!({"type": "response.audio_transcript.delta", "delta": "lo "}).to_string(),
            json!({"type": "response.audio_transcript.delta", "delta": "there"}).to_string(),
            json!({"type": "response.audio.done"}).to_string(),
            json!({
                "type": "conversation.item.input_audio_transcription.completed",
                "transcript": "I feel anxious today"
            })
            .to_string(),
        ])
        .await;

        let (handlers, recorded) = recording_handlers();
        let mut session = CallSession::connect_detached(&url, 24000, handlers)
            .await
            .unwrap();

        wait_until(|| recorded.transcripts.lock().unwrap().len() >= 5).await;

        let transcripts = recorded.transcripts.lock().unwrap().clone();
        assert_eq!(
            transcripts,
            vec![
                TranscriptEvent::AssistantPartial("Hel".to_string()),
                TranscriptEvent::AssistantPartial("Hello ".to_string()),
                TranscriptEvent::AssistantPartial("Hello there".to_string()),
                TranscriptEvent::AssistantFinal("Hello there".to_string()),
                TranscriptEvent::User("I feel anxious today".to_string()),
            ]
        );
        assert!(recorded.errors.lock().unwrap().is_empty());

        session.teardown();
    }

    /// Audio deltas decode into the playback queue and start a burst; error
    /// envelopes surface to the error handler; malformed payloads are
    /// dropped without killing the call.
    #[tokio::test]
    async fn test_audio_and_error_dispatch() {
        let audio = encode::encode_frame(&vec![0.1f32; 240]);
        let url = fake_relay(vec![
            json!({"type": "response.audio.delta", "delta": audio}).to_string(),
            "{definitely not json".to_string(),
            json!({"type": "error", "error": "upstream connect failed"}).to_string(),
        ])
        .await;

        let (handlers, recorded) = recording_handlers();
        let mut session = CallSession::connect_detached(&url, 24000, handlers)
            .await
            .unwrap();

        wait_until(|| !recorded.errors.lock().unwrap().is_empty()).await;

        assert_eq!(session.playback_queue().pending_frames(), 1);
        assert_eq!(*recorded.speaking.lock().unwrap(), vec![true]);
        assert_eq!(
            *recorded.errors.lock().unwrap(),
            vec!["upstream connect failed".to_string()]
        );
        // The malformed frame killed nothing
        assert!(session.is_connected());

        session.teardown();
    }

    /// Teardown twice in a row: no error, socket closed, queue empty — and
    /// interrupting the in-flight burst emits the final speaking-stopped.
    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let audio = encode::encode_frame(&vec![0.1f32; 240]);
        let url = fake_relay(vec![
            json!({"type": "response.audio.delta", "delta": audio}).to_string(),
        ])
        .await;

        let (handlers, recorded) = recording_handlers();
        let mut session = CallSession::connect_detached(&url, 24000, handlers)
            .await
            .unwrap();

        wait_until(|| !recorded.speaking.lock().unwrap().is_empty()).await;

        session.teardown();
        session.teardown();

        assert!(!session.is_connected());
        assert!(session.playback_queue().is_idle());
        assert_eq!(*recorded.speaking.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test]
    async fn test_connect_fails_when_relay_unreachable() {
        let (handlers, _recorded) = recording_handlers();
        // Port 9 (discard) is not listening on loopback
        let result = CallSession::connect_detached("ws://127.0.0.1:9", 24000, handlers).await;
        assert!(matches!(result, Err(AppError::UpstreamUnavailable(_))));
    }
}
