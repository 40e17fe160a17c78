//! # Wire Envelopes
//!
//! The relay and the client exchange JSON text frames tagged by a `type`
//! string. This module knows the envelope types this system acts on, builds
//! the outbound envelopes, and parses inbound ones leniently.
//!
//! ## Transparency rule:
//! The relay forwards every envelope verbatim whether or not it recognizes
//! the `type` — parsing here is for local bookkeeping and for the client's
//! dispatch, never a gate on forwarding. An unrecognized type is
//! [`ServerEvent::Other`], not an error; a payload that doesn't parse at all
//! is a `MalformedEnvelope` that the caller logs and drops.

use crate::config::SessionSettings;
use crate::error::{AppError, AppResult};
use serde_json::{json, Value};

/// Client → relay: one base64 PCM16 audio frame.
pub const INPUT_AUDIO_APPEND: &str = "input_audio_buffer.append";

/// Relay → upstream, exactly once per session: session configuration.
pub const SESSION_UPDATE: &str = "session.update";

/// Upstream → client: one base64 PCM16 chunk of synthesized audio.
pub const RESPONSE_AUDIO_DELTA: &str = "response.audio.delta";

/// Upstream → client: the current audio response is complete.
pub const RESPONSE_AUDIO_DONE: &str = "response.audio.done";

/// Upstream → client: full transcript of what the user just said.
pub const INPUT_TRANSCRIPTION_COMPLETED: &str =
    "conversation.item.input_audio_transcription.completed";

/// Upstream → client: incremental fragment of the assistant's transcript.
pub const RESPONSE_TRANSCRIPT_DELTA: &str = "response.audio_transcript.delta";

/// Either leg: error description; surfaced to the user, never a silent kill.
pub const ERROR: &str = "error";

/// Parsed view of the upstream → client envelopes the client acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Synthesized audio chunk, still base64-encoded
    AudioDelta { delta: String },

    /// End of the current synthesized response
    AudioDone,

    /// Complete user utterance transcript
    UserTranscript { transcript: String },

    /// Incremental assistant transcript fragment
    AssistantTranscriptDelta { delta: String },

    /// Error surfaced from the relay or the upstream service
    ErrorNotice { message: String },

    /// Recognized as a valid envelope, but not a type this client acts on
    Other { kind: String },
}

/// Peek at an envelope's `type` without requiring the rest to parse.
///
/// Used by the relay for bookkeeping on the forwarding path; a `None` here
/// never blocks the forward.
pub fn envelope_kind(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value.get("type")?.as_str().map(|s| s.to_string())
}

/// Parse an upstream → client envelope into the client's event view.
///
/// ## Errors:
/// `MalformedEnvelope` when the text is not JSON, has no `type`, or a
/// recognized type is missing its payload field. Callers log and drop; the
/// session survives.
pub fn parse_server_event(text: &str) -> AppResult<ServerEvent> {
    let value: Value = serde_json::from_str(text)?;

    let kind = value
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::MalformedEnvelope("envelope has no 'type' field".to_string()))?;

    match kind {
        RESPONSE_AUDIO_DELTA => {
            let delta = require_str(&value, "delta", kind)?;
            Ok(ServerEvent::AudioDelta { delta })
        }
        RESPONSE_AUDIO_DONE => Ok(ServerEvent::AudioDone),
        INPUT_TRANSCRIPTION_COMPLETED => {
            let transcript = require_str(&value, "transcript", kind)?;
            Ok(ServerEvent::UserTranscript { transcript })
        }
        RESPONSE_TRANSCRIPT_DELTA => {
            let delta = require_str(&value, "delta", kind)?;
            Ok(ServerEvent::AssistantTranscriptDelta { delta })
        }
        ERROR => {
            // The error payload is a string on the relay leg but an object on
            // the upstream leg; render either as a message.
            let message = match value.get("error") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => "unknown error".to_string(),
            };
            Ok(ServerEvent::ErrorNotice { message })
        }
        other => Ok(ServerEvent::Other {
            kind: other.to_string(),
        }),
    }
}

fn require_str(value: &Value, field: &str, kind: &str) -> AppResult<String> {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            AppError::MalformedEnvelope(format!("'{}' envelope missing '{}' field", kind, field))
        })
}

/// Build the client → relay audio frame envelope.
pub fn input_audio_append(audio_b64: &str) -> String {
    json!({
        "type": INPUT_AUDIO_APPEND,
        "audio": audio_b64,
    })
    .to_string()
}

/// Build an `error` envelope for the downstream leg.
pub fn error_envelope(message: &str) -> String {
    json!({
        "type": ERROR,
        "error": message,
    })
    .to_string()
}

/// Build the one-shot `session.update` configuration envelope.
///
/// Sent immediately after the upstream handshake completes, exactly once per
/// relay session. Carries modalities, instructions, voice, the fixed PCM16
/// audio formats, input transcription, server-VAD turn detection, temperature
/// and the output token cap.
pub fn session_update(settings: &SessionSettings) -> String {
    json!({
        "type": SESSION_UPDATE,
        "session": {
            "modalities": ["text", "audio"],
            "instructions": settings.instructions,
            "voice": settings.voice,
            "input_audio_format": "pcm16",
            "output_audio_format": "pcm16",
            "input_audio_transcription": {
                "model": settings.transcription_model,
            },
            "turn_detection": {
                "type": "server_vad",
                "threshold": settings.turn_detection.threshold,
                "prefix_padding_ms": settings.turn_detection.prefix_padding_ms,
                "silence_duration_ms": settings.turn_detection.silence_duration_ms,
            },
            "temperature": settings.temperature,
            "max_response_output_tokens": settings.max_response_output_tokens,
        },
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_session_update_contains_configured_fields() {
        let settings = AppConfig::default().session;
        let envelope = session_update(&settings);
        let value: Value = serde_json::from_str(&envelope).unwrap();

        assert_eq!(value["type"], SESSION_UPDATE);
        let session = &value["session"];
        assert_eq!(session["modalities"], json!(["text", "audio"]));
        assert_eq!(session["voice"], "alloy");
        assert_eq!(session["input_audio_format"], "pcm16");
        assert_eq!(session["output_audio_format"], "pcm16");
        assert_eq!(session["input_audio_transcription"]["model"], "whisper-1");
        assert_eq!(session["turn_detection"]["type"], "server_vad");
        assert_eq!(session["turn_detection"]["threshold"], 0.5);
        assert_eq!(session["turn_detection"]["prefix_padding_ms"], 300);
        assert_eq!(session["turn_detection"]["silence_duration_ms"], 1000);
        assert_eq!(session["temperature"], 0.8);
        assert_eq!(session["max_response_output_tokens"], 4096);
        assert!(session["instructions"]
            .as_str()
            .unwrap()
            .contains("NeuroConnect"));
    }

    #[test]
    fn test_parse_audio_delta() {
        let event =
            parse_server_event(r#"{"type":"response.audio.delta","delta":"AAAA"}"#).unwrap();
        assert_eq!(
            event,
            ServerEvent::AudioDelta {
                delta: "AAAA".to_string()
            }
        );
    }

    #[test]
    fn test_parse_audio_done() {
        let event = parse_server_event(r#"{"type":"response.audio.done"}"#).unwrap();
        assert_eq!(event, ServerEvent::AudioDone);
    }

    #[test]
    fn test_parse_transcripts() {
        let user = parse_server_event(
            r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"I feel anxious today"}"#,
        )
        .unwrap();
        assert_eq!(
            user,
            ServerEvent::UserTranscript {
                transcript: "I feel anxious today".to_string()
            }
        );

        let assistant =
            parse_server_event(r#"{"type":"response.audio_transcript.delta","delta":"Hel"}"#)
                .unwrap();
        assert_eq!(
            assistant,
            ServerEvent::AssistantTranscriptDelta {
                delta: "Hel".to_string()
            }
        );
    }

    #[test]
    fn test_parse_error_string_and_object_payloads() {
        let relay_leg = parse_server_event(r#"{"type":"error","error":"upstream gone"}"#).unwrap();
        assert_eq!(
            relay_leg,
            ServerEvent::ErrorNotice {
                message: "upstream gone".to_string()
            }
        );

        let upstream_leg =
            parse_server_event(r#"{"type":"error","error":{"code":"rate_limited"}}"#).unwrap();
        match upstream_leg {
            ServerEvent::ErrorNotice { message } => assert!(message.contains("rate_limited")),
            other => panic!("expected error notice, got {:?}", other),
        }
    }

    /// Unknown types are recognized-but-unhandled, never an error: the
    /// forwarding path must stay transparent.
    #[test]
    fn test_parse_unknown_type_is_other() {
        let event = parse_server_event(r#"{"type":"response.created"}"#).unwrap();
        assert_eq!(
            event,
            ServerEvent::Other {
                kind: "response.created".to_string()
            }
        );
    }

    #[test]
    fn test_parse_failures_are_malformed_envelope() {
        assert!(parse_server_event("{not json").is_err());
        assert!(parse_server_event(r#"{"no_type":true}"#).is_err());
        // Recognized type with a missing payload field
        assert!(parse_server_event(r#"{"type":"response.audio.delta"}"#).is_err());
    }

    #[test]
    fn test_input_audio_append_shape() {
        let envelope = input_audio_append("UENN");
        let value: Value = serde_json::from_str(&envelope).unwrap();
        assert_eq!(value["type"], INPUT_AUDIO_APPEND);
        assert_eq!(value["audio"], "UENN");
    }

    #[test]
    fn test_envelope_kind_peek() {
        assert_eq!(
            envelope_kind(r#"{"type":"response.audio.delta","delta":"x"}"#),
            Some("response.audio.delta".to_string())
        );
        assert_eq!(envelope_kind("not json"), None);
    }
}
