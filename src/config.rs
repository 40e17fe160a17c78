//! # Configuration Management
//!
//! This module handles loading and managing the relay configuration from
//! multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, OPENAI_API_KEY, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! ## The upstream credential:
//! The upstream API key is only ever read from the environment
//! (`OPENAI_API_KEY`), is masked on the config read endpoint, and cannot be
//! set over HTTP. A missing key does not fail validation — the relay stays up
//! and rejects voice upgrades with a server error until one is provided.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub session: SessionSettings,
    pub audio: AudioSettings,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Upstream realtime voice-service configuration.
///
/// ## Fields:
/// - `url`: base WebSocket URL of the realtime API
/// - `model`: realtime model identifier, appended as a query parameter
/// - `api_key`: bearer credential; environment-only, never persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: String,
}

impl UpstreamConfig {
    /// Full connect URL with the model query parameter attached.
    pub fn connect_url(&self) -> String {
        format!("{}?model={}", self.url, self.model)
    }
}

/// Conversation/session configuration sent upstream once per relay session.
///
/// These map one-to-one onto the `session.update` envelope fields; see
/// [`crate::relay::envelope::session_update`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Behavioral instructions for the voice companion
    pub instructions: String,

    /// Voice identity used for synthesis
    pub voice: String,

    /// Model used for input-audio transcription
    pub transcription_model: String,

    /// Sampling temperature for response generation
    pub temperature: f64,

    /// Cap on generated tokens per response
    pub max_response_output_tokens: u32,

    /// Server-side voice-activity turn detection parameters
    pub turn_detection: TurnDetection,
}

/// Server-VAD turn detection: decides when the user has finished speaking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDetection {
    /// Energy threshold for speech detection (0.0 to 1.0)
    pub threshold: f64,

    /// Leading audio retained before detected speech, in milliseconds
    pub prefix_padding_ms: u32,

    /// Trailing silence that ends the user's turn, in milliseconds
    pub silence_duration_ms: u32,
}

/// Audio wire format, fixed on both legs of the relay — never negotiated
/// per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            upstream: UpstreamConfig {
                url: "wss://api.openai.com/v1/realtime".to_string(),
                model: "gpt-4o-realtime-preview-2024-10-01".to_string(),
                api_key: String::new(), // environment-only, see load()
            },
            session: SessionSettings {
                instructions: "You are NeuroConnect, a compassionate mental wellness AI \
                    companion for university students. You provide empathetic support, \
                    active listening, and guidance for mental health concerns. Keep \
                    responses warm, understanding, and supportive. Encourage students \
                    to seek professional help when needed."
                    .to_string(),
                voice: "alloy".to_string(),
                transcription_model: "whisper-1".to_string(),
                temperature: 0.8,
                max_response_output_tokens: 4096,
                turn_detection: TurnDetection {
                    threshold: 0.5,
                    prefix_padding_ms: 300,
                    silence_duration_ms: 1000,
                },
            },
            audio: AudioSettings {
                sample_rate: 24000, // fixed PCM16 rate on both legs
                channels: 1,
                bit_depth: 16,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST, PORT and OPENAI_API_KEY
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER_HOST=0.0.0.0`: Override server host
    /// - `OPENAI_API_KEY=sk-...`: Upstream credential (required for voice)
    /// - `HOST`/`PORT`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Special environment variables used by deployment platforms and the
        // upstream provider; these don't follow the APP_ prefix convention.
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(api_key) = env::var("OPENAI_API_KEY") {
            settings = settings.set_override("upstream.api_key", api_key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Whether the upstream credential is present.
    ///
    /// Checked once at startup (for the loud warning) and on every voice
    /// handshake (for the 500 rejection) — absence is never a per-session
    /// mid-call error.
    pub fn credential_configured(&self) -> bool {
        !self.upstream.api_key.trim().is_empty()
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Upstream URL is a WebSocket URL
    /// - Temperature and VAD threshold are within their valid ranges
    /// - Audio format matches the fixed PCM16 mono contract
    ///
    /// The upstream API key is deliberately not validated here; see
    /// [`AppConfig::credential_configured`].
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if !self.upstream.url.starts_with("ws://") && !self.upstream.url.starts_with("wss://") {
            return Err(anyhow::anyhow!(
                "Upstream URL must be a ws:// or wss:// URL, got '{}'",
                self.upstream.url
            ));
        }

        if self.upstream.model.is_empty() {
            return Err(anyhow::anyhow!("Upstream model cannot be empty"));
        }

        if !(0.0..=2.0).contains(&self.session.temperature) {
            return Err(anyhow::anyhow!(
                "Temperature must be between 0.0 and 2.0, got {}",
                self.session.temperature
            ));
        }

        if !(0.0..=1.0).contains(&self.session.turn_detection.threshold) {
            return Err(anyhow::anyhow!(
                "Turn detection threshold must be between 0.0 and 1.0, got {}",
                self.session.turn_detection.threshold
            ));
        }

        if self.session.max_response_output_tokens == 0 {
            return Err(anyhow::anyhow!("Max response output tokens must be greater than 0"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rate cannot be 0"));
        }

        if self.audio.channels != 1 {
            return Err(anyhow::anyhow!("Audio must be mono (1 channel)"));
        }

        if self.audio.bit_depth != 16 {
            return Err(anyhow::anyhow!("Audio must be 16-bit PCM"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present in the JSON are changed; everything else keeps
    /// its current value. The upstream API key is not updatable through this
    /// path — it stays environment-only.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(upstream) = partial_config.get("upstream") {
            if let Some(url) = upstream.get("url").and_then(|v| v.as_str()) {
                self.upstream.url = url.to_string();
            }
            if let Some(model) = upstream.get("model").and_then(|v| v.as_str()) {
                self.upstream.model = model.to_string();
            }
            // api_key intentionally ignored: environment-only
        }

        if let Some(session) = partial_config.get("session") {
            if let Some(instructions) = session.get("instructions").and_then(|v| v.as_str()) {
                self.session.instructions = instructions.to_string();
            }
            if let Some(voice) = session.get("voice").and_then(|v| v.as_str()) {
                self.session.voice = voice.to_string();
            }
            if let Some(temperature) = session.get("temperature").and_then(|v| v.as_f64()) {
                self.session.temperature = temperature;
            }
            if let Some(tokens) = session
                .get("max_response_output_tokens")
                .and_then(|v| v.as_u64())
            {
                self.session.max_response_output_tokens = tokens as u32;
            }
            if let Some(turn) = session.get("turn_detection") {
                if let Some(threshold) = turn.get("threshold").and_then(|v| v.as_f64()) {
                    self.session.turn_detection.threshold = threshold;
                }
                if let Some(prefix) = turn.get("prefix_padding_ms").and_then(|v| v.as_u64()) {
                    self.session.turn_detection.prefix_padding_ms = prefix as u32;
                }
                if let Some(silence) = turn.get("silence_duration_ms").and_then(|v| v.as_u64()) {
                    self.session.turn_detection.silence_duration_ms = silence as u32;
                }
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The default configuration must be valid and carry the fixed audio
    /// contract.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.audio.sample_rate, 24000);
        assert_eq!(config.audio.channels, 1);
        assert_eq!(config.audio.bit_depth, 16);
        assert!(config.validate().is_ok());
    }

    /// No credential ships in the defaults; the relay must detect that.
    #[test]
    fn test_default_credential_missing() {
        let config = AppConfig::default();
        assert!(!config.credential_configured());
        // Whitespace is not a credential either
        let mut config = config;
        config.upstream.api_key = "   ".to_string();
        assert!(!config.credential_configured());
        config.upstream.api_key = "sk-test".to_string();
        assert!(config.credential_configured());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.upstream.url = "https://api.openai.com".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.turn_detection.threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.channels = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"session": {"voice": "verse", "turn_detection": {"silence_duration_ms": 800}}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.session.voice, "verse");
        assert_eq!(config.session.turn_detection.silence_duration_ms, 800);
        // Untouched fields keep their values
        assert_eq!(config.session.temperature, 0.8);
    }

    /// The credential cannot be injected through the runtime update surface.
    #[test]
    fn test_config_update_cannot_set_api_key() {
        let mut config = AppConfig::default();
        let json = r#"{"upstream": {"api_key": "sk-sneaky"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert!(!config.credential_configured());
    }

    #[test]
    fn test_connect_url() {
        let config = AppConfig::default();
        assert_eq!(
            config.upstream.connect_url(),
            "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview-2024-10-01"
        );
    }
}
