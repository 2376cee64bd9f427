//! Relay configuration
//!
//! Durations are carried as `*_ms` integers so the same struct loads from
//! TOML and environment variables without a custom deserializer.

use std::fmt;
use std::time::Duration;

use callrelay_codec_core::AudioEncoding;
use callrelay_infra_common::{ConfigSource, load_config};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::errors::{Result, SessionError};
use crate::functions::FunctionName;

/// Top-level configuration for an orchestrator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub engine: EngineConfig,
    pub relay: RelaySettings,
    pub turn: TurnConfig,
    pub functions: FunctionsConfig,
}

/// Speech engine connection and session parameters
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub url: String,
    pub model: String,
    pub api_key: String,
    pub voice: String,
    pub instructions: String,
    pub temperature: f32,
    pub max_response_output_tokens: u32,
    /// Audio format for both engine directions
    pub audio_format: AudioEncoding,
    pub vad_threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
    /// Instructions for the opening response; no greeting when unset
    pub greeting: Option<String>,
    /// Caller-side transcription model, enables caller transcript events
    pub transcription_model: Option<String>,
    /// How long to wait for `session.updated`
    pub negotiation_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.openai.com/v1/realtime".to_string(),
            model: "gpt-4o-realtime-preview-2024-12-17".to_string(),
            api_key: String::new(),
            voice: "alloy".to_string(),
            instructions: "You are a friendly, efficient customer support agent. Keep answers short \
                           and use the available tools to look up real data."
                .to_string(),
            temperature: 0.8,
            max_response_output_tokens: 4096,
            audio_format: AudioEncoding::G711Ulaw,
            vad_threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
            greeting: Some("Greet the caller warmly and ask how you can help.".to_string()),
            transcription_model: None,
            negotiation_timeout_ms: 10_000,
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("url", &self.url)
            .field("model", &self.model)
            .field("api_key", &if self.api_key.is_empty() { "<unset>" } else { "<redacted>" })
            .field("voice", &self.voice)
            .field("temperature", &self.temperature)
            .field("audio_format", &self.audio_format)
            .field("greeting", &self.greeting.is_some())
            .field("negotiation_timeout_ms", &self.negotiation_timeout_ms)
            .finish_non_exhaustive()
    }
}

impl EngineConfig {
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    /// Full dial URL including the model query parameter
    pub fn endpoint(&self) -> String {
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}model={}", self.url, sep, self.model)
    }
}

/// Relay pipeline limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Frames buffered per direction before the oldest is dropped
    pub max_buffered_frames: usize,
    /// Time tasks get to stop after cancellation before being aborted
    pub shutdown_grace_ms: u64,
    /// Consecutive malformed messages from one peer before the session ends
    pub max_protocol_violations: u32,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            max_buffered_frames: 50,
            shutdown_grace_ms: 2_000,
            max_protocol_violations: 20,
        }
    }
}

impl RelaySettings {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Which peer reports caller voice activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VadSource {
    /// Engine server VAD (`input_audio_buffer.speech_started` / `speech_stopped`)
    Engine,
    /// Energy detector over inbound telephony frames
    Telephony,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    pub vad_source: VadSource,
    /// Forced resume if the engine never acknowledges a flush
    pub flush_ack_timeout_ms: u64,
    /// RMS level for the telephony-side detector
    pub energy_threshold: f32,
    pub onset_frames: u32,
    pub hangover_frames: u32,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            vad_source: VadSource::Engine,
            flush_ack_timeout_ms: 2_000,
            energy_threshold: 500.0,
            onset_frames: 2,
            hangover_frames: 25,
        }
    }
}

impl TurnConfig {
    pub fn flush_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_ack_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionsConfig {
    /// Functions advertised to the engine; each needs a registered handler
    pub enabled: Vec<FunctionName>,
    pub timeout_ms: u64,
}

impl Default for FunctionsConfig {
    fn default() -> Self {
        Self {
            enabled: FunctionName::iter().collect(),
            timeout_ms: 8_000,
        }
    }
}

impl FunctionsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl RelayConfig {
    /// Load from defaults, an optional TOML file and `CALLRELAY_*` variables
    pub fn load(source: &ConfigSource) -> Result<Self> {
        let config: RelayConfig = load_config(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or disable a session
    pub fn validate(&self) -> Result<()> {
        if self.engine.url.is_empty() {
            return Err(SessionError::config("engine.url must be set"));
        }
        if self.engine.negotiation_timeout_ms == 0 {
            return Err(SessionError::config("engine.negotiation_timeout_ms must be non-zero"));
        }
        if self.relay.max_buffered_frames == 0 {
            return Err(SessionError::config("relay.max_buffered_frames must be non-zero"));
        }
        if self.relay.max_protocol_violations == 0 {
            return Err(SessionError::config("relay.max_protocol_violations must be non-zero"));
        }
        if self.turn.flush_ack_timeout_ms == 0 {
            return Err(SessionError::config("turn.flush_ack_timeout_ms must be non-zero"));
        }
        if self.functions.timeout_ms == 0 {
            return Err(SessionError::config("functions.timeout_ms must be non-zero"));
        }
        if !(0.0..=2.0).contains(&self.engine.temperature) {
            return Err(SessionError::config(format!(
                "engine.temperature {} out of range",
                self.engine.temperature
            )));
        }
        Ok(())
    }
}
