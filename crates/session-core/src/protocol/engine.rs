//! Realtime speech engine events
//!
//! Frames are JSON objects tagged by `type`. The engine emits many event
//! kinds the relay has no use for; those decode to [`EngineEvent::Unknown`]
//! instead of counting as violations. Only unparseable frames and frames
//! without a `type` are violations.

use callrelay_codec_core::AudioEncoding;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{EngineConfig, TurnConfig, VadSource};
use crate::errors::{Result, SessionError};
use crate::types::Peer;

/// Event received from the engine, reduced to what the relay acts on
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    SessionCreated,
    /// Acknowledges `session.update`; completes negotiation
    SessionUpdated,
    ResponseCreated { response_id: Option<String> },
    /// Base64 agent audio chunk
    AudioDelta { response_id: Option<String>, delta: String },
    AudioDone { response_id: Option<String> },
    ResponseDone { response_id: Option<String> },
    FunctionCall { call_id: String, name: String, arguments: String },
    SpeechStarted,
    SpeechStopped,
    /// Acknowledges `output_audio_buffer.clear`
    OutputAudioCleared,
    /// Final transcript of an agent response
    AgentTranscript { transcript: String },
    /// Final transcript of caller input
    CallerTranscript { transcript: String },
    /// Conversation item added; message items may carry text
    ItemCreated { item: Value },
    Error { code: Option<String>, message: String },
    Unknown(String),
}

#[derive(Debug, Deserialize)]
struct ResponseRef {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum WireEvent {
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "response.created")]
    ResponseCreated { response: Option<ResponseRef> },
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(default)]
        response_id: Option<String>,
        delta: String,
    },
    #[serde(rename = "response.audio.done")]
    AudioDone {
        #[serde(default)]
        response_id: Option<String>,
    },
    #[serde(rename = "response.done")]
    ResponseDone { response: Option<ResponseRef> },
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: String,
    },
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "output_audio_buffer.cleared")]
    OutputAudioCleared,
    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone {
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted {
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "conversation.item.created")]
    ItemCreated {
        #[serde(default)]
        item: Value,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: ErrorBody,
    },
    #[serde(other)]
    Other,
}

/// Parse one inbound text frame
pub fn decode(text: &str) -> Result<EngineEvent> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| SessionError::protocol_violation(Peer::Engine, format!("malformed JSON: {}", e)))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| SessionError::protocol_violation(Peer::Engine, "missing type field"))?
        .to_string();

    let wire: WireEvent = serde_json::from_value(value).map_err(|e| {
        SessionError::protocol_violation(Peer::Engine, format!("invalid {} event: {}", kind, e))
    })?;

    Ok(match wire {
        WireEvent::SessionCreated => EngineEvent::SessionCreated,
        WireEvent::SessionUpdated => EngineEvent::SessionUpdated,
        WireEvent::ResponseCreated { response } => EngineEvent::ResponseCreated {
            response_id: response.and_then(|r| r.id),
        },
        WireEvent::AudioDelta { response_id, delta } => EngineEvent::AudioDelta { response_id, delta },
        WireEvent::AudioDone { response_id } => EngineEvent::AudioDone { response_id },
        WireEvent::ResponseDone { response } => EngineEvent::ResponseDone {
            response_id: response.and_then(|r| r.id),
        },
        WireEvent::FunctionCallArgumentsDone { call_id, name, arguments } => {
            EngineEvent::FunctionCall { call_id, name, arguments }
        }
        WireEvent::SpeechStarted => EngineEvent::SpeechStarted,
        WireEvent::SpeechStopped => EngineEvent::SpeechStopped,
        WireEvent::OutputAudioCleared => EngineEvent::OutputAudioCleared,
        WireEvent::AudioTranscriptDone { transcript } => EngineEvent::AgentTranscript { transcript },
        WireEvent::InputTranscriptionCompleted { transcript } => {
            EngineEvent::CallerTranscript { transcript }
        }
        WireEvent::ItemCreated { item } => EngineEvent::ItemCreated { item },
        WireEvent::Error { error } => EngineEvent::Error {
            code: error.code,
            message: error.message,
        },
        WireEvent::Other => EngineEvent::Unknown(kind),
    })
}

/// Server-side turn detection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputTranscription {
    pub model: String,
}

/// Body of `session.update`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionParameters {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: AudioEncoding,
    pub output_audio_format: AudioEncoding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputTranscription>,
    /// `null` disables engine VAD; the relay then commits turns itself
    pub turn_detection: Option<TurnDetection>,
    pub tools: Vec<Value>,
    pub tool_choice: String,
    pub temperature: f32,
    pub max_response_output_tokens: u32,
}

impl SessionParameters {
    pub fn from_config(engine: &EngineConfig, turn: &TurnConfig, tools: Vec<Value>) -> Self {
        let turn_detection = match turn.vad_source {
            VadSource::Engine => Some(TurnDetection {
                kind: "server_vad".to_string(),
                threshold: engine.vad_threshold,
                prefix_padding_ms: engine.prefix_padding_ms,
                silence_duration_ms: engine.silence_duration_ms,
            }),
            VadSource::Telephony => None,
        };
        Self {
            modalities: vec!["text".to_string(), "audio".to_string()],
            instructions: engine.instructions.clone(),
            voice: engine.voice.clone(),
            input_audio_format: engine.audio_format,
            output_audio_format: engine.audio_format,
            input_audio_transcription: engine
                .transcription_model
                .as_ref()
                .map(|model| InputTranscription { model: model.clone() }),
            turn_detection,
            tool_choice: if tools.is_empty() { "none" } else { "auto" }.to_string(),
            tools,
            temperature: engine.temperature,
            max_response_output_tokens: engine.max_response_output_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseOptions {
    pub modalities: Vec<String>,
    pub instructions: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    FunctionCallOutput { call_id: String, output: String },
}

/// Message sent to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineCommand {
    #[serde(rename = "session.update")]
    SessionUpdate { session: Box<SessionParameters> },
    #[serde(rename = "input_audio_buffer.append")]
    AppendAudio { audio: String },
    #[serde(rename = "input_audio_buffer.commit")]
    CommitAudio,
    #[serde(rename = "response.create")]
    CreateResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<ResponseOptions>,
    },
    #[serde(rename = "response.cancel")]
    CancelResponse,
    #[serde(rename = "output_audio_buffer.clear")]
    ClearOutputAudio,
    #[serde(rename = "conversation.item.create")]
    CreateItem { item: ConversationItem },
}

impl EngineCommand {
    pub fn session_update(parameters: SessionParameters) -> Self {
        Self::SessionUpdate {
            session: Box::new(parameters),
        }
    }

    /// `response.create` with audio-only instructions, used for the greeting
    pub fn greeting(instructions: impl Into<String>) -> Self {
        Self::CreateResponse {
            response: Some(ResponseOptions {
                modalities: vec!["audio".to_string()],
                instructions: instructions.into(),
            }),
        }
    }

    pub fn create_response() -> Self {
        Self::CreateResponse { response: None }
    }

    pub fn function_output(call_id: impl Into<String>, output: &Value) -> Self {
        Self::CreateItem {
            item: ConversationItem::FunctionCallOutput {
                call_id: call_id.into(),
                output: output.to_string(),
            },
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| SessionError::protocol_violation(Peer::Engine, e.to_string()))
    }

    /// Wire `type` of the command, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            EngineCommand::SessionUpdate { .. } => "session.update",
            EngineCommand::AppendAudio { .. } => "input_audio_buffer.append",
            EngineCommand::CommitAudio => "input_audio_buffer.commit",
            EngineCommand::CreateResponse { .. } => "response.create",
            EngineCommand::CancelResponse => "response.cancel",
            EngineCommand::ClearOutputAudio => "output_audio_buffer.clear",
            EngineCommand::CreateItem { .. } => "conversation.item.create",
        }
    }
}

/// Text of a `message` conversation item, if it has any
pub fn message_text(item: &Value) -> Option<(&str, &str)> {
    if item.get("type").and_then(Value::as_str) != Some("message") {
        return None;
    }
    let role = item.get("role").and_then(Value::as_str).unwrap_or("");
    let content = item.get("content")?.as_array()?.first()?;
    let text = match content.get("type").and_then(Value::as_str) {
        Some("audio") => content.get("transcript").and_then(Value::as_str),
        _ => content.get("text").and_then(Value::as_str),
    }?;
    if text.is_empty() { None } else { Some((role, text)) }
}
