//! Twilio-style media stream messages
//!
//! Every frame is a JSON object tagged by `event`. Inbound audio arrives as
//! base64 mu-law in `media.payload`; outbound `media`, `mark` and `clear`
//! must carry the stream sid announced in `start`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{Result, SessionError};
use crate::types::{CallerMetadata, Peer};

const KNOWN_EVENTS: [&str; 6] = ["connected", "start", "media", "mark", "dtmf", "stop"];

/// Event received from the telephony peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyEvent {
    Connected,
    Start { start: StreamStart },
    Media { media: InboundMedia },
    Mark { mark: MarkPayload },
    Dtmf { dtmf: DtmfPayload },
    Stop,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStart {
    pub stream_sid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_sid: Option<String>,
    #[serde(default)]
    pub tracks: Vec<String>,
    #[serde(default)]
    pub custom_parameters: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_format: Option<MediaFormat>,
}

impl StreamStart {
    /// Caller details carried by the start event
    ///
    /// `from` and `to` are read from custom parameters, the way the voice
    /// webhook forwards them.
    pub fn caller_metadata(&self) -> CallerMetadata {
        let custom_parameters: HashMap<String, String> = self
            .custom_parameters
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect();
        CallerMetadata {
            from: custom_parameters.get("from").cloned(),
            to: custom_parameters.get("to").cloned(),
            stream_sid: Some(self.stream_sid.clone()),
            custom_parameters,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    pub encoding: String,
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u8,
}

fn default_channels() -> u8 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMedia {
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtmfPayload {
    pub digit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMedia {
    pub payload: String,
}

/// Message sent to the telephony peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyCommand {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMedia,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: MarkPayload,
    },
    /// Discard audio the carrier has buffered for playback
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

impl TelephonyCommand {
    pub fn media(stream_sid: impl Into<String>, payload: String) -> Self {
        Self::Media {
            stream_sid: stream_sid.into(),
            media: OutboundMedia { payload },
        }
    }

    pub fn mark(stream_sid: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Mark {
            stream_sid: stream_sid.into(),
            mark: MarkPayload { name: name.into() },
        }
    }

    pub fn clear(stream_sid: impl Into<String>) -> Self {
        Self::Clear {
            stream_sid: stream_sid.into(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| SessionError::protocol_violation(Peer::Telephony, e.to_string()))
    }
}

/// Parse one inbound text frame
///
/// Malformed JSON, a missing `event` field and unrecognised event names are
/// all protocol violations.
pub fn decode(text: &str) -> Result<TelephonyEvent> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| SessionError::protocol_violation(Peer::Telephony, format!("malformed JSON: {}", e)))?;

    let event = value
        .get("event")
        .and_then(Value::as_str)
        .ok_or_else(|| SessionError::protocol_violation(Peer::Telephony, "missing event field"))?;

    if !KNOWN_EVENTS.contains(&event) {
        return Err(SessionError::protocol_violation(
            Peer::Telephony,
            format!("unknown event '{}'", event),
        ));
    }

    let event = event.to_string();
    serde_json::from_value(value).map_err(|e| {
        SessionError::protocol_violation(Peer::Telephony, format!("invalid {} event: {}", event, e))
    })
}

impl TelephonyEvent {
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| SessionError::protocol_violation(Peer::Telephony, e.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            TelephonyEvent::Connected => "connected",
            TelephonyEvent::Start { .. } => "start",
            TelephonyEvent::Media { .. } => "media",
            TelephonyEvent::Mark { .. } => "mark",
            TelephonyEvent::Dtmf { .. } => "dtmf",
            TelephonyEvent::Stop => "stop",
        }
    }
}
