//! Carrier media stream protocol
//!
//! Every WebSocket text frame is a JSON object tagged by `event`. Inbound
//! frames announce the stream, carry base64 audio, and signal the end of the
//! stream; outbound frames carry synthesized audio and playback marks back to
//! the same stream.

use crate::audio::{AudioFormat, Encoding};
use crate::error::FrameError;
use base64::engine::general_purpose;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Inbound carrier messages
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum CarrierMessage {
    /// Transport is up, no stream yet
    Connected {
        #[serde(default)]
        protocol: Option<String>,
    },
    /// Stream started; carries the routing parameters for the call
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        start: StartMetadata,
    },
    /// One audio frame
    Media {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        media: MediaPayload,
    },
    /// Carrier finished playing a mark we sent
    Mark {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        mark: MarkPayload,
    },
    /// Stream ended
    Stop {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
    },
    /// Anything else (dtmf, custom events)
    #[serde(other)]
    Unknown,
}

impl CarrierMessage {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMetadata {
    pub call_sid: String,
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
    #[serde(default)]
    pub media_format: Option<MediaFormat>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    pub encoding: String,
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
}

fn default_channels() -> u16 {
    1
}

impl MediaFormat {
    /// Stream format announced by the carrier, if we understand its encoding
    pub fn to_audio_format(&self) -> Option<AudioFormat> {
        Some(AudioFormat {
            encoding: Encoding::from_mime(&self.encoding)?,
            sample_rate: self.sample_rate,
            channels: self.channels,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaPayload {
    pub payload: String,
    #[serde(default)]
    pub track: Option<String>,
    #[serde(default)]
    pub chunk: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl MediaPayload {
    /// Decode the base64 audio bytes
    pub fn decode(&self) -> Result<Vec<u8>, FrameError> {
        Ok(general_purpose::STANDARD.decode(self.payload.as_bytes())?)
    }

    /// Frames from the outbound track are our own audio echoed back
    pub fn is_inbound(&self) -> bool {
        !matches!(self.track.as_deref(), Some("outbound"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MarkPayload {
    pub name: String,
}

/// Outbound messages written back to the carrier
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundMessage {
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
    /// Drop any audio the carrier still has queued
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundMedia {
    pub payload: String,
}

impl OutboundMessage {
    pub fn media(stream_sid: &str, audio: &[u8]) -> Self {
        Self::Media {
            stream_sid: stream_sid.to_string(),
            media: OutboundMedia {
                payload: general_purpose::STANDARD.encode(audio),
            },
        }
    }

    pub fn mark(stream_sid: &str, name: impl Into<String>) -> Self {
        Self::Mark {
            stream_sid: stream_sid.to_string(),
            mark: MarkPayload { name: name.into() },
        }
    }

    pub fn clear(stream_sid: &str) -> Self {
        Self::Clear {
            stream_sid: stream_sid.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
