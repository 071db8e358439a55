//! Telephony live-media wire protocol.
//!
//! One JSON object per WebSocket text message, discriminated by `event`.

use serde::{Deserialize, Deserializer, Serialize};

/// Inbound message from the telephony provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamEnvelope {
    /// Connection handshake. Carries no stream id.
    Connected {
        #[serde(default)]
        protocol: Option<String>,
        #[serde(default)]
        version: Option<String>,
    },
    /// A call's media stream has started.
    Start(StartEnvelope),
    /// One chunk of caller audio.
    Media(MediaEnvelope),
    /// The provider ended the stream.
    Stop {
        #[serde(rename = "streamId")]
        stream_id: String,
    },
    /// The provider reached a playback marker we previously sent.
    Mark {
        #[serde(rename = "streamId")]
        stream_id: String,
        name: String,
    },
}

impl StreamEnvelope {
    /// Returns the stream id referenced by this envelope, if any.
    pub fn stream_id(&self) -> Option<&str> {
        match self {
            Self::Connected { .. } => None,
            Self::Start(start) => Some(&start.stream_id),
            Self::Media(media) => Some(&media.stream_id),
            Self::Stop { stream_id } | Self::Mark { stream_id, .. } => Some(stream_id),
        }
    }

    /// Returns the wire discriminator for this envelope.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Start(_) => "start",
            Self::Media(_) => "media",
            Self::Stop { .. } => "stop",
            Self::Mark { .. } => "mark",
        }
    }
}

/// Payload of a `start` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartEnvelope {
    pub call_id: String,
    pub stream_id: String,
    #[serde(rename = "from")]
    pub from_number: String,
    #[serde(rename = "to")]
    pub to_number: String,
}

/// Payload of a `media` envelope.
///
/// `payload` is left base64-encoded; decoding belongs to the audio codec so a
/// malformed chunk is a per-frame error rather than an envelope parse failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaEnvelope {
    pub stream_id: String,
    pub payload: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub sequence_number: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub timestamp: Option<u64>,
}

/// Outbound message written back to the telephony provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundFrame {
    /// Assistant audio, base64 µ-law at the wire rate.
    Media {
        #[serde(rename = "streamId")]
        stream_id: String,
        payload: String,
    },
    /// Playback marker; the provider echoes it once playback reaches it.
    Mark {
        #[serde(rename = "streamId")]
        stream_id: String,
        name: String,
    },
    /// Discard any audio the provider has buffered but not yet played.
    Clear {
        #[serde(rename = "streamId")]
        stream_id: String,
    },
    /// End the call from the bridge side.
    Stop {
        #[serde(rename = "streamId")]
        stream_id: String,
    },
}

/// Providers send counters as either JSON numbers or decimal strings.
fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(u64),
        Str(String),
    }

    match Option::<NumOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumOrString::Num(n)) => Ok(Some(n)),
        Some(NumOrString::Str(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
