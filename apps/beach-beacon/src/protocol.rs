use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const SDP_MESSAGE: &str = "sdp";
pub const ICE_MESSAGE: &str = "ice";

/// Untyped signaling envelope as it travels over the websocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

/// Session description subtype carried by an `sdp` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

impl std::fmt::Display for SdpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A session description, either exchanged with the peer or handed to the engine.
///
/// Also the `data` of an `sdp` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// `data` of an `ice` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcePayload {
    #[serde(rename = "sdpMLineIndex")]
    pub mline_index: u32,
    pub candidate: String,
}

/// Typed view of a validated envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    Sdp(SessionDescription),
    Ice { mline_index: u32, candidate: String },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("envelope is not a json object")]
    NotAnObject,
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(#[source] serde_json::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("{message} message `data` must be an object")]
    DataNotObject { message: &'static str },
    #[error("invalid {message} message: {reason}")]
    InvalidPayload {
        message: &'static str,
        reason: String,
    },
    #[error("binary frames are not accepted ({0} bytes)")]
    BinaryFrame(usize),
}

/// Serializes an envelope into a text frame.
pub fn encode(envelope: &Envelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}

/// Parses a text frame into an envelope. Payload fields are checked later,
/// by [`SignalingMessage::try_from`].
pub fn decode(text: &str) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    serde_json::from_value(value).map_err(DecodeError::InvalidEnvelope)
}

impl TryFrom<SignalingMessage> for Envelope {
    type Error = serde_json::Error;

    fn try_from(message: SignalingMessage) -> Result<Self, Self::Error> {
        let (kind, data) = match message {
            SignalingMessage::Sdp(description) => (SDP_MESSAGE, serde_json::to_value(description)?),
            SignalingMessage::Ice {
                mline_index,
                candidate,
            } => (
                ICE_MESSAGE,
                serde_json::to_value(IcePayload {
                    mline_index,
                    candidate,
                })?,
            ),
        };
        Ok(Envelope {
            kind: kind.to_string(),
            data,
        })
    }
}

impl TryFrom<Envelope> for SignalingMessage {
    type Error = ProtocolError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        match envelope.kind.as_str() {
            SDP_MESSAGE => Ok(SignalingMessage::Sdp(payload(SDP_MESSAGE, envelope.data)?)),
            ICE_MESSAGE => {
                let IcePayload {
                    mline_index,
                    candidate,
                } = payload(ICE_MESSAGE, envelope.data)?;
                Ok(SignalingMessage::Ice {
                    mline_index,
                    candidate,
                })
            }
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

fn payload<T: DeserializeOwned>(message: &'static str, data: Value) -> Result<T, ProtocolError> {
    if !data.is_object() {
        return Err(ProtocolError::DataNotObject { message });
    }
    serde_json::from_value(data).map_err(|err| ProtocolError::InvalidPayload {
        message,
        reason: err.to_string(),
    })
}
