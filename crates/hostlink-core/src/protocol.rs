use crate::Primitive;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

/// Sent as an integer; accepted as an integer or a numeric string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawVersion", into = "u16")]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl From<ProtocolVersion> for u16 {
    fn from(version: ProtocolVersion) -> Self {
        version.0
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawVersion {
    Number(u64),
    Text(String),
}

impl TryFrom<RawVersion> for ProtocolVersion {
    type Error = String;

    fn try_from(raw: RawVersion) -> Result<Self, Self::Error> {
        let parsed = match &raw {
            RawVersion::Number(value) => u16::try_from(*value).ok(),
            RawVersion::Text(value) => value.trim().parse::<u16>().ok(),
        };
        parsed.map(ProtocolVersion).ok_or_else(|| match raw {
            RawVersion::Number(value) => format!("protocol version out of range: {value}"),
            RawVersion::Text(value) => format!("invalid protocol version '{value}'"),
        })
    }
}

/// One duplex message. Browsers may send just `{"type", "payload"}`; the
/// remaining fields default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEnvelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub msg: WireMsg,
}

impl WireEnvelope {
    pub fn new(sender_id: &str, msg: WireMsg) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            sender_id: sender_id.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            request_id: None,
            msg,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum WireMsg {
    #[serde(rename = "client.hello")]
    ClientHello(ClientHelloPayload),
    #[serde(rename = "client.alive")]
    ClientAlive(ClientAlivePayload),
    #[serde(rename = "submit")]
    Submit(SubmitPayload),
    #[serde(rename = "accepted")]
    Accepted(AcceptedPayload),
    #[serde(rename = "rejected")]
    Rejected(RejectedPayload),
    #[serde(rename = "enqueue")]
    Enqueue(EnqueuePayload),
    #[serde(rename = "drain")]
    Drain(DrainPayload),
    #[serde(rename = "acked")]
    Acked(AckedPayload),
    #[serde(rename = "reset")]
    Reset(ResetPayload),
    #[serde(rename = "reset.ack")]
    ResetAck(ResetAckPayload),
    #[serde(rename = "output")]
    Output(OutputPayload),
    #[serde(rename = "status")]
    Status(StatusPayload),
    #[serde(rename = "error")]
    Error(ErrorPayload),
    #[serde(rename = "scan.scenes")]
    ScanScenes(ScanScenesPayload),
    #[serde(rename = "client.scenes")]
    ClientScenes(ClientScenesPayload),
}

impl WireMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMsg::ClientHello(_) => "client.hello",
            WireMsg::ClientAlive(_) => "client.alive",
            WireMsg::Submit(_) => "submit",
            WireMsg::Accepted(_) => "accepted",
            WireMsg::Rejected(_) => "rejected",
            WireMsg::Enqueue(_) => "enqueue",
            WireMsg::Drain(_) => "drain",
            WireMsg::Acked(_) => "acked",
            WireMsg::Reset(_) => "reset",
            WireMsg::ResetAck(_) => "reset.ack",
            WireMsg::Output(_) => "output",
            WireMsg::Status(_) => "status",
            WireMsg::Error(_) => "error",
            WireMsg::ScanScenes(_) => "scan.scenes",
            WireMsg::ClientScenes(_) => "client.scenes",
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        WireMsg::Error(ErrorPayload {
            code: code.to_string(),
            message: message.into(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientHelloPayload {
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientAlivePayload {
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitPayload {
    pub cmd: String,
    #[serde(default)]
    pub params: Vec<Primitive>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AcceptedPayload {
    pub seq: u64,
    pub cmd: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    NoClient,
    Backpressure,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::NoClient => "no-client",
            RejectReason::Backpressure => "backpressure",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RejectedPayload {
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnqueuePayload {
    pub seq: u64,
    pub line: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DrainPayload {
    pub last_ack: i64,
    pub inflight: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AckedPayload {
    pub seq: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResetPayload {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResetAckPayload {
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputPayload {
    pub seq: u64,
    pub cmd: String,
    #[serde(default)]
    pub params: Vec<Primitive>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub inflight: usize,
    pub last_ack: i64,
    #[serde(default)]
    pub agent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_inflight: Option<usize>,
    #[serde(default)]
    pub event_gaps: u64,
    #[serde(default)]
    pub event_disorder: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanScenesPayload {}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientScenesPayload {
    #[serde(default)]
    pub scenes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),
    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),
}

pub fn encode_message<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

/// Decodes a text frame into an envelope and checks version and timestamp.
pub fn decode_envelope(bytes: &[u8]) -> Result<WireEnvelope, FrameError> {
    if bytes.len() > DEFAULT_MAX_FRAME_BYTES {
        return Err(FrameError::OversizedFrame {
            size: bytes.len(),
            max: DEFAULT_MAX_FRAME_BYTES,
        });
    }
    let envelope: WireEnvelope =
        serde_json::from_slice(bytes).map_err(|err| FrameError::Decode(err.to_string()))?;
    validate_envelope(&envelope)?;
    Ok(envelope)
}

pub fn validate_envelope(envelope: &WireEnvelope) -> Result<(), FrameError> {
    if envelope.version != ProtocolVersion::CURRENT {
        return Err(FrameError::UnsupportedVersion(envelope.version.0));
    }
    if !envelope.timestamp.is_empty()
        && chrono::DateTime::parse_from_rfc3339(&envelope.timestamp).is_err()
    {
        return Err(FrameError::InvalidTimestamp(envelope.timestamp.clone()));
    }
    Ok(())
}
