use crate::error::{CastError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Wire protocol version carried in every envelope
pub const PROTOCOL_VERSION: i32 = 0;

/// Sender id of the platform-level virtual connection
pub const PLATFORM_SENDER_ID: &str = "sender-0";

/// Destination id of the platform receiver
pub const PLATFORM_RECEIVER_ID: &str = "receiver-0";

/// Virtual-connection handshake namespace
pub const NS_CONNECTION: &str = "urn:x-cast:tp.connection";

/// Keep-alive namespace
pub const NS_HEARTBEAT: &str = "urn:x-cast:tp.heartbeat";

/// Receiver control namespace
pub const NS_RECEIVER: &str = "urn:x-cast:receiver";

/// One namespaced message as it crosses the wire.
///
/// Serialized as the JSON body of a `<decimal length>:<json>` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CastFrame {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: i32,
    #[serde(rename = "sourceId")]
    pub source_id: String,
    #[serde(rename = "destinationId")]
    pub destination_id: String,
    pub namespace: String,
    #[serde(flatten)]
    pub payload: Payload,
}

/// Frame payload, either UTF-8 JSON text or base64 binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "payloadType")]
pub enum Payload {
    #[serde(rename = "STRING")]
    String {
        #[serde(rename = "payloadUtf8")]
        utf8: String,
    },
    #[serde(rename = "BINARY")]
    Binary {
        #[serde(rename = "payloadBinary")]
        base64: String,
    },
}

impl CastFrame {
    /// Build a STRING frame carrying a JSON payload.
    pub fn text(
        source_id: impl Into<String>,
        destination_id: impl Into<String>,
        namespace: impl Into<String>,
        payload: &Value,
    ) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            source_id: source_id.into(),
            destination_id: destination_id.into(),
            namespace: namespace.into(),
            payload: Payload::String {
                utf8: payload.to_string(),
            },
        }
    }

    /// Build a BINARY frame from raw bytes.
    pub fn binary(
        source_id: impl Into<String>,
        destination_id: impl Into<String>,
        namespace: impl Into<String>,
        bytes: &[u8],
    ) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            source_id: source_id.into(),
            destination_id: destination_id.into(),
            namespace: namespace.into(),
            payload: Payload::Binary {
                base64: BASE64.encode(bytes),
            },
        }
    }

    /// Parse the UTF-8 payload as JSON.
    ///
    /// Fails on BINARY frames and on malformed payload text.
    pub fn payload_json(&self) -> Result<Value> {
        match &self.payload {
            Payload::String { utf8 } => Ok(serde_json::from_str(utf8)?),
            Payload::Binary { .. } => Err(CastError::InvalidResponse(
                "expected STRING payload".to_string(),
            )),
        }
    }

    /// Decode the BINARY payload.
    pub fn payload_bytes(&self) -> Result<Vec<u8>> {
        match &self.payload {
            Payload::Binary { base64 } => BASE64
                .decode(base64)
                .map_err(|e| CastError::InvalidResponse(format!("bad base64 payload: {e}"))),
            Payload::String { .. } => Err(CastError::InvalidResponse(
                "expected BINARY payload".to_string(),
            )),
        }
    }
}

/// Message types spoken on the three core namespaces.
///
/// Each request carries a `requestId` echoed by the receiver in the
/// matching response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Connect,
    Close,
    Ping,
    Pong,
    Launch,
    Stop,
    GetStatus,
    SetVolume,
    ReceiverStatus,
    LaunchError,
    InvalidRequest,
}

impl MessageType {
    /// Extract the `type` field of a payload, if it is one we know.
    pub fn of(payload: &Value) -> Option<MessageType> {
        payload
            .get("type")
            .and_then(|v| v.as_str())
            .and_then(|s| serde_json::from_value(Value::String(s.to_string())).ok())
    }
}

/// Payload builders for the connection namespace.
pub mod connection {
    use super::*;

    pub fn connect(package: &str, user_agent: &str) -> Value {
        json!({
            "type": MessageType::Connect,
            "origin": { "package": package },
            "userAgent": user_agent,
        })
    }

    pub fn close() -> Value {
        json!({ "type": MessageType::Close })
    }
}

/// Payload builders for the heartbeat namespace.
pub mod heartbeat {
    use super::*;

    pub fn ping() -> Value {
        json!({ "type": MessageType::Ping })
    }

    pub fn pong() -> Value {
        json!({ "type": MessageType::Pong })
    }
}

/// Payload builders for the receiver namespace.
pub mod receiver {
    use super::*;

    pub fn launch(request_id: i32, app_id: &str) -> Value {
        json!({
            "type": MessageType::Launch,
            "requestId": request_id,
            "appId": app_id,
        })
    }

    pub fn stop(request_id: i32, session_id: &str) -> Value {
        json!({
            "type": MessageType::Stop,
            "requestId": request_id,
            "sessionId": session_id,
        })
    }

    pub fn get_status(request_id: i32) -> Value {
        json!({
            "type": MessageType::GetStatus,
            "requestId": request_id,
        })
    }

    pub fn set_volume(request_id: i32, level: f64) -> Value {
        json!({
            "type": MessageType::SetVolume,
            "requestId": request_id,
            "volume": { "level": level },
        })
    }

    pub fn set_mute(request_id: i32, muted: bool) -> Value {
        json!({
            "type": MessageType::SetVolume,
            "requestId": request_id,
            "volume": { "muted": muted },
        })
    }
}

/// Read the `requestId` a response echoes, if present and integral.
pub fn request_id_of(payload: &Value) -> Option<i32> {
    payload
        .get("requestId")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32)
}
