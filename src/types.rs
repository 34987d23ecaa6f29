use crate::status::Status;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Device identifier assigned by discovery
pub type DeviceId = String;

/// Application identifier on the receiver (e.g. "CC1AD845")
pub type AppId = String;

/// Per-application virtual-connection identifier
pub type TransportId = String;

/// Receiver application session identifier
pub type SessionId = String;

/// A receiver device produced by discovery.
///
/// Immutable value; the connection manager consumes it to open the
/// device socket. Discovery itself (SSDP/mDNS) lives outside this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub host: String,
    pub port: u16,
    pub friendly_name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub icons: Vec<DeviceIcon>,
    /// Whether the device socket expects TLS
    #[serde(default)]
    pub tls: bool,
}

/// Icon advertised by a device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIcon {
    pub url: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

impl DeviceRecord {
    /// Minimal record for connecting to a known address.
    pub fn for_address(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            id: host.clone(),
            host,
            port,
            friendly_name: String::new(),
            model: String::new(),
            version: String::new(),
            icons: Vec::new(),
            tls: false,
        }
    }
}

/// Extra connection facts reported by sub-connections on connect.
///
/// Hints from multiple sub-connections are merged key-wise; the manager
/// hands the merged bundle to `ConnectionCallbacks::on_connected`.
#[derive(Debug, Clone, Default)]
pub struct ConnectionHint {
    entries: BTreeMap<String, Value>,
}

impl ConnectionHint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge another hint into this one; later entries win on key clash.
    pub fn merge(&mut self, other: ConnectionHint) {
        self.entries.extend(other.entries);
    }
}

/// Why an established connection was suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspensionCause {
    /// The local network went away; reconnect immediately
    NetworkLost,
    /// The backing service dropped the link; bounded retry applies
    ServiceDisconnected,
    /// The application asked for the teardown
    Canceled,
}

/// A failed connect attempt from one sub-connection.
///
/// When several sub-connections fail, the manager keeps only the
/// failure with the lowest priority rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionFailure {
    pub status: Status,
    /// Aggregation rank; lower values win
    pub priority: i32,
}

impl ConnectionFailure {
    pub fn new(status: Status, priority: i32) -> Self {
        Self { status, priority }
    }
}

/// Why a socket was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Local explicit close
    ExplicitClose,
    /// I/O error on the stream
    IoError,
    /// TLS negotiation or transfer error
    TlsError,
    /// The OS connect did not complete within the window
    ConnectTimeout,
    /// The heartbeat declared the link dead
    LinkDead,
}

impl DisconnectReason {
    /// Status surfaced for a connect attempt that failed for this reason.
    pub(crate) fn connect_status(self) -> Status {
        match self {
            DisconnectReason::ExplicitClose => Status::Canceled,
            DisconnectReason::ConnectTimeout => Status::Timeout,
            _ => Status::NetworkError,
        }
    }
}

/// Receiver volume as reported in `RECEIVER_STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeState {
    /// Level in [0.0, 1.0]
    #[serde(default)]
    pub level: f64,
    #[serde(default)]
    pub muted: bool,
}

impl Default for VolumeState {
    fn default() -> Self {
        Self {
            level: 0.0,
            muted: false,
        }
    }
}

/// A running receiver application as reported in `RECEIVER_STATUS`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationStatus {
    #[serde(rename = "appId")]
    pub app_id: AppId,
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
    #[serde(rename = "transportId")]
    pub transport_id: TransportId,
    #[serde(rename = "displayName", default)]
    pub display_name: String,
    #[serde(rename = "statusText", default)]
    pub status_text: String,
    #[serde(default)]
    pub namespaces: Vec<NamespaceEntry>,
}

/// Namespace advertised by a receiver application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceEntry {
    pub name: String,
}

/// Last-known receiver state held by the receiver channel.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReceiverStatus {
    #[serde(default)]
    pub volume: VolumeState,
    #[serde(default)]
    pub applications: Vec<ApplicationStatus>,
}

impl ReceiverStatus {
    /// The first running application, if any.
    pub fn application(&self) -> Option<&ApplicationStatus> {
        self.applications.first()
    }
}
