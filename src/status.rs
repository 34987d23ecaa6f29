use serde::{Deserialize, Serialize};

/// Numeric status code carried by every operation result.
///
/// Codes below 2000 are generic client codes; 2000-2007 are
/// receiver-specific failures reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum Status {
    /// Operation completed successfully
    Success,
    /// The companion service is not installed on this host
    ServiceMissing,
    /// The companion service is too old for this client
    ServiceVersionUpdateRequired,
    /// The companion service is disabled
    ServiceDisabled,
    /// The operation requires a signed-in account
    SignInRequired,
    /// The caller must complete a resolution step and retry
    ResolutionRequired,
    /// A network-level failure prevented the operation
    NetworkError,
    /// An unexpected internal failure
    InternalError,
    /// The operation was canceled locally
    Canceled,
    /// The waiting caller was interrupted before a result arrived
    Interrupted,
    /// The operation timed out locally
    Timeout,
    /// The receiver rejected the device authentication
    AuthenticationFailed,
    /// The receiver could not parse or accept the request
    InvalidRequest,
    /// The receiver canceled the request
    ReceiverCanceled,
    /// The request is not allowed in the receiver's current state
    NotAllowed,
    /// The requested application id is unknown to the receiver
    ApplicationNotFound,
    /// The targeted application is not currently running
    ApplicationNotRunning,
    /// The message exceeds the wire size limit
    MessageTooLarge,
    /// The outbound buffer had no room for the message
    SendBufferFull,
    /// A code this client does not know
    Unknown(i32),
}

impl Status {
    /// Numeric wire value of this status.
    pub fn code(self) -> i32 {
        match self {
            Status::Success => 0,
            Status::ServiceMissing => 1,
            Status::ServiceVersionUpdateRequired => 2,
            Status::ServiceDisabled => 3,
            Status::SignInRequired => 4,
            Status::ResolutionRequired => 6,
            Status::NetworkError => 7,
            Status::InternalError => 8,
            Status::Canceled => 13,
            Status::Interrupted => 14,
            Status::Timeout => 15,
            Status::AuthenticationFailed => 2000,
            Status::InvalidRequest => 2001,
            Status::ReceiverCanceled => 2002,
            Status::NotAllowed => 2003,
            Status::ApplicationNotFound => 2004,
            Status::ApplicationNotRunning => 2005,
            Status::MessageTooLarge => 2006,
            Status::SendBufferFull => 2007,
            Status::Unknown(code) => code,
        }
    }

    /// Whether this status represents success.
    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl From<i32> for Status {
    fn from(code: i32) -> Self {
        match code {
            0 => Status::Success,
            1 => Status::ServiceMissing,
            2 => Status::ServiceVersionUpdateRequired,
            3 => Status::ServiceDisabled,
            4 => Status::SignInRequired,
            6 => Status::ResolutionRequired,
            7 => Status::NetworkError,
            8 => Status::InternalError,
            13 => Status::Canceled,
            14 => Status::Interrupted,
            15 => Status::Timeout,
            2000 => Status::AuthenticationFailed,
            2001 => Status::InvalidRequest,
            2002 => Status::ReceiverCanceled,
            2003 => Status::NotAllowed,
            2004 => Status::ApplicationNotFound,
            2005 => Status::ApplicationNotRunning,
            2006 => Status::MessageTooLarge,
            2007 => Status::SendBufferFull,
            other => Status::Unknown(other),
        }
    }
}

impl From<Status> for i32 {
    fn from(status: Status) -> i32 {
        status.code()
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// Status surfaced when a local operation fails before reaching the wire.
pub(crate) fn status_for_error(error: &crate::error::CastError) -> Status {
    use crate::error::CastError;
    match error {
        CastError::SendBufferFull => Status::SendBufferFull,
        CastError::MessageTooLarge { .. } => Status::MessageTooLarge,
        CastError::RequestInFlight { .. } => Status::InvalidRequest,
        CastError::Timeout => Status::Timeout,
        CastError::NotConnected | CastError::ConnectionClosed | CastError::Io(_) => {
            Status::NetworkError
        }
        CastError::Tls(_) => Status::NetworkError,
        _ => Status::InternalError,
    }
}

/// Map a receiver `LAUNCH_ERROR`/`INVALID_REQUEST` reason string to a status.
pub(crate) fn status_for_reason(reason: &str) -> Status {
    match reason {
        "NOT_FOUND" => Status::ApplicationNotFound,
        "NOT_RUNNING" => Status::ApplicationNotRunning,
        "NOT_ALLOWED" => Status::NotAllowed,
        "CANCELLED" | "CANCELED" => Status::ReceiverCanceled,
        "INVALID_COMMAND" | "INVALID_PARAMS" | "DUPLICATE_REQUEST_ID" => Status::InvalidRequest,
        _ => Status::InternalError,
    }
}
