use super::types::FailureReason;
use std::path::PathBuf;
use thiserror::Error;

/// A specialized `Result` type for ADB operations.
pub type AdbResult<T> = Result<T, AdbError>;

/// The error type for all ADB-related operations.
#[derive(Debug, Error)]
pub enum AdbError {
    #[error("Transport unreachable ({address}): {source}")]
    TransportUnreachable {
        address: String,
        source: std::io::Error,
    },

    #[error("Device requires authorization. Accept the 'Allow USB debugging?' prompt on the device.")]
    AuthenticationRequired,

    #[error("Device requires pairing before a TLS connection can be established")]
    PairingRequired,

    #[error("Operation timed out after {duration:?}: {description}")]
    Timeout {
        duration: std::time::Duration,
        description: String,
    },

    #[error("ADB protocol violation: {description}")]
    ProtocolViolation { description: String },

    #[error("Not connected to ADB")]
    NotConnected,

    #[error("Remote failure: {message}")]
    Fail { message: String },

    #[error("Device refused to open stream '{destination}'")]
    StreamRejected { destination: String },

    #[error("ADB connection closed")]
    ConnectionClosed,

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("TLS error: {source}")]
    Tls {
        #[from]
        source: rustls::Error,
    },

    #[error("Failed to build TLS client certificate: {source}")]
    Certificate {
        #[from]
        source: rcgen::Error,
    },

    #[error("Service discovery failed: {description}")]
    Discovery { description: String },

    #[error("Pairing failed: {description}")]
    Pairing { description: String },

    #[error("ADB key error: {description}")]
    Key { description: String },

    #[error("ADB key not found at {path:?}")]
    KeyNotFound { path: PathBuf },

    #[error("Failed to determine home directory for ADB key")]
    HomeDirectoryNotFound,

    #[error("Task failed to complete: {source}")]
    JoinError {
        #[from]
        source: tokio::task::JoinError,
    },

    #[error("Unknown error: {description}")]
    Unknown { description: String },
}

impl AdbError {
    pub fn protocol(description: impl Into<String>) -> Self {
        AdbError::ProtocolViolation {
            description: description.into(),
        }
    }

    pub fn timeout(duration: std::time::Duration, description: impl Into<String>) -> Self {
        AdbError::Timeout {
            duration,
            description: description.into(),
        }
    }

    pub fn is_auth_required(&self) -> bool {
        matches!(self, AdbError::AuthenticationRequired)
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, AdbError::ProtocolViolation { .. })
    }

    /// Collapse an error into the per-transport failure reason the
    /// orchestrator publishes.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            AdbError::Timeout { .. } => FailureReason::Timeout,
            AdbError::AuthenticationRequired => FailureReason::Unauthorized,
            AdbError::PairingRequired => FailureReason::PairingRequired,
            AdbError::TransportUnreachable { .. } => FailureReason::HostUnreachable,
            AdbError::Io { source } if is_unreachable(source) => FailureReason::HostUnreachable,
            AdbError::Io { source } if source.kind() == std::io::ErrorKind::TimedOut => {
                FailureReason::Timeout
            }
            _ => FailureReason::Unknown,
        }
    }

    /// Wrap a socket connect error, keeping the peer address for the message.
    pub fn from_connect_error(address: impl Into<String>, source: std::io::Error) -> Self {
        if is_unreachable(&source) {
            AdbError::TransportUnreachable {
                address: address.into(),
                source,
            }
        } else {
            AdbError::Io { source }
        }
    }
}

fn is_unreachable(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::HostUnreachable
            | ErrorKind::NetworkUnreachable
            | ErrorKind::AddrNotAvailable
            | ErrorKind::NotFound
    )
}
