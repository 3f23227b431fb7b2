//! Diablo Error Types

use std::net::SocketAddr;

use thiserror::Error;

use crate::session::Role;

/// Result type alias for Diablo operations
pub type Result<T> = std::result::Result<T, Error>;

/// Diablo error types
#[derive(Error, Debug)]
pub enum Error {
    // Pre-flight errors
    #[error("Unsupported platform: {0}")]
    PlatformUnsupported(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("A {role} session is already running (PID {pid})")]
    AlreadyRunning { role: Role, pid: u32 },

    #[error("The {role} session (PID {pid}) did not exit after SIGTERM; its record was kept")]
    StillRunning { role: Role, pid: u32 },

    // Virtual interface errors
    #[error("No free virtual interface is available")]
    DeviceExhausted,

    #[error("Virtual interface error: {0}")]
    Interface(String),

    // Channel errors
    #[error("Tunnel port {0} is already in use")]
    BindInUse(SocketAddr),

    #[error("Peer unreachable at {address}: {reason}")]
    PeerUnreachable { address: String, reason: String },

    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Peer disconnected during authentication")]
    PeerDisconnected,

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Password error: {0}")]
    Password(String),

    // Process errors
    #[error("Process {0} not found")]
    ProcessNotFound(u32),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("Status record error: {0}")]
    Json(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Errors reported to the operator as a plain cause rather than a fault
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::PlatformUnsupported(_)
                | Error::PermissionDenied(_)
                | Error::AlreadyRunning { .. }
                | Error::StillRunning { .. }
                | Error::BindInUse(_)
                | Error::HandshakeFailed(_)
                | Error::AuthRejected(_)
                | Error::DeviceExhausted
                | Error::PeerUnreachable { .. }
                | Error::ProcessNotFound(_)
        )
    }

    /// Map an OS error from device or socket setup onto the taxonomy
    pub(crate) fn from_os(context: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => {
                Error::PermissionDenied(format!("{}: {}", context, err))
            }
            _ => Error::Interface(format!("{}: {}", context, err)),
        }
    }
}
