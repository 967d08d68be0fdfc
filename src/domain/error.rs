//! Error taxonomy for the provisioning channel.

use thiserror::Error;

/// Transfer-level failures reported by a USB backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UsbError {
    #[error("Access denied")]
    Access,

    #[error("Device disconnected")]
    NoDevice,

    #[error("Transfer timed out")]
    Timeout,

    #[error("Endpoint stalled")]
    Pipe,

    #[error("Device is not open")]
    NotOpen,

    #[error("Device selection requires an interactive user")]
    UserGestureRequired,

    #[error("IO error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Interface {interface} with vendor-specific class not found")]
    InterfaceNotFound { interface: u8 },

    #[error("Endpoint not found: direction={direction}")]
    EndpointNotFound { direction: &'static str },

    #[error("Transport error: {0}")]
    Transport(#[from] UsbError),

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("Invalid configuration: {0}")]
    InvalidRecord(String),

    #[error("Failed to encode configuration: {0}")]
    Encode(#[from] serde_json::Error),
}
