//! Error handling for the lanconnect protocol core
//!
//! This module provides a single error type for every protocol operation.
//! Errors are converted from underlying library errors using `thiserror`.
//!
//! ## Error Categories
//!
//! ### Transport errors
//! Bind, connect, accept and reset failures. Converted from `std::io::Error`
//! and refined with [`ProtocolError::from_io_error`]. The owning service or
//! transfer recovers from them; they never take the process down.
//!
//! ### Protocol errors
//! Malformed packets, missing `deviceId`, certificate mismatches. The channel
//! that produced them is closed immediately.
//!
//! ### Integrity errors
//! Transfer byte-count or checksum mismatches. The transfer ends in the
//! failed state and output cleanup is left to the caller.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use lanconnect_protocol::{Packet, Result};
//!
//! fn process_packet(data: &[u8]) -> Result<Packet> {
//!     let packet = Packet::from_bytes(data)?;
//!     Ok(packet)
//! }
//! ```

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during protocol operations
///
/// # Examples
///
/// ```rust
/// use lanconnect_protocol::ProtocolError;
///
/// let error = ProtocolError::DeviceNotFound("device-123".to_string());
/// assert_eq!(error.to_string(), "Device not found: device-123");
///
/// let error = ProtocolError::NotPaired;
/// assert_eq!(error.to_string(), "Not paired");
/// ```
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (file system, network, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS handshake or stream error
    #[error("TLS error: {0}")]
    Tls(#[from] openssl::ssl::Error),

    /// Certificate generation or parsing error
    #[error("Certificate error: {0}")]
    Certificate(#[from] openssl::error::ErrorStack),

    /// Peer certificate did not pass verification
    ///
    /// Raised when a paired device presents a certificate whose fingerprint
    /// differs from the pinned one, or when a certificate does not belong to
    /// the identity that was announced.
    #[error("Certificate validation error: {0}")]
    CertificateValidation(String),

    /// Device not found in registry
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Operation requires a paired device
    #[error("Not paired")]
    NotPaired,

    /// Invalid or malformed packet
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Plugin-specific error
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// Network connection error
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Operation timed out
    #[error("Connection timeout: {0}")]
    Timeout(String),

    /// Connection refused by the remote device
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// No route to the remote host
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// Configuration is invalid or missing
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Insufficient permissions
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Operation was cancelled through its cancellation token
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Packet exceeds the maximum line length
    #[error("Packet size exceeded: {0} bytes (max: {1})")]
    PacketSizeExceeded(usize, usize),

    /// Operation not valid in the current pairing or connection state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The channel was closed before or during the operation
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// A payload transfer moved a different number of bytes than declared
    #[error("Transfer incomplete: {transferred} of {expected} bytes")]
    TransferIncomplete {
        /// Bytes that actually flowed
        transferred: u64,
        /// Declared `payloadSize`
        expected: u64,
    },

    /// Payload checksum did not match `payloadHash`
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Checksum announced by the sender
        expected: String,
        /// Checksum of the received bytes
        actual: String,
    },
}

impl ProtocolError {
    /// Convert a generic I/O error into a more specific network error
    ///
    /// # Examples
    ///
    /// ```rust
    /// use lanconnect_protocol::ProtocolError;
    /// use std::io::{Error, ErrorKind};
    ///
    /// let io_error = Error::new(ErrorKind::TimedOut, "connection timeout");
    /// let error = ProtocolError::from_io_error(io_error, "connecting to device");
    ///
    /// assert!(matches!(error, ProtocolError::Timeout(_)));
    /// ```
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(format!("{}: {}", context, error)),
            ErrorKind::ConnectionRefused => {
                ProtocolError::ConnectionRefused(format!("{}: {}", context, error))
            }
            ErrorKind::NetworkUnreachable => {
                ProtocolError::NetworkUnreachable(format!("{}: {}", context, error))
            }
            ErrorKind::PermissionDenied => {
                ProtocolError::PermissionDenied(format!("{}: {}", context, error))
            }
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                ProtocolError::NetworkError(format!(
                    "{}: connection interrupted ({})",
                    context, error
                ))
            }
            _ => ProtocolError::Io(error),
        }
    }

    /// Check if this error is transient and the operation may be retried
    ///
    /// ```rust
    /// use lanconnect_protocol::ProtocolError;
    ///
    /// assert!(ProtocolError::Timeout("accept".to_string()).is_recoverable());
    /// assert!(!ProtocolError::NotPaired.is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Timeout(_)
                | ProtocolError::NetworkError(_)
                | ProtocolError::NetworkUnreachable(_)
                | ProtocolError::ConnectionRefused(_)
                | ProtocolError::Io(_)
        )
    }

    /// Get a user-facing message for device-scoped error notifications
    ///
    /// ```rust
    /// use lanconnect_protocol::ProtocolError;
    ///
    /// assert_eq!(
    ///     ProtocolError::NotPaired.user_message(),
    ///     "Device not paired. Please pair the device first."
    /// );
    /// ```
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::NotPaired => {
                "Device not paired. Please pair the device first.".to_string()
            }
            ProtocolError::DeviceNotFound(id) => {
                format!("Device '{}' not found. Check if the device is connected.", id)
            }
            ProtocolError::Timeout(msg) => {
                format!("Connection timeout: {}. Check network connection.", msg)
            }
            ProtocolError::ConnectionRefused(_) => {
                "Connection refused. Check if the remote application is running.".to_string()
            }
            ProtocolError::NetworkUnreachable(_) => {
                "Network unreachable. Check if both devices are on the same network.".to_string()
            }
            ProtocolError::NetworkError(msg) => {
                format!("Network error: {}. Connection may be unstable.", msg)
            }
            ProtocolError::PermissionDenied(msg) => {
                format!("Permission denied: {}. Check file and directory permissions.", msg)
            }
            ProtocolError::Configuration(msg) => {
                format!("Configuration error: {}. Check your settings.", msg)
            }
            ProtocolError::CertificateValidation(msg) => {
                format!("Certificate validation failed: {}. You may need to re-pair.", msg)
            }
            ProtocolError::PacketSizeExceeded(size, max) => {
                format!("Packet too large ({} bytes, max {} bytes).", size, max)
            }
            ProtocolError::InvalidPacket(msg) => format!("Invalid data received: {}.", msg),
            ProtocolError::Plugin(msg) => format!("Plugin error: {}.", msg),
            ProtocolError::Cancelled(msg) => format!("Operation cancelled: {}.", msg),
            ProtocolError::ChannelClosed(msg) => format!("Device disconnected: {}.", msg),
            ProtocolError::InvalidState(msg) => format!("Not possible right now: {}.", msg),
            ProtocolError::TransferIncomplete {
                transferred,
                expected,
            } => format!(
                "Transfer incomplete: received {} of {} bytes.",
                transferred, expected
            ),
            ProtocolError::ChecksumMismatch { .. } => {
                "Transfer corrupted: checksum mismatch.".to_string()
            }
            ProtocolError::Io(e) => format!("I/O error: {}.", e),
            ProtocolError::Json(e) => format!("Data format error: {}.", e),
            ProtocolError::Tls(e) => format!("Secure connection error: {}.", e),
            ProtocolError::Certificate(e) => {
                format!("Certificate error: {}. You may need to re-pair.", e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ProtocolError::DeviceNotFound("test-device".to_string());
        assert_eq!(error.to_string(), "Device not found: test-device");

        let error = ProtocolError::InvalidPacket("bad format".to_string());
        assert_eq!(error.to_string(), "Invalid packet: bad format");

        let error = ProtocolError::TransferIncomplete {
            transferred: 10,
            expected: 20,
        };
        assert_eq!(error.to_string(), "Transfer incomplete: 10 of 20 bytes");
    }

    #[test]
    fn test_io_error_conversion() {
        use std::io::{Error, ErrorKind};

        let io_error = Error::new(ErrorKind::NotFound, "file not found");
        let protocol_error: ProtocolError = io_error.into();

        assert!(matches!(protocol_error, ProtocolError::Io(_)));
        assert!(protocol_error.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_io_error_refines_kind() {
        use std::io::{Error, ErrorKind};

        let refused = ProtocolError::from_io_error(
            Error::new(ErrorKind::ConnectionRefused, "refused"),
            "dialing",
        );
        assert!(matches!(refused, ProtocolError::ConnectionRefused(_)));
        assert!(refused.is_recoverable());

        let reset = ProtocolError::from_io_error(
            Error::new(ErrorKind::ConnectionReset, "reset"),
            "reading",
        );
        assert!(matches!(reset, ProtocolError::NetworkError(_)));
    }

    #[test]
    fn test_recoverable_classification() {
        use std::io::{Error, ErrorKind};

        let denied = ProtocolError::from_io_error(
            Error::new(ErrorKind::PermissionDenied, "denied"),
            "binding",
        );
        assert!(!denied.is_recoverable());
        assert!(!ProtocolError::CertificateValidation("mismatch".into()).is_recoverable());
        assert!(!ProtocolError::Cancelled("user".into()).is_recoverable());
    }

    #[test]
    fn test_json_error_conversion() {
        let json = r#"{"invalid json"#;
        let json_error = serde_json::from_str::<serde_json::Value>(json).unwrap_err();
        let protocol_error: ProtocolError = json_error.into();

        assert!(matches!(protocol_error, ProtocolError::Json(_)));
    }
}
