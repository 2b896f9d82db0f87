//! Error types for overlay-router
//!
//! This module defines the error hierarchy for the overlay data plane and
//! control plane. Errors are grouped by subsystem and carry a recovery hint:
//! per-packet errors are dropped by the forwarding loops, transport closure
//! ends a bridge, and configuration errors are fatal at startup.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;

/// Top-level error type for overlay-router
#[derive(Debug, Error)]
pub enum OverlayError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Packet parsing and serialization errors
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// Next-hop resolution errors
    #[error("Route error: {0}")]
    Route(#[from] RouteError),

    /// Shared registry errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Bridge transport and interface errors
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// Scheduler control-session errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Fleet configuration errors
    #[error("Fleet error: {0}")]
    Fleet(#[from] crate::fleet::FleetError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl OverlayError {
    /// Check if this error is recoverable (the caller may continue or retry)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(e) => e.is_recoverable(),
            Self::Packet(e) => e.is_recoverable(),
            Self::Route(e) => e.is_recoverable(),
            Self::Registry(e) => e.is_recoverable(),
            Self::Bridge(e) => e.is_recoverable(),
            Self::Scheduler(e) => e.is_recoverable(),
            Self::Fleet(_) => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without operator intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a validation error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// Packet codec errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Buffer is too short or is not a well-formed IPv4 datagram
    #[error("Malformed packet: {0}")]
    Malformed(String),

    /// A transport-layer operation was requested on a packet without one
    #[error("Packet has no {0} layer")]
    MissingLayer(&'static str),
}

impl PacketError {
    /// Packet errors only affect the packet at hand
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }

    /// Create a malformed packet error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed(reason.into())
    }
}

/// Next-hop resolution errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    /// No exact or CIDR entry covers the address
    #[error("No route to {0}")]
    NotFound(Ipv4Addr),
}

impl RouteError {
    /// A missing route drops one packet, never the loop
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }
}

/// Shared registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The backend did not answer within the deadline
    #[error("Registry lookup timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The backend is unreachable or returned an error
    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    /// Stored value could not be interpreted
    #[error("Invalid registry value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

impl RegistryError {
    /// Timeouts and backend failures are transient; bad values are not
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Unavailable(_))
    }

    /// Create an unavailable error
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable(reason.into())
    }

    /// Create an invalid value error
    pub fn invalid_value(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

impl From<redis::RedisError> for RegistryError {
    fn from(e: redis::RedisError) -> Self {
        Self::Unavailable(e.to_string())
    }
}

/// Bridge errors
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The UDP transport failed outside of a requested shutdown
    #[error("Transport closed: {0}")]
    TransportClosed(#[source] io::Error),

    /// The virtual interface failed outside of a requested shutdown
    #[error("Virtual interface error: {0}")]
    Interface(#[source] io::Error),

    /// Failed to bind the transport socket
    #[error("Failed to bind transport on {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    /// A pump task panicked or was aborted
    #[error("Bridge task failed: {0}")]
    Task(String),
}

impl BridgeError {
    /// Bridge errors terminate the bridge
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a bind error
    pub fn bind(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::Bind {
            addr,
            reason: reason.into(),
        }
    }
}

/// Scheduler control-session errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Client acknowledged a different endpoint than the one sent
    #[error("Acknowledgement mismatch: sent {sent:?}, received {received:?}")]
    AckMismatch { sent: String, received: String },

    /// Client did not acknowledge within the timeout
    #[error("No acknowledgement within {}ms", .0.as_millis())]
    AckTimeout(Duration),

    /// Control connection closed by the peer
    #[error("Control connection closed by {0}")]
    Closed(SocketAddr),

    /// Switch command could not be interpreted
    #[error("Invalid switch command: {0}")]
    InvalidCommand(String),

    /// Control channel I/O error
    #[error("Control channel I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl SchedulerError {
    /// Session errors end that session only; a new one can be opened
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::AckTimeout(_) => true,
            Self::AckMismatch { .. } | Self::Closed(_) | Self::InvalidCommand(_) => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            ),
        }
    }
}

/// Type alias for Result with OverlayError
pub type Result<T> = std::result::Result<T, OverlayError>;
