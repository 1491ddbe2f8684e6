//! Error types for the CCU event bridge
//!
//! The crate-wide [`BridgeError`] wraps the per-concern errors below. Calls
//! the CCU makes are never answered with an error type; they get an XML-RPC
//! fault whose code comes from [`ErrorCode`].

use std::time::Duration;
use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Top-level error for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Listener could not be bound or the HTTP server stopped
    #[error("Server error: {0}")]
    Server(String),

    /// Subscription with a CCU interface failed
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    /// State store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Inbound payload could not be decoded
    #[error(transparent)]
    Malformed(#[from] MalformedPayload),

    /// Supervisor notification failed
    #[error("Supervisor notification failed: {0}")]
    Notify(String),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Failure to subscribe with one interface
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The interface endpoint could not be reached at all
    #[error("interface {interface} unreachable: {reason}")]
    Unreachable { interface: String, reason: String },

    /// The interface answered, but refused the subscription
    #[error("interface {interface} rejected init: {reason}")]
    Rejected { interface: String, reason: String },

    /// The init call exceeded its deadline
    #[error("interface {interface} did not answer within {timeout:?}")]
    Timeout { interface: String, timeout: Duration },
}

impl SubscriptionError {
    /// Interface the error belongs to
    pub fn interface(&self) -> &str {
        match self {
            Self::Unreachable { interface, .. }
            | Self::Rejected { interface, .. }
            | Self::Timeout { interface, .. } => interface,
        }
    }
}

/// Persistence failure reported by a [`crate::store::StateStore`]
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Schema setup failed: {0}")]
    Schema(String),

    #[error("Value cannot be stored: {0}")]
    UnsupportedValue(String),

    #[error("Stored value is corrupt: {0}")]
    Corrupt(String),
}

/// An inbound XML-RPC body that could not be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Malformed payload: {0}")]
pub struct MalformedPayload(pub String);

impl MalformedPayload {
    pub fn new<S: Into<String>>(msg: S) -> Self {
        Self(msg.into())
    }
}

/// XML-RPC fault codes sent back to the CCU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Service errors (1600-1699)
    ServiceTimeout,

    // Protocol errors (1700-1799)
    UnsupportedOperation,
    MessageMalformed,
    RequestTooLarge,
}

impl ErrorCode {
    /// Get numeric error code
    pub fn as_number(&self) -> i32 {
        match self {
            ErrorCode::ServiceTimeout => 1602,
            ErrorCode::UnsupportedOperation => 1702,
            ErrorCode::MessageMalformed => 1703,
            ErrorCode::RequestTooLarge => 1704,
        }
    }
}

impl BridgeError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a server error
    pub fn server<S: Into<String>>(msg: S) -> Self {
        Self::Server(msg.into())
    }

    /// Create a notification error
    pub fn notify<S: Into<String>>(msg: S) -> Self {
        Self::Notify(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_error_interface() {
        let unreachable = SubscriptionError::Unreachable {
            interface: "BidCos-RF".into(),
            reason: "connection refused".into(),
        };
        let timeout = SubscriptionError::Timeout {
            interface: "HmIP-RF".into(),
            timeout: Duration::from_secs(15),
        };

        assert_eq!(unreachable.interface(), "BidCos-RF");
        assert_eq!(timeout.interface(), "HmIP-RF");
        assert_eq!(
            BridgeError::from(timeout).to_string(),
            "interface HmIP-RF did not answer within 15s"
        );
    }

    #[test]
    fn test_fault_codes_are_distinct() {
        let codes = [
            ErrorCode::ServiceTimeout,
            ErrorCode::UnsupportedOperation,
            ErrorCode::MessageMalformed,
            ErrorCode::RequestTooLarge,
        ];
        let numbers: std::collections::HashSet<i32> = codes.iter().map(ErrorCode::as_number).collect();
        assert_eq!(numbers.len(), codes.len());
        assert_eq!(ErrorCode::MessageMalformed.as_number(), 1703);
    }
}
