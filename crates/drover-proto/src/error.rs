//! Error types for the drover wire format.
//!
//! All errors are structured, testable, and provide actionable information.

use thiserror::Error;

/// Errors that can occur while encoding or decoding wire types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Link packet payload exceeds what the length field can carry
    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge {
        /// Actual payload size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Typed envelope failed to decode
    #[error("malformed envelope: {0}")]
    Envelope(String),

    /// Type id has no registered message
    #[error("unknown message type: {type_id:#010x}")]
    UnknownType {
        /// The unrecognized type id
        type_id: u32,
    },

    /// Message payload failed to decode against its schema
    #[error("malformed payload for type {type_id:#010x}: {reason}")]
    Payload {
        /// Type id the payload was decoded as
        type_id: u32,
        /// Schema-level decode failure
        reason: String,
    },
}

/// Convenient Result type alias for wire operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
