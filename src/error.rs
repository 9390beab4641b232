//! # Relay Error Handling
//!
//! This module defines the RelayError enum, which represents the different error
//! types that can occur while relaying SmartPort commands over a link.
//!
//! Device-level failures are not errors: a device that rejects a command still
//! produces a well-formed response whose status byte is nonzero.

use std::time::Duration;
use thiserror::Error;

/// Represents the different error types that can occur in the relay crate.
#[derive(Debug, Error)]
pub enum RelayError {
    /// No response tagged with the sequence number arrived before the deadline.
    #[error("Timed out after {waited:?} waiting for response to request {sequence}")]
    Timeout { sequence: u8, waited: Duration },

    /// A frame was shorter than its command's minimum shape or otherwise unparseable.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The link ended, or the connection was closed while the call was outstanding.
    #[error("Connection closed")]
    Closed,

    /// The device id does not fall in any connection's range.
    #[error("Device {0} is not routable")]
    Unroutable(u8),

    /// Assigning more ids would push the global device-id space past its ceiling.
    #[error("Device id space exhausted: {requested} ids requested")]
    CapacityExceeded { requested: usize },

    /// The sequence number is already outstanding on this connection.
    #[error("Request {0} is already outstanding on this connection")]
    DuplicateSequence(u8),

    /// The sequence number is kept back for device reboot signalling.
    #[error("Sequence number 0x{0:02X} is reserved")]
    ReservedSequence(u8),

    /// A newly accepted link never finished its handshake.
    #[error("Connection did not settle within {0:?}")]
    HandshakeTimeout(Duration),

    /// `start` was called on a listener that is already listening.
    #[error("Listener is already listening")]
    AlreadyListening,

    /// A block number does not fit in 24 bits.
    #[error("Invalid block number: {0}")]
    InvalidBlockNumber(u32),

    /// Block data was not exactly one block long.
    #[error("Invalid block data length: {0} bytes")]
    InvalidBlockData(usize),

    /// Relay configuration could not be used.
    #[error("Config error: {0}")]
    Config(String),

    /// Socket or channel I/O failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RelayError {
    /// Create a malformed frame error with message
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedFrame(msg.into())
    }

    /// Create a config error with message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True for failures caused by the transport rather than the request itself.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RelayError::Timeout { .. } | RelayError::Closed | RelayError::Io(_)
        )
    }
}

impl<I: std::fmt::Debug> From<nom::Err<nom::error::Error<I>>> for RelayError {
    fn from(err: nom::Err<nom::error::Error<I>>) -> Self {
        match err {
            nom::Err::Incomplete(needed) => {
                RelayError::MalformedFrame(format!("incomplete frame: {needed:?}"))
            }
            nom::Err::Error(e) | nom::Err::Failure(e) => {
                RelayError::MalformedFrame(format!("{:?} at {:?}", e.code, e.input))
            }
        }
    }
}

/// Result type alias for RelayError
pub type Result<T> = std::result::Result<T, RelayError>;
