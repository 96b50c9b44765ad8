//! # aronia-wire
//!
//! Wire protocol for the Aronia fabric: the signed binary frame and the
//! JSON payload schemas carried inside it.
//!
//! ## Architecture
//!
//! ```text
//! Application value (serde_json)
//!     |
//!     v
//! Payload schema (payload.rs)   -- type-specific JSON object
//!     |
//!     v
//! Frame (frame.rs)              -- 52-byte header + payload + Ed25519 signature
//!     |
//!     v
//! Swarm stream                  -- ordered, encrypted duplex channel
//! ```
//!
//! The swarm library delivers whole frames; the leading `length` field lets
//! an implementation re-delimit a raw byte stream if it has to.

pub mod frame;
pub mod payload;

/// Error types for wire operations.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Malformed frame: bad length, version, or truncation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Payload is not the JSON object the frame type requires.
    #[error("payload error: {0}")]
    Payload(String),
}

/// Result type alias for wire operations.
pub type Result<T> = std::result::Result<T, WireError>;

/// Serialize a payload value to the UTF-8 JSON bytes a frame carries.
///
/// # Errors
///
/// Returns [`WireError::Payload`] if the value cannot be serialized.
pub fn encode_payload<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| WireError::Payload(e.to_string()))
}

/// Decode a frame payload into its type-specific schema.
///
/// # Errors
///
/// Returns [`WireError::Payload`] if the bytes are not valid JSON or do not
/// match the expected schema.
pub fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| WireError::Payload(e.to_string()))
}
