//! The Aronia wire frame: serialize, parse, sign, verify.
//!
//! ## Wire format
//!
//! All multi-byte integers are big-endian.
//!
//! ```text
//! offset  size  field
//!      0     4  total length (u32, counts the whole frame)
//!      4     1  protocol version (1)
//!      5     1  frame type
//!      6     2  flags
//!      8     4  reserved word (zero on send, preserved on parse)
//!     12     8  timestamp, ms since epoch
//!     20    32  sender public key
//!     52     n  payload (UTF-8 JSON)
//!   52+n    64  Ed25519 signature
//! ```
//!
//! The signature covers the serialized prefix excluding the trailing 64
//! bytes, so everything a peer acts on (length, version, type, flags,
//! timestamp, sender, payload) is authenticated. Unknown flag bits and
//! the reserved word are accepted and carried through unchanged so that
//! signatures stay valid across implementations that use them.

use aronia_crypto::ed25519::{Signature, SigningKey, VerifyingKey};
use aronia_crypto::PeerId;

use crate::{Result, WireError};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 52;

/// Size of the trailing Ed25519 signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Minimum frame size: header plus signature, empty payload.
pub const MIN_FRAME_LEN: usize = HEADER_LEN + SIGNATURE_LEN;

/// Maximum payload size accepted (to bound per-frame allocation).
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// Frame type registry
// ---------------------------------------------------------------------------

/// Heartbeats and capability announcements.
pub const FRAME_CONTROL: u8 = 0x01;
/// RPC request.
pub const FRAME_REQUEST: u8 = 0x02;
/// RPC response.
pub const FRAME_RESPONSE: u8 = 0x03;
/// Fire-and-forget application event.
pub const FRAME_EVENT: u8 = 0x04;
/// Stream chunk (reserved; surfaced as an event).
pub const FRAME_STREAM_DATA: u8 = 0x05;
/// Stream end (reserved; surfaced as an event).
pub const FRAME_STREAM_END: u8 = 0x06;
/// Trust delegation record.
pub const FRAME_INTRODUCE: u8 = 0x07;

// ---------------------------------------------------------------------------
// Flag bits
// ---------------------------------------------------------------------------

/// Payload is application-encrypted. Reserved; the core never sets it.
pub const FLAG_ENCRYPTED: u16 = 0x0001;
/// Payload is compressed. Reserved; the core never sets it.
pub const FLAG_COMPRESSED: u16 = 0x0002;
/// Frame should jump the queue. Reserved; the core never sets it.
pub const FLAG_URGENT: u16 = 0x0004;

/// A parsed or to-be-sent wire frame.
///
/// `frame_type` is kept as the raw byte: frames with types this
/// implementation does not know still parse and verify, and the session
/// layer decides how to surface them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Protocol version. Must be [`PROTOCOL_VERSION`] on the wire.
    pub version: u8,
    /// Frame type byte from the registry above.
    pub frame_type: u8,
    /// Flag bits. Unknown bits are passed through.
    pub flags: u16,
    /// Reserved header word. Zero on send, preserved on parse.
    pub reserved: u32,
    /// Sender clock, milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// The sender's public key. Checked against the session's remote key.
    pub sender: PeerId,
    /// Type-specific UTF-8 JSON payload.
    pub payload: Vec<u8>,
    /// Ed25519 signature over the serialized prefix. Zero until signed.
    pub signature: [u8; SIGNATURE_LEN],
}

impl Frame {
    /// Create an unsigned frame stamped with the current wall clock.
    pub fn new(frame_type: u8, sender: PeerId, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            frame_type,
            flags: 0,
            reserved: 0,
            timestamp: now_ms(),
            sender,
            payload,
            signature: [0u8; SIGNATURE_LEN],
        }
    }

    /// Total serialized size of this frame in bytes.
    pub fn total_len(&self) -> usize {
        HEADER_LEN + self.payload.len() + SIGNATURE_LEN
    }

    /// Serialize the frame to wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Protocol`] if the payload exceeds
    /// [`MAX_PAYLOAD_LEN`].
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(WireError::Protocol(format!(
                "payload too large: {} bytes, max {MAX_PAYLOAD_LEN}",
                self.payload.len()
            )));
        }

        let total = self.total_len();
        let mut out = vec![0u8; total];
        out[0..4].copy_from_slice(&(total as u32).to_be_bytes());
        out[4] = self.version;
        out[5] = self.frame_type;
        out[6..8].copy_from_slice(&self.flags.to_be_bytes());
        out[8..12].copy_from_slice(&self.reserved.to_be_bytes());
        out[12..20].copy_from_slice(&self.timestamp.to_be_bytes());
        out[20..52].copy_from_slice(&self.sender);
        out[52..52 + self.payload.len()].copy_from_slice(&self.payload);
        out[total - SIGNATURE_LEN..].copy_from_slice(&self.signature);
        Ok(out)
    }

    /// Parse a frame from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Protocol`] if the input is shorter than
    /// [`MIN_FRAME_LEN`], the length field disagrees with the input
    /// length, the payload exceeds [`MAX_PAYLOAD_LEN`], or the version is
    /// not [`PROTOCOL_VERSION`].
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < MIN_FRAME_LEN {
            return Err(WireError::Protocol(format!(
                "frame too short: {} bytes, minimum {MIN_FRAME_LEN}",
                data.len()
            )));
        }

        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&data[0..4]);
        let length = u32::from_be_bytes(len_buf) as usize;
        if length != data.len() {
            return Err(WireError::Protocol(format!(
                "length field {length} disagrees with frame size {}",
                data.len()
            )));
        }

        let version = data[4];
        if version != PROTOCOL_VERSION {
            return Err(WireError::Protocol(format!(
                "unsupported protocol version {version}, expected {PROTOCOL_VERSION}"
            )));
        }

        let payload_len = length - HEADER_LEN - SIGNATURE_LEN;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(WireError::Protocol(format!(
                "payload too large: {payload_len} bytes, max {MAX_PAYLOAD_LEN}"
            )));
        }

        let frame_type = data[5];
        let mut flags_buf = [0u8; 2];
        flags_buf.copy_from_slice(&data[6..8]);
        let mut reserved_buf = [0u8; 4];
        reserved_buf.copy_from_slice(&data[8..12]);
        let mut ts_buf = [0u8; 8];
        ts_buf.copy_from_slice(&data[12..20]);
        let mut sender = [0u8; 32];
        sender.copy_from_slice(&data[20..52]);
        let payload = data[HEADER_LEN..HEADER_LEN + payload_len].to_vec();
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&data[length - SIGNATURE_LEN..]);

        Ok(Self {
            version,
            frame_type,
            flags: u16::from_be_bytes(flags_buf),
            reserved: u32::from_be_bytes(reserved_buf),
            timestamp: u64::from_be_bytes(ts_buf),
            sender,
            payload,
            signature,
        })
    }

    /// Sign the frame with the sender's key, filling in `signature`.
    ///
    /// The signature covers the serialized prefix: header and payload,
    /// excluding the trailing signature bytes themselves.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Protocol`] if the frame cannot be serialized.
    pub fn sign(&mut self, key: &SigningKey) -> Result<()> {
        let bytes = self.to_bytes()?;
        let prefix = &bytes[..bytes.len() - SIGNATURE_LEN];
        self.signature = key.sign(prefix).to_bytes();
        Ok(())
    }

    /// Verify the frame's signature against its `sender` key.
    ///
    /// Any failure (an invalid sender key, a frame that cannot be
    /// serialized, a signature mismatch) yields `false`.
    pub fn verify(&self) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.sender) else {
            return false;
        };
        let Ok(bytes) = self.to_bytes() else {
            return false;
        };
        let prefix = &bytes[..bytes.len() - SIGNATURE_LEN];
        let signature = Signature::from_bytes(&self.signature);
        key.verify(prefix, &signature).is_ok()
    }
}

/// Current wall clock in milliseconds since the Unix epoch.
///
/// Saturates to zero if the clock is before the epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
