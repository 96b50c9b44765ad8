//! # aronia-crypto
//!
//! Cryptographic primitives for the Aronia fabric.
//!
//! Aronia nodes are addressed by their Ed25519 public key: 32 raw bytes,
//! compared and keyed byte-wise. Hex is a display and configuration form
//! only, never the canonical identity.
//!
//! ## Modules
//!
//! - [`ed25519`] — Node identity keypairs, frame and introduction signing
//! - [`hash`] — BLAKE3 hashing and topic-hash derivation

pub mod ed25519;
pub mod hash;

/// A node's stable address: the raw bytes of its Ed25519 public key.
pub type PeerId = [u8; 32];

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Ed25519 signature verification failed.
    #[error("signature verification failed")]
    SignatureVerification,

    /// Key material had the wrong length or encoding.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A hex-encoded key could not be decoded.
    #[error("invalid hex key: {0}")]
    InvalidHex(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Encode a peer id as lowercase hex (display/config form).
pub fn peer_id_to_hex(id: &PeerId) -> String {
    hex::encode(id)
}

/// Decode a peer id from its hex form.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidHex`] if the input is not 64 hex characters.
pub fn peer_id_from_hex(s: &str) -> Result<PeerId> {
    let bytes = hex::decode(s).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidHex(format!("expected 32 bytes, got {}", s.len() / 2)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_hex_roundtrip() {
        let id: PeerId = [0xab; 32];
        let encoded = peer_id_to_hex(&id);
        assert_eq!(encoded.len(), 64);
        let decoded = peer_id_from_hex(&encoded).expect("decode");
        assert_eq!(decoded, id);
    }

    #[test]
    fn test_peer_id_from_hex_rejects_short() {
        assert!(peer_id_from_hex("abcd").is_err());
        assert!(peer_id_from_hex("not hex at all").is_err());
    }
}
