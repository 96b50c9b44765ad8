//! # aronia-trust
//!
//! Trust delegation for the Aronia fabric.
//!
//! An introduction is a signed record by which a connected, already-trusted
//! peer vouches for a third party. The record carries the introduced key,
//! the introducer's key and signature, and the chain of introducers so far
//! (`trustPath`). Validation bounds the chain length, rejects cycles, and
//! pins the signer to the peer that delivered the record.
//!
//! ## Modules
//!
//! - [`introduction`] — The signed record and its canonical serialization
//! - [`validate`] — Validation rules and cycle detection

pub mod introduction;
pub mod validate;

use std::collections::HashSet;

use aronia_crypto::PeerId;
use aronia_wire::payload::Capabilities;

/// Default maximum age of an introduction record (24 hours).
pub const DEFAULT_INTRODUCTION_MAX_AGE_MS: u64 = 86_400_000;

/// Default maximum accepted `trustPath` length.
pub const DEFAULT_MAX_TRUST_DEPTH: usize = 3;

/// Error types for introduction handling.
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    /// The record is older than the configured maximum age.
    #[error("introduction expired: age {age_ms} ms exceeds maximum {max_age_ms} ms")]
    Expired {
        /// Observed age of the record.
        age_ms: u64,
        /// Configured maximum age.
        max_age_ms: u64,
    },

    /// The record's timestamp is ahead of the local clock.
    #[error("introduction timestamp is from the future")]
    FromFuture,

    /// The signature does not match the canonical body under the
    /// introducer's key.
    #[error("invalid signature")]
    InvalidSignature,

    /// The record names a different introducer than the peer that
    /// delivered it.
    #[error("introducer mismatch: record names {claimed}, delivered by {delivering}")]
    IntroducerMismatch {
        /// Hex key named in the record.
        claimed: String,
        /// Hex key of the delivering peer.
        delivering: String,
    },

    /// The trust path contains the admitting node or a repeated entry.
    #[error("circular trust path")]
    CircularTrust,

    /// The trust path exceeds the configured depth bound.
    #[error("trust path too long: {len} entries, maximum {max}")]
    TrustPathTooLong {
        /// Observed path length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Hex keys or signature bytes in the record do not decode.
    #[error("malformed introduction: {0}")]
    Malformed(String),
}

/// Result type alias for trust operations.
pub type Result<T> = std::result::Result<T, TrustError>;

/// Admission policy for inbound introductions.
#[derive(Clone, Debug, Default)]
pub struct TrustConfig {
    /// Introducers whose introductions are accepted without manual review.
    pub auto_accept_from: HashSet<PeerId>,
    /// Capability tokens that always force manual review.
    pub require_approval_for: HashSet<String>,
}

impl TrustConfig {
    /// Whether an introduction delivered by `introducer`, vouching for a
    /// peer with `capabilities`, may be accepted automatically.
    pub fn auto_accepts(&self, introducer: &PeerId, capabilities: &Capabilities) -> bool {
        self.auto_accept_from.contains(introducer)
            && !capabilities
                .accepts
                .iter()
                .any(|token| self.require_approval_for.contains(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(accepts: &[&str]) -> Capabilities {
        Capabilities {
            agent: "aronia".to_string(),
            version: "0.1.0".to_string(),
            accepts: accepts.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn test_auto_accept_requires_trusted_introducer() {
        let trusted: PeerId = [1u8; 32];
        let stranger: PeerId = [2u8; 32];
        let config = TrustConfig {
            auto_accept_from: HashSet::from([trusted]),
            require_approval_for: HashSet::new(),
        };

        assert!(config.auto_accepts(&trusted, &caps(&[])));
        assert!(!config.auto_accepts(&stranger, &caps(&[])));
    }

    #[test]
    fn test_guarded_capability_forces_manual_review() {
        let trusted: PeerId = [1u8; 32];
        let config = TrustConfig {
            auto_accept_from: HashSet::from([trusted]),
            require_approval_for: HashSet::from(["admin".to_string()]),
        };

        assert!(config.auto_accepts(&trusted, &caps(&["task"])));
        assert!(!config.auto_accepts(&trusted, &caps(&["task", "admin"])));
    }
}
