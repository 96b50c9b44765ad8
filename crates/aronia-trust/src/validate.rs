//! Validation rules for received introductions.
//!
//! An introduction passes when, in order: it is neither expired nor from
//! the future, its signature verifies under the introducer's key, the
//! named introducer is the peer that delivered it, its trust path is
//! acyclic from the admitting node's point of view, and the path length
//! is within the configured bound.

use std::collections::HashSet;

use aronia_crypto::{peer_id_to_hex, PeerId};

use crate::introduction::Introduction;
use crate::{Result, TrustError};

/// Validate a received introduction.
///
/// `delivering_peer` is the remote key of the session the record arrived
/// on; `own` is the admitting node's key; `now_ms` is the local clock.
///
/// # Errors
///
/// Returns the first failing [`TrustError`] in validation order.
pub fn validate_introduction(
    record: &Introduction,
    delivering_peer: &PeerId,
    own: &PeerId,
    max_age_ms: u64,
    max_depth: usize,
    now_ms: u64,
) -> Result<()> {
    if record.timestamp > now_ms {
        return Err(TrustError::FromFuture);
    }
    let age_ms = now_ms - record.timestamp;
    if age_ms > max_age_ms {
        return Err(TrustError::Expired { age_ms, max_age_ms });
    }

    record.verify_signature()?;

    let delivering_hex = peer_id_to_hex(delivering_peer);
    if record.introducer_pubkey != delivering_hex {
        return Err(TrustError::IntroducerMismatch {
            claimed: record.introducer_pubkey.clone(),
            delivering: delivering_hex,
        });
    }

    if detect_circular_trust(&record.trust_path, &peer_id_to_hex(own)) {
        return Err(TrustError::CircularTrust);
    }

    if record.trust_path.len() > max_depth {
        return Err(TrustError::TrustPathTooLong {
            len: record.trust_path.len(),
            max: max_depth,
        });
    }

    Ok(())
}

/// Whether a trust path is circular from `own_hex`'s point of view:
/// it contains the node itself, or any entry twice.
pub fn detect_circular_trust(trust_path: &[String], own_hex: &str) -> bool {
    let mut seen = HashSet::with_capacity(trust_path.len());
    for entry in trust_path {
        if entry == own_hex || !seen.insert(entry.as_str()) {
            return true;
        }
    }
    false
}
