//! The introduction record and its canonical serialization.
//!
//! ## Signing
//!
//! The introducer signs the canonical JSON serialization of every field
//! except `signature`, in declared order. The `message` field is always
//! present (null when unset) so both sides produce identical bytes.
//! Keys travel hex-encoded; byte-wise peer ids are recovered on demand.

use aronia_crypto::ed25519::{KeyPair, Signature, VerifyingKey};
use aronia_crypto::{peer_id_from_hex, peer_id_to_hex, PeerId};
use aronia_wire::payload::Capabilities;
use serde::{Deserialize, Serialize};

use crate::{Result, TrustError};

/// A signed trust-delegation record, carried in an `INTRODUCE` frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Introduction {
    /// Hex-encoded public key of the peer being introduced.
    pub pubkey: String,
    /// Human-readable name the introducer knows the peer by.
    pub alias: String,
    /// The introduced peer's capabilities, as declared by the introducer.
    pub capabilities: Capabilities,
    /// Free-form note from the introducer.
    pub message: Option<String>,
    /// Hex-encoded public key of the signer.
    pub introducer_pubkey: String,
    /// Creation time, ms since epoch.
    pub timestamp: u64,
    /// Ordered chain of introducer hex keys, the signer last.
    pub trust_path: Vec<String>,
    /// Hex-encoded Ed25519 signature over the canonical body.
    pub signature: String,
}

/// The signed view of a record: every field except `signature`, in the
/// declared (canonical) order.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalBody<'a> {
    pubkey: &'a str,
    alias: &'a str,
    capabilities: &'a Capabilities,
    message: &'a Option<String>,
    introducer_pubkey: &'a str,
    timestamp: u64,
    trust_path: &'a [String],
}

impl Introduction {
    /// Build and sign a first-hop introduction: the introducer vouches for
    /// a peer it knows directly, so the trust path is just the introducer.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::Malformed`] if the body cannot be serialized.
    pub fn new(
        target: &PeerId,
        alias: impl Into<String>,
        capabilities: Capabilities,
        message: Option<String>,
        introducer: &KeyPair,
        timestamp: u64,
    ) -> Result<Self> {
        let introducer_hex = peer_id_to_hex(&introducer.peer_id());
        let mut record = Self {
            pubkey: peer_id_to_hex(target),
            alias: alias.into(),
            capabilities,
            message,
            introducer_pubkey: introducer_hex.clone(),
            timestamp,
            trust_path: vec![introducer_hex],
            signature: String::new(),
        };
        record.sign(introducer)?;
        Ok(record)
    }

    /// Re-issue a received introduction one hop further: the forwarder
    /// becomes the signer and appends itself to the trust path. The
    /// receiver checks the signature against the forwarder (the peer it
    /// is actually connected to) while the original chain stays visible
    /// in `trustPath`.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::Malformed`] if the body cannot be serialized.
    pub fn forwarded(received: &Introduction, forwarder: &KeyPair, timestamp: u64) -> Result<Self> {
        let forwarder_hex = peer_id_to_hex(&forwarder.peer_id());
        let mut trust_path = received.trust_path.clone();
        trust_path.push(forwarder_hex.clone());

        let mut record = Self {
            pubkey: received.pubkey.clone(),
            alias: received.alias.clone(),
            capabilities: received.capabilities.clone(),
            message: received.message.clone(),
            introducer_pubkey: forwarder_hex,
            timestamp,
            trust_path,
            signature: String::new(),
        };
        record.sign(forwarder)?;
        Ok(record)
    }

    /// The canonical bytes the signature covers.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::Malformed`] if serialization fails.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let body = CanonicalBody {
            pubkey: &self.pubkey,
            alias: &self.alias,
            capabilities: &self.capabilities,
            message: &self.message,
            introducer_pubkey: &self.introducer_pubkey,
            timestamp: self.timestamp,
            trust_path: &self.trust_path,
        };
        serde_json::to_vec(&body).map_err(|e| TrustError::Malformed(e.to_string()))
    }

    /// Sign the canonical body, filling in `signature`.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::Malformed`] if serialization fails.
    pub fn sign(&mut self, key: &KeyPair) -> Result<()> {
        let body = self.canonical_bytes()?;
        self.signature = hex::encode(key.signing_key.sign(&body).to_bytes());
        Ok(())
    }

    /// Verify `signature` over the canonical body with the record's own
    /// `introducerPubkey`.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::Malformed`] if the key or signature bytes do
    /// not decode, [`TrustError::InvalidSignature`] on mismatch.
    pub fn verify_signature(&self) -> Result<()> {
        let introducer = self.introducer_id()?;
        let key = VerifyingKey::from_bytes(&introducer)
            .map_err(|e| TrustError::Malformed(e.to_string()))?;

        let sig_bytes: [u8; 64] = hex::decode(&self.signature)
            .map_err(|e| TrustError::Malformed(format!("signature hex: {e}")))?
            .try_into()
            .map_err(|_| TrustError::Malformed("signature must be 64 bytes".to_string()))?;

        let body = self.canonical_bytes()?;
        key.verify(&body, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| TrustError::InvalidSignature)
    }

    /// The introduced peer's id as raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::Malformed`] if the hex does not decode.
    pub fn peer_id(&self) -> Result<PeerId> {
        peer_id_from_hex(&self.pubkey).map_err(|e| TrustError::Malformed(e.to_string()))
    }

    /// The signer's id as raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::Malformed`] if the hex does not decode.
    pub fn introducer_id(&self) -> Result<PeerId> {
        peer_id_from_hex(&self.introducer_pubkey).map_err(|e| TrustError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> Capabilities {
        Capabilities {
            agent: "aronia".to_string(),
            version: "0.1.0".to_string(),
            accepts: vec!["task".to_string()],
        }
    }

    #[test]
    fn test_new_signs_validly() {
        let introducer = KeyPair::from_bytes(&[1u8; 32]);
        let target: PeerId = [2u8; 32];
        let record = Introduction::new(&target, "carol", caps(), None, &introducer, 1_000)
            .expect("create");

        assert_eq!(record.trust_path, vec![peer_id_to_hex(&introducer.peer_id())]);
        assert_eq!(record.peer_id().expect("pubkey"), target);
        record.verify_signature().expect("signature must verify");
    }

    #[test]
    fn test_canonical_field_order() {
        let introducer = KeyPair::from_bytes(&[1u8; 32]);
        let record = Introduction::new(&[2u8; 32], "carol", caps(), None, &introducer, 1_000)
            .expect("create");
        let body = String::from_utf8(record.canonical_bytes().expect("bytes")).expect("utf8");

        // Declared order is the canonical order; signature never appears.
        let indices: Vec<usize> = [
            "\"pubkey\"",
            "\"alias\"",
            "\"capabilities\"",
            "\"message\"",
            "\"introducerPubkey\"",
            "\"timestamp\"",
            "\"trustPath\"",
        ]
        .iter()
        .map(|field| body.find(field).expect("field present"))
        .collect();
        assert!(indices.windows(2).all(|w| w[0] < w[1]));
        assert!(!body.contains("\"signature\""));
    }

    #[test]
    fn test_absent_message_serializes_as_null() {
        let introducer = KeyPair::from_bytes(&[1u8; 32]);
        let record = Introduction::new(&[2u8; 32], "carol", caps(), None, &introducer, 1_000)
            .expect("create");
        let body = String::from_utf8(record.canonical_bytes().expect("bytes")).expect("utf8");
        assert!(body.contains("\"message\":null"));
    }

    #[test]
    fn test_tampered_record_fails_verification() {
        let introducer = KeyPair::from_bytes(&[1u8; 32]);
        let mut record = Introduction::new(&[2u8; 32], "carol", caps(), None, &introducer, 1_000)
            .expect("create");
        record.alias = "mallory".to_string();
        assert!(matches!(
            record.verify_signature(),
            Err(TrustError::InvalidSignature)
        ));
    }

    #[test]
    fn test_json_roundtrip_preserves_signature() {
        let introducer = KeyPair::from_bytes(&[1u8; 32]);
        let record = Introduction::new(
            &[2u8; 32],
            "carol",
            caps(),
            Some("met at the rendezvous".to_string()),
            &introducer,
            1_000,
        )
        .expect("create");

        let json = serde_json::to_string(&record).expect("serialize");
        assert!(json.contains("\"introducerPubkey\""));
        assert!(json.contains("\"trustPath\""));

        let parsed: Introduction = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed, record);
        parsed.verify_signature().expect("survives the roundtrip");
    }

    #[test]
    fn test_forwarded_extends_chain_and_resigns() {
        let origin = KeyPair::from_bytes(&[1u8; 32]);
        let forwarder = KeyPair::from_bytes(&[3u8; 32]);
        let original = Introduction::new(&[2u8; 32], "carol", caps(), None, &origin, 1_000)
            .expect("create");

        let forwarded =
            Introduction::forwarded(&original, &forwarder, 2_000).expect("forward");

        assert_eq!(
            forwarded.trust_path,
            vec![
                peer_id_to_hex(&origin.peer_id()),
                peer_id_to_hex(&forwarder.peer_id()),
            ]
        );
        assert_eq!(
            forwarded.introducer_pubkey,
            peer_id_to_hex(&forwarder.peer_id())
        );
        assert_eq!(forwarded.pubkey, original.pubkey);
        forwarded.verify_signature().expect("forwarder's signature");
    }
}
