//! BLAKE3 hashing and topic-hash derivation.
//!
//! The fabric needs one 32-byte digest: the DHT rendezvous key for a named
//! topic. Nodes announcing and searching under the same topic name must
//! derive the same key, so the derivation is fixed:
//!
//! `topic_hash(name) = BLAKE3("aronia" || name)`

/// Namespace prefix mixed into every topic hash.
pub const TOPIC_PREFIX: &[u8] = b"aronia";

/// Compute the BLAKE3 hash of the input data.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *::blake3::hash(data).as_bytes()
}

/// Derive the 32-byte DHT rendezvous key for a topic name.
pub fn topic_hash(name: &str) -> [u8; 32] {
    let mut input = Vec::with_capacity(TOPIC_PREFIX.len() + name.len());
    input.extend_from_slice(TOPIC_PREFIX);
    input.extend_from_slice(name.as_bytes());
    hash(&input)
}
