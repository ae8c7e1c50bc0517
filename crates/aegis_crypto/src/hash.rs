//! SHA-256 utilities — context hashes and key fingerprints.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of a UTF-8 string. Used for the `context_hash`
/// bound into consent tokens.
pub fn sha256_hex(s: &str) -> String {
    hex::encode(Sha256::digest(s.as_bytes()))
}

/// First 16 hex chars of SHA-256 over raw bytes. Displayed to users for
/// out-of-band verification of a peer's verify key.
pub fn fingerprint(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(digest)[..16].to_string()
}
