//! Authenticated boxes over X25519 key agreement.
//!
//! A box is the authenticated-encryption context two parties share after a
//! Diffie-Hellman exchange: X25519 shared secret → HKDF-SHA256 → 32-byte
//! XChaCha20-Poly1305 key. Nonces are 24 bytes, freshly random per message,
//! and travel beside the ciphertext (the wire envelope carries them as a
//! separate base64 field, so `seal`/`open` take the nonce explicitly).
//!
//! Two derivation domains:
//! - [`PeerBox`] — long-term-derived X25519 halves, protects transport
//!   envelopes (including the session handshake itself).
//! - [`SessionBox`] — ephemeral halves only, protects session payloads.
//!   Destroying both ephemeral secrets after the handshake leaves no way to
//!   re-derive this key, even with both long-term signing keys in hand.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

pub const NONCE_LEN: usize = 24;

const PEER_BOX_INFO: &[u8] = b"aegis-box-v1";
const SESSION_BOX_INFO: &[u8] = b"aegis-session-v1";

/// Fresh random 24-byte nonce.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

fn derive_key(
    my_secret: &StaticSecret,
    their_public: &X25519Public,
    info: &[u8],
) -> Result<[u8; 32], CryptoError> {
    let shared = my_secret.diffie_hellman(their_public);
    // Reject the all-zero output produced by low-order peer points.
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey("non-contributory X25519 exchange".into()));
    }
    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(info, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

fn seal_with(key: &[u8; 32], nonce: &[u8; NONCE_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    cipher
        .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)
}

fn open_with(key: &[u8; 32], nonce: &[u8; NONCE_LEN], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::AeadDecrypt)
}

/// Authenticated-encryption context between two long-term peer identities.
#[derive(ZeroizeOnDrop)]
pub struct PeerBox {
    key: [u8; 32],
}

impl PeerBox {
    pub fn new(my_secret: &StaticSecret, their_public: &X25519Public) -> Result<Self, CryptoError> {
        Ok(Self { key: derive_key(my_secret, their_public, PEER_BOX_INFO)? })
    }

    pub fn seal(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        seal_with(&self.key, nonce, plaintext, PEER_BOX_INFO)
    }

    pub fn open(&self, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        open_with(&self.key, nonce, ciphertext, PEER_BOX_INFO)
    }
}

/// Authenticated-encryption context derived from the two ephemeral X25519
/// halves of a session handshake. Consumes the local ephemeral secret: once
/// built, the handshake secret no longer exists anywhere.
#[derive(ZeroizeOnDrop)]
pub struct SessionBox {
    key: [u8; 32],
}

impl SessionBox {
    pub fn new(mut my_ephemeral: StaticSecret, their_ephemeral: &X25519Public) -> Result<Self, CryptoError> {
        let key = derive_key(&my_ephemeral, their_ephemeral, SESSION_BOX_INFO)?;
        my_ephemeral.zeroize();
        Ok(Self { key })
    }

    pub fn seal(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        seal_with(&self.key, nonce, plaintext, SESSION_BOX_INFO)
    }

    pub fn open(&self, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        open_with(&self.key, nonce, ciphertext, SESSION_BOX_INFO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn pair() -> (StaticSecret, X25519Public) {
        let s = StaticSecret::random_from_rng(OsRng);
        let p = X25519Public::from(&s);
        (s, p)
    }

    #[test]
    fn peer_box_roundtrip_both_directions() {
        let (a_sec, a_pub) = pair();
        let (b_sec, b_pub) = pair();
        let ab = PeerBox::new(&a_sec, &b_pub).unwrap();
        let ba = PeerBox::new(&b_sec, &a_pub).unwrap();

        let nonce = generate_nonce();
        let ct = ab.seal(&nonce, b"hello bob").unwrap();
        assert_eq!(ba.open(&nonce, &ct).unwrap(), b"hello bob");

        let nonce2 = generate_nonce();
        let ct2 = ba.seal(&nonce2, b"hello alice").unwrap();
        assert_eq!(ab.open(&nonce2, &ct2).unwrap(), b"hello alice");
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let (a_sec, _a_pub) = pair();
        let (_b_sec, b_pub) = pair();
        let boxed = PeerBox::new(&a_sec, &b_pub).unwrap();
        let nonce = generate_nonce();
        let mut ct = boxed.seal(&nonce, b"payload").unwrap();
        ct[0] ^= 0x01;
        assert!(boxed.open(&nonce, &ct).is_err());
    }

    #[test]
    fn wrong_nonce_rejected() {
        let (a_sec, _) = pair();
        let (_, b_pub) = pair();
        let boxed = PeerBox::new(&a_sec, &b_pub).unwrap();
        let nonce = generate_nonce();
        let ct = boxed.seal(&nonce, b"payload").unwrap();
        let other = generate_nonce();
        assert!(boxed.open(&other, &ct).is_err());
    }

    #[test]
    fn session_box_agrees_across_ephemeral_halves() {
        let (a_sec, a_pub) = pair();
        let (b_sec, b_pub) = pair();
        let alice = SessionBox::new(a_sec, &b_pub).unwrap();
        let bob = SessionBox::new(b_sec, &a_pub).unwrap();
        let nonce = generate_nonce();
        let ct = alice.seal(&nonce, b"task").unwrap();
        assert_eq!(bob.open(&nonce, &ct).unwrap(), b"task");
    }

    #[test]
    fn peer_and_session_domains_are_separated() {
        // Same DH halves must not produce interchangeable keys.
        let (a_sec, a_pub) = pair();
        let (b_sec, b_pub) = pair();
        let peer = PeerBox::new(&a_sec, &b_pub).unwrap();
        let session = SessionBox::new(b_sec, &a_pub).unwrap();
        let nonce = generate_nonce();
        let ct = peer.seal(&nonce, b"x").unwrap();
        assert!(session.open(&nonce, &ct).is_err());
    }
}
