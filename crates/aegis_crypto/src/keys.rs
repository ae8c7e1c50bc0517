//! Long-term identity key management.
//!
//! Each node has one long-term Ed25519 signing keypair, persisted as two
//! base64 files (`{name}.ed25519.sk` / `{name}.ed25519.pk`). The same
//! identity is converted deterministically to an X25519 pair for the
//! transport's peer boxes, so a node announces exactly one public key
//! derived from the key its contacts already verified.

use std::fs;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;

pub fn b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn b64d(s: &str) -> Result<Vec<u8>, CryptoError> {
    Ok(STANDARD.decode(s.trim())?)
}

fn to_32(bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))
}

/// Load the persisted identity for `name`, or generate and persist a fresh
/// one when either file is missing.
///
/// Key files are created with user-only permissions where the host OS
/// supports it.
pub fn load_or_create_keys(name: &str, dir: &Path) -> Result<(SigningKey, VerifyingKey), CryptoError> {
    fs::create_dir_all(dir)?;
    let sk_path = dir.join(format!("{name}.ed25519.sk"));
    let pk_path = dir.join(format!("{name}.ed25519.pk"));

    if sk_path.exists() && pk_path.exists() {
        let seed = to_32(&b64d(&fs::read_to_string(&sk_path)?)?)?;
        let signing = SigningKey::from_bytes(&seed);
        let stored_pk = to_32(&b64d(&fs::read_to_string(&pk_path)?)?)?;
        let verify = VerifyingKey::from_bytes(&stored_pk)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        if verify != signing.verifying_key() {
            return Err(CryptoError::KeyFile(format!(
                "{} does not match {}",
                pk_path.display(),
                sk_path.display()
            )));
        }
        return Ok((signing, verify));
    }

    let signing = SigningKey::generate(&mut OsRng);
    let verify = signing.verifying_key();
    fs::write(&sk_path, b64(&signing.to_bytes()))?;
    fs::write(&pk_path, b64(verify.as_bytes()))?;
    restrict_permissions(&sk_path)?;
    restrict_permissions(&pk_path)?;
    Ok((signing, verify))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), CryptoError> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), CryptoError> {
    Ok(())
}

/// Convert an Ed25519 signing key to an X25519 static secret.
///
/// Uses the clamped SHA-512 expansion of the seed (RFC 7748 §5), the same
/// transform libsodium applies to the expanded secret's scalar half.
pub fn ed25519_secret_to_x25519(sk: &SigningKey) -> StaticSecret {
    let mut h = Sha512::digest(sk.to_bytes());
    h[0] &= 248;
    h[31] &= 127;
    h[31] |= 64;
    let mut key = [0u8; 32];
    key.copy_from_slice(&h[..32]);
    h.as_mut_slice().zeroize();
    let secret = StaticSecret::from(key);
    key.zeroize();
    secret
}

/// Convert an Ed25519 verifying key to an X25519 public key via the
/// birational Edwards → Montgomery map.
pub fn ed25519_pub_to_x25519(vk: &VerifyingKey) -> Result<X25519Public, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;
    let compressed = CompressedEdwardsY::from_slice(vk.as_bytes())
        .map_err(|_| CryptoError::InvalidKey("invalid Ed25519 public key".into()))?;
    let point = compressed
        .decompress()
        .ok_or_else(|| CryptoError::InvalidKey("Ed25519 public key decompression failed".into()))?;
    Ok(X25519Public::from(point.to_montgomery().to_bytes()))
}

/// Both halves of the identity converted for key agreement.
pub fn ed25519_to_curve25519(
    sk: &SigningKey,
    vk: &VerifyingKey,
) -> Result<(StaticSecret, X25519Public), CryptoError> {
    Ok((ed25519_secret_to_x25519(sk), ed25519_pub_to_x25519(vk)?))
}

/// Base64 of the 32-byte verify key, the form stored in the contact book.
pub fn verify_key_b64(vk: &VerifyingKey) -> String {
    b64(vk.as_bytes())
}

/// Human fingerprint: first 16 hex chars of SHA-256 of the public key.
pub fn verify_key_fingerprint(vk: &VerifyingKey) -> String {
    crate::hash::fingerprint(vk.as_bytes())
}

/// Decode a base64 verify key as stored in the contact book.
pub fn verify_key_from_b64(s: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = to_32(&b64d(s)?)?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}
