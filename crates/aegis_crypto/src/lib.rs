//! aegis_crypto — cryptographic primitives for the Aegis mesh
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize secret material on drop.
//! - Verification never mutates its input.
//!
//! # Module layout
//! - `keys`    — long-term Ed25519 identity, persisted key files, X25519 conversion
//! - `boxes`   — X25519 + XChaCha20-Poly1305 authenticated boxes (peer and session)
//! - `consent` — signed, expiring, scope-limited capability tokens
//! - `hash`    — SHA-256 utilities (context hashes, fingerprints)
//! - `error`   — unified error type

pub mod boxes;
pub mod consent;
pub mod error;
pub mod hash;
pub mod keys;

pub use consent::ConsentToken;
pub use error::CryptoError;
