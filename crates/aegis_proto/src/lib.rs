//! aegis_proto — wire types and shared configuration for the Aegis mesh
//!
//! Everything that crosses the relay is JSON. The relay is a DUMB forwarder:
//! it sees envelope routing fields and opaque base64 ciphertext, nothing
//! else. All plaintext shapes live here so every crate agrees on them.
//!
//! # Modules
//! - `envelope` — relay protocol messages (announce, peer updates, envelopes)
//! - `kairos`   — session handshake payloads and in-session message shapes
//! - `ops`      — replicated-graph operation batches
//! - `config`   — application configuration tree, injected once per component

pub mod config;
pub mod envelope;
pub mod kairos;
pub mod ops;

pub use config::AppConfig;
pub use envelope::Envelope;
pub use kairos::SessionPayload;
pub use ops::CrdtOp;
