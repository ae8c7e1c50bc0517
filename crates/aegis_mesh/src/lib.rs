//! aegis_mesh — the mesh transport and session layer
//!
//! Layering, bottom up:
//! - `transport` — one persistent websocket to the relay; peer discovery,
//!   key announcements, and authenticated peer-box envelopes.
//! - `session`   — Kairos: a 3-message handshake that layers consent-gated,
//!   forward-secret sessions over transport envelopes.
//! - `exec`      — the session-message handler that runs allow-listed tools
//!   for a peer, plus the client-side delegation helpers.
//! - `sync`      — broadcast/absorb of relation-graph operations.
//!
//! The transport knows nothing about sessions: the session manager holds a
//! reference to the transport and registers type-erased handlers on it, so
//! the dependency runs one way only.

pub mod error;
pub mod exec;
pub mod session;
pub mod sync;
pub mod transport;

pub use error::MeshError;
pub use exec::{SessionExec, SessionTools, SESSION_ALLOWED_TOOLS};
pub use session::{SessionManager, VerifyKeyLookup};
pub use sync::SyncService;
pub use transport::Transport;
