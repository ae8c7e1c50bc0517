//! aegis_tools — typed, timeout-bounded, policy-gated tool dispatch
//!
//! The registry maps tool names to boxed async handlers. Feature gates
//! (web access, code execution) are decided ONCE at construction; `call`
//! never raises — every failure mode comes back as an in-band string.
//!
//! # Modules
//! - `registry` — name → handler dispatch with global timeout
//! - `eval`     — allow-list arithmetic evaluator backing the `calc` tool
//! - `sandbox`  — subprocess sandbox backing the `code_exec` tool
//! - `collab`   — traits for the external collaborators (knowledge base,
//!   web client, peer delegation) the registry is wired with

pub mod collab;
pub mod eval;
pub mod registry;
pub mod sandbox;

pub use collab::{KnowledgeBase, NullKnowledgeBase, PeerClient, WebClient};
pub use registry::ToolRegistry;
pub use sandbox::CodeSandbox;
