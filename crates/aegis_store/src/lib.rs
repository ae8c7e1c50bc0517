//! aegis_store — durable local state for the Aegis mesh
//!
//! Two independent single-table SQLite files, each owned by exactly one
//! component:
//! - `contacts` — peer identities and their trust status. Read concurrently
//!   by session verification, written only by user-driven admin operations.
//! - `relations` — the durable half of the last-writer-wins relation graph.
//!
//! Neither file holds key material or plaintext worth encrypting at rest;
//! sensitive state (session boxes, ephemeral secrets) never touches disk.

pub mod contacts;
pub mod db;
pub mod error;
pub mod graph;

pub use contacts::{Contact, ContactBook};
pub use error::StoreError;
pub use graph::{Relation, RelationGraph};
