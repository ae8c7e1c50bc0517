//! External collaborator seams.
//!
//! Vector retrieval, web access, and in-session peer delegation live
//! outside this crate; the registry only knows these trait shapes. Every
//! method returns a string (or a count) because tool output is always a
//! string handed back to the model/peer — errors are stringified in-band
//! by the registry, never propagated.

use async_trait::async_trait;
use serde_json::Value;

/// Chunked document store with similarity retrieval.
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// Ingest a document; returns the number of chunks stored.
    async fn add_document(&self, text: &str, source: &str) -> anyhow::Result<usize>;

    /// Retrieval string for a query: the top-`k` chunks, joined.
    async fn retrieve_context(&self, query: &str, k: usize) -> anyhow::Result<String>;
}

/// Outbound web access (search + fetch). Implementations own caching; the
/// registry enforces the `assistant.allow_domains` restriction itself, so
/// a disallowed URL never reaches `fetch`.
#[async_trait]
pub trait WebClient: Send + Sync {
    async fn search(&self, query: &str, k: usize) -> anyhow::Result<String>;
    async fn fetch(&self, url: &str) -> anyhow::Result<String>;
}

/// Delegation into an established mesh session. The session executor
/// builds registries WITHOUT a peer client so a delegated task can never
/// re-delegate transitively.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn delegate(&self, session_id: &str, tool: &str, args: Value) -> anyhow::Result<String>;
    async fn share_text(&self, session_id: &str, text: &str, source: &str)
        -> anyhow::Result<String>;
}

/// Knowledge base that stores nothing and retrieves nothing. Used when an
/// embedder runs the mesh without a vector store wired in.
pub struct NullKnowledgeBase;

#[async_trait]
impl KnowledgeBase for NullKnowledgeBase {
    async fn add_document(&self, _text: &str, _source: &str) -> anyhow::Result<usize> {
        Ok(0)
    }

    async fn retrieve_context(&self, _query: &str, _k: usize) -> anyhow::Result<String> {
        Ok(String::new())
    }
}
