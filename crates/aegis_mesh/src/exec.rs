//! Session executor and delegation helpers.
//!
//! [`SessionExec`] is the responder half: installed as the manager's
//! session-message hook, it runs `task` messages through a tool registry
//! and replies in-band. Defense in depth, independent of whatever the
//! initiator's consent token says:
//! - only tools on [`SESSION_ALLOWED_TOOLS`] ever run for a peer;
//! - each invocation gets a FRESH registry built with `peer_client =
//!   None`, so a delegated task can never delegate onward (no loops).
//!
//! [`SessionTools`] is the initiator half: it refuses a delegation that
//! the session's own consent scope does not permit BEFORE anything is
//! sent, and implements [`PeerClient`] so a full local registry can expose
//! delegation as ordinary tools.

use std::sync::Arc;

use aegis_proto::config::AssistantConfig;
use aegis_proto::kairos::SessionPayload;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, warn};

use aegis_tools::{KnowledgeBase, PeerClient, ToolRegistry, WebClient};

use crate::error::MeshError;
use crate::session::SessionManager;

/// Tools a peer may invoke in a session, regardless of consent scope.
/// Deliberately a separate constant — never derived from the registry.
pub const SESSION_ALLOWED_TOOLS: [&str; 3] = ["kb_query", "fetch_url", "search_web"];

pub struct SessionExec {
    sessions: Arc<SessionManager>,
    kb: Arc<dyn KnowledgeBase>,
    web: Option<Arc<dyn WebClient>>,
    cfg: AssistantConfig,
}

impl SessionExec {
    /// Build the executor and install it as the session-message hook.
    pub fn install(
        sessions: Arc<SessionManager>,
        kb: Arc<dyn KnowledgeBase>,
        web: Option<Arc<dyn WebClient>>,
        cfg: AssistantConfig,
    ) -> Arc<Self> {
        let exec = Arc::new(Self { sessions: Arc::clone(&sessions), kb, web, cfg });
        let hooked = Arc::clone(&exec);
        sessions.set_on_session_message(Arc::new(move |session_id, inner| {
            let exec = Arc::clone(&hooked);
            async move { exec.handle(session_id, inner).await }.boxed()
        }));
        exec
    }

    async fn handle(&self, session_id: String, inner: Value) {
        // Only task messages; everything else belongs to other handlers.
        let Ok(SessionPayload::Task { tool, args }) =
            serde_json::from_value::<SessionPayload>(inner)
        else {
            debug!(session_id, "non-task session message ignored by executor");
            return;
        };

        let reply = if SESSION_ALLOWED_TOOLS.contains(&tool.as_str()) {
            // Fresh registry per invocation, no peer client: a delegated
            // task cannot fan out to further peers.
            let registry = ToolRegistry::new(self.kb.clone(), self.web.clone(), &self.cfg, None);
            let result = registry.call(&tool, args).await;
            SessionPayload::Result { result: Some(result), error: None }
        } else {
            debug!(session_id, tool, "peer asked for tool outside the allow-list");
            SessionPayload::Result { result: None, error: Some("tool not allowed".into()) }
        };

        match serde_json::to_value(&reply) {
            Ok(value) => {
                if let Err(e) = self.sessions.send_session(&session_id, &value).await {
                    warn!(session_id, error = %e, "failed to send task result");
                }
            }
            Err(e) => warn!(error = %e, "result payload serialisation failed"),
        }
    }
}

/// Initiator-side helpers for working inside an established session.
pub struct SessionTools {
    sessions: Arc<SessionManager>,
}

impl SessionTools {
    pub fn new(sessions: Arc<SessionManager>) -> Arc<Self> {
        Arc::new(Self { sessions })
    }

    /// Send a task to the session peer. Refused locally when the session's
    /// consent scope does not permit the tool/args — nothing reaches the
    /// wire on a scope violation.
    pub async fn delegate_in_session(
        &self,
        session_id: &str,
        tool: &str,
        args: Value,
    ) -> Result<String, MeshError> {
        let consent = self
            .sessions
            .session_consent(session_id)
            .ok_or_else(|| MeshError::UnknownSession(session_id.to_string()))?;
        if !consent.allows(tool, &args) {
            return Err(MeshError::ScopeDenied { tool: tool.to_string() });
        }
        let payload = SessionPayload::Task { tool: tool.to_string(), args };
        self.sessions
            .send_session(session_id, &serde_json::to_value(&payload)?)
            .await?;
        Ok("Task sent to session peer.".to_string())
    }

    /// Push a piece of text to the session peer.
    pub async fn share_text_in_session(
        &self,
        session_id: &str,
        text: &str,
        source: &str,
    ) -> Result<String, MeshError> {
        let payload = SessionPayload::ShareText {
            text: text.to_string(),
            source: source.to_string(),
        };
        self.sessions
            .send_session(session_id, &serde_json::to_value(&payload)?)
            .await?;
        Ok("Shared with session peer.".to_string())
    }
}

#[async_trait]
impl PeerClient for SessionTools {
    async fn delegate(&self, session_id: &str, tool: &str, args: Value) -> anyhow::Result<String> {
        Ok(self.delegate_in_session(session_id, tool, args).await?)
    }

    async fn share_text(
        &self,
        session_id: &str,
        text: &str,
        source: &str,
    ) -> anyhow::Result<String> {
        Ok(self.share_text_in_session(session_id, text, source).await?)
    }
}
