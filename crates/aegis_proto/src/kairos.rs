//! Kairos session handshake payloads and in-session message shapes.
//!
//! The three handshake messages travel as ordinary encrypted envelopes
//! (peer-box under long-term-derived keys); the payloads here are their
//! decrypted contents. Session messages are encrypted a second time under
//! the ephemeral session box, so the handshake keys never protect session
//! payloads.

use aegis_crypto::ConsentToken;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `kairos_invite` payload (initiator → responder).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvitePayload {
    /// `ses-` followed by 8 hex chars.
    pub session_id: String,
    /// Signed consent token scoping what the initiator may ask for.
    pub consent: ConsentToken,
    /// Initiator's fresh ephemeral X25519 public key, base64.
    pub eph_pub: String,
}

/// `kairos_accept` payload (responder → initiator). The responder has
/// already completed its side of the key agreement before sending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptPayload {
    pub session_id: String,
    pub eph_pub: String,
}

/// `kairos_reject` payload (responder → initiator). Carries no reason —
/// rejections are indistinguishable from one another on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectPayload {
    pub session_id: String,
}

/// `kairos_session_msg` payload: a session-box ciphertext addressed to an
/// established session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMsg {
    pub session_id: String,
    /// 24-byte session-box nonce, base64.
    pub nonce_s: String,
    /// Session-box ciphertext, base64.
    pub ciphertext_s: String,
}

/// Decrypted in-session message shapes the core understands. Messages with
/// other `type` values are handed to the embedder's session-message hook
/// untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionPayload {
    /// Ask the peer to run a tool on our behalf.
    Task {
        tool: String,
        #[serde(default)]
        args: Value,
    },
    /// Reply to a task. Exactly one of `result` / `error` is set.
    Result {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Push a piece of text into the peer's knowledge base.
    ShareText {
        text: String,
        #[serde(default = "default_share_source")]
        source: String,
    },
}

fn default_share_source() -> String {
    "session".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_payload_wire_shape() {
        let msg = SessionPayload::Task {
            tool: "kb_query".into(),
            args: json!({"query": "foo", "k": 3}),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "task");
        assert_eq!(v["tool"], "kb_query");
        assert_eq!(v["args"]["k"], 3);
    }

    #[test]
    fn result_payload_omits_absent_half() {
        let ok = SessionPayload::Result { result: Some("42".into()), error: None };
        let v = serde_json::to_value(&ok).unwrap();
        assert_eq!(v["type"], "result");
        assert!(v.get("error").is_none());

        let denied = SessionPayload::Result { result: None, error: Some("tool not allowed".into()) };
        let v = serde_json::to_value(&denied).unwrap();
        assert_eq!(v["error"], "tool not allowed");
        assert!(v.get("result").is_none());
    }

    #[test]
    fn unknown_inner_type_is_not_a_session_payload() {
        let v = json!({"type": "future_thing", "data": 1});
        assert!(serde_json::from_value::<SessionPayload>(v).is_err());
    }
}
