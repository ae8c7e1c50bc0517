//! Relay protocol messages — what the nexus sees.
//!
//! The nexus forwards envelopes by `to`, stamps `from` on delivery, and
//! fans out presence (`peer_update`) and key announcements (`pubkey`). It
//! cannot read envelope contents: `ciphertext` is an authenticated peer-box
//! output and `nonce` is fresh per envelope.

use serde::{Deserialize, Serialize};

/// Wire envelope `type` values handled by the core. Anything else is passed
/// to user-registered handlers, or dropped.
pub mod msg_type {
    pub const PUBKEY: &str = "pubkey";
    pub const PEER_UPDATE: &str = "peer_update";
    pub const KAIROS_INVITE: &str = "kairos_invite";
    pub const KAIROS_ACCEPT: &str = "kairos_accept";
    pub const KAIROS_REJECT: &str = "kairos_reject";
    pub const KAIROS_SESSION_MSG: &str = "kairos_session_msg";
    pub const CRDT_OPS: &str = "crdt_ops";
}

/// Encrypted envelope routed peer-to-peer through the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Recipient peer id — the only routing information the relay needs.
    pub to: String,

    #[serde(rename = "type")]
    pub msg_type: String,

    /// 24-byte nonce, base64, fresh per envelope.
    pub nonce: String,

    /// Peer-box ciphertext, base64.
    pub ciphertext: String,

    /// Sender's X25519 public key, base64. The recipient decrypts against
    /// this; it is NOT an identity claim by itself.
    pub sender_pub: String,

    /// Stamped by the relay before delivery; absent on send.
    /// The core trusts the relay to stamp it correctly — a stricter
    /// deployment would bind `from` to `sender_pub` with a signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

/// Announcement sent right after connecting: our X25519 public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubkeyAnnounce {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub pubkey: String,
}

impl PubkeyAnnounce {
    pub fn new(pubkey_b64: impl Into<String>) -> Self {
        Self { msg_type: msg_type::PUBKEY.into(), pubkey: pubkey_b64.into() }
    }
}

/// Relay-fanned key announcement for some peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerPubkey {
    pub peer: String,
    pub pubkey: String,
}

/// Relay presence update: the full list of currently connected peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerUpdate {
    #[serde(default)]
    pub peers: Vec<String>,
}
