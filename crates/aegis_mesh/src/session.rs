//! Kairos — consent-gated, forward-secret sessions over relay envelopes.
//!
//! Three-message handshake, all carried as ordinary encrypted envelopes:
//!
//! ```text
//! initiator                                   responder
//!   | -- kairos_invite {sid, consent, eph_pub} -> |  trusted? verify? approve?
//!   | <- kairos_accept {sid, eph_pub} ----------- |  (session installed first)
//!   |          or kairos_reject {sid}             |
//! ```
//!
//! The session box is derived ONLY from the two ephemeral X25519 halves;
//! the long-term identities sign the consent token and protect the
//! handshake envelopes but never the session payloads. Both ephemeral
//! secrets are consumed while deriving the box, so once the handshake ends
//! nothing on either machine can re-derive the session key.
//!
//! Note the asymmetry: the handshake envelopes themselves ride under the
//! long-term-derived peer box, so they do not get forward secrecy — only
//! session payloads do.
//!
//! Authorization failures send `kairos_reject` with no reason attached;
//! undecodable handshake messages are dropped without any reply so a
//! probing sender cannot distinguish "bad key" from "not trusted".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aegis_crypto::boxes::{generate_nonce, SessionBox, NONCE_LEN};
use aegis_crypto::hash::sha256_hex;
use aegis_crypto::keys::{b64, b64d, verify_key_from_b64};
use aegis_crypto::ConsentToken;
use aegis_proto::envelope::{msg_type, Envelope};
use aegis_proto::kairos::{AcceptPayload, InvitePayload, RejectPayload, SessionMsg};
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::MeshError;
use crate::transport::Transport;

const INVITE_TIMEOUT: Duration = Duration::from_secs(60);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_CONSENT_TTL_SEC: i64 = 600;

/// Async trust lookup: the base64 verify key of a peer, ONLY if the peer
/// is trusted. Untrusted peers are invisible to the session layer.
#[async_trait]
pub trait VerifyKeyLookup: Send + Sync {
    async fn verify_key(&self, peer_id: &str) -> Option<String>;
}

#[async_trait]
impl VerifyKeyLookup for aegis_store::ContactBook {
    async fn verify_key(&self, peer_id: &str) -> Option<String> {
        match self.get_verify_key(peer_id).await {
            Ok(key) => key,
            Err(e) => {
                warn!(peer_id, error = %e, "contact lookup failed");
                None
            }
        }
    }
}

/// User approval hook: `(peer_id, session_id, consent) → approve?`. May
/// suspend for user I/O; a timeout in the embedder counts as rejection.
pub type ConsentHook =
    Arc<dyn Fn(String, String, ConsentToken) -> BoxFuture<'static, bool> + Send + Sync>;

/// Per-message hook for decrypted session payloads.
pub type SessionMessageHook =
    Arc<dyn Fn(String, Value) -> BoxFuture<'static, ()> + Send + Sync>;

struct Session {
    peer_id: String,
    session_box: Arc<SessionBox>,
    consent: ConsentToken,
    created_at: i64,
}

struct PendingInvite {
    tx: oneshot::Sender<bool>,
    eph_secret: StaticSecret,
    consent: ConsentToken,
}

pub struct SessionManager {
    transport: Arc<Transport>,
    signing_key: SigningKey,
    contacts: Arc<dyn VerifyKeyLookup>,
    max_age_sec: i64,
    sessions: Mutex<HashMap<String, Session>>,
    pending: Mutex<HashMap<String, PendingInvite>>,
    on_consent_request: RwLock<Option<ConsentHook>>,
    on_session_message: RwLock<Option<SessionMessageHook>>,
}

impl SessionManager {
    /// Build the manager and register its four envelope handlers on the
    /// transport. The transport keeps no reference back — handlers are
    /// type-erased closures holding a weak-free Arc clone of the manager.
    pub fn new(
        transport: Arc<Transport>,
        signing_key: SigningKey,
        contacts: Arc<dyn VerifyKeyLookup>,
        max_age_sec: i64,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            transport,
            signing_key,
            contacts,
            max_age_sec,
            sessions: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            on_consent_request: RwLock::new(None),
            on_session_message: RwLock::new(None),
        });
        manager.install_handlers();
        manager
    }

    fn install_handlers(self: &Arc<Self>) {
        let m = Arc::clone(self);
        self.transport.on(msg_type::KAIROS_INVITE, move |env| {
            let m = Arc::clone(&m);
            async move { m.on_invite(env).await }.boxed()
        });
        let m = Arc::clone(self);
        self.transport.on(msg_type::KAIROS_ACCEPT, move |env| {
            let m = Arc::clone(&m);
            async move { m.on_accept(env).await }.boxed()
        });
        let m = Arc::clone(self);
        self.transport.on(msg_type::KAIROS_REJECT, move |env| {
            let m = Arc::clone(&m);
            async move { m.on_reject(env).await }.boxed()
        });
        let m = Arc::clone(self);
        self.transport.on(msg_type::KAIROS_SESSION_MSG, move |env| {
            let m = Arc::clone(&m);
            async move { m.on_session_msg(env).await }.boxed()
        });
    }

    pub fn set_on_consent_request(&self, hook: ConsentHook) {
        *self.on_consent_request.write() = Some(hook);
    }

    pub fn set_on_session_message(&self, hook: SessionMessageHook) {
        *self.on_session_message.write() = Some(hook);
    }

    // ── Introspection ────────────────────────────────────────────────────

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    pub fn session_peer(&self, session_id: &str) -> Option<String> {
        self.sessions.lock().get(session_id).map(|s| s.peer_id.clone())
    }

    /// The consent token attached to a session — the initiator's own signed
    /// token on both sides. Delegating callers check `allows` against this
    /// before sending.
    pub fn session_consent(&self, session_id: &str) -> Option<ConsentToken> {
        self.sessions.lock().get(session_id).map(|s| s.consent.clone())
    }

    // ── Initiator side ───────────────────────────────────────────────────

    /// Open a session with `peer_id`: sign a consent token over the
    /// redacted context, send the invite, and wait up to 60 s for the
    /// peer's answer.
    pub async fn initiate(
        &self,
        peer_id: &str,
        redacted_context: &str,
        scope: Value,
        ttl_sec: Option<i64>,
    ) -> Result<String, MeshError> {
        let session_id = self.fresh_session_id();
        let ttl = ttl_sec.unwrap_or(DEFAULT_CONSENT_TTL_SEC);
        let token = ConsentToken::new(
            session_id.clone(),
            self.transport.peer_id(),
            peer_id,
            scope,
            sha256_hex(redacted_context),
            chrono::Utc::now().timestamp() + ttl,
        );
        let consent = token.sign(&self.signing_key)?;

        let eph_secret = StaticSecret::random_from_rng(OsRng);
        let eph_pub = X25519Public::from(&eph_secret);
        let invite = InvitePayload {
            session_id: session_id.clone(),
            consent: consent.clone(),
            eph_pub: b64(eph_pub.as_bytes()),
        };

        // Register the pending entry before the invite leaves, so even an
        // instant accept finds it. An id reused over an older pending entry
        // replaces it; the replaced future reads as rejected.
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(session_id.clone(), PendingInvite { tx, eph_secret, consent });

        if let Err(e) = self
            .transport
            .send_encrypted(peer_id, msg_type::KAIROS_INVITE, &serde_json::to_value(&invite)?)
            .await
        {
            self.pending.lock().remove(&session_id);
            return Err(e);
        }

        match tokio::time::timeout(INVITE_TIMEOUT, rx).await {
            Ok(Ok(true)) => Ok(session_id),
            Ok(Ok(false)) | Ok(Err(_)) => {
                self.pending.lock().remove(&session_id);
                Err(MeshError::InviteRejected)
            }
            Err(_elapsed) => {
                self.pending.lock().remove(&session_id);
                Err(MeshError::InviteTimeout)
            }
        }
    }

    /// `ses-` + 8 hex chars, re-drawn while it collides with a live
    /// session or pending invite.
    fn fresh_session_id(&self) -> String {
        loop {
            let candidate = format!("ses-{}", &Uuid::new_v4().simple().to_string()[..8]);
            let taken = self.sessions.lock().contains_key(&candidate)
                || self.pending.lock().contains_key(&candidate);
            if !taken {
                return candidate;
            }
        }
    }

    async fn on_accept(&self, envelope: Envelope) {
        let Some(from) = envelope.from.clone() else { return };
        let Some(payload) = self.transport.decrypt_envelope(&envelope) else { return };
        let Ok(accept) = serde_json::from_value::<AcceptPayload>(payload) else {
            debug!("malformed accept payload dropped");
            return;
        };

        let Some(pending) = self.pending.lock().remove(&accept.session_id) else {
            debug!(session_id = %accept.session_id, "accept for unknown invite dropped");
            return;
        };
        let PendingInvite { tx, eph_secret, consent } = pending;

        let Some(their_eph) = parse_x25519(&accept.eph_pub) else {
            let _ = tx.send(false);
            return;
        };
        let session_box = match SessionBox::new(eph_secret, &their_eph) {
            Ok(sbox) => sbox,
            Err(e) => {
                debug!(error = %e, "session key agreement failed");
                let _ = tx.send(false);
                return;
            }
        };

        self.sessions.lock().insert(
            accept.session_id.clone(),
            Session {
                peer_id: from,
                session_box: Arc::new(session_box),
                consent,
                created_at: chrono::Utc::now().timestamp(),
            },
        );
        info!(session_id = %accept.session_id, "session established (initiator)");
        let _ = tx.send(true);
    }

    async fn on_reject(&self, envelope: Envelope) {
        let Some(payload) = self.transport.decrypt_envelope(&envelope) else { return };
        let Ok(reject) = serde_json::from_value::<RejectPayload>(payload) else { return };
        if let Some(pending) = self.pending.lock().remove(&reject.session_id) {
            let _ = pending.tx.send(false);
        }
    }

    // ── Responder side ───────────────────────────────────────────────────

    async fn on_invite(&self, envelope: Envelope) {
        let Some(from) = envelope.from.clone() else { return };
        let Some(payload) = self.transport.decrypt_envelope(&envelope) else { return };
        let Ok(invite) = serde_json::from_value::<InvitePayload>(payload) else {
            debug!("malformed invite payload dropped");
            return;
        };

        // Acceptance checks, in order, short-circuiting on first failure.
        let Some(vk_b64) = self.contacts.verify_key(&from).await else {
            debug!(peer_id = %from, "invite from untrusted peer rejected");
            self.send_reject(&from, &invite.session_id).await;
            return;
        };
        let Ok(vk) = verify_key_from_b64(&vk_b64) else {
            warn!(peer_id = %from, "stored verify key unparseable");
            self.send_reject(&from, &invite.session_id).await;
            return;
        };
        if !invite.consent.verify(&vk) {
            debug!(peer_id = %from, session_id = %invite.session_id, "consent token failed verification");
            self.send_reject(&from, &invite.session_id).await;
            return;
        }
        let consent_hook = self.on_consent_request.read().clone();
        let approved = match consent_hook {
            // A hook that panics counts as a rejection.
            Some(hook) => std::panic::AssertUnwindSafe(hook(
                from.clone(),
                invite.session_id.clone(),
                invite.consent.clone(),
            ))
            .catch_unwind()
            .await
            .unwrap_or(false),
            None => true,
        };
        if !approved {
            self.send_reject(&from, &invite.session_id).await;
            return;
        }

        let Some(their_eph) = parse_x25519(&invite.eph_pub) else {
            debug!("invite with malformed ephemeral key dropped");
            return;
        };
        let eph_secret = StaticSecret::random_from_rng(OsRng);
        let eph_pub = X25519Public::from(&eph_secret);
        let session_box = match SessionBox::new(eph_secret, &their_eph) {
            Ok(sbox) => sbox,
            Err(e) => {
                debug!(error = %e, "session key agreement failed");
                return;
            }
        };

        // Install before answering so a fast first message cannot race the
        // accept on our side.
        self.sessions.lock().insert(
            invite.session_id.clone(),
            Session {
                peer_id: from.clone(),
                session_box: Arc::new(session_box),
                consent: invite.consent,
                created_at: chrono::Utc::now().timestamp(),
            },
        );
        let accept = AcceptPayload {
            session_id: invite.session_id.clone(),
            eph_pub: b64(eph_pub.as_bytes()),
        };
        match serde_json::to_value(&accept) {
            Ok(value) => {
                if let Err(e) = self
                    .transport
                    .send_encrypted(&from, msg_type::KAIROS_ACCEPT, &value)
                    .await
                {
                    warn!(error = %e, "failed to send accept; session will age out");
                }
            }
            Err(e) => warn!(error = %e, "accept payload serialisation failed"),
        }
        info!(session_id = %invite.session_id, peer_id = %from, "session established (responder)");
    }

    async fn send_reject(&self, peer_id: &str, session_id: &str) {
        let payload = RejectPayload { session_id: session_id.to_string() };
        match serde_json::to_value(&payload) {
            Ok(value) => {
                if let Err(e) = self
                    .transport
                    .send_encrypted(peer_id, msg_type::KAIROS_REJECT, &value)
                    .await
                {
                    debug!(error = %e, "failed to send reject");
                }
            }
            Err(e) => debug!(error = %e, "reject payload serialisation failed"),
        }
    }

    // ── Session messages ─────────────────────────────────────────────────

    /// Encrypt `payload` under the session box and ship it.
    pub async fn send_session(&self, session_id: &str, payload: &Value) -> Result<(), MeshError> {
        let (peer_id, session_box) = {
            let sessions = self.sessions.lock();
            let session = sessions
                .get(session_id)
                .ok_or_else(|| MeshError::UnknownSession(session_id.to_string()))?;
            (session.peer_id.clone(), Arc::clone(&session.session_box))
        };
        let nonce = generate_nonce();
        let ciphertext = session_box.seal(&nonce, &serde_json::to_vec(payload)?)?;
        let msg = SessionMsg {
            session_id: session_id.to_string(),
            nonce_s: b64(&nonce),
            ciphertext_s: b64(&ciphertext),
        };
        self.transport
            .send_encrypted(&peer_id, msg_type::KAIROS_SESSION_MSG, &serde_json::to_value(&msg)?)
            .await
    }

    async fn on_session_msg(&self, envelope: Envelope) {
        let Some(payload) = self.transport.decrypt_envelope(&envelope) else { return };
        let Ok(msg) = serde_json::from_value::<SessionMsg>(payload) else { return };

        let session_box = {
            let sessions = self.sessions.lock();
            match sessions.get(&msg.session_id) {
                Some(session) => Arc::clone(&session.session_box),
                None => {
                    debug!(session_id = %msg.session_id, "message for unknown session dropped");
                    return;
                }
            }
        };
        let Ok(nonce_bytes) = b64d(&msg.nonce_s) else { return };
        let Ok(nonce) = <[u8; NONCE_LEN]>::try_from(nonce_bytes.as_slice()) else { return };
        let Ok(ct) = b64d(&msg.ciphertext_s) else { return };
        let Ok(plaintext) = session_box.open(&nonce, &ct) else {
            debug!(session_id = %msg.session_id, "session message failed authentication");
            return;
        };
        let Ok(inner) = serde_json::from_slice::<Value>(&plaintext) else { return };

        let hook = self.on_session_message.read().clone();
        if let Some(hook) = hook {
            let session_id = msg.session_id.clone();
            let guarded = std::panic::AssertUnwindSafe(hook(msg.session_id, inner)).catch_unwind();
            if guarded.await.is_err() {
                warn!(session_id, "session message hook panicked");
            }
        }
    }

    // ── Maintenance ──────────────────────────────────────────────────────

    /// Drop sessions older than `max_age_sec`. Pending invites are not
    /// swept here — they cancel themselves through the 60 s invite timeout.
    pub fn evict_stale(&self) {
        let now = chrono::Utc::now().timestamp();
        let max_age = self.max_age_sec;
        let mut sessions = self.sessions.lock();
        sessions.retain(|session_id, session| {
            let keep = now - session.created_at <= max_age;
            if !keep {
                info!(session_id = %session_id, "session evicted");
            }
            keep
        });
    }

    /// Background sweep, every 60 s. The task runs until aborted.
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                manager.evict_stale();
            }
        })
    }
}

fn parse_x25519(b64_key: &str) -> Option<X25519Public> {
    let bytes: [u8; 32] = b64d(b64_key).ok()?.try_into().ok()?;
    Some(X25519Public::from(bytes))
}
