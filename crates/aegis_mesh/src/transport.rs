//! Relay transport — one persistent websocket per node.
//!
//! On connect the node announces its X25519 public key; the relay fans
//! announcements and presence updates to everyone. Everything else on the
//! wire is an [`Envelope`] whose ciphertext only the addressed peer can
//! open. The relay stamps `from` on delivery and is trusted to stamp it
//! correctly; `from` is only ever used to look peers up, never as a
//! cryptographic claim (a stricter deployment would bind it to
//! `sender_pub` with a signature).
//!
//! The listen loop never tears down: malformed messages are dropped and
//! logged, and a closed connection triggers redial after a 3 s pause. The
//! announce-on-dial makes reconnection idempotent. In-flight sends during
//! a disconnect fail with [`MeshError::NotConnected`] and may be retried
//! by the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aegis_crypto::boxes::{generate_nonce, PeerBox, NONCE_LEN};
use aegis_crypto::keys::{b64, b64d, ed25519_to_curve25519};
use aegis_proto::envelope::{msg_type, Envelope, PeerPubkey, PeerUpdate, PubkeyAnnounce};
use ed25519_dalek::SigningKey;
use futures::future::BoxFuture;
use futures::stream::{SplitSink, SplitStream};
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::MeshError;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<Ws, Message>;
type WsStream = SplitStream<Ws>;

/// Type-erased async handler for one envelope `type`.
pub type EnvelopeHandler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;

const RECONNECT_PAUSE: Duration = Duration::from_secs(3);

pub struct Transport {
    peer_id: String,
    nexus: String,
    curve_secret: StaticSecret,
    curve_public_b64: String,
    sink: Mutex<Option<WsSink>>,
    peers: RwLock<Vec<String>>,
    peer_curve_pubs: RwLock<HashMap<String, String>>,
    handlers: RwLock<HashMap<String, EnvelopeHandler>>,
}

impl Transport {
    /// Build a transport for `peer_id` speaking to the relay at
    /// `nexus_url`. The envelope keys are derived from the long-term
    /// signing identity, so contacts who verified the identity implicitly
    /// know which X25519 key to expect.
    pub fn new(
        peer_id: impl Into<String>,
        nexus_url: &str,
        identity: &SigningKey,
    ) -> Result<Arc<Self>, MeshError> {
        let (curve_secret, curve_public) =
            ed25519_to_curve25519(identity, &identity.verifying_key())?;
        Ok(Arc::new(Self {
            peer_id: peer_id.into(),
            nexus: nexus_url.trim_end_matches('/').to_string(),
            curve_secret,
            curve_public_b64: b64(curve_public.as_bytes()),
            sink: Mutex::new(None),
            peers: RwLock::new(Vec::new()),
            peer_curve_pubs: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
        }))
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn curve_public_b64(&self) -> &str {
        &self.curve_public_b64
    }

    /// Currently known peers (self excluded), per the latest relay update.
    pub fn peers(&self) -> Vec<String> {
        self.peers.read().clone()
    }

    /// Announced X25519 public key of a peer, if seen.
    pub fn peer_key(&self, peer_id: &str) -> Option<String> {
        self.peer_curve_pubs.read().get(peer_id).cloned()
    }

    /// Register the handler for an envelope `type`. One handler per type;
    /// re-registering replaces.
    pub fn on<F>(&self, envelope_type: &str, handler: F)
    where
        F: Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .insert(envelope_type.to_string(), Arc::new(handler));
    }

    /// Dial the relay, announce our key, and start the listen loop.
    pub async fn connect(self: &Arc<Self>) -> Result<(), MeshError> {
        let stream = self.dial().await?;
        let transport = Arc::clone(self);
        tokio::spawn(async move { transport.listen(stream).await });
        Ok(())
    }

    async fn dial(&self) -> Result<WsStream, MeshError> {
        let url = format!("{}/ws/{}", self.nexus, self.peer_id);
        let (ws, _response) = connect_async(url.as_str()).await?;
        let (mut sink, stream) = ws.split();
        let announce = PubkeyAnnounce::new(self.curve_public_b64.clone());
        sink.send(Message::Text(serde_json::to_string(&announce)?)).await?;
        *self.sink.lock().await = Some(sink);
        Ok(stream)
    }

    async fn listen(self: Arc<Self>, mut stream: WsStream) {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => self.dispatch(&text).await,
                Some(Ok(Message::Close(_))) | None => {
                    stream = self.reconnect().await;
                }
                Some(Ok(_)) => {} // binary/ping/pong: nothing to do
                Some(Err(e)) => {
                    warn!(error = %e, "relay stream error");
                    stream = self.reconnect().await;
                }
            }
        }
    }

    async fn reconnect(&self) -> WsStream {
        *self.sink.lock().await = None;
        loop {
            tokio::time::sleep(RECONNECT_PAUSE).await;
            match self.dial().await {
                Ok(stream) => {
                    debug!(peer_id = %self.peer_id, "reconnected to relay");
                    return stream;
                }
                Err(e) => warn!(error = %e, "relay redial failed"),
            }
        }
    }

    async fn dispatch(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "undecodable relay message dropped");
                return;
            }
        };
        let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_string) else {
            debug!("relay message without type dropped");
            return;
        };
        match kind.as_str() {
            msg_type::PEER_UPDATE => {
                if let Ok(update) = serde_json::from_value::<PeerUpdate>(value) {
                    let mut peers = update.peers;
                    peers.retain(|p| p != &self.peer_id);
                    *self.peers.write() = peers;
                }
            }
            msg_type::PUBKEY => {
                if let Ok(announce) = serde_json::from_value::<PeerPubkey>(value) {
                    self.peer_curve_pubs
                        .write()
                        .insert(announce.peer, announce.pubkey);
                }
            }
            other => {
                let handler = self.handlers.read().get(other).cloned();
                match handler {
                    Some(handler) => match serde_json::from_value::<Envelope>(value) {
                        Ok(envelope) => {
                            // Nothing a handler does may tear down the
                            // listen loop.
                            let guarded =
                                std::panic::AssertUnwindSafe(handler(envelope)).catch_unwind();
                            if guarded.await.is_err() {
                                warn!(kind = other, "envelope handler panicked");
                            }
                        }
                        Err(e) => debug!(kind = other, error = %e, "malformed envelope dropped"),
                    },
                    None => debug!(kind = other, "unhandled message type dropped"),
                }
            }
        }
    }

    /// Encrypt `payload` for `to` and ship it as an envelope.
    pub async fn send_encrypted(
        &self,
        to: &str,
        envelope_type: &str,
        payload: &Value,
    ) -> Result<(), MeshError> {
        if self.sink.lock().await.is_none() {
            return Err(MeshError::NotConnected);
        }
        let their_pub = self
            .peer_key(to)
            .ok_or_else(|| MeshError::UnknownPeerKey(to.to_string()))
            .and_then(|b| parse_x25519_pub(&b))?;

        let peer_box = PeerBox::new(&self.curve_secret, &their_pub)?;
        let nonce = generate_nonce();
        let ciphertext = peer_box.seal(&nonce, &serde_json::to_vec(payload)?)?;
        let envelope = Envelope {
            to: to.to_string(),
            msg_type: envelope_type.to_string(),
            nonce: b64(&nonce),
            ciphertext: b64(&ciphertext),
            sender_pub: self.curve_public_b64.clone(),
            from: None,
        };
        let text = serde_json::to_string(&envelope)?;

        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(MeshError::NotConnected)?;
        sink.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Open a peer-box envelope. `None` on ANY failure — undecodable input
    /// and authentication failure are indistinguishable to callers, so a
    /// sender probing us learns nothing.
    pub fn decrypt_from(&self, sender_pub: &str, nonce: &str, ciphertext: &str) -> Option<Value> {
        let their_pub = parse_x25519_pub(sender_pub).ok()?;
        let peer_box = PeerBox::new(&self.curve_secret, &their_pub).ok()?;
        let nonce: [u8; NONCE_LEN] = b64d(nonce).ok()?.try_into().ok()?;
        let plaintext = peer_box.open(&nonce, &b64d(ciphertext).ok()?).ok()?;
        serde_json::from_slice(&plaintext).ok()
    }

    pub fn decrypt_envelope(&self, envelope: &Envelope) -> Option<Value> {
        self.decrypt_from(&envelope.sender_pub, &envelope.nonce, &envelope.ciphertext)
    }
}

fn parse_x25519_pub(b64_key: &str) -> Result<X25519Public, MeshError> {
    let bytes: [u8; 32] = b64d(b64_key)?
        .try_into()
        .map_err(|_| MeshError::Crypto(aegis_crypto::CryptoError::InvalidKey(
            "expected 32-byte X25519 key".into(),
        )))?;
    Ok(X25519Public::from(bytes))
}
