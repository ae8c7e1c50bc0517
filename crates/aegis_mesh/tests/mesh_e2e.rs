//! End-to-end mesh scenarios against an in-process relay.
//!
//! The relay here mirrors the production nexus contract: route envelopes by
//! `to`, stamp `from`, fan out `pubkey` announcements and `peer_update`
//! presence, and never look inside a ciphertext.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aegis_crypto::keys::verify_key_b64;
use aegis_mesh::{SessionExec, SessionManager, SessionTools, Transport};
use aegis_proto::config::AssistantConfig;
use aegis_store::{ContactBook, RelationGraph};
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use futures::{FutureExt, SinkExt, StreamExt};
use rand::rngs::OsRng;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

// ── Test relay ───────────────────────────────────────────────────────────

type Clients = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<String>>>>;
type Pubkeys = Arc<Mutex<HashMap<String, String>>>;

async fn spawn_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let clients: Clients = Arc::new(Mutex::new(HashMap::new()));
    let pubkeys: Pubkeys = Arc::new(Mutex::new(HashMap::new()));

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            let clients = clients.clone();
            let pubkeys = pubkeys.clone();
            tokio::spawn(async move {
                let mut path = String::new();
                let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
                    path = req.uri().path().to_string();
                    Ok(resp)
                })
                .await;
                let Ok(ws) = ws else { return };
                let peer_id = path.trim_start_matches("/ws/").to_string();
                let (mut sink, mut stream) = ws.split();

                let (tx, mut rx) = mpsc::unbounded_channel::<String>();
                clients.lock().await.insert(peer_id.clone(), tx);
                broadcast_peer_update(&clients).await;

                let writer = tokio::spawn(async move {
                    while let Some(text) = rx.recv().await {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                });

                while let Some(Ok(msg)) = stream.next().await {
                    let Message::Text(text) = msg else { continue };
                    let Ok(mut value) = serde_json::from_str::<Value>(&text) else { continue };
                    if value.get("type").and_then(Value::as_str) == Some("pubkey") {
                        let Some(pk) = value.get("pubkey").and_then(Value::as_str) else { continue };
                        pubkeys.lock().await.insert(peer_id.clone(), pk.to_string());
                        // Fan the announcement to everyone else, and catch the
                        // announcer up on everyone already known.
                        let known: Vec<(String, String)> = pubkeys
                            .lock()
                            .await
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect();
                        let clients_now = clients.lock().await;
                        for (id, tx) in clients_now.iter() {
                            if id == &peer_id {
                                for (other, other_pk) in &known {
                                    if other != id {
                                        let _ = tx.send(
                                            json!({"type": "pubkey", "peer": other, "pubkey": other_pk})
                                                .to_string(),
                                        );
                                    }
                                }
                            } else {
                                let _ = tx.send(
                                    json!({"type": "pubkey", "peer": peer_id, "pubkey": pk})
                                        .to_string(),
                                );
                            }
                        }
                    } else if let Some(to) = value.get("to").and_then(Value::as_str) {
                        let to = to.to_string();
                        if let Some(obj) = value.as_object_mut() {
                            obj.insert("from".into(), Value::String(peer_id.clone()));
                        }
                        if let Some(tx) = clients.lock().await.get(&to) {
                            let _ = tx.send(value.to_string());
                        }
                    }
                }

                clients.lock().await.remove(&peer_id);
                broadcast_peer_update(&clients).await;
                writer.abort();
            });
        }
    });

    format!("ws://{addr}")
}

async fn broadcast_peer_update(clients: &Clients) {
    let clients = clients.lock().await;
    let peers: Vec<String> = clients.keys().cloned().collect();
    let update = json!({"type": "peer_update", "peers": peers}).to_string();
    for tx in clients.values() {
        let _ = tx.send(update.clone());
    }
}

// ── Node fixture ─────────────────────────────────────────────────────────

struct Node {
    transport: Arc<Transport>,
    sessions: Arc<SessionManager>,
    contacts: ContactBook,
    identity: SigningKey,
    _dir: tempfile::TempDir,
}

async fn spawn_node(peer_id: &str, relay_url: &str) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let identity = SigningKey::generate(&mut OsRng);
    let contacts = ContactBook::open(&dir.path().join("contacts.db")).await.unwrap();
    let transport = Transport::new(peer_id, relay_url, &identity).unwrap();
    let sessions = SessionManager::new(
        Arc::clone(&transport),
        identity.clone(),
        Arc::new(contacts.clone()),
        1800,
    );
    transport.connect().await.unwrap();
    Node { transport, sessions, contacts, identity, _dir: dir }
}

async fn make_mutual_trust(a: &Node, b: &Node) {
    a.contacts
        .add_pending("peer-b", b.transport.peer_id(), &verify_key_b64(&b.identity.verifying_key()))
        .await
        .unwrap();
    a.contacts.trust_contact(b.transport.peer_id()).await.unwrap();
    b.contacts
        .add_pending("peer-a", a.transport.peer_id(), &verify_key_b64(&a.identity.verifying_key()))
        .await
        .unwrap();
    b.contacts.trust_contact(a.transport.peer_id()).await.unwrap();
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn await_discovery(a: &Node, b: &Node) {
    let (a_t, b_t) = (Arc::clone(&a.transport), Arc::clone(&b.transport));
    let (a_id, b_id) = (a_t.peer_id().to_string(), b_t.peer_id().to_string());
    wait_until("mutual key discovery", move || {
        a_t.peer_key(&b_id).is_some() && b_t.peer_key(&a_id).is_some()
    })
    .await;
}

struct StaticKb(&'static str);

#[async_trait]
impl aegis_tools::KnowledgeBase for StaticKb {
    async fn add_document(&self, _text: &str, _source: &str) -> anyhow::Result<usize> {
        Ok(1)
    }
    async fn retrieve_context(&self, _query: &str, _k: usize) -> anyhow::Result<String> {
        Ok(self.0.to_string())
    }
}

/// Capture every decrypted session message a node receives.
fn capture_session_messages(node: &Node) -> mpsc::UnboundedReceiver<(String, Value)> {
    let (tx, rx) = mpsc::unbounded_channel();
    node.sessions.set_on_session_message(Arc::new(move |sid, inner| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((sid, inner));
        }
        .boxed()
    }));
    rx
}

async fn recv_with_timeout(rx: &mut mpsc::UnboundedReceiver<(String, Value)>) -> (String, Value) {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("no session message within 10s")
        .expect("capture channel closed")
}

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_session_and_delegated_kb_query() {
    let relay = spawn_relay().await;
    let alice = spawn_node("alice", &relay).await;
    let bob = spawn_node("bob", &relay).await;
    make_mutual_trust(&alice, &bob).await;
    await_discovery(&alice, &bob).await;

    SessionExec::install(
        Arc::clone(&bob.sessions),
        Arc::new(StaticKb("<kb text>")),
        None,
        AssistantConfig::default(),
    );
    let mut alice_rx = capture_session_messages(&alice);

    let sid = alice
        .sessions
        .initiate("bob", "ctx text", json!({"tools": ["kb_query"], "args": {"max_k": 5}}), Some(600))
        .await
        .unwrap();
    assert!(sid.starts_with("ses-"));
    assert!(alice.sessions.has_session(&sid));
    assert!(bob.sessions.has_session(&sid));
    assert_eq!(bob.sessions.session_peer(&sid).as_deref(), Some("alice"));

    let tools = SessionTools::new(Arc::clone(&alice.sessions));
    let sent = tools
        .delegate_in_session(&sid, "kb_query", json!({"query": "foo", "k": 3}))
        .await
        .unwrap();
    assert_eq!(sent, "Task sent to session peer.");

    let (reply_sid, reply) = recv_with_timeout(&mut alice_rx).await;
    assert_eq!(reply_sid, sid);
    assert_eq!(reply, json!({"type": "result", "result": "<kb text>"}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scope_violating_delegation_is_refused_before_send() {
    let relay = spawn_relay().await;
    let alice = spawn_node("alice", &relay).await;
    let bob = spawn_node("bob", &relay).await;
    make_mutual_trust(&alice, &bob).await;
    await_discovery(&alice, &bob).await;

    SessionExec::install(
        Arc::clone(&bob.sessions),
        Arc::new(StaticKb("<kb text>")),
        None,
        AssistantConfig::default(),
    );
    let mut alice_rx = capture_session_messages(&alice);

    let sid = alice
        .sessions
        .initiate("bob", "ctx", json!({"tools": ["kb_query"]}), Some(600))
        .await
        .unwrap();

    let tools = SessionTools::new(Arc::clone(&alice.sessions));
    let err = tools
        .delegate_in_session(&sid, "search_web", json!({"query": "secrets"}))
        .await
        .unwrap_err();
    assert!(matches!(err, aegis_mesh::MeshError::ScopeDenied { .. }));

    // The k bound is enforced the same way.
    let err = tools
        .delegate_in_session(&sid, "kb_query", json!({"query": "x", "k": 99}))
        .await
        .unwrap_err();
    assert!(matches!(err, aegis_mesh::MeshError::ScopeDenied { .. }));

    // A peer pushing a task outside the executor's hard allow-list gets an
    // in-band denial even though the session itself is healthy.
    alice
        .sessions
        .send_session(&sid, &json!({"type": "task", "tool": "calc", "args": {"expr": "1+1"}}))
        .await
        .unwrap();
    let (_, reply) = recv_with_timeout(&mut alice_rx).await;
    assert_eq!(reply, json!({"type": "result", "error": "tool not allowed"}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn untrusted_peer_invite_is_rejected_without_session() {
    let relay = spawn_relay().await;
    let bob = spawn_node("bob", &relay).await;
    let carol = spawn_node("carol", &relay).await;
    // Carol knows and trusts Bob; Bob has never heard of Carol. Her invite
    // is signed with her real key — trust, not signatures, is what fails.
    carol
        .contacts
        .add_pending("bob", "bob", &verify_key_b64(&bob.identity.verifying_key()))
        .await
        .unwrap();
    carol.contacts.trust_contact("bob").await.unwrap();
    await_discovery(&bob, &carol).await;

    let err = carol
        .sessions
        .initiate("bob", "ctx", json!({}), Some(600))
        .await
        .unwrap_err();
    assert!(matches!(err, aegis_mesh::MeshError::InviteRejected));
    assert_eq!(bob.sessions.session_count(), 0);
    assert_eq!(carol.sessions.session_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pending_contact_is_as_untrusted_as_a_stranger() {
    let relay = spawn_relay().await;
    let bob = spawn_node("bob", &relay).await;
    let carol = spawn_node("carol", &relay).await;
    // Bob has Carol in the book, but only as pending.
    bob.contacts
        .add_pending("carol", "carol", &verify_key_b64(&carol.identity.verifying_key()))
        .await
        .unwrap();
    carol
        .contacts
        .add_pending("bob", "bob", &verify_key_b64(&bob.identity.verifying_key()))
        .await
        .unwrap();
    carol.contacts.trust_contact("bob").await.unwrap();
    await_discovery(&bob, &carol).await;

    let err = carol
        .sessions
        .initiate("bob", "ctx", json!({}), Some(600))
        .await
        .unwrap_err();
    assert!(matches!(err, aegis_mesh::MeshError::InviteRejected));
    assert_eq!(bob.sessions.session_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crdt_ops_converge_across_two_nodes() {
    let relay = spawn_relay().await;
    let alice = spawn_node("alice", &relay).await;
    let bob = spawn_node("bob", &relay).await;
    await_discovery(&alice, &bob).await;

    let alice_dir = tempfile::tempdir().unwrap();
    let bob_dir = tempfile::tempdir().unwrap();
    let alice_graph =
        Arc::new(RelationGraph::open(&alice_dir.path().join("graph.db")).await.unwrap());
    let bob_graph = Arc::new(RelationGraph::open(&bob_dir.path().join("graph.db")).await.unwrap());

    let alice_sync =
        aegis_mesh::SyncService::install(Arc::clone(&alice_graph), Arc::clone(&alice.transport));
    let _bob_sync =
        aegis_mesh::SyncService::install(Arc::clone(&bob_graph), Arc::clone(&bob.transport));

    // Out-of-order timestamps; the max must win everywhere.
    let batch = vec![
        ("x".to_string(), "r".to_string(), "y".to_string(), 3.0),
        ("x".to_string(), "r".to_string(), "y".to_string(), 1.0),
        ("x".to_string(), "r".to_string(), "y".to_string(), 2.0),
    ];
    for (src, rel, dst, ts) in &batch {
        alice_graph.upsert(src, rel, dst, Some(*ts)).await.unwrap();
    }
    alice_sync.broadcast_relations(&batch).await;

    let bob_graph_poll = Arc::clone(&bob_graph);
    for _ in 0..200 {
        if bob_graph_poll.ts_of("x", "r", "y").await == Some(3.0) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(bob_graph.ts_of("x", "r", "y").await, Some(3.0));
    assert_eq!(alice_graph.ts_of("x", "r", "y").await, Some(3.0));
    assert_eq!(bob_graph.facts_for_prompt(10).await, "x r y");
    assert_eq!(alice_graph.facts_for_prompt(10).await, "x r y");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn session_survives_handshake_then_ages_out() {
    let relay = spawn_relay().await;
    let alice = spawn_node("alice", &relay).await;
    let bob = spawn_node("bob", &relay).await;
    make_mutual_trust(&alice, &bob).await;
    await_discovery(&alice, &bob).await;

    let sid = alice
        .sessions
        .initiate("bob", "ctx", json!({}), Some(600))
        .await
        .unwrap();
    assert!(alice.sessions.has_session(&sid));

    // Eviction with max_age 1800 leaves a fresh session alone.
    alice.sessions.evict_stale();
    assert!(alice.sessions.has_session(&sid));
}
