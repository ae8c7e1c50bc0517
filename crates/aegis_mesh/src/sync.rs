//! Graph sync — broadcast locally applied relation ops, absorb remote ones.
//!
//! Best-effort on both sides: a send failure to one peer is logged and the
//! rest of the fan-out continues; a malformed inbound op is skipped without
//! touching its siblings. Correctness never depends on delivery — the LWW
//! merge makes replays and reorderings harmless.

use std::sync::Arc;

use aegis_proto::envelope::{msg_type, Envelope};
use aegis_proto::ops::{CrdtOp, OpsBatch};
use aegis_store::RelationGraph;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::transport::Transport;

pub struct SyncService {
    graph: Arc<RelationGraph>,
    transport: Arc<Transport>,
}

impl SyncService {
    /// Build the service and register it for `crdt_ops` envelopes.
    pub fn install(graph: Arc<RelationGraph>, transport: Arc<Transport>) -> Arc<Self> {
        let service = Arc::new(Self { graph, transport: Arc::clone(&transport) });
        let hooked = Arc::clone(&service);
        transport.on(msg_type::CRDT_OPS, move |envelope| {
            let service = Arc::clone(&hooked);
            async move { service.on_ops(envelope).await }.boxed()
        });
        service
    }

    /// Send a batch of upserts to every currently known peer, once each.
    pub async fn broadcast_relations(&self, relations: &[(String, String, String, f64)]) {
        if relations.is_empty() {
            return;
        }
        let ops: Vec<CrdtOp> = relations
            .iter()
            .map(|(src, rel, dst, ts)| CrdtOp::UpsertRelation {
                src: src.clone(),
                rel: rel.clone(),
                dst: dst.clone(),
                ts: *ts,
            })
            .collect();
        let payload = match serde_json::to_value(OpsBatch::from_ops(&ops)) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "ops batch serialisation failed");
                return;
            }
        };
        for peer in self.transport.peers() {
            if let Err(e) = self
                .transport
                .send_encrypted(&peer, msg_type::CRDT_OPS, &payload)
                .await
            {
                warn!(peer, error = %e, "crdt broadcast to peer failed");
            }
        }
    }

    async fn on_ops(&self, envelope: Envelope) {
        let Some(payload) = self.transport.decrypt_envelope(&envelope) else {
            debug!("undecryptable crdt_ops envelope dropped");
            return;
        };
        let Ok(batch) = serde_json::from_value::<OpsBatch>(payload) else {
            debug!("malformed crdt_ops batch dropped");
            return;
        };
        for op in &batch.ops {
            // apply_op logs and returns false for malformed members.
            self.graph.apply_op(op).await;
        }
    }
}
