//! Replicated-graph operation batches carried in `crdt_ops` envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single graph operation. Internally tagged so unknown `op` values fail
/// to parse — the receiver skips those rather than rejecting the batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CrdtOp {
    UpsertRelation {
        src: String,
        rel: String,
        dst: String,
        ts: f64,
    },
}

/// Batch wrapper: `{"ops": [...]}`. Inbound ops stay raw `Value`s so one
/// malformed element cannot poison its siblings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OpsBatch {
    #[serde(default)]
    pub ops: Vec<Value>,
}

impl OpsBatch {
    pub fn from_ops(ops: &[CrdtOp]) -> Self {
        Self { ops: ops.iter().map(Value::from).collect() }
    }
}

impl From<&CrdtOp> for Value {
    fn from(op: &CrdtOp) -> Value {
        match op {
            CrdtOp::UpsertRelation { src, rel, dst, ts } => serde_json::json!({
                "op": "upsert_relation", "src": src, "rel": rel, "dst": dst, "ts": ts,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn upsert_relation_wire_shape() {
        let op = CrdtOp::UpsertRelation {
            src: "x".into(),
            rel: "r".into(),
            dst: "y".into(),
            ts: 3.0,
        };
        let v = serde_json::to_value(&op).unwrap();
        assert_eq!(v, json!({"op": "upsert_relation", "src": "x", "rel": "r", "dst": "y", "ts": 3.0}));
        assert_eq!(serde_json::from_value::<CrdtOp>(v).unwrap(), op);
    }

    #[test]
    fn unknown_op_fails_to_parse() {
        let v = json!({"op": "delete_everything", "src": "x"});
        assert!(serde_json::from_value::<CrdtOp>(v).is_err());
    }

    #[test]
    fn batch_tolerates_mixed_members() {
        let batch: OpsBatch = serde_json::from_value(json!({
            "ops": [
                {"op": "upsert_relation", "src": "a", "rel": "likes", "dst": "b", "ts": 1.0},
                {"op": "upsert_relation", "src": "a"},
                "garbage",
            ]
        }))
        .unwrap();
        assert_eq!(batch.ops.len(), 3);
        let parsed: Vec<_> = batch
            .ops
            .iter()
            .filter_map(|v| serde_json::from_value::<CrdtOp>(v.clone()).ok())
            .collect();
        assert_eq!(parsed.len(), 1);
    }
}
