//! Last-writer-wins relation graph.
//!
//! The convergent replicated state of the mesh: a set of (src, rel, dst)
//! triples, each carrying the wall-clock timestamp of its latest writer.
//! Merge rule: newer `ts` wins; equal `ts` overwrites (idempotent replay).
//! Applying the same multiset of operations in any order, with any
//! duplication, yields the same graph on every node.
//!
//! The in-memory map is authoritative for reads; every accepted write also
//! lands in the `relations` table keyed `"src|rel|dst"` so the graph
//! survives restarts. The map lock is held across the paired DB write so a
//! concurrent writer cannot interleave a stale row between them.

use std::collections::HashMap;
use std::path::Path;

use aegis_proto::CrdtOp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{db, error::StoreError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Relation {
    pub src: String,
    pub rel: String,
    pub dst: String,
    /// Wall-clock seconds; fractional part carries sub-second ordering.
    pub ts: f64,
}

type TripleKey = (String, String, String);

pub struct RelationGraph {
    pool: SqlitePool,
    rels: RwLock<HashMap<TripleKey, Relation>>,
}

impl RelationGraph {
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let pool = db::open_pool(db_path).await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS relations(
                key TEXT PRIMARY KEY,
                src TEXT, rel TEXT, dst TEXT, ts REAL)",
        )
        .execute(&pool)
        .await?;

        let mut rels = HashMap::new();
        let rows = sqlx::query("SELECT src, rel, dst, ts FROM relations")
            .fetch_all(&pool)
            .await?;
        for row in rows {
            let relation = Relation {
                src: row.get(0),
                rel: row.get(1),
                dst: row.get(2),
                ts: row.get(3),
            };
            rels.insert(
                (relation.src.clone(), relation.rel.clone(), relation.dst.clone()),
                relation,
            );
        }
        Ok(Self { pool, rels: RwLock::new(rels) })
    }

    fn now_ts() -> f64 {
        chrono::Utc::now().timestamp_micros() as f64 / 1e6
    }

    /// Insert or refresh a triple. `ts` defaults to the current wall clock.
    /// The write is accepted when the triple is new or `ts` is not older
    /// than the stored row; a stale write leaves the graph untouched.
    /// Returns the surviving relation either way.
    pub async fn upsert(
        &self,
        src: &str,
        rel: &str,
        dst: &str,
        ts: Option<f64>,
    ) -> Result<Relation, StoreError> {
        let ts = ts.unwrap_or_else(Self::now_ts);
        let key = (src.to_string(), rel.to_string(), dst.to_string());

        let mut rels = self.rels.write().await;
        if let Some(existing) = rels.get(&key) {
            if ts < existing.ts {
                return Ok(existing.clone());
            }
        }
        let relation = Relation { src: key.0.clone(), rel: key.1.clone(), dst: key.2.clone(), ts };
        sqlx::query(
            "INSERT OR REPLACE INTO relations (key, src, rel, dst, ts) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(format!("{src}|{rel}|{dst}"))
        .bind(src)
        .bind(rel)
        .bind(dst)
        .bind(ts)
        .execute(&self.pool)
        .await?;
        rels.insert(key, relation.clone());
        Ok(relation)
    }

    /// Apply a replicated operation. Returns true when the op was
    /// recognized — including the stale no-op case — and false for unknown
    /// or malformed ops. Nothing else is ever grounds for rejection.
    pub async fn apply_op(&self, op: &Value) -> bool {
        match serde_json::from_value::<CrdtOp>(op.clone()) {
            Ok(CrdtOp::UpsertRelation { src, rel, dst, ts }) => {
                match self.upsert(&src, &rel, &dst, Some(ts)).await {
                    Ok(_) => true,
                    Err(e) => {
                        debug!(error = %e, "relation upsert failed");
                        false
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, "skipping unrecognized graph op");
                false
            }
        }
    }

    /// The `n` most recent triples, rendered one per line, newest first.
    pub async fn facts_for_prompt(&self, n: usize) -> String {
        let rels = self.rels.read().await;
        let mut rows: Vec<&Relation> = rels.values().collect();
        rows.sort_by(|a, b| b.ts.total_cmp(&a.ts));
        rows.truncate(n);
        rows.iter()
            .map(|r| format!("{} {} {}", r.src, r.rel, r.dst))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub async fn len(&self) -> usize {
        self.rels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rels.read().await.is_empty()
    }

    /// Stored timestamp for a triple, if present.
    pub async fn ts_of(&self, src: &str, rel: &str, dst: &str) -> Option<f64> {
        self.rels
            .read()
            .await
            .get(&(src.to_string(), rel.to_string(), dst.to_string()))
            .map(|r| r.ts)
    }
}
