//! Contact book — peer identities and trust status.
//!
//! A contact starts `pending` and becomes `trusted` only through an
//! explicit user action (after out-of-band fingerprint comparison). The
//! session layer consults `get_verify_key`, which answers ONLY for trusted
//! contacts; pending peers are invisible to it by construction.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::{db, error::StoreError};

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_TRUSTED: &str = "trusted";

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Contact {
    /// User-facing label; unique per book.
    pub alias: String,
    /// Mesh-wide peer identifier; unique per book.
    pub peer_id: String,
    /// Base64 Ed25519 verify key — MUST NOT change silently once trusted.
    pub verify_key_b64: String,
    pub status: String,
}

/// Cheap to clone (pool is Arc internally).
#[derive(Clone)]
pub struct ContactBook {
    pool: SqlitePool,
}

impl ContactBook {
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let pool = db::open_pool(db_path).await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS contacts(
                alias TEXT PRIMARY KEY,
                peer_id TEXT UNIQUE,
                verify_key_b64 TEXT,
                status TEXT DEFAULT 'pending')",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    /// Record a new contact as pending. A duplicate alias or peer id is a
    /// no-op — first write wins, matching the admin flow where re-adding a
    /// known peer must never downgrade or overwrite its key.
    pub async fn add_pending(
        &self,
        alias: &str,
        peer_id: &str,
        verify_key_b64: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR IGNORE INTO contacts (alias, peer_id, verify_key_b64) VALUES (?, ?, ?)",
        )
        .bind(alias)
        .bind(peer_id)
        .bind(verify_key_b64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a peer trusted after the user verified its fingerprint.
    pub async fn trust_contact(&self, peer_id: &str) -> Result<(), StoreError> {
        let res = sqlx::query("UPDATE contacts SET status = 'trusted' WHERE peer_id = ?")
            .bind(peer_id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("contact {peer_id}")));
        }
        Ok(())
    }

    pub async fn get_trusted_peers(&self) -> Result<Vec<Contact>, StoreError> {
        Ok(sqlx::query_as::<_, Contact>(
            "SELECT alias, peer_id, verify_key_b64, status FROM contacts WHERE status = 'trusted'",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Verify key for a peer, ONLY if that peer is trusted.
    pub async fn get_verify_key(&self, peer_id: &str) -> Result<Option<String>, StoreError> {
        Ok(sqlx::query_scalar::<_, String>(
            "SELECT verify_key_b64 FROM contacts WHERE status = 'trusted' AND peer_id = ?",
        )
        .bind(peer_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Contact row regardless of status — admin/display use only; never
    /// consulted by the session layer.
    pub async fn get_contact(&self, peer_id: &str) -> Result<Option<Contact>, StoreError> {
        Ok(sqlx::query_as::<_, Contact>(
            "SELECT alias, peer_id, verify_key_b64, status FROM contacts WHERE peer_id = ?",
        )
        .bind(peer_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn all_contacts(&self) -> Result<Vec<Contact>, StoreError> {
        Ok(sqlx::query_as::<_, Contact>(
            "SELECT alias, peer_id, verify_key_b64, status FROM contacts ORDER BY alias",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn remove_contact(&self, alias: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM contacts WHERE alias = ?")
            .bind(alias)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn book() -> (tempfile::TempDir, ContactBook) {
        let dir = tempfile::tempdir().unwrap();
        let book = ContactBook::open(&dir.path().join("contacts.db")).await.unwrap();
        (dir, book)
    }

    #[tokio::test]
    async fn pending_contacts_are_invisible_to_verification() {
        let (_dir, book) = book().await;
        book.add_pending("bob", "bob-id", "a2V5").await.unwrap();

        assert!(book.get_verify_key("bob-id").await.unwrap().is_none());
        assert!(book.get_trusted_peers().await.unwrap().is_empty());

        book.trust_contact("bob-id").await.unwrap();
        assert_eq!(book.get_verify_key("bob-id").await.unwrap().as_deref(), Some("a2V5"));
        assert_eq!(book.get_trusted_peers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn re_adding_never_overwrites_key() {
        let (_dir, book) = book().await;
        book.add_pending("bob", "bob-id", "b3JpZ2luYWw=").await.unwrap();
        book.trust_contact("bob-id").await.unwrap();

        // A second add with a different key must not replace the original
        // or reset the trust status.
        book.add_pending("bob", "bob-id", "ZXZpbA==").await.unwrap();
        assert_eq!(
            book.get_verify_key("bob-id").await.unwrap().as_deref(),
            Some("b3JpZ2luYWw=")
        );
    }

    #[tokio::test]
    async fn trusting_unknown_peer_errors() {
        let (_dir, book) = book().await;
        assert!(matches!(
            book.trust_contact("ghost").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unknown_peer_has_no_key() {
        let (_dir, book) = book().await;
        assert!(book.get_verify_key("nobody").await.unwrap().is_none());
    }
}
