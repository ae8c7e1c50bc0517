//! SQLite pool setup shared by both stores.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};

use crate::error::StoreError;

/// Open (or create) the SQLite database at `db_path`.
///
/// WAL journal mode is configured at connection time; parent directories
/// are created as needed. Callers create their own tables on open — each
/// file holds exactly one table owned by one component.
pub async fn open_pool(db_path: &Path) -> Result<SqlitePool, StoreError> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let opts = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);
    Ok(SqlitePool::connect_with(opts).await?)
}
