//! Shared SQLite pool initialization

use crate::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Initialize a SQLite connection pool, creating the database file and
/// its parent directory if missing.
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // mode=rwc: read, write, create
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;
    Ok(pool)
}

/// In-memory pool for tests.
///
/// Capped at one connection: every pooled connection to `:memory:`
/// would otherwise open its own empty database.
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    Ok(pool)
}
