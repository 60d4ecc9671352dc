//! Database access for the tagging engine

pub mod calibrations;

use sonotag_common::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Initialize the engine database: open the pool and create engine
/// tables if they don't exist.
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    let pool = sonotag_common::db::init_database_pool(db_path).await?;
    init_tables(&pool).await?;
    Ok(pool)
}

/// Create engine-specific tables
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS calibrations (
            model_key TEXT NOT NULL,
            head_name TEXT NOT NULL,
            label TEXT NOT NULL,
            calibration_def_hash TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            hist_lo REAL NOT NULL,
            hist_hi REAL NOT NULL,
            hist_bins INTEGER NOT NULL,
            hist_bin_width REAL NOT NULL,
            p5 REAL NOT NULL,
            p95 REAL NOT NULL,
            n INTEGER NOT NULL,
            underflow_count INTEGER NOT NULL DEFAULT 0,
            overflow_count INTEGER NOT NULL DEFAULT 0,
            histogram_bins TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (model_key, head_name, label)
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::debug!("Engine tables initialized (calibrations)");
    Ok(())
}
