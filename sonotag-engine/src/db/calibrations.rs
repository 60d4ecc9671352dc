//! Persisted calibration records
//!
//! One record per (model_key, head_name, label). This store is the
//! single source of truth for the live tagging path; bundle files are
//! transport-only and never read here. A new `calibration_def_hash`
//! supersedes the stored record on upsert.

use crate::services::calibration::{
    Calibration, CalibrationSummary, HistogramBin, HistogramSpec,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sonotag_common::{Error, Result};
use sqlx::{Row, SqlitePool};

/// Sparse histogram bin as persisted (JSON array in the record)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StoredBin {
    pub lower_edge: f64,
    pub count: u64,
}

/// Stored percentile calibration for one (model, head, label)
#[derive(Debug, Clone)]
pub struct CalibrationRecord {
    pub model_key: String,
    pub head_name: String,
    pub label: String,
    pub calibration_def_hash: String,
    pub version: i64,
    pub histogram: HistogramSpec,
    pub p5: f64,
    pub p95: f64,
    pub n: i64,
    pub underflow_count: i64,
    pub overflow_count: i64,
    pub bins: Vec<StoredBin>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CalibrationRecord {
    /// Build a record from a freshly generated summary.
    pub fn from_summary(
        model_key: &str,
        head_name: &str,
        label: &str,
        def_hash: &str,
        version: i64,
        spec: HistogramSpec,
        bins: &[HistogramBin],
        summary: &CalibrationSummary,
    ) -> Self {
        let now = Utc::now();
        Self {
            model_key: model_key.to_string(),
            head_name: head_name.to_string(),
            label: label.to_string(),
            calibration_def_hash: def_hash.to_string(),
            version,
            histogram: spec,
            p5: summary.p5,
            p95: summary.p95,
            n: summary.n as i64,
            underflow_count: summary.underflow as i64,
            overflow_count: summary.overflow as i64,
            bins: bins
                .iter()
                .map(|b| StoredBin {
                    lower_edge: b.lower_edge,
                    count: b.count,
                })
                .collect(),
            created_at: now,
            updated_at: now,
        }
    }

    /// The applied form for the live path.
    pub fn calibration(&self) -> Calibration {
        Calibration {
            p5: self.p5,
            p95: self.p95,
        }
    }
}

/// Insert or update the record for this (model_key, head_name, label).
pub async fn save_calibration(pool: &SqlitePool, record: &CalibrationRecord) -> Result<()> {
    let bins_json = serde_json::to_string(&record.bins)
        .map_err(|e| Error::Internal(format!("serialize histogram bins: {}", e)))?;

    sqlx::query(
        r#"
        INSERT INTO calibrations (
            model_key, head_name, label, calibration_def_hash, version,
            hist_lo, hist_hi, hist_bins, hist_bin_width,
            p5, p95, n, underflow_count, overflow_count, histogram_bins,
            created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(model_key, head_name, label) DO UPDATE SET
            calibration_def_hash = excluded.calibration_def_hash,
            version = excluded.version,
            hist_lo = excluded.hist_lo,
            hist_hi = excluded.hist_hi,
            hist_bins = excluded.hist_bins,
            hist_bin_width = excluded.hist_bin_width,
            p5 = excluded.p5,
            p95 = excluded.p95,
            n = excluded.n,
            underflow_count = excluded.underflow_count,
            overflow_count = excluded.overflow_count,
            histogram_bins = excluded.histogram_bins,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&record.model_key)
    .bind(&record.head_name)
    .bind(&record.label)
    .bind(&record.calibration_def_hash)
    .bind(record.version)
    .bind(record.histogram.lo)
    .bind(record.histogram.hi)
    .bind(record.histogram.bins as i64)
    .bind(record.histogram.bin_width())
    .bind(record.p5)
    .bind(record.p95)
    .bind(record.n)
    .bind(record.underflow_count)
    .bind(record.overflow_count)
    .bind(bins_json)
    .bind(record.created_at.to_rfc3339())
    .bind(record.updated_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

/// Load one calibration record.
pub async fn load_calibration(
    pool: &SqlitePool,
    model_key: &str,
    head_name: &str,
    label: &str,
) -> Result<Option<CalibrationRecord>> {
    let row = sqlx::query(
        r#"
        SELECT model_key, head_name, label, calibration_def_hash, version,
               hist_lo, hist_hi, hist_bins, p5, p95, n,
               underflow_count, overflow_count, histogram_bins,
               created_at, updated_at
        FROM calibrations
        WHERE model_key = ? AND head_name = ? AND label = ?
        "#,
    )
    .bind(model_key)
    .bind(head_name)
    .bind(label)
    .fetch_optional(pool)
    .await?;

    row.map(record_from_row).transpose()
}

/// Load every record for one model key.
pub async fn load_calibrations_for_model(
    pool: &SqlitePool,
    model_key: &str,
) -> Result<Vec<CalibrationRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT model_key, head_name, label, calibration_def_hash, version,
               hist_lo, hist_hi, hist_bins, p5, p95, n,
               underflow_count, overflow_count, histogram_bins,
               created_at, updated_at
        FROM calibrations
        WHERE model_key = ?
        ORDER BY head_name, label
        "#,
    )
    .bind(model_key)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(record_from_row).collect()
}

/// Delete records superseded by a newer definition hash.
pub async fn delete_superseded(
    pool: &SqlitePool,
    model_key: &str,
    current_def_hash: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM calibrations WHERE model_key = ? AND calibration_def_hash != ?",
    )
    .bind(model_key)
    .bind(current_def_hash)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

fn record_from_row(row: sqlx::sqlite::SqliteRow) -> Result<CalibrationRecord> {
    let bins_json: String = row.get("histogram_bins");
    let bins: Vec<StoredBin> = serde_json::from_str(&bins_json)
        .map_err(|e| Error::Internal(format!("parse stored histogram bins: {}", e)))?;

    let created_str: String = row.get("created_at");
    let updated_str: String = row.get("updated_at");
    let created_at = DateTime::parse_from_rfc3339(&created_str)
        .map_err(|e| Error::Internal(format!("parse created_at: {}", e)))?
        .with_timezone(&Utc);
    let updated_at = DateTime::parse_from_rfc3339(&updated_str)
        .map_err(|e| Error::Internal(format!("parse updated_at: {}", e)))?
        .with_timezone(&Utc);

    Ok(CalibrationRecord {
        model_key: row.get("model_key"),
        head_name: row.get("head_name"),
        label: row.get("label"),
        calibration_def_hash: row.get("calibration_def_hash"),
        version: row.get("version"),
        histogram: HistogramSpec {
            lo: row.get("hist_lo"),
            hi: row.get("hist_hi"),
            bins: row.get::<i64, _>("hist_bins") as u32,
        },
        p5: row.get("p5"),
        p95: row.get("p95"),
        n: row.get("n"),
        underflow_count: row.get("underflow_count"),
        overflow_count: row.get("overflow_count"),
        bins,
        created_at,
        updated_at,
    })
}
