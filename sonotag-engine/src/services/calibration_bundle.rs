//! Calibration bundle import/export
//!
//! JSON transport for calibrations:
//! `{"labels": {label: {p5, p95, method, ...}}, "metadata": {...}}`.
//! Bundles move calibrations between deployments; the live serving
//! path never reads them — it reads the persisted calibration store
//! only.

use crate::services::calibration::Calibration;
use serde::{Deserialize, Serialize};
use sonotag_common::{Error, Result};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// One label's calibration inside a bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleEntry {
    pub p5: f64,
    pub p95: f64,
    /// Derivation method, e.g. "histogram-percentile"
    pub method: String,
    /// Forward-compatible extras (sample counts, notes, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl BundleEntry {
    pub fn to_calibration(&self) -> Calibration {
        Calibration {
            p5: self.p5,
            p95: self.p95,
        }
    }
}

/// A calibration bundle file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationBundle {
    pub labels: BTreeMap<String, BundleEntry>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Write a bundle as pretty-printed JSON.
pub fn export_bundle(bundle: &CalibrationBundle, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(bundle)
        .map_err(|e| Error::Internal(format!("serialize bundle: {}", e)))?;
    std::fs::write(path, json)?;
    info!(path = %path.display(), labels = bundle.labels.len(), "Calibration bundle exported");
    Ok(())
}

/// Read a bundle file.
pub fn import_bundle(path: &Path) -> Result<CalibrationBundle> {
    let content = std::fs::read_to_string(path)?;
    let bundle: CalibrationBundle = serde_json::from_str(&content)
        .map_err(|e| Error::Internal(format!("parse bundle {}: {}", path.display(), e)))?;
    info!(path = %path.display(), labels = bundle.labels.len(), "Calibration bundle imported");
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibrations.json");

        let mut bundle = CalibrationBundle::default();
        bundle.labels.insert(
            "happy".to_string(),
            BundleEntry {
                p5: 0.12,
                p95: 0.87,
                method: "histogram-percentile".to_string(),
                extra: BTreeMap::new(),
            },
        );
        bundle
            .metadata
            .insert("model_key".to_string(), serde_json::json!("effnet:mood:1"));

        export_bundle(&bundle, &path).unwrap();
        let loaded = import_bundle(&path).unwrap();

        assert_eq!(loaded.labels.len(), 1);
        let entry = &loaded.labels["happy"];
        assert_eq!(entry.p5, 0.12);
        assert_eq!(entry.p95, 0.87);
        assert_eq!(loaded.metadata["model_key"], "effnet:mood:1");
    }

    #[test]
    fn test_bundle_accepts_unknown_label_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.json");
        std::fs::write(
            &path,
            r#"{"labels": {"sad": {"p5": 0.1, "p95": 0.6, "method": "histogram-percentile", "n": 4821}}, "metadata": {}}"#,
        )
        .unwrap();

        let bundle = import_bundle(&path).unwrap();
        assert_eq!(bundle.labels["sad"].extra["n"], 4821);
        let calib = bundle.labels["sad"].to_calibration();
        assert!(calib.is_valid());
    }

    #[test]
    fn test_import_missing_file_is_io_error() {
        assert!(import_bundle(Path::new("/nonexistent/bundle.json")).is_err());
    }
}
