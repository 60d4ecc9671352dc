//! Model discovery
//!
//! Directory convention:
//!
//! ```text
//! <models_dir>/<backbone>/embeddings/<stem>.{onnx,pb}   (+ <stem>.json)
//! <models_dir>/<backbone>/heads/<type>/<stem>.json      (+ <stem>.{onnx,pb})
//! ```
//!
//! `embedding/` is accepted as a singular alias. Discovery never loads
//! weights; it only pairs sidecars with weight files so warmup can
//! report unloadable entries instead of hiding them.

use super::spec::{self, BackboneModel, HeadModel};
use sonotag_common::Result;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Everything found under a models directory
#[derive(Debug, Default)]
pub struct DiscoveredModels {
    pub backbones: HashMap<String, BackboneModel>,
    pub heads: Vec<HeadModel>,
}

impl DiscoveredModels {
    pub fn head_count(&self) -> usize {
        self.heads.len()
    }

    /// Heads grouped by backbone name, preserving discovery order
    pub fn heads_by_backbone(&self) -> HashMap<&str, Vec<&HeadModel>> {
        let mut grouped: HashMap<&str, Vec<&HeadModel>> = HashMap::new();
        for head in &self.heads {
            grouped.entry(head.backbone.as_str()).or_default().push(head);
        }
        grouped
    }
}

const WEIGHT_EXTENSIONS: [&str; 2] = ["onnx", "pb"];

/// Scan a models directory
pub fn discover_models(models_dir: &Path) -> Result<DiscoveredModels> {
    let mut discovered = DiscoveredModels::default();

    if !models_dir.is_dir() {
        warn!(dir = %models_dir.display(), "Models directory missing; nothing discovered");
        return Ok(discovered);
    }

    for entry in std::fs::read_dir(models_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let backbone_dir = entry.path();
        let backbone_name = entry.file_name().to_string_lossy().into_owned();

        if let Some(backbone) = discover_backbone(&backbone_dir, &backbone_name) {
            discovered.backbones.insert(backbone_name.clone(), backbone);
        }
        discover_heads(&backbone_dir, &backbone_name, &mut discovered.heads);
    }

    debug!(
        backbones = discovered.backbones.len(),
        heads = discovered.heads.len(),
        "Model discovery complete"
    );
    Ok(discovered)
}

fn discover_backbone(backbone_dir: &Path, backbone_name: &str) -> Option<BackboneModel> {
    let embeddings_dir = ["embeddings", "embedding"]
        .iter()
        .map(|d| backbone_dir.join(d))
        .find(|p| p.is_dir())?;

    // First weights file wins; .onnx preferred over .pb
    let mut weights = None;
    for ext in WEIGHT_EXTENSIONS {
        for candidate in sorted_files(&embeddings_dir) {
            if candidate.extension().and_then(|e| e.to_str()) == Some(ext) {
                weights = Some(candidate);
                break;
            }
        }
        if weights.is_some() {
            break;
        }
    }
    let weights = weights?;

    let sidecar = weights.with_extension("json");
    if !sidecar.is_file() {
        warn!(
            backbone = backbone_name,
            weights = %weights.display(),
            "Backbone weights without sidecar; skipping"
        );
        return None;
    }

    match spec::parse_backbone_sidecar(&sidecar, &weights, backbone_name) {
        Ok(backbone) => Some(backbone),
        Err(e) => {
            warn!(backbone = backbone_name, error = %e, "Unparseable backbone sidecar");
            None
        }
    }
}

fn discover_heads(backbone_dir: &Path, backbone_name: &str, heads: &mut Vec<HeadModel>) {
    let heads_dir = backbone_dir.join("heads");
    if !heads_dir.is_dir() {
        return;
    }

    for entry in WalkDir::new(&heads_dir)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let head_type = entry
            .path()
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let Some(weights) = paired_weights(path) else {
            warn!(sidecar = %path.display(), "Head sidecar without same-stem weights; skipping");
            continue;
        };

        match spec::parse_head_sidecar(path, &weights, backbone_name, &head_type) {
            Ok(head) => heads.push(head),
            Err(e) => warn!(sidecar = %path.display(), error = %e, "Unparseable head sidecar"),
        }
    }
}

fn paired_weights(sidecar: &Path) -> Option<std::path::PathBuf> {
    WEIGHT_EXTENSIONS
        .iter()
        .map(|ext| sidecar.with_extension(ext))
        .find(|p| p.is_file())
}

fn sorted_files(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}
