//! Model description sidecar parsing
//!
//! Sidecar JSON fields: `name`/`head_name`, `classes`/`labels`,
//! `schema.inputs`/`schema.outputs` (name, shape, optional
//! `output_purpose`), `audio.sample_rate` or `inference.sample_rate`,
//! `segment.length_s`/`segment.hop_s`, `release_date`, and optional
//! `cascade`/`tiers` overrides.

use serde::Deserialize;
use sonotag_common::{Error, Result};
use std::path::{Path, PathBuf};

/// Head kind, resolved once at load time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadKind {
    Regression,
    Multilabel,
    Multiclass,
}

impl HeadKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "regression" => Some(HeadKind::Regression),
            "multilabel" | "multi-label" => Some(HeadKind::Multilabel),
            "multiclass" | "multi-class" => Some(HeadKind::Multiclass),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HeadKind::Regression => "regression",
            HeadKind::Multilabel => "multilabel",
            HeadKind::Multiclass => "multiclass",
        }
    }
}

/// Segmenting parameters for the mel frontend
#[derive(Debug, Clone, Copy)]
pub struct SegmentSpec {
    pub length_s: f32,
    pub hop_s: f32,
}

impl Default for SegmentSpec {
    fn default() -> Self {
        Self {
            length_s: 4.1,
            hop_s: 2.05,
        }
    }
}

/// Per-head cascade overrides from the sidecar (`cascade` or `tiers`)
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct CascadeOverride {
    pub high: Option<f32>,
    pub medium: Option<f32>,
    pub low: Option<f32>,
    pub ratio_high: Option<f32>,
    pub ratio_medium: Option<f32>,
    pub ratio_low: Option<f32>,
    pub gap_high: Option<f32>,
    pub gap_medium: Option<f32>,
    pub gap_low: Option<f32>,
}

/// An embedding extractor shared by multiple heads
#[derive(Debug, Clone)]
pub struct BackboneModel {
    pub name: String,
    pub weights_path: PathBuf,
    pub input_name: String,
    /// Output whose `output_purpose` is the embedding (falls back to
    /// the last declared output)
    pub output_name: String,
    pub sample_rate: u32,
    pub segment: SegmentSpec,
}

/// One classifier/regressor head
#[derive(Debug, Clone)]
pub struct HeadModel {
    pub name: String,
    pub kind: HeadKind,
    pub labels: Vec<String>,
    pub backbone: String,
    /// Directory component under `heads/` (e.g. "mood", "genre")
    pub head_type: String,
    pub weights_path: PathBuf,
    pub input_name: String,
    pub output_name: String,
    pub min_conf: Option<f32>,
    pub max_classes: Option<usize>,
    pub top_ratio: Option<f32>,
    pub cascade: Option<CascadeOverride>,
    pub mood_source: bool,
    pub release_date: Option<String>,
}

impl HeadModel {
    /// Versioned model key used for calibration records and tag
    /// provenance.
    pub fn model_key(&self) -> String {
        let version = self.release_date.as_deref().unwrap_or("1");
        format!("{}:{}:{}", self.backbone, self.name, version)
    }

    /// Counter-label for multilabel counter-confidence: an explicit
    /// negation label when present, else the opposing label of a
    /// binary head, else `None` (caller falls back to max-of-others).
    pub fn counter_label(&self, label: &str) -> Option<&str> {
        for candidate in [
            format!("non_{}", label),
            format!("not_{}", label),
        ] {
            if let Some(found) = self.labels.iter().find(|l| **l == candidate) {
                return Some(found.as_str());
            }
        }
        // A negated label's counter is its positive form
        for prefix in ["non_", "not_"] {
            if let Some(positive) = label.strip_prefix(prefix) {
                if let Some(found) = self.labels.iter().find(|l| l.as_str() == positive) {
                    return Some(found.as_str());
                }
            }
        }
        if self.labels.len() == 2 {
            return self.labels.iter().find(|l| l.as_str() != label).map(|l| l.as_str());
        }
        None
    }
}

// ============================================================================
// Raw sidecar JSON shape
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawSidecar {
    name: Option<String>,
    head_name: Option<String>,
    kind: Option<String>,
    classes: Option<Vec<String>>,
    labels: Option<Vec<String>>,
    schema: Option<RawSchema>,
    audio: Option<RawAudio>,
    inference: Option<RawInference>,
    segment: Option<RawSegment>,
    release_date: Option<String>,
    cascade: Option<CascadeOverride>,
    tiers: Option<CascadeOverride>,
    mood_source: Option<bool>,
    min_conf: Option<f32>,
    max_classes: Option<usize>,
    top_ratio: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct RawSchema {
    inputs: Option<Vec<RawTensor>>,
    outputs: Option<Vec<RawTensor>>,
}

#[derive(Debug, Deserialize)]
struct RawTensor {
    name: String,
    #[allow(dead_code)]
    shape: Option<Vec<i64>>,
    output_purpose: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAudio {
    sample_rate: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawInference {
    sample_rate: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawSegment {
    length_s: Option<f32>,
    hop_s: Option<f32>,
}

impl RawSidecar {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ModelSpec(format!("read {}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::ModelSpec(format!("parse {}: {}", path.display(), e)))
    }

    fn resolved_name(&self, path: &Path) -> String {
        self.head_name
            .clone()
            .or_else(|| self.name.clone())
            .unwrap_or_else(|| {
                path.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            })
    }

    fn sample_rate(&self) -> u32 {
        self.audio
            .as_ref()
            .and_then(|a| a.sample_rate)
            .or_else(|| self.inference.as_ref().and_then(|i| i.sample_rate))
            .unwrap_or(16_000)
    }

    fn segment(&self) -> SegmentSpec {
        let default = SegmentSpec::default();
        match &self.segment {
            Some(raw) => SegmentSpec {
                length_s: raw.length_s.unwrap_or(default.length_s),
                hop_s: raw.hop_s.unwrap_or(default.hop_s),
            },
            None => default,
        }
    }

    fn input_name(&self) -> String {
        self.schema
            .as_ref()
            .and_then(|s| s.inputs.as_ref())
            .and_then(|ins| ins.first())
            .map(|t| t.name.clone())
            .unwrap_or_else(|| "input".to_string())
    }

    /// Pick the output by purpose, else the last declared output.
    fn output_name(&self, purpose: &str) -> String {
        let outputs = self
            .schema
            .as_ref()
            .and_then(|s| s.outputs.as_ref());
        if let Some(outs) = outputs {
            if let Some(t) = outs
                .iter()
                .find(|t| t.output_purpose.as_deref() == Some(purpose))
            {
                return t.name.clone();
            }
            if let Some(t) = outs.last() {
                return t.name.clone();
            }
        }
        "output".to_string()
    }
}

/// Parse a backbone sidecar
pub fn parse_backbone_sidecar(
    sidecar_path: &Path,
    weights_path: &Path,
    backbone_dir_name: &str,
) -> Result<BackboneModel> {
    let raw = RawSidecar::load(sidecar_path)?;
    Ok(BackboneModel {
        name: backbone_dir_name.to_string(),
        weights_path: weights_path.to_path_buf(),
        input_name: raw.input_name(),
        output_name: raw.output_name("embeddings"),
        sample_rate: raw.sample_rate(),
        segment: raw.segment(),
    })
}

/// Parse a head sidecar; `head_type` is the directory component under
/// `heads/`.
pub fn parse_head_sidecar(
    sidecar_path: &Path,
    weights_path: &Path,
    backbone: &str,
    head_type: &str,
) -> Result<HeadModel> {
    let raw = RawSidecar::load(sidecar_path)?;

    let labels = raw
        .classes
        .clone()
        .or_else(|| raw.labels.clone())
        .ok_or_else(|| {
            Error::ModelSpec(format!(
                "{}: sidecar has neither 'classes' nor 'labels'",
                sidecar_path.display()
            ))
        })?;

    // Kind resolves once: explicit field first, then the directory
    // component, then multilabel.
    let kind = raw
        .kind
        .as_deref()
        .and_then(HeadKind::parse)
        .or_else(|| HeadKind::parse(head_type))
        .unwrap_or(HeadKind::Multilabel);

    let name = raw.resolved_name(sidecar_path);
    let cascade = raw.cascade.or(raw.tiers);

    Ok(HeadModel {
        input_name: raw.input_name(),
        output_name: raw.output_name("predictions"),
        name,
        kind,
        labels,
        backbone: backbone.to_string(),
        head_type: head_type.to_string(),
        weights_path: weights_path.to_path_buf(),
        min_conf: raw.min_conf,
        max_classes: raw.max_classes,
        top_ratio: raw.top_ratio,
        cascade,
        mood_source: raw.mood_source.unwrap_or(head_type == "mood"),
        release_date: raw.release_date,
    })
}
