//! Two-stage inference: backbone embeddings, then head predictions
//!
//! One embedding matrix is computed per (file, backbone) pair and
//! reused across every head sharing that backbone; each head batches
//! its per-segment predictions over that matrix. The embedding is
//! dropped as soon as the last sharing head has run — callers hold it
//! only for the duration of one file.

use crate::models::{BackboneModel, HeadModel};
use crate::services::mel_frontend::MelFrontend;
use crate::types::Waveform;
use ndarray::Array2;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

/// Per-segment scores, `[segments × classes]`
pub type ScoreMatrix = Array2<f32>;
/// Backbone output, `[segments × dims]`
pub type Embedding = Array2<f32>;

/// Patches per backbone session run
const EMBED_BATCH: usize = 8;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("ONNX runtime error: {0}")]
    Session(#[from] ort::Error),

    #[error("model output '{output}' missing from session results")]
    MissingOutput { output: String },

    #[error("unexpected tensor shape: {0}")]
    Shape(String),

    #[error("waveform at {actual} Hz but backbone '{backbone}' expects {expected} Hz")]
    SampleRateMismatch {
        backbone: String,
        expected: u32,
        actual: u32,
    },

    #[error("audio too short to form a single analysis segment")]
    AudioTooShort,
}

/// One warm model handle: an ONNX session plus its tensor names.
///
/// `predict` needs `&mut`, so shared handles live behind
/// `Arc<Mutex<..>>` in the predictor cache.
pub struct Predictor {
    session: Session,
    input_name: String,
    output_name: String,
}

impl Predictor {
    /// Load weights from disk. `.pb` stems discovered alongside
    /// sidecars fail here and get reported by warmup.
    pub fn load(
        weights: &Path,
        input_name: &str,
        output_name: &str,
    ) -> Result<Self, InferenceError> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(1)?
            .commit_from_file(weights)?;

        debug!(weights = %weights.display(), "Predictor session loaded");

        Ok(Self {
            session,
            input_name: input_name.to_string(),
            output_name: output_name.to_string(),
        })
    }

    /// Run one batch: `data` is row-major with the given shape; the
    /// output tensor is returned the same way.
    pub fn run(
        &mut self,
        shape: Vec<usize>,
        data: Vec<f32>,
    ) -> Result<(Vec<usize>, Vec<f32>), InferenceError> {
        let value = Value::from_array((shape, data))?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &value])?;

        let out = outputs
            .get(self.output_name.as_str())
            .ok_or_else(|| InferenceError::MissingOutput {
                output: self.output_name.clone(),
            })?;
        let (out_shape, out_data) = out.try_extract_tensor::<f32>()?;

        Ok((
            out_shape.iter().map(|d| *d as usize).collect(),
            out_data.to_vec(),
        ))
    }
}

/// Compute the embedding matrix for one (file, backbone) pair.
pub fn embed(
    predictor: &Arc<Mutex<Predictor>>,
    backbone: &BackboneModel,
    waveform: &Waveform,
) -> Result<Embedding, InferenceError> {
    if waveform.sample_rate != backbone.sample_rate {
        return Err(InferenceError::SampleRateMismatch {
            backbone: backbone.name.clone(),
            expected: backbone.sample_rate,
            actual: waveform.sample_rate,
        });
    }

    let frontend = MelFrontend::new(backbone.sample_rate);
    let mel = frontend.log_mel(&waveform.samples);
    let (patch_frames, patch_hop) = frontend.patch_geometry(&backbone.segment);
    let patches = frontend.patches(&mel, patch_frames, patch_hop);
    if patches.is_empty() {
        return Err(InferenceError::AudioTooShort);
    }

    let n_mels = frontend.n_mels();
    let mut rows: Vec<f32> = Vec::new();
    let mut dims = 0usize;

    let mut guard = predictor.lock().unwrap_or_else(|e| e.into_inner());
    for chunk in patches.chunks(EMBED_BATCH) {
        let mut data = Vec::with_capacity(chunk.len() * patch_frames * n_mels);
        for patch in chunk {
            data.extend(patch.iter().copied());
        }

        let (out_shape, out_data) =
            guard.run(vec![chunk.len(), patch_frames, n_mels], data)?;

        if out_shape.len() != 2 || out_shape[0] != chunk.len() {
            return Err(InferenceError::Shape(format!(
                "backbone '{}' returned shape {:?} for a batch of {}",
                backbone.name,
                out_shape,
                chunk.len()
            )));
        }
        dims = out_shape[1];
        rows.extend(out_data);
    }
    drop(guard);

    let segments = patches.len();
    debug!(
        backbone = %backbone.name,
        segments,
        dims,
        "Embedding computed"
    );

    Array2::from_shape_vec((segments, dims), rows)
        .map_err(|e| InferenceError::Shape(e.to_string()))
}

/// Run one head over an embedding, batching segment rows.
pub fn predict_batched(
    predictor: &Arc<Mutex<Predictor>>,
    head: &HeadModel,
    embedding: &Embedding,
    batch_size: usize,
) -> Result<ScoreMatrix, InferenceError> {
    let segments = embedding.nrows();
    let dims = embedding.ncols();
    let batch = batch_size.max(1);

    let mut scores: Vec<f32> = Vec::new();
    let mut classes = 0usize;

    let mut guard = predictor.lock().unwrap_or_else(|e| e.into_inner());
    let mut start = 0usize;
    while start < segments {
        let end = (start + batch).min(segments);
        let rows = end - start;

        let mut data = Vec::with_capacity(rows * dims);
        for r in start..end {
            for c in 0..dims {
                data.push(embedding[[r, c]]);
            }
        }

        let (out_shape, out_data) = guard.run(vec![rows, dims], data)?;
        if out_shape.len() != 2 || out_shape[0] != rows {
            return Err(InferenceError::Shape(format!(
                "head '{}' returned shape {:?} for a batch of {}",
                head.name, out_shape, rows
            )));
        }
        classes = out_shape[1];
        scores.extend(out_data);

        start = end;
    }
    drop(guard);

    if classes != head.labels.len() {
        return Err(InferenceError::Shape(format!(
            "head '{}' produced {} classes for {} labels",
            head.name,
            classes,
            head.labels.len()
        )));
    }

    Array2::from_shape_vec((segments, classes), scores)
        .map_err(|e| InferenceError::Shape(e.to_string()))
}

// ============================================================================
// Segment pooling
// ============================================================================

/// Per-class trimmed mean across segments, NaN-tolerant.
///
/// Non-finite segment scores are ignored; a class with no finite
/// scores pools to NaN, which every downstream threshold rejects.
pub fn pool_trimmed_mean(scores: &ScoreMatrix, trim_fraction: f32) -> Vec<f32> {
    let fraction = trim_fraction.clamp(0.0, 0.49);
    (0..scores.ncols())
        .map(|c| {
            let mut column: Vec<f32> = (0..scores.nrows())
                .map(|r| scores[[r, c]])
                .filter(|v| v.is_finite())
                .collect();
            if column.is_empty() {
                return f32::NAN;
            }
            column.sort_by(|a, b| a.total_cmp(b));

            let trim = ((column.len() as f32) * fraction).floor() as usize;
            let kept = &column[trim..column.len() - trim];
            // Trimming never empties the column: trim < len/2
            kept.iter().sum::<f32>() / kept.len() as f32
        })
        .collect()
}

/// Per-class standard deviation across segments, NaN-tolerant.
pub fn segment_std(scores: &ScoreMatrix) -> Vec<f32> {
    (0..scores.ncols())
        .map(|c| {
            let column: Vec<f32> = (0..scores.nrows())
                .map(|r| scores[[r, c]])
                .filter(|v| v.is_finite())
                .collect();
            if column.len() < 2 {
                return 0.0;
            }
            let mean = column.iter().sum::<f32>() / column.len() as f32;
            let var = column.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>()
                / column.len() as f32;
            var.sqrt()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_trimmed_mean_drops_extremes() {
        // Column with one outlier at each end; 20% trim drops both
        let scores = array![[0.0], [0.5], [0.5], [0.5], [10.0]];
        let pooled = pool_trimmed_mean(&scores, 0.2);
        assert!((pooled[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_trimmed_mean_zero_fraction_is_plain_mean() {
        let scores = array![[0.0, 1.0], [1.0, 1.0]];
        let pooled = pool_trimmed_mean(&scores, 0.0);
        assert!((pooled[0] - 0.5).abs() < 1e-6);
        assert!((pooled[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_trimmed_mean_ignores_nan() {
        let scores = array![[f32::NAN], [0.4], [0.6]];
        let pooled = pool_trimmed_mean(&scores, 0.0);
        assert!((pooled[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_trimmed_mean_all_nan_pools_to_nan() {
        let scores = array![[f32::NAN], [f32::NAN]];
        let pooled = pool_trimmed_mean(&scores, 0.1);
        assert!(pooled[0].is_nan());
    }

    #[test]
    fn test_segment_std() {
        let scores = array![[0.4], [0.6]];
        let stds = segment_std(&scores);
        assert!((stds[0] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_segment_std_single_row_is_zero() {
        let scores = array![[0.9, 0.1]];
        assert_eq!(segment_std(&scores), vec![0.0, 0.0]);
    }

    // NOTE: Predictor/embed/predict_batched need real ONNX weights;
    // exercised as integration coverage in deployments with models.
}
