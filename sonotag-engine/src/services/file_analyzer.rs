//! Per-file analysis pipeline
//!
//! Loader → Fingerprinter + Inference (via the predictor cache) →
//! Tier Decision, producing the calibrated `HeadOutput`s the mood
//! aggregator and tag writer consume. Within one file, a backbone's
//! embedding is fully computed before any sharing head reads it, and
//! released as soon as the last head has run.
//!
//! A failed head leaves a name in `failed_heads` and is simply absent
//! from the outputs — partial results are explicit, never padded with
//! zeros.

use crate::config::EngineConfig;
use crate::models::{DiscoveredModels, HeadKind, HeadModel};
use crate::services::audio_loader::{AudioLoader, LoadError};
use crate::services::calibration::{self, Calibration};
use crate::services::fingerprinter::Fingerprinter;
use crate::services::inference::{self, InferenceError, Predictor};
use crate::services::mood_aggregator::calibration_key;
use crate::services::predictor_cache::{GraphKey, PredictorCache};
use crate::services::tier_decision::TierDecider;
use crate::types::{Fingerprint, HeadOutput, Waveform};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Canonical rate for content fingerprints, independent of whatever
/// rates the backbones want. The safe writer recomputes at the same
/// rate, so the two digests are comparable.
pub const FINGERPRINT_SAMPLE_RATE: u32 = 16_000;

/// Segment rows per head prediction batch
const HEAD_BATCH_SIZE: usize = 64;

/// One stored calibration plus its identity
#[derive(Debug, Clone)]
pub struct CalibrationEntry {
    pub calibration: Calibration,
    pub def_hash: String,
}

/// Calibrations keyed by `calibration_key(model_key, head, label)`
pub type CalibrationStore = HashMap<String, CalibrationEntry>;

/// Analysis result for one file
#[derive(Debug)]
pub struct FileAnalysis {
    pub fingerprint: Fingerprint,
    pub outputs: Vec<HeadOutput>,
    /// Heads that failed (predictor unavailable, inference error);
    /// absent from `outputs` by design.
    pub failed_heads: Vec<String>,
}

#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error(transparent)]
    Load(#[from] LoadError),
}

/// Per-file analyzer
pub struct FileAnalyzer {
    loader: AudioLoader,
    fingerprinter: Fingerprinter,
    cache: Arc<PredictorCache>,
    decider: TierDecider,
    trim_fraction: f32,
}

impl FileAnalyzer {
    pub fn new(config: &EngineConfig, cache: Arc<PredictorCache>) -> Self {
        Self {
            loader: AudioLoader::new(config.loader.clone()),
            fingerprinter: Fingerprinter::new(),
            cache,
            decider: TierDecider::new(config),
            trim_fraction: config.pooling.trim_fraction,
        }
    }

    /// Analyze one file against every discovered model.
    ///
    /// Decode crash/shutdown aborts the file; individual head failures
    /// do not.
    pub async fn analyze_file(
        &self,
        models: &DiscoveredModels,
        calibrations: &CalibrationStore,
        path: &Path,
        shutdown: &CancellationToken,
    ) -> Result<FileAnalysis, AnalyzeError> {
        // One waveform per needed sample rate, loaded lazily
        let mut waveforms: HashMap<u32, Waveform> = HashMap::new();

        let fingerprint = {
            let waveform = self
                .waveform_at(&mut waveforms, path, FINGERPRINT_SAMPLE_RATE, shutdown)
                .await?;
            self.fingerprinter.fingerprint(waveform)
        };

        let mut outputs = Vec::new();
        let mut failed_heads = Vec::new();

        for (backbone_name, heads) in models.heads_by_backbone() {
            let Some(backbone) = models.backbones.get(backbone_name) else {
                warn!(backbone = backbone_name, "Heads reference an undiscovered backbone");
                failed_heads.extend(heads.iter().map(|h| h.name.clone()));
                continue;
            };

            let waveform = self
                .waveform_at(&mut waveforms, path, backbone.sample_rate, shutdown)
                .await?;

            // The embedding must exist in full before any head reads it
            let embedding = match self
                .predictor(&GraphKey::for_backbone(backbone), &backbone.weights_path, &backbone.input_name, &backbone.output_name)
                .and_then(|p| inference::embed(&p, backbone, waveform))
            {
                Ok(embedding) => embedding,
                Err(e) => {
                    warn!(backbone = backbone_name, error = %e, "Backbone unavailable; its heads are skipped");
                    failed_heads.extend(heads.iter().map(|h| h.name.clone()));
                    continue;
                }
            };

            for head in heads {
                match self.run_head(head, &embedding, calibrations) {
                    Ok(mut head_outputs) => outputs.append(&mut head_outputs),
                    Err(e) => {
                        warn!(head = %head.name, error = %e, "Head failed; omitted from outputs");
                        failed_heads.push(head.name.clone());
                    }
                }
            }
            // Embedding dropped here; it lived exactly as long as its heads
            drop(embedding);
        }

        debug!(
            path = %path.display(),
            outputs = outputs.len(),
            failed = failed_heads.len(),
            "File analysis complete"
        );

        Ok(FileAnalysis {
            fingerprint,
            outputs,
            failed_heads,
        })
    }

    fn run_head(
        &self,
        head: &HeadModel,
        embedding: &inference::Embedding,
        calibrations: &CalibrationStore,
    ) -> Result<Vec<HeadOutput>, InferenceError> {
        let predictor = self.predictor(
            &GraphKey::for_head(head),
            &head.weights_path,
            &head.input_name,
            &head.output_name,
        )?;
        let scores = inference::predict_batched(&predictor, head, embedding, HEAD_BATCH_SIZE)?;

        let pooled = inference::pool_trimmed_mean(&scores, self.trim_fraction);
        let stds = inference::segment_std(&scores);

        let model_key = head.model_key();
        let decisions = self.decider.decide(head, &pooled, Some(&stds));

        let outputs = decisions
            .into_iter()
            .map(|decision| {
                let index = head
                    .labels
                    .iter()
                    .position(|l| *l == decision.label)
                    .unwrap_or(0);

                // Regression values get their mood tier from the
                // intensity transform, not the cascade
                let tier = match head.kind {
                    HeadKind::Regression => self
                        .decider
                        .regression_intensity(decision.probability, stds[index]),
                    _ => decision.tier,
                };

                let key = calibration_key(&model_key, &head.name, &decision.label);
                let entry = calibrations.get(&key);
                let calibrated = entry.map(|e| {
                    calibration::apply(decision.probability as f64, Some(&e.calibration)) as f32
                });

                HeadOutput {
                    head_name: head.name.clone(),
                    model_key: model_key.clone(),
                    label: decision.label,
                    raw: decision.probability,
                    calibrated,
                    tier,
                    calibration_id: entry.map(|e| e.def_hash.clone()),
                    mood_source: head.mood_source,
                }
            })
            .collect();

        Ok(outputs)
    }

    async fn waveform_at<'a>(
        &self,
        waveforms: &'a mut HashMap<u32, Waveform>,
        path: &Path,
        sample_rate: u32,
        shutdown: &CancellationToken,
    ) -> Result<&'a Waveform, LoadError> {
        if !waveforms.contains_key(&sample_rate) {
            let waveform = self.loader.load_mono(path, sample_rate, shutdown).await?;
            waveforms.insert(sample_rate, waveform);
        }
        Ok(&waveforms[&sample_rate])
    }

    /// Warm handle from the cache, loading and inserting on miss.
    fn predictor(
        &self,
        key: &GraphKey,
        weights: &Path,
        input_name: &str,
        output_name: &str,
    ) -> Result<Arc<Mutex<Predictor>>, InferenceError> {
        if let Some(handle) = self.cache.get(key) {
            return Ok(handle);
        }
        let predictor = Predictor::load(weights, input_name, output_name)?;
        Ok(self.cache.put(key, predictor))
    }
}
