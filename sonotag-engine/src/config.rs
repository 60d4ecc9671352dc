//! Engine tunables
//!
//! Every cascade/stability/drift constant in the pipeline lives here
//! with a serde default, so deployments can override them from
//! `sonotag.toml` without a rebuild. The defaults mirror the shipped
//! model generation and have no derivation beyond field experience;
//! treat them as data, not code.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Full engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub loader: LoaderConfig,
    pub cache: CacheConfig,
    pub pooling: PoolingConfig,
    pub cascade: CascadeConfig,
    pub stability: StabilityConfig,
    pub regression: RegressionTierConfig,
    pub multiclass: MulticlassConfig,
    pub mood: MoodConfig,
    pub drift: DriftThresholds,
}

/// Audio loader / decode worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Decode worker binary; defaults to `sonotag-decoder` next to the
    /// current executable.
    pub worker_bin: Option<PathBuf>,
    /// Pipe poll slice in milliseconds (shutdown observation latency)
    pub poll_interval_ms: u64,
    /// Hard wall-clock deadline per decode attempt, in seconds
    pub decode_timeout_s: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            worker_bin: None,
            poll_interval_ms: 250,
            decode_timeout_s: 120,
        }
    }
}

impl LoaderConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn decode_timeout(&self) -> Duration {
        Duration::from_secs(self.decode_timeout_s)
    }
}

/// Predictor cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Idle seconds before `evict_if_idle` clears the cache; 0 = never
    pub idle_timeout_s: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { idle_timeout_s: 600 }
    }
}

impl CacheConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_s)
    }
}

/// Segment score pooling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolingConfig {
    /// Fraction trimmed from each end before the mean (0.1 = drop the
    /// lowest and highest 10% of segment scores)
    pub trim_fraction: f32,
}

impl Default for PoolingConfig {
    fn default() -> Self {
        Self { trim_fraction: 0.1 }
    }
}

/// One cascade tier gate: all three conditions must hold
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierGate {
    pub prob: f32,
    pub ratio: f32,
    pub gap: f32,
}

/// Multilabel cascade thresholds, matched high → medium → low
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    /// Global minimum probability for a label to be considered at all
    pub min_conf: f32,
    pub high: TierGate,
    pub medium: TierGate,
    pub low: TierGate,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            min_conf: 0.40,
            high: TierGate {
                prob: 0.75,
                ratio: 2.0,
                gap: 0.30,
            },
            medium: TierGate {
                prob: 0.60,
                ratio: 1.5,
                gap: 0.15,
            },
            low: TierGate {
                prob: 0.45,
                ratio: 1.2,
                gap: 0.08,
            },
        }
    }
}

/// Temporal stability ceiling.
///
/// Per-label standard deviation across segments caps the maximum
/// achievable tier; evaluated before the ratio/gap gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// std at or above this forbids any tier
    pub acceptable: f32,
    /// std at or above this caps at low
    pub stable: f32,
    /// std at or above this caps at medium
    pub very_stable: f32,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            acceptable: 0.35,
            stable: 0.25,
            very_stable: 0.15,
        }
    }
}

/// Regression-head intensity transform: segment mean against fixed
/// strong/weak thresholds, with a variance-gated tier cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegressionTierConfig {
    /// Mean at or above this earns high
    pub strong: f32,
    /// Mean at or above this earns medium; below yields no tier
    pub weak: f32,
    /// Segment std at or above this caps the tier at low
    pub cap_low_std: f32,
    /// Segment std at or above this forbids any tier
    pub forbid_std: f32,
}

impl Default for RegressionTierConfig {
    fn default() -> Self {
        Self {
            strong: 0.65,
            weak: 0.45,
            cap_low_std: 0.25,
            forbid_std: 0.35,
        }
    }
}

/// Multiclass adaptive top-K defaults (heads may override via sidecar)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MulticlassConfig {
    /// Emitted classes must reach `top_score × top_ratio`
    pub top_ratio: f32,
    /// Default cap on emitted classes
    pub max_classes: usize,
}

impl Default for MulticlassConfig {
    fn default() -> Self {
        Self {
            top_ratio: 0.5,
            max_classes: 3,
        }
    }
}

/// Mood aggregation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MoodConfig {
    /// Label pairs that must never coexist in the output
    pub opposing_pairs: Vec<(String, String)>,
}

impl Default for MoodConfig {
    fn default() -> Self {
        Self {
            opposing_pairs: vec![
                ("happy".to_string(), "sad".to_string()),
                ("aggressive".to_string(), "relaxed".to_string()),
                ("acoustic".to_string(), "electronic".to_string()),
            ],
        }
    }
}

/// Per-metric drift thresholds; a calibration run is stable only when
/// every metric is within its threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftThresholds {
    /// Absolute percentile drift bound (|Δp5|, |Δp95|)
    pub apd: f64,
    /// Scale-range drift bound (|Δ(p95 − p5)|)
    pub srd: f64,
    /// Jensen-Shannon divergence bound (100-bin histograms)
    pub jsd: f64,
    /// Median drift bound
    pub median: f64,
    /// IQR drift bound
    pub iqr: f64,
}

impl Default for DriftThresholds {
    fn default() -> Self {
        Self {
            apd: 0.05,
            srd: 0.05,
            jsd: 0.10,
            median: 0.05,
            iqr: 0.05,
        }
    }
}
