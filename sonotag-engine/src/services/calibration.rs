//! Percentile calibration and drift measurement
//!
//! Calibration maps raw model scores into a comparable [0, 1] range
//! using p5/p95 bounds derived from a sparse score histogram. The
//! derivation walks non-empty bins in order, so its error is bounded
//! by the bin width — exact quantiles are explicitly not a goal here.
//! Degenerate calibrations (p95 ≤ p5, missing bounds, no samples)
//! degrade to raw-score passthrough; they are logged, never raised.

use crate::config::DriftThresholds;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Histogram shape for one (model, head, label)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramSpec {
    pub lo: f64,
    pub hi: f64,
    pub bins: u32,
}

impl HistogramSpec {
    pub fn bin_width(&self) -> f64 {
        if self.bins == 0 {
            return 0.0;
        }
        (self.hi - self.lo) / self.bins as f64
    }
}

/// One non-empty histogram bin
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramBin {
    pub lower_edge: f64,
    pub count: u64,
}

/// Sparse histogram: only non-zero-count bins are stored, with
/// separate underflow/overflow counters for out-of-range samples.
#[derive(Debug, Clone)]
pub struct SparseHistogram {
    pub spec: HistogramSpec,
    pub bins: Vec<HistogramBin>,
    pub underflow: u64,
    pub overflow: u64,
}

impl SparseHistogram {
    /// Total sample count including under/overflow
    pub fn total(&self) -> u64 {
        self.underflow + self.overflow + self.bins.iter().map(|b| b.count).sum::<u64>()
    }

    /// Accumulate raw scores into a sparse histogram.
    pub fn from_samples(spec: HistogramSpec, samples: &[f64]) -> Self {
        let width = spec.bin_width();
        let mut counts = vec![0u64; spec.bins as usize];
        let mut underflow = 0u64;
        let mut overflow = 0u64;

        for &s in samples {
            if !s.is_finite() || s < spec.lo {
                underflow += 1;
            } else if s >= spec.hi {
                overflow += 1;
            } else if width > 0.0 {
                let idx = (((s - spec.lo) / width) as usize).min(spec.bins as usize - 1);
                counts[idx] += 1;
            }
        }

        let bins = counts
            .into_iter()
            .enumerate()
            .filter(|(_, c)| *c > 0)
            .map(|(i, count)| HistogramBin {
                lower_edge: spec.lo + i as f64 * width,
                count,
            })
            .collect();

        Self {
            spec,
            bins,
            underflow,
            overflow,
        }
    }
}

/// Output of calibration generation for one label
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationSummary {
    pub p5: f64,
    pub p95: f64,
    pub n: u64,
    pub underflow: u64,
    pub overflow: u64,
}

/// The applied form: just the percentile bounds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub p5: f64,
    pub p95: f64,
}

impl Calibration {
    /// Usable for rescaling only when the range is real
    pub fn is_valid(&self) -> bool {
        self.p5.is_finite() && self.p95.is_finite() && self.p95 > self.p5
    }
}

impl From<&CalibrationSummary> for Calibration {
    fn from(summary: &CalibrationSummary) -> Self {
        Self {
            p5: summary.p5,
            p95: summary.p95,
        }
    }
}

/// Derive p5/p95 from a sparse histogram.
///
/// The walk accumulates bin counts seeded at the underflow total; each
/// percentile is the lower edge of the first bin whose cumulative
/// count reaches its target. An unreached target falls back to the
/// histogram bound. Returns `None` (logged) when there are no samples.
pub fn generate(label: &str, histogram: &SparseHistogram) -> Option<CalibrationSummary> {
    let total = histogram.total();
    if total == 0 {
        warn!(label, "No histogram samples; calibration degrades to raw scores");
        return None;
    }

    let mut bins = histogram.bins.clone();
    bins.sort_by(|a, b| a.lower_edge.total_cmp(&b.lower_edge));

    let p5_target = 0.05 * total as f64;
    let p95_target = 0.95 * total as f64;

    let mut cumulative = histogram.underflow as f64;
    let mut p5 = None;
    let mut p95 = None;

    for bin in &bins {
        cumulative += bin.count as f64;
        if p5.is_none() && cumulative >= p5_target {
            p5 = Some(bin.lower_edge);
        }
        if p95.is_none() && cumulative >= p95_target {
            p95 = Some(bin.lower_edge);
            break;
        }
    }

    let p5 = p5.unwrap_or(histogram.spec.lo).clamp(histogram.spec.lo, histogram.spec.hi);
    let p95 = p95
        .unwrap_or(histogram.spec.hi)
        .clamp(histogram.spec.lo, histogram.spec.hi);

    debug!(label, p5, p95, n = total, "Calibration generated");

    Some(CalibrationSummary {
        p5,
        p95,
        n: total,
        underflow: histogram.underflow,
        overflow: histogram.overflow,
    })
}

/// Rescale a raw score through a calibration.
///
/// `clamp01((raw − p5) / (p95 − p5))`; any degenerate calibration
/// returns the raw value unchanged — never a silent negative scaling.
pub fn apply(raw: f64, calibration: Option<&Calibration>) -> f64 {
    match calibration {
        Some(c) if c.is_valid() => ((raw - c.p5) / (c.p95 - c.p5)).clamp(0.0, 1.0),
        _ => raw,
    }
}

/// Stable identity of a calibration definition; a new hash supersedes
/// every stored record for the same (model, head, label).
pub fn calibration_def_hash(
    model_key: &str,
    head_name: &str,
    label: &str,
    spec: &HistogramSpec,
    version: i64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            model_key, head_name, label, spec.lo, spec.hi, spec.bins, version
        )
        .as_bytes(),
    );
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// Drift
// ============================================================================

/// Bin count for the drift JSD histograms
const JSD_BINS: usize = 100;

/// Inter-run drift metrics, each computed and thresholded
/// independently.
#[derive(Debug, Clone, PartialEq)]
pub struct DriftReport {
    /// |Δp5|
    pub apd_p5: f64,
    /// |Δp95|
    pub apd_p95: f64,
    /// |Δ(p95 − p5)|
    pub srd: f64,
    /// Jensen-Shannon divergence between 100-bin sample histograms
    pub jsd: f64,
    pub median_drift: f64,
    pub iqr_drift: f64,
    /// True only when every metric is within its threshold
    pub is_stable: bool,
    /// Names of metrics that missed their threshold
    pub failed_metrics: Vec<String>,
}

/// Compare two calibration runs.
///
/// `old_sample`/`new_sample` are the raw score samples behind each
/// run, used for the distribution metrics.
pub fn drift(
    old: &CalibrationSummary,
    new: &CalibrationSummary,
    old_sample: &[f64],
    new_sample: &[f64],
    thresholds: &DriftThresholds,
) -> DriftReport {
    let apd_p5 = (new.p5 - old.p5).abs();
    let apd_p95 = (new.p95 - old.p95).abs();
    let srd = ((new.p95 - new.p5) - (old.p95 - old.p5)).abs();
    let jsd = jensen_shannon_divergence(old_sample, new_sample);
    let median_drift = (percentile(new_sample, 0.5) - percentile(old_sample, 0.5)).abs();
    let iqr_drift = (iqr(new_sample) - iqr(old_sample)).abs();

    let mut failed_metrics = Vec::new();
    for (name, value, bound) in [
        ("apd_p5", apd_p5, thresholds.apd),
        ("apd_p95", apd_p95, thresholds.apd),
        ("srd", srd, thresholds.srd),
        ("jsd", jsd, thresholds.jsd),
        ("median_drift", median_drift, thresholds.median),
        ("iqr_drift", iqr_drift, thresholds.iqr),
    ] {
        if value > bound {
            failed_metrics.push(name.to_string());
        }
    }

    if !failed_metrics.is_empty() {
        warn!(failed = ?failed_metrics, "Calibration drift outside thresholds");
    }

    DriftReport {
        apd_p5,
        apd_p95,
        srd,
        jsd,
        median_drift,
        iqr_drift,
        is_stable: failed_metrics.is_empty(),
        failed_metrics,
    }
}

/// Jensen-Shannon divergence (log base 2, bounded [0, 1]) between
/// 100-bin histograms of the two samples over their combined range.
fn jensen_shannon_divergence(a: &[f64], b: &[f64]) -> f64 {
    let finite = |s: &[f64]| s.iter().copied().filter(|v| v.is_finite()).collect::<Vec<_>>();
    let a = finite(a);
    let b = finite(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let lo = a
        .iter()
        .chain(b.iter())
        .copied()
        .fold(f64::INFINITY, f64::min);
    let hi = a
        .iter()
        .chain(b.iter())
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    if hi <= lo {
        return 0.0;
    }

    let width = (hi - lo) / JSD_BINS as f64;
    let to_dist = |s: &[f64]| {
        let mut counts = vec![0.0f64; JSD_BINS];
        for &v in s {
            let idx = (((v - lo) / width) as usize).min(JSD_BINS - 1);
            counts[idx] += 1.0;
        }
        let total = s.len() as f64;
        counts.iter_mut().for_each(|c| *c /= total);
        counts
    };

    let p = to_dist(&a);
    let q = to_dist(&b);

    let mut divergence = 0.0;
    for i in 0..JSD_BINS {
        let m = 0.5 * (p[i] + q[i]);
        if p[i] > 0.0 {
            divergence += 0.5 * p[i] * (p[i] / m).log2();
        }
        if q[i] > 0.0 {
            divergence += 0.5 * q[i] * (q[i] / m).log2();
        }
    }
    divergence.max(0.0)
}

/// Linear-interpolation percentile over finite values; 0.0 on empty
/// input.
fn percentile(sample: &[f64], q: f64) -> f64 {
    let mut values: Vec<f64> = sample.iter().copied().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));

    let position = q.clamp(0.0, 1.0) * (values.len() - 1) as f64;
    let below = position.floor() as usize;
    let above = position.ceil() as usize;
    if below == above {
        values[below]
    } else {
        let fraction = position - below as f64;
        values[below] * (1.0 - fraction) + values[above] * fraction
    }
}

fn iqr(sample: &[f64]) -> f64 {
    percentile(sample, 0.75) - percentile(sample, 0.25)
}
