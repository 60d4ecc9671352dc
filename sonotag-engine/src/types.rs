//! Core data types shared across the tagging pipeline

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Decoded mono audio, consumed immediately by fingerprinting and
/// inference; never persisted.
#[derive(Debug, Clone)]
pub struct Waveform {
    /// Mono samples, f32 in [-1.0, 1.0]
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl Waveform {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Duration in seconds
    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Content-addressed audio hash: 32 lowercase hex chars derived from
/// spectral frames. Recomputed at write time and compared against the
/// stored value before any file replacement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Digest length in hex characters
    pub const HEX_LEN: usize = 32;

    /// Wrap an already-computed digest, truncating to 32 hex chars
    pub fn from_digest_hex(hex: &str) -> Self {
        Self(hex.chars().take(Self::HEX_LEN).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Confidence tier assigned to a selected label
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Low,
    Medium,
    High,
}

impl Tier {
    /// Rank used for conflict scoring (high = 3, medium = 2, low = 1)
    pub fn rank(&self) -> u32 {
        match self {
            Tier::High => 3,
            Tier::Medium => 2,
            Tier::Low => 1,
        }
    }
}

/// One calibrated prediction for one label of one head.
///
/// Tier is `None` when the measurement was judged unstable or the
/// label failed every cascade gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadOutput {
    /// Head name (matches the model description sidecar)
    pub head_name: String,
    /// Versioned model key (`{backbone}:{head}:{version}`)
    pub model_key: String,
    /// Label this score belongs to
    pub label: String,
    /// Raw pooled model output
    pub raw: f32,
    /// Calibrated value in [0, 1], when a valid calibration applied
    pub calibrated: Option<f32>,
    /// Confidence tier (`None` = unstable or rejected)
    pub tier: Option<Tier>,
    /// def_hash of the calibration used, if any
    pub calibration_id: Option<String>,
    /// Whether the producing head feeds mood aggregation
    pub mood_source: bool,
}

impl HeadOutput {
    /// Best available value: calibrated when present, raw otherwise
    pub fn value(&self) -> f32 {
        self.calibrated.unwrap_or(self.raw)
    }
}

/// Aggregated mood tags, bucketed by tier.
///
/// Tiers are inclusive (`strict ⊆ regular ⊆ loose`); empty tiers are
/// absent from the map rather than present as empty sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoodTagSet {
    tiers: BTreeMap<String, BTreeSet<String>>,
}

impl MoodTagSet {
    pub const STRICT: &'static str = "mood-strict";
    pub const REGULAR: &'static str = "mood-regular";
    pub const LOOSE: &'static str = "mood-loose";

    /// Build from the three tier sets, expanding inclusively and
    /// dropping empty tiers.
    pub fn from_tiers(
        strict: BTreeSet<String>,
        regular: BTreeSet<String>,
        loose: BTreeSet<String>,
    ) -> Self {
        let mut regular_all = regular;
        regular_all.extend(strict.iter().cloned());

        let mut loose_all = loose;
        loose_all.extend(regular_all.iter().cloned());

        let mut tiers = BTreeMap::new();
        if !strict.is_empty() {
            tiers.insert(Self::STRICT.to_string(), strict);
        }
        if !regular_all.is_empty() {
            tiers.insert(Self::REGULAR.to_string(), regular_all);
        }
        if !loose_all.is_empty() {
            tiers.insert(Self::LOOSE.to_string(), loose_all);
        }
        Self { tiers }
    }

    pub fn strict(&self) -> Option<&BTreeSet<String>> {
        self.tiers.get(Self::STRICT)
    }

    pub fn regular(&self) -> Option<&BTreeSet<String>> {
        self.tiers.get(Self::REGULAR)
    }

    pub fn loose(&self) -> Option<&BTreeSet<String>> {
        self.tiers.get(Self::LOOSE)
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Tier key → labels, empty tiers already omitted
    pub fn as_map(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.tiers
    }
}
