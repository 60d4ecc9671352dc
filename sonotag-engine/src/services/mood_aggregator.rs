//! Mood tag aggregation
//!
//! Merges every mood-source head's outputs into the three inclusive
//! tag sets (strict ⊆ regular ⊆ loose). Opposing labels (happy/sad,
//! aggressive/relaxed, ...) are resolved by suppressing both sides —
//! contradictory tags must never coexist, and the conflict is
//! expected steady-state behavior, not a fault.

use crate::config::MoodConfig;
use crate::services::calibration::{self, Calibration};
use crate::types::{HeadOutput, MoodTagSet, Tier};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Calibration lookup key: `{model_key}::{head_name}::{label}`
pub fn calibration_key(model_key: &str, head_name: &str, label: &str) -> String {
    format!("{}::{}::{}", model_key, head_name, label)
}

/// Per-label calibrations available to the aggregator
pub type CalibrationMap = HashMap<String, Calibration>;

/// Mood aggregator
pub struct MoodAggregator {
    opposing_pairs: Vec<(String, String)>,
}

impl MoodAggregator {
    pub fn new(config: &MoodConfig) -> Self {
        Self {
            opposing_pairs: config.opposing_pairs.clone(),
        }
    }

    /// Aggregate head outputs into the inclusive tag sets.
    ///
    /// Only outputs from mood-source heads with a non-null tier
    /// participate. A head that failed upstream is simply absent from
    /// `outputs` — partial aggregation is explicit, never padded with
    /// defaults.
    pub fn aggregate(&self, outputs: &[HeadOutput], calibrations: &CalibrationMap) -> MoodTagSet {
        // Tier map: label → (tier, calibrated-or-raw score), keeping
        // the strongest entry when several heads emit the same label.
        let mut tier_map: BTreeMap<String, (Tier, f32)> = BTreeMap::new();

        for output in outputs {
            if !output.mood_source {
                continue;
            }
            let Some(tier) = output.tier else { continue };

            let key = calibration_key(&output.model_key, &output.head_name, &output.label);
            let value =
                calibration::apply(output.raw as f64, calibrations.get(&key)) as f32;

            match tier_map.get(&output.label) {
                Some(&(existing_tier, existing_value))
                    if conflict_score(existing_tier, existing_value)
                        >= conflict_score(tier, value) => {}
                _ => {
                    tier_map.insert(output.label.clone(), (tier, value));
                }
            }
        }

        self.suppress_conflicts(&mut tier_map);

        let mut strict = BTreeSet::new();
        let mut regular = BTreeSet::new();
        let mut loose = BTreeSet::new();
        for (label, (tier, _)) in &tier_map {
            match tier {
                Tier::High => {
                    strict.insert(label.clone());
                }
                Tier::Medium => {
                    regular.insert(label.clone());
                }
                Tier::Low => {
                    loose.insert(label.clone());
                }
            }
        }

        MoodTagSet::from_tiers(strict, regular, loose)
    }

    /// For each opposing pair, find the best key on each side; when
    /// both sides exist, drop both.
    fn suppress_conflicts(&self, tier_map: &mut BTreeMap<String, (Tier, f32)>) {
        for (left, right) in &self.opposing_pairs {
            let left_best = best_side_key(tier_map, left);
            let right_best = best_side_key(tier_map, right);

            if let (Some(left_key), Some(right_key)) = (left_best, right_best) {
                debug!(
                    left = %left_key,
                    right = %right_key,
                    "Opposing mood labels both present; suppressing both"
                );
                tier_map.remove(&left_key);
                tier_map.remove(&right_key);
            }
        }
    }
}

/// Conflict ranking: tier dominates, probability breaks ties.
fn conflict_score(tier: Tier, value: f32) -> f32 {
    tier.rank() as f32 * 100.0 + value
}

/// Best-scoring tier-map key matching one side of an opposing pair.
///
/// A side matches its exact label; negated variants (`non_x`/`not_x`)
/// never match the positive side.
fn best_side_key(tier_map: &BTreeMap<String, (Tier, f32)>, side: &str) -> Option<String> {
    tier_map
        .iter()
        .filter(|(label, _)| label.as_str() == side)
        .max_by(|a, b| {
            conflict_score(a.1 .0, a.1 .1).total_cmp(&conflict_score(b.1 .0, b.1 .1))
        })
        .map(|(label, _)| label.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MoodConfig;

    fn output(label: &str, raw: f32, tier: Option<Tier>) -> HeadOutput {
        HeadOutput {
            head_name: format!("mood_{}", label),
            model_key: format!("effnet:mood_{}:1", label),
            label: label.to_string(),
            raw,
            calibrated: None,
            tier,
            calibration_id: None,
            mood_source: true,
        }
    }

    fn aggregator() -> MoodAggregator {
        MoodAggregator::new(&MoodConfig::default())
    }

    #[test]
    fn test_tiers_bucket_and_expand_inclusively() {
        let outputs = vec![
            output("happy", 0.9, Some(Tier::High)),
            output("energetic", 0.7, Some(Tier::Medium)),
            output("party", 0.5, Some(Tier::Low)),
        ];
        let tags = aggregator().aggregate(&outputs, &CalibrationMap::new());

        let strict = tags.strict().unwrap();
        let regular = tags.regular().unwrap();
        let loose = tags.loose().unwrap();

        assert!(strict.contains("happy"));
        assert!(regular.contains("happy") && regular.contains("energetic"));
        assert!(loose.contains("happy") && loose.contains("energetic") && loose.contains("party"));

        // Inclusion invariant
        assert!(strict.is_subset(regular));
        assert!(regular.is_subset(loose));
    }

    #[test]
    fn test_conflict_suppression_drops_both_sides() {
        let outputs = vec![
            output("happy", 0.9, Some(Tier::High)),
            output("sad", 0.85, Some(Tier::High)),
            output("energetic", 0.7, Some(Tier::Medium)),
        ];
        let tags = aggregator().aggregate(&outputs, &CalibrationMap::new());

        for tier in [tags.strict(), tags.regular(), tags.loose()] {
            if let Some(set) = tier {
                assert!(!set.contains("happy"));
                assert!(!set.contains("sad"));
            }
        }
        assert!(tags.loose().unwrap().contains("energetic"));
    }

    #[test]
    fn test_one_sided_pair_survives() {
        let outputs = vec![output("happy", 0.9, Some(Tier::High))];
        let tags = aggregator().aggregate(&outputs, &CalibrationMap::new());
        assert!(tags.strict().unwrap().contains("happy"));
    }

    #[test]
    fn test_null_tier_and_non_mood_sources_excluded() {
        let mut not_mood = output("instrumental", 0.95, Some(Tier::High));
        not_mood.mood_source = false;

        let outputs = vec![
            output("happy", 0.9, None), // unstable, no tier
            not_mood,
        ];
        let tags = aggregator().aggregate(&outputs, &CalibrationMap::new());
        assert!(tags.is_empty());
    }

    #[test]
    fn test_calibration_applied_per_label() {
        let outputs = vec![output("happy", 0.5, Some(Tier::High))];
        let mut calibrations = CalibrationMap::new();
        calibrations.insert(
            calibration_key("effnet:mood_happy:1", "mood_happy", "happy"),
            Calibration { p5: 0.0, p95: 0.5 },
        );

        // Calibrated value (1.0) decides ranking; the label itself
        // still lands in strict via its tier
        let tags = aggregator().aggregate(&outputs, &calibrations);
        assert!(tags.strict().unwrap().contains("happy"));
    }

    #[test]
    fn test_duplicate_label_keeps_strongest() {
        let mut weak = output("happy", 0.5, Some(Tier::Low));
        weak.head_name = "mood_mirex".to_string();
        let outputs = vec![weak, output("happy", 0.9, Some(Tier::High))];

        let tags = aggregator().aggregate(&outputs, &CalibrationMap::new());
        // High wins, so the label appears in strict
        assert!(tags.strict().unwrap().contains("happy"));
    }

    #[test]
    fn test_empty_input_is_empty_output() {
        let tags = aggregator().aggregate(&[], &CalibrationMap::new());
        assert!(tags.is_empty());
        assert!(tags.as_map().is_empty());
    }
}
