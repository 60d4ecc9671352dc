//! Cascade tier decisions
//!
//! Converts a head's pooled score vector into selected labels with a
//! high/medium/low confidence tier. Multilabel heads run the full
//! cascade (min-confidence, counter-label ratio/gap, temporal
//! stability ceiling); multiclass heads use adaptive top-K over a
//! normalized simplex; regression heads never select or reject — they
//! emit every label's raw value and the mood layer applies the
//! intensity transform separately.

use crate::config::{
    CascadeConfig, EngineConfig, MulticlassConfig, RegressionTierConfig, StabilityConfig, TierGate,
};
use crate::models::{HeadKind, HeadModel};
use crate::types::Tier;
use tracing::trace;

/// Counter-confidence floor for the ratio computation
const COUNTER_EPSILON: f32 = 1e-6;

/// One decided label
#[derive(Debug, Clone, PartialEq)]
pub struct LabelDecision {
    pub label: String,
    pub probability: f32,
    /// `None` only for regression heads (which always emit)
    pub tier: Option<Tier>,
}

/// Tier decision engine
pub struct TierDecider {
    cascade: CascadeConfig,
    stability: StabilityConfig,
    regression: RegressionTierConfig,
    multiclass: MulticlassConfig,
}

impl TierDecider {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            cascade: config.cascade.clone(),
            stability: config.stability.clone(),
            regression: config.regression.clone(),
            multiclass: config.multiclass.clone(),
        }
    }

    /// Decide labels for one head's pooled scores.
    ///
    /// `stds` is the per-label temporal standard deviation across
    /// segments; when supplied it caps the maximum achievable tier and
    /// is evaluated before the ratio/gap gate.
    pub fn decide(
        &self,
        head: &HeadModel,
        pooled: &[f32],
        stds: Option<&[f32]>,
    ) -> Vec<LabelDecision> {
        match head.kind {
            HeadKind::Multilabel => self.decide_multilabel(head, pooled, stds),
            HeadKind::Multiclass => self.decide_multiclass(head, pooled),
            HeadKind::Regression => head
                .labels
                .iter()
                .zip(pooled.iter())
                .map(|(label, &value)| LabelDecision {
                    label: label.clone(),
                    probability: value,
                    tier: None,
                })
                .collect(),
        }
    }

    fn decide_multilabel(
        &self,
        head: &HeadModel,
        pooled: &[f32],
        stds: Option<&[f32]>,
    ) -> Vec<LabelDecision> {
        let (min_conf, gates) = self.effective_gates(head);
        let mut decisions = Vec::new();

        for (i, label) in head.labels.iter().enumerate() {
            let Some(&p) = pooled.get(i) else { break };

            // NaN fails every comparison and drops out here
            if !(p >= min_conf && p >= gates[2].prob) {
                continue;
            }

            // Stability ceiling comes before the ratio/gap gate
            let cap = match stds.and_then(|s| s.get(i).copied()) {
                Some(std) => match self.tier_cap(std) {
                    Some(cap) => cap,
                    None => {
                        trace!(label = %label, std, "Unstable measurement; no tier possible");
                        continue;
                    }
                },
                None => Tier::High,
            };

            let counter = self.counter_confidence(head, pooled, i);
            let ratio = p / counter.max(COUNTER_EPSILON);
            let gap = p - counter;

            let tier = [Tier::High, Tier::Medium, Tier::Low]
                .into_iter()
                .filter(|t| t.rank() <= cap.rank())
                .find(|t| {
                    let gate = gate_for(&gates, *t);
                    p >= gate.prob && ratio >= gate.ratio && gap >= gate.gap
                });

            // No matching tier drops the label entirely; there is no
            // "low" fallback.
            if let Some(tier) = tier {
                decisions.push(LabelDecision {
                    label: label.clone(),
                    probability: p,
                    tier: Some(tier),
                });
            }
        }

        decisions
    }

    fn decide_multiclass(&self, head: &HeadModel, pooled: &[f32]) -> Vec<LabelDecision> {
        let min_conf = head.min_conf.unwrap_or(self.cascade.min_conf);
        let top_ratio = head.top_ratio.unwrap_or(self.multiclass.top_ratio);
        let max_classes = head.max_classes.unwrap_or(self.multiclass.max_classes);
        let (_, gates) = self.effective_gates(head);

        // Normalize to a probability simplex over finite, nonnegative
        // scores.
        let clipped: Vec<f32> = pooled
            .iter()
            .map(|&v| if v.is_finite() && v > 0.0 { v } else { 0.0 })
            .collect();
        let total: f32 = clipped.iter().sum();
        if total <= 0.0 {
            return Vec::new();
        }

        let mut ranked: Vec<(usize, f32)> = clipped
            .iter()
            .enumerate()
            .take(head.labels.len())
            .map(|(i, &v)| (i, v / total))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

        let top = match ranked.first() {
            Some(&(_, p)) => p,
            None => return Vec::new(),
        };

        let mut decisions = Vec::new();
        for (i, p) in ranked {
            if decisions.len() >= max_classes {
                break;
            }
            if p < min_conf || p < top * top_ratio {
                break;
            }

            let tier = if p >= gates[0].prob {
                Tier::High
            } else if p >= gates[1].prob {
                Tier::Medium
            } else {
                Tier::Low
            };

            decisions.push(LabelDecision {
                label: head.labels[i].clone(),
                probability: p,
                tier: Some(tier),
            });
        }
        decisions
    }

    /// Intensity transform for regression values: segment mean against
    /// fixed strong/weak thresholds with a variance-gated tier cap.
    pub fn regression_intensity(&self, mean: f32, std: f32) -> Option<Tier> {
        if !mean.is_finite() || std >= self.regression.forbid_std {
            return None;
        }

        let base = if mean >= self.regression.strong {
            Tier::High
        } else if mean >= self.regression.weak {
            Tier::Medium
        } else {
            return None;
        };

        if std >= self.regression.cap_low_std {
            Some(Tier::Low)
        } else {
            Some(base)
        }
    }

    /// Maximum achievable tier for a given temporal std; `None` means
    /// the measurement is too unstable for any tier.
    fn tier_cap(&self, std: f32) -> Option<Tier> {
        if !std.is_finite() || std >= self.stability.acceptable {
            None
        } else if std >= self.stability.stable {
            Some(Tier::Low)
        } else if std >= self.stability.very_stable {
            Some(Tier::Medium)
        } else {
            Some(Tier::High)
        }
    }

    /// Counter-confidence: explicit negation label when present, the
    /// opposing label in a binary head, else the max of all other
    /// labels in the head.
    fn counter_confidence(&self, head: &HeadModel, pooled: &[f32], index: usize) -> f32 {
        if let Some(counter_label) = head.counter_label(&head.labels[index]) {
            if let Some(j) = head.labels.iter().position(|l| l == counter_label) {
                let v = pooled.get(j).copied().unwrap_or(0.0);
                return if v.is_finite() { v } else { 0.0 };
            }
        }

        pooled
            .iter()
            .enumerate()
            .filter(|(j, v)| *j != index && *j < head.labels.len() && v.is_finite())
            .map(|(_, &v)| v)
            .fold(0.0f32, f32::max)
    }

    /// Merge per-head sidecar overrides onto the configured cascade.
    /// Returns (min_conf, [high, medium, low]).
    fn effective_gates(&self, head: &HeadModel) -> (f32, [TierGate; 3]) {
        let mut high = self.cascade.high;
        let mut medium = self.cascade.medium;
        let mut low = self.cascade.low;

        if let Some(o) = &head.cascade {
            apply_override(&mut high, o.high, o.ratio_high, o.gap_high);
            apply_override(&mut medium, o.medium, o.ratio_medium, o.gap_medium);
            apply_override(&mut low, o.low, o.ratio_low, o.gap_low);
        }

        let min_conf = head.min_conf.unwrap_or(self.cascade.min_conf);
        (min_conf, [high, medium, low])
    }
}

fn apply_override(gate: &mut TierGate, prob: Option<f32>, ratio: Option<f32>, gap: Option<f32>) {
    if let Some(p) = prob {
        gate.prob = p;
    }
    if let Some(r) = ratio {
        gate.ratio = r;
    }
    if let Some(g) = gap {
        gate.gap = g;
    }
}

fn gate_for(gates: &[TierGate; 3], tier: Tier) -> &TierGate {
    match tier {
        Tier::High => &gates[0],
        Tier::Medium => &gates[1],
        Tier::Low => &gates[2],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CascadeOverride, HeadModel};
    use std::path::PathBuf;

    fn head(kind: HeadKind, labels: &[&str]) -> HeadModel {
        HeadModel {
            name: "test_head".to_string(),
            kind,
            labels: labels.iter().map(|s| s.to_string()).collect(),
            backbone: "effnet".to_string(),
            head_type: "mood".to_string(),
            weights_path: PathBuf::from("/models/test.onnx"),
            input_name: "embeddings".to_string(),
            output_name: "activations".to_string(),
            min_conf: None,
            max_classes: None,
            top_ratio: None,
            cascade: None,
            mood_source: true,
            release_date: None,
        }
    }

    fn decider() -> TierDecider {
        TierDecider::new(&EngineConfig::default())
    }

    #[test]
    fn test_multilabel_high_tier_with_negation_counter() {
        let head = head(HeadKind::Multilabel, &["happy", "non_happy"]);
        // p=0.9 vs counter 0.1: ratio 9.0, gap 0.8 → high
        let decisions = decider().decide(&head, &[0.9, 0.1], None);

        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].label, "happy");
        assert_eq!(decisions[0].tier, Some(Tier::High));
    }

    #[test]
    fn test_multilabel_below_min_conf_dropped() {
        let head = head(HeadKind::Multilabel, &["happy", "non_happy"]);
        let decisions = decider().decide(&head, &[0.3, 0.1], None);
        assert!(decisions.is_empty());
    }

    #[test]
    fn test_multilabel_no_gate_match_drops_label_entirely() {
        let head = head(HeadKind::Multilabel, &["happy", "non_happy"]);
        // Clears min_conf and the low prob gate, but counter is close:
        // ratio 0.5/0.46 ≈ 1.09 < 1.2 → not even low; no fallback
        let decisions = decider().decide(&head, &[0.5, 0.46], None);
        assert!(decisions.is_empty());
    }

    #[test]
    fn test_multilabel_gap_gate_limits_tier() {
        let head = head(HeadKind::Multilabel, &["happy", "non_happy"]);
        // p=0.78 counter=0.55: ratio 1.42, gap 0.23 → fails high
        // (ratio < 2.0) and fails medium (ratio < 1.5); low matches
        let decisions = decider().decide(&head, &[0.78, 0.55], None);
        assert_eq!(decisions[0].tier, Some(Tier::Low));
    }

    #[test]
    fn test_stability_ceiling_forbids_tier() {
        let head = head(HeadKind::Multilabel, &["happy", "non_happy"]);
        // Scores would earn high; std ≥ acceptable forbids everything
        let decisions = decider().decide(&head, &[0.9, 0.05], Some(&[0.40, 0.0]));
        assert!(decisions.is_empty());
    }

    #[test]
    fn test_stability_ceiling_caps_at_medium() {
        let head = head(HeadKind::Multilabel, &["happy", "non_happy"]);
        // std 0.2 ∈ [very_stable, stable) caps at medium even though
        // the scores match the high gate
        let decisions = decider().decide(&head, &[0.9, 0.05], Some(&[0.20, 0.0]));
        assert_eq!(decisions[0].tier, Some(Tier::Medium));
    }

    #[test]
    fn test_stability_ceiling_caps_at_low() {
        let head = head(HeadKind::Multilabel, &["happy", "non_happy"]);
        let decisions = decider().decide(&head, &[0.9, 0.05], Some(&[0.30, 0.0]));
        assert_eq!(decisions[0].tier, Some(Tier::Low));
    }

    #[test]
    fn test_nan_score_dropped() {
        let head = head(HeadKind::Multilabel, &["happy", "non_happy"]);
        let decisions = decider().decide(&head, &[f32::NAN, 0.1], None);
        assert!(decisions.is_empty());
    }

    #[test]
    fn test_counter_from_max_of_others() {
        let head = head(HeadKind::Multilabel, &["rock", "jazz", "ambient"]);
        // rock 0.8; strongest other is jazz 0.2 → ratio 4.0, gap 0.6
        let decisions = decider().decide(&head, &[0.8, 0.2, 0.05], None);
        let rock = decisions.iter().find(|d| d.label == "rock").unwrap();
        assert_eq!(rock.tier, Some(Tier::High));
    }

    #[test]
    fn test_sidecar_override_tightens_high_gate() {
        let mut h = head(HeadKind::Multilabel, &["happy", "non_happy"]);
        h.cascade = Some(CascadeOverride {
            high: Some(0.95),
            ..Default::default()
        });
        // 0.9 no longer reaches high; medium gate still matches
        let decisions = decider().decide(&h, &[0.9, 0.05], None);
        assert_eq!(decisions[0].tier, Some(Tier::Medium));
    }

    #[test]
    fn test_multiclass_adaptive_top_k() {
        let mut h = head(HeadKind::Multiclass, &["rock", "jazz", "pop", "folk"]);
        h.min_conf = Some(0.1);
        // Normalized: 0.5, 0.3, 0.15, 0.05; top_ratio 0.5 → cutoff 0.25
        let decisions = decider().decide(&h, &[0.5, 0.3, 0.15, 0.05], None);

        let labels: Vec<&str> = decisions.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, vec!["rock", "jazz"]);
    }

    #[test]
    fn test_multiclass_max_classes_cap() {
        let mut h = head(HeadKind::Multiclass, &["a", "b", "c", "d"]);
        h.min_conf = Some(0.01);
        h.top_ratio = Some(0.01);
        h.max_classes = Some(2);
        let decisions = decider().decide(&h, &[0.4, 0.3, 0.2, 0.1], None);
        assert_eq!(decisions.len(), 2);
    }

    #[test]
    fn test_multiclass_all_zero_scores_empty() {
        let h = head(HeadKind::Multiclass, &["a", "b"]);
        assert!(decider().decide(&h, &[0.0, 0.0], None).is_empty());
    }

    #[test]
    fn test_regression_emits_every_label_untier() {
        let h = head(HeadKind::Regression, &["arousal", "valence"]);
        let decisions = decider().decide(&h, &[0.72, 0.31], None);

        assert_eq!(decisions.len(), 2);
        assert!(decisions.iter().all(|d| d.tier.is_none()));
        assert_eq!(decisions[0].probability, 0.72);
    }

    #[test]
    fn test_regression_intensity_transform() {
        let d = decider();
        // Strong, stable → high
        assert_eq!(d.regression_intensity(0.7, 0.05), Some(Tier::High));
        // Weak-range mean → medium
        assert_eq!(d.regression_intensity(0.5, 0.05), Some(Tier::Medium));
        // Below weak → nothing
        assert_eq!(d.regression_intensity(0.3, 0.05), None);
        // Variance gate caps at low
        assert_eq!(d.regression_intensity(0.7, 0.30), Some(Tier::Low));
        // Too unstable forbids
        assert_eq!(d.regression_intensity(0.7, 0.40), None);
    }
}
