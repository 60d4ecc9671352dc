//! Cross-service pipeline tests
//!
//! Wires calibration, tier decisions, mood aggregation, tag building,
//! and the safe writer together the way a tagging run does — without
//! model weights, using synthetic head outputs.

use sonotag_engine::config::MoodConfig;
use sonotag_engine::services::calibration::{self, Calibration, HistogramSpec, SparseHistogram};
use sonotag_engine::services::mood_aggregator::{calibration_key, CalibrationMap, MoodAggregator};
use sonotag_engine::services::safe_writer::SafeWriter;
use sonotag_engine::services::tag_writer::{self, TagValue, TAGGER_VERSION_KEY};
use sonotag_engine::types::{Fingerprint, HeadOutput, Tier};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

fn output(head: &str, label: &str, raw: f32, tier: Option<Tier>) -> HeadOutput {
    HeadOutput {
        head_name: head.to_string(),
        model_key: format!("effnet:{}:1", head),
        label: label.to_string(),
        raw,
        calibrated: None,
        tier,
        calibration_id: None,
        mood_source: true,
    }
}

#[test]
fn test_calibrated_scores_flow_into_mood_tiers() {
    // Calibration derived from a real histogram walk
    let spec = HistogramSpec {
        lo: 0.0,
        hi: 1.0,
        bins: 100,
    };
    let samples: Vec<f64> = (0..2000).map(|i| (i % 100) as f64 / 100.0).collect();
    let hist = SparseHistogram::from_samples(spec, &samples);
    let summary = calibration::generate("happy", &hist).unwrap();
    let calib = Calibration::from(&summary);
    assert!(calib.is_valid());

    let mut calibrations = CalibrationMap::new();
    calibrations.insert(
        calibration_key("effnet:mood_happy:1", "mood_happy", "happy"),
        calib,
    );

    let aggregator = MoodAggregator::new(&MoodConfig::default());
    let outputs = vec![output("mood_happy", "happy", 0.92, Some(Tier::High))];
    let tags = aggregator.aggregate(&outputs, &calibrations);

    assert!(tags.strict().unwrap().contains("happy"));
}

#[test]
fn test_tier_inclusion_invariant_over_many_shapes() {
    let aggregator = MoodAggregator::new(&MoodConfig::default());

    let tier_cycle = [Some(Tier::High), Some(Tier::Medium), Some(Tier::Low), None];
    let labels = ["happy", "energetic", "party", "calm", "dark", "warm"];

    // Sweep tier assignments across labels; the containment chain must
    // hold for every combination that produces output
    for shift in 0..tier_cycle.len() {
        let outputs: Vec<HeadOutput> = labels
            .iter()
            .enumerate()
            .map(|(i, label)| {
                let tier = tier_cycle[(i + shift) % tier_cycle.len()];
                output(&format!("mood_{}", label), label, 0.5 + i as f32 * 0.05, tier)
            })
            .collect();

        let tags = aggregator.aggregate(&outputs, &CalibrationMap::new());

        let empty = BTreeSet::new();
        let strict = tags.strict().unwrap_or(&empty);
        let regular = tags.regular().unwrap_or(&empty);
        let loose = tags.loose().unwrap_or(&empty);

        assert!(strict.is_subset(regular), "strict ⊄ regular at shift {}", shift);
        assert!(regular.is_subset(loose), "regular ⊄ loose at shift {}", shift);

        // No label may appear below without appearing above
        for label in strict {
            assert!(regular.contains(label) && loose.contains(label));
        }
        for label in regular {
            assert!(loose.contains(label));
        }
    }
}

#[test]
fn test_opposing_high_tier_pair_never_coexists() {
    let aggregator = MoodAggregator::new(&MoodConfig::default());
    let outputs = vec![
        output("mood_happy", "happy", 0.95, Some(Tier::High)),
        output("mood_sad", "sad", 0.94, Some(Tier::High)),
    ];
    let tags = aggregator.aggregate(&outputs, &CalibrationMap::new());

    for set in [tags.strict(), tags.regular(), tags.loose()].into_iter().flatten() {
        assert!(!set.contains("happy"), "suppressed label leaked into output");
        assert!(!set.contains("sad"), "suppressed label leaked into output");
    }
}

/// Fingerprint for the fake "audio" files used below: digest of bytes
/// before the first `|`.
fn fake_fingerprint(path: &Path) -> anyhow::Result<String> {
    use sha2::{Digest, Sha256};
    let bytes = fs::read(path)?;
    let audio: Vec<u8> = bytes.split(|&b| b == b'|').next().unwrap_or(&[]).to_vec();
    Ok(format!("{:x}", Sha256::digest(&audio))
        .chars()
        .take(32)
        .collect())
}

#[test]
fn test_full_tag_write_path() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("track.mp3");
    fs::write(&file, b"PCMPCMPCM").unwrap();
    let expected = Fingerprint::from_digest_hex(&fake_fingerprint(&file).unwrap());

    // Aggregate → build the tag map → safe write with a serializing
    // write_fn standing in for the container-level tag encoder
    let aggregator = MoodAggregator::new(&MoodConfig::default());
    let outputs = vec![
        output("mood_happy", "happy", 0.92, Some(Tier::High)),
        output("mood_party", "party", 0.55, Some(Tier::Low)),
    ];
    let mood = aggregator.aggregate(&outputs, &CalibrationMap::new());
    let tags = tag_writer::build_tag_map(&outputs, &mood, "sonotag/test");

    assert!(matches!(
        tags.get(TAGGER_VERSION_KEY),
        Some(TagValue::Text(_))
    ));

    let serialized: String = tags
        .iter()
        .map(|(k, v)| format!("{}={:?};", k, v))
        .collect();

    let writer = SafeWriter::new(fake_fingerprint);
    writer
        .write_safe(&file, dir.path(), &expected, move |path: &Path| {
            let mut bytes = fs::read(path)?;
            bytes.push(b'|');
            bytes.extend_from_slice(serialized.as_bytes());
            fs::write(path, bytes)?;
            Ok(())
        })
        .unwrap();

    let written = fs::read_to_string(&file).unwrap();
    assert!(written.starts_with("PCMPCMPCM|"));
    assert!(written.contains("sonotag:mood-strict"));
    assert!(written.contains("sonotag:mood_happy:happy"));
}

#[test]
fn test_batch_isolation_one_bad_file_does_not_abort_others() {
    // Two files; the second one's write_fn corrupts audio content.
    // The batch caller gets per-file results: one Ok, one Err, and the
    // corrupted write never touches its original.
    let dir = tempfile::tempdir().unwrap();
    let writer = SafeWriter::new(fake_fingerprint);

    let files: Vec<PathBuf> = (0..2)
        .map(|i| {
            let path = dir.path().join(format!("track{}.mp3", i));
            fs::write(&path, format!("AUDIO{}", i)).unwrap();
            path
        })
        .collect();

    let mut results = Vec::new();
    for (i, file) in files.iter().enumerate() {
        let expected = Fingerprint::from_digest_hex(&fake_fingerprint(file).unwrap());
        let result = writer.write_safe(file, dir.path(), &expected, move |path: &Path| {
            if i == 1 {
                fs::write(path, b"CORRUPTED")?;
            } else {
                let mut bytes = fs::read(path)?;
                bytes.extend_from_slice(b"|tags");
                fs::write(path, bytes)?;
            }
            Ok(())
        });
        results.push(result);
    }

    assert!(results[0].is_ok());
    assert!(results[1].is_err());
    // The failed file's original is intact
    assert_eq!(fs::read(&files[1]).unwrap(), b"AUDIO1");
    // The good file carried its tags
    assert_eq!(fs::read(&files[0]).unwrap(), b"AUDIO0|tags");
}
