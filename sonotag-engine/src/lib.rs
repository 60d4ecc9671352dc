//! sonotag-engine — audio mood/genre auto-tagging pipeline
//!
//! Takes an audio file through crash-isolated decoding, backbone/head
//! model inference, cascade tier decisions, percentile calibration,
//! mood aggregation, and a corruption-proof tag write. The web/CLI
//! orchestration around it lives elsewhere; this crate is the engine.

pub mod config;
pub mod db;
pub mod models;
pub mod services;
pub mod types;
pub mod utils;

pub use config::EngineConfig;
pub use services::audio_loader::{AudioLoader, LoadError};
pub use services::calibration::{Calibration, CalibrationSummary, SparseHistogram};
pub use services::file_analyzer::{AnalyzeError, FileAnalysis, FileAnalyzer};
pub use services::fingerprinter::Fingerprinter;
pub use services::mood_aggregator::MoodAggregator;
pub use services::predictor_cache::{GraphKey, PredictorCache};
pub use services::safe_writer::{SafeWriter, WriteError};
pub use services::tier_decision::TierDecider;
pub use types::{Fingerprint, HeadOutput, MoodTagSet, Tier, Waveform};

/// Tagger-version marker written with every tag set
pub fn tagger_version() -> String {
    format!("sonotag/{}", env!("CARGO_PKG_VERSION"))
}
