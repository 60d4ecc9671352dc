//! Model descriptions and discovery
//!
//! One JSON sidecar per embedding extractor ("backbone") and per
//! classifier/regressor head, paired with a same-stem weights file.
//! Sidecars are parsed once at discovery; head kind resolves to a
//! closed enum so no string comparison happens at prediction time.

pub mod discovery;
pub mod spec;

pub use discovery::{discover_models, DiscoveredModels};
pub use spec::{BackboneModel, CascadeOverride, HeadKind, HeadModel, SegmentSpec};
