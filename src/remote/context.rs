//! Remote reasoning context bundle and fingerprint
//!
//! The bundle carries semantic content only. Tick numbers and capture times
//! are left out and continuous values are quantized, so back-to-back ticks of
//! an unchanged scene produce the same fingerprint.

use serde::Serialize;

use crate::history::HistorySummary;
use crate::remote::provider::ProviderId;
use crate::types::{
    Behavior, CaregiverStress, ChildProfile, EnvironmentDescriptor, FeatureSnapshot, VocalStress,
};

/// Quantization step for continuous signals
const QUANTUM: f64 = 0.1;

/// Semantic view of a snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotView {
    pub movement_intensity: f64,
    pub tension_score: f64,
    pub behaviors: Vec<Behavior>,
    pub vocal_stress: Option<VocalStress>,
    pub environment: EnvironmentDescriptor,
    pub caregiver_stress: Option<CaregiverStress>,
}

impl From<&FeatureSnapshot> for SnapshotView {
    fn from(snapshot: &FeatureSnapshot) -> Self {
        Self {
            movement_intensity: quantize(snapshot.movement_intensity),
            tension_score: quantize(snapshot.tension_score),
            behaviors: snapshot.behaviors.clone(),
            vocal_stress: snapshot.vocal_stress,
            environment: snapshot.environment,
            caregiver_stress: snapshot.caregiver_stress,
        }
    }
}

fn quantize(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    ((value.clamp(0.0, 1.0) / QUANTUM).round() * QUANTUM * 100.0).round() / 100.0
}

/// Everything sent to the remote provider for one evaluation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReasoningContext {
    pub profile: ChildProfile,
    pub snapshot: SnapshotView,
    pub history: HistorySummary,
}

impl ReasoningContext {
    pub fn new(profile: &ChildProfile, snapshot: &FeatureSnapshot, history: HistorySummary) -> Self {
        Self {
            profile: profile.clone(),
            snapshot: SnapshotView::from(snapshot),
            history,
        }
    }

    /// Canonical JSON bundle. Field order is fixed by declaration order.
    pub fn bundle(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Stable content hash of a bundle as addressed to a specific provider/model
pub fn fingerprint(provider: ProviderId, model: &str, bundle: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(provider.as_str().as_bytes());
    hasher.update(&[0]);
    hasher.update(model.as_bytes());
    hasher.update(&[0]);
    hasher.update(bundle.as_bytes());
    hasher.finalize().to_hex().to_string()
}
