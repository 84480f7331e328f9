//! Core data types for the arousal decision engine
//!
//! Feature snapshots flow in from the capture collaborator once per tick.
//! Decisions, suggestions and session aggregates flow out to presentation.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoachError;

// ============================================================================
// Arousal bands
// ============================================================================

/// Discretized arousal level of the observed child.
///
/// Variants are declared in severity order so the derived `Ord` gives
/// `Shutdown < Calm < Building < High < Crisis`. Shutdown is a distinct
/// withdrawal state, not a quieter form of calm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArousalBand {
    Shutdown,
    Calm,
    Building,
    High,
    Crisis,
}

impl ArousalBand {
    /// All bands in severity order
    pub const ALL: [ArousalBand; 5] = [
        ArousalBand::Shutdown,
        ArousalBand::Calm,
        ArousalBand::Building,
        ArousalBand::High,
        ArousalBand::Crisis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArousalBand::Shutdown => "shutdown",
            ArousalBand::Calm => "calm",
            ArousalBand::Building => "building",
            ArousalBand::High => "high",
            ArousalBand::Crisis => "crisis",
        }
    }

    /// Map an integer severity score to a band.
    ///
    /// 0-1 calm, 2-3 building, 4 high, 5 and above crisis.
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=1 => ArousalBand::Calm,
            2..=3 => ArousalBand::Building,
            4 => ArousalBand::High,
            _ => ArousalBand::Crisis,
        }
    }
}

impl fmt::Display for ArousalBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArousalBand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shutdown" => Ok(ArousalBand::Shutdown),
            "calm" => Ok(ArousalBand::Calm),
            "building" => Ok(ArousalBand::Building),
            "high" => Ok(ArousalBand::High),
            "crisis" => Ok(ArousalBand::Crisis),
            other => Err(format!("unknown arousal band '{}'", other)),
        }
    }
}

// ============================================================================
// Signal vocabulary
// ============================================================================

/// Vocal stress category reported by the audio feature extractor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VocalStress {
    /// Flat or monotone affect
    Flat,
    Neutral,
    Elevated,
    Strained,
}

/// Behaviors the pose/audio detectors can label
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Behavior {
    Meltdown,
    SelfInjury,
    Aggression,
    Elopement,
    Screaming,
    Crying,
    Pacing,
    CoveringEars,
    AvertingGaze,
    HandFlapping,
    Rocking,
    Spinning,
}

/// Coarse grouping of behaviors used by the classifier and coaching table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorCategory {
    /// Meltdown-equivalent behaviors that force the crisis band
    Crisis,
    /// Outward distress (screaming, crying, pacing)
    Distress,
    /// Sensory avoidance (covering ears, averting gaze)
    SensoryAvoidance,
    /// Stimming and other self-regulatory movement
    SelfRegulatory,
}

impl Behavior {
    pub fn category(self) -> BehaviorCategory {
        match self {
            Behavior::Meltdown | Behavior::SelfInjury | Behavior::Aggression | Behavior::Elopement => {
                BehaviorCategory::Crisis
            }
            Behavior::Screaming | Behavior::Crying | Behavior::Pacing => BehaviorCategory::Distress,
            Behavior::CoveringEars | Behavior::AvertingGaze => BehaviorCategory::SensoryAvoidance,
            Behavior::HandFlapping | Behavior::Rocking | Behavior::Spinning => {
                BehaviorCategory::SelfRegulatory
            }
        }
    }

    pub fn is_crisis(self) -> bool {
        self.category() == BehaviorCategory::Crisis
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Behavior::Meltdown => "meltdown",
            Behavior::SelfInjury => "self_injury",
            Behavior::Aggression => "aggression",
            Behavior::Elopement => "elopement",
            Behavior::Screaming => "screaming",
            Behavior::Crying => "crying",
            Behavior::Pacing => "pacing",
            Behavior::CoveringEars => "covering_ears",
            Behavior::AvertingGaze => "averting_gaze",
            Behavior::HandFlapping => "hand_flapping",
            Behavior::Rocking => "rocking",
            Behavior::Spinning => "spinning",
        }
    }
}

/// Ambient lighting as seen by the camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lighting {
    Dim,
    #[default]
    Normal,
    Bright,
    Flickering,
}

/// Ambient noise level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseLevel {
    #[default]
    Quiet,
    Moderate,
    Loud,
}

/// Flags derived from the environment descriptor that coaching rules key on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentFlag {
    Loud,
    HarshLighting,
    Cluttered,
    Crowded,
}

/// Environment descriptor for one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EnvironmentDescriptor {
    #[serde(default)]
    pub lighting: Lighting,
    #[serde(default)]
    pub noise_level: NoiseLevel,
    #[serde(default)]
    pub cluttered: bool,
    #[serde(default)]
    pub crowded: bool,
}

impl EnvironmentDescriptor {
    /// Active environment flags, in a fixed order
    pub fn flags(&self) -> Vec<EnvironmentFlag> {
        let mut flags = Vec::new();
        if self.noise_level == NoiseLevel::Loud {
            flags.push(EnvironmentFlag::Loud);
        }
        if matches!(self.lighting, Lighting::Bright | Lighting::Flickering) {
            flags.push(EnvironmentFlag::HarshLighting);
        }
        if self.cluttered {
            flags.push(EnvironmentFlag::Cluttered);
        }
        if self.crowded {
            flags.push(EnvironmentFlag::Crowded);
        }
        flags
    }

    pub fn has_flag(&self, flag: EnvironmentFlag) -> bool {
        self.flags().contains(&flag)
    }
}

/// Caregiver stress level from the optional front-camera facial feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaregiverStress {
    Low,
    Moderate,
    High,
}

// ============================================================================
// Feature snapshot
// ============================================================================

/// One tick's worth of aggregated features.
///
/// Produced once per tick by the aggregator and only ever borrowed by the
/// rest of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    /// Monotonic tick number assigned by the aggregator
    pub tick: u64,
    /// When the underlying frame/audio window was captured
    pub captured_at: DateTime<Utc>,
    /// Overall body movement intensity (0-1)
    pub movement_intensity: f64,
    /// Postural tension score (0-1)
    #[serde(default)]
    pub tension_score: f64,
    /// Detected behaviors, de-duplicated, in first-detected order
    #[serde(default)]
    pub behaviors: Vec<Behavior>,
    /// Vocal stress category, absent when no voice was heard
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vocal_stress: Option<VocalStress>,
    /// Environment descriptor
    #[serde(default)]
    pub environment: EnvironmentDescriptor,
    /// Caregiver stress, present only when dual-signal capture is active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caregiver_stress: Option<CaregiverStress>,
}

impl FeatureSnapshot {
    /// A snapshot with no active signals: moderate movement, no voice, no behaviors
    pub fn neutral(tick: u64, captured_at: DateTime<Utc>) -> Self {
        Self {
            tick,
            captured_at,
            movement_intensity: 0.3,
            tension_score: 0.0,
            behaviors: Vec::new(),
            vocal_stress: None,
            environment: EnvironmentDescriptor::default(),
            caregiver_stress: None,
        }
    }

    /// Parse a recorded snapshot from JSON
    pub fn from_json(json: &str) -> Result<Self, CoachError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn has_crisis_behavior(&self) -> bool {
        self.behaviors.iter().any(|b| b.is_crisis())
    }

    pub fn has_active_behavior(&self) -> bool {
        !self.behaviors.is_empty()
    }
}

// ============================================================================
// Decisions
// ============================================================================

/// Which path produced a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Rule,
    Remote,
}

/// The single published arousal decision for a tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub band: ArousalBand,
    /// Confidence in the band (0-1)
    pub confidence: f64,
    pub source: DecisionSource,
    pub rationale: String,
    pub key_indicators: Vec<String>,
    /// Tick this decision was published for
    pub tick: u64,
    pub timestamp: DateTime<Utc>,
}

impl Decision {
    /// Re-stamp a decision for publication on a given tick.
    ///
    /// Cached remote verdicts are reused across ticks, so the tick and
    /// timestamp are assigned when the arbiter publishes.
    pub fn stamped(mut self, tick: u64, timestamp: DateTime<Utc>) -> Self {
        self.tick = tick;
        self.timestamp = timestamp;
        self
    }
}

// ============================================================================
// Suggestions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionSeverity {
    Low,
    Medium,
    High,
}

/// Suggestion category.
///
/// Declaration order is the tie-break order: safety first, sensory
/// environment second, relational tone last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionCategory {
    Safety,
    Sensory,
    Relational,
}

/// A coaching suggestion for the caregiver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    /// Stable rule identifier, used for cooldown de-duplication
    pub id: String,
    pub severity: SuggestionSeverity,
    pub category: SuggestionCategory,
    pub text: String,
}

// ============================================================================
// Session aggregates
// ============================================================================

/// Per-band occurrence counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandCounts {
    pub shutdown: u64,
    pub calm: u64,
    pub building: u64,
    pub high: u64,
    pub crisis: u64,
}

impl BandCounts {
    pub fn get(&self, band: ArousalBand) -> u64 {
        match band {
            ArousalBand::Shutdown => self.shutdown,
            ArousalBand::Calm => self.calm,
            ArousalBand::Building => self.building,
            ArousalBand::High => self.high,
            ArousalBand::Crisis => self.crisis,
        }
    }

    pub fn increment(&mut self, band: ArousalBand) {
        let slot = match band {
            ArousalBand::Shutdown => &mut self.shutdown,
            ArousalBand::Calm => &mut self.calm,
            ArousalBand::Building => &mut self.building,
            ArousalBand::High => &mut self.high,
            ArousalBand::Crisis => &mut self.crisis,
        };
        *slot = slot.saturating_add(1);
    }

    pub fn total(&self) -> u64 {
        ArousalBand::ALL.iter().map(|b| self.get(*b)).sum()
    }

    /// Most frequent band; ties resolve toward the more severe band
    pub fn dominant(&self) -> Option<ArousalBand> {
        if self.total() == 0 {
            return None;
        }
        ArousalBand::ALL.iter().copied().max_by_key(|b| (self.get(*b), *b))
    }

    /// Fraction of time spent in each band
    pub fn distribution(&self) -> BTreeMap<ArousalBand, f64> {
        let total = self.total();
        ArousalBand::ALL
            .iter()
            .map(|b| {
                let share = if total == 0 {
                    0.0
                } else {
                    self.get(*b) as f64 / total as f64
                };
                (*b, share)
            })
            .collect()
    }
}

/// Aggregate statistics for one session. No raw signal data is retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAggregate {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    /// Number of decisions published (always equals `band_counts.total()`)
    pub decisions_published: u64,
    /// Of those, how many came from the remote path
    pub remote_decisions: u64,
    pub band_counts: BandCounts,
    /// Distinct behaviors observed, in first-seen order
    pub behaviors_observed: Vec<Behavior>,
    /// Issuance counts per suggestion id
    pub suggestion_counts: BTreeMap<String, u32>,
}

// ============================================================================
// Profile
// ============================================================================

/// Traits of the observed child, supplied by the caller at session start.
///
/// Only used to build the remote reasoning context; carries no identifying data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_years: Option<u8>,
    #[serde(default)]
    pub diagnoses: Vec<String>,
    #[serde(default)]
    pub sensory_sensitivities: Vec<String>,
    #[serde(default)]
    pub known_triggers: Vec<String>,
    #[serde(default)]
    pub calming_strategies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub communication: Option<String>,
}

impl ChildProfile {
    pub fn from_json(json: &str) -> Result<Self, CoachError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_severity_order() {
        assert!(ArousalBand::Shutdown < ArousalBand::Calm);
        assert!(ArousalBand::Calm < ArousalBand::Building);
        assert!(ArousalBand::Building < ArousalBand::High);
        assert!(ArousalBand::High < ArousalBand::Crisis);
    }

    #[test]
    fn test_band_from_score() {
        assert_eq!(ArousalBand::from_score(0), ArousalBand::Calm);
        assert_eq!(ArousalBand::from_score(1), ArousalBand::Calm);
        assert_eq!(ArousalBand::from_score(2), ArousalBand::Building);
        assert_eq!(ArousalBand::from_score(3), ArousalBand::Building);
        assert_eq!(ArousalBand::from_score(4), ArousalBand::High);
        assert_eq!(ArousalBand::from_score(5), ArousalBand::Crisis);
        assert_eq!(ArousalBand::from_score(u8::MAX), ArousalBand::Crisis);
    }

    #[test]
    fn test_band_parse_is_lenient() {
        assert_eq!(" HIGH ".parse::<ArousalBand>(), Ok(ArousalBand::High));
        assert!("frantic".parse::<ArousalBand>().is_err());
    }

    #[test]
    fn test_behavior_serialization() {
        let json = serde_json::to_string(&Behavior::CoveringEars).unwrap();
        assert_eq!(json, "\"covering_ears\"");
        assert!(Behavior::Meltdown.is_crisis());
        assert!(!Behavior::Rocking.is_crisis());
    }

    #[test]
    fn test_environment_flags() {
        let env = EnvironmentDescriptor {
            lighting: Lighting::Flickering,
            noise_level: NoiseLevel::Loud,
            cluttered: false,
            crowded: true,
        };
        assert_eq!(
            env.flags(),
            vec![
                EnvironmentFlag::Loud,
                EnvironmentFlag::HarshLighting,
                EnvironmentFlag::Crowded
            ]
        );
        assert!(EnvironmentDescriptor::default().flags().is_empty());
    }

    #[test]
    fn test_snapshot_deserialization_with_defaults() {
        let json = r#"{
            "tick": 7,
            "captured_at": "2024-01-15T14:00:00Z",
            "movement_intensity": 0.9,
            "behaviors": ["meltdown"],
            "vocal_stress": "strained"
        }"#;

        let snapshot = FeatureSnapshot::from_json(json).unwrap();
        assert_eq!(snapshot.tick, 7);
        assert_eq!(snapshot.vocal_stress, Some(VocalStress::Strained));
        assert!(snapshot.has_crisis_behavior());
        assert_eq!(snapshot.environment, EnvironmentDescriptor::default());
        assert!(snapshot.caregiver_stress.is_none());
    }

    #[test]
    fn test_band_counts() {
        let mut counts = BandCounts::default();
        assert_eq!(counts.dominant(), None);

        counts.increment(ArousalBand::Calm);
        counts.increment(ArousalBand::Calm);
        counts.increment(ArousalBand::High);
        counts.increment(ArousalBand::High);

        assert_eq!(counts.total(), 4);
        // Ties go to the more severe band
        assert_eq!(counts.dominant(), Some(ArousalBand::High));

        let dist = counts.distribution();
        assert!((dist[&ArousalBand::Calm] - 0.5).abs() < 1e-9);
        assert_eq!(dist[&ArousalBand::Crisis], 0.0);
    }
}
