//! Rule-based arousal classifier
//!
//! Pure and total: maps a snapshot to a band with a fixed confidence. No
//! network, no state, no failure modes. Missing optional signals simply do
//! not contribute.

use crate::config::ClassifierThresholds;
use crate::types::{
    ArousalBand, BehaviorCategory, CaregiverStress, Decision, DecisionSource, FeatureSnapshot,
    VocalStress,
};

/// Score assigned when a crisis behavior is present
pub const MAX_SCORE: u8 = 5;

/// Scored breakdown of a snapshot, before band mapping
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub score: u8,
    pub crisis_behavior: bool,
    pub shutdown: bool,
    pub key_indicators: Vec<String>,
    pub notes: Vec<String>,
}

/// Rule-based classifier
#[derive(Debug, Clone, Default)]
pub struct RuleClassifier {
    thresholds: ClassifierThresholds,
}

impl RuleClassifier {
    pub fn new(thresholds: ClassifierThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &ClassifierThresholds {
        &self.thresholds
    }

    /// Classify a snapshot into a rule-sourced decision
    pub fn classify(&self, snapshot: &FeatureSnapshot) -> Decision {
        let assessment = self.assess(snapshot);

        let band = if assessment.crisis_behavior {
            ArousalBand::Crisis
        } else if assessment.shutdown {
            ArousalBand::Shutdown
        } else {
            ArousalBand::from_score(assessment.score)
        };

        let rationale = if assessment.notes.is_empty() {
            format!("score {} -> {}: no elevated signals", assessment.score, band)
        } else {
            format!(
                "score {} -> {}: {}",
                assessment.score,
                band,
                assessment.notes.join("; ")
            )
        };

        Decision {
            band,
            confidence: self.thresholds.rule_confidence.clamp(0.0, 1.0),
            source: DecisionSource::Rule,
            rationale,
            key_indicators: assessment.key_indicators,
            tick: snapshot.tick,
            timestamp: snapshot.captured_at,
        }
    }

    /// Compute the weighted severity score and overrides for a snapshot
    pub fn assess(&self, snapshot: &FeatureSnapshot) -> Assessment {
        let t = &self.thresholds;
        let movement = sanitize(snapshot.movement_intensity);
        let tension = sanitize(snapshot.tension_score);

        let mut score: u8 = 0;
        let mut key_indicators = Vec::new();
        let mut notes = Vec::new();

        if movement > t.movement_extreme {
            score += 2;
            key_indicators.push("movement_extreme".to_string());
            notes.push(format!("extreme movement ({:.2})", movement));
        } else if movement > t.movement_high {
            score += 1;
            key_indicators.push("movement_high".to_string());
            notes.push(format!("high movement ({:.2})", movement));
        }

        match snapshot.vocal_stress {
            Some(VocalStress::Strained) => {
                score += 2;
                key_indicators.push("vocal_strained".to_string());
                notes.push("strained vocalization".to_string());
            }
            Some(VocalStress::Elevated) => {
                score += 1;
                key_indicators.push("vocal_elevated".to_string());
                notes.push("elevated vocalization".to_string());
            }
            Some(VocalStress::Flat) | Some(VocalStress::Neutral) | None => {}
        }

        if tension > t.tension_high {
            score += 1;
            key_indicators.push("tension_high".to_string());
            notes.push(format!("high postural tension ({:.2})", tension));
        }

        if snapshot
            .behaviors
            .iter()
            .any(|b| b.category() == BehaviorCategory::Distress)
        {
            score += 1;
            notes.push("distress behavior observed".to_string());
        }

        for (i, behavior) in snapshot.behaviors.iter().enumerate() {
            if !snapshot.behaviors[..i].contains(behavior) {
                key_indicators.push(format!("behavior:{}", behavior.as_str()));
            }
        }

        let crisis_behavior = snapshot.has_crisis_behavior();
        if crisis_behavior {
            score = MAX_SCORE;
            notes.push("crisis behavior present".to_string());
        }

        // Caregiver stress informs coaching only; it never moves the child's score
        if snapshot.caregiver_stress == Some(CaregiverStress::High) {
            notes.push("caregiver stress high (not scored)".to_string());
        }

        let vocal_flat_or_absent = matches!(snapshot.vocal_stress, None | Some(VocalStress::Flat));
        let shutdown = !crisis_behavior
            && movement < t.movement_low
            && vocal_flat_or_absent
            && !snapshot.has_active_behavior();
        if shutdown {
            key_indicators.push("shutdown_pattern".to_string());
            notes.push("minimal movement with flat or absent voice".to_string());
        }

        Assessment {
            score: score.min(MAX_SCORE),
            crisis_behavior,
            shutdown,
            key_indicators,
            notes,
        }
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Behavior;
    use chrono::{TimeZone, Utc};

    fn snapshot(movement: f64, vocal: Option<VocalStress>, behaviors: Vec<Behavior>) -> FeatureSnapshot {
        FeatureSnapshot {
            movement_intensity: movement,
            vocal_stress: vocal,
            behaviors,
            ..FeatureSnapshot::neutral(1, Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap())
        }
    }

    #[test]
    fn test_meltdown_is_crisis() {
        let classifier = RuleClassifier::default();
        let decision = classifier.classify(&snapshot(
            0.9,
            Some(VocalStress::Strained),
            vec![Behavior::Meltdown],
        ));

        assert_eq!(decision.band, ArousalBand::Crisis);
        assert_eq!(decision.source, DecisionSource::Rule);
        assert!(decision
            .key_indicators
            .contains(&"behavior:meltdown".to_string()));
    }

    #[test]
    fn test_repeated_behaviors_listed_once() {
        let decision = RuleClassifier::default().classify(&snapshot(
            0.5,
            None,
            vec![Behavior::Pacing, Behavior::Rocking, Behavior::Pacing],
        ));

        assert_eq!(
            decision.key_indicators,
            vec!["behavior:pacing".to_string(), "behavior:rocking".to_string()]
        );
    }

    #[test]
    fn test_crisis_behavior_overrides_everything() {
        let classifier = RuleClassifier::default();
        for behavior in [
            Behavior::Meltdown,
            Behavior::SelfInjury,
            Behavior::Aggression,
            Behavior::Elopement,
        ] {
            // Even with shutdown-like movement and no voice
            let decision = classifier.classify(&snapshot(0.0, None, vec![behavior]));
            assert_eq!(decision.band, ArousalBand::Crisis, "{:?}", behavior);
        }
    }

    #[test]
    fn test_low_movement_no_voice_is_shutdown() {
        let classifier = RuleClassifier::default();
        assert_eq!(
            classifier.classify(&snapshot(0.05, None, vec![])).band,
            ArousalBand::Shutdown
        );
        assert_eq!(
            classifier
                .classify(&snapshot(0.05, Some(VocalStress::Flat), vec![]))
                .band,
            ArousalBand::Shutdown
        );
    }

    #[test]
    fn test_shutdown_requires_all_conditions() {
        let classifier = RuleClassifier::default();
        // Voice present and neutral
        assert_eq!(
            classifier
                .classify(&snapshot(0.05, Some(VocalStress::Neutral), vec![]))
                .band,
            ArousalBand::Calm
        );
        // Self-regulatory behavior is still an active behavior
        assert_eq!(
            classifier
                .classify(&snapshot(0.05, None, vec![Behavior::Rocking]))
                .band,
            ArousalBand::Calm
        );
        // Moderate movement
        assert_eq!(
            classifier.classify(&snapshot(0.3, None, vec![])).band,
            ArousalBand::Calm
        );
    }

    #[test]
    fn test_score_to_band_mapping() {
        let classifier = RuleClassifier::default();

        // movement high (+1), elevated (+1) = 2 -> building
        assert_eq!(
            classifier
                .classify(&snapshot(0.6, Some(VocalStress::Elevated), vec![]))
                .band,
            ArousalBand::Building
        );
        // movement extreme (+2), elevated (+1) = 3 -> building
        assert_eq!(
            classifier
                .classify(&snapshot(0.9, Some(VocalStress::Elevated), vec![]))
                .band,
            ArousalBand::Building
        );
        // movement extreme (+2), strained (+2) = 4 -> high
        assert_eq!(
            classifier
                .classify(&snapshot(0.9, Some(VocalStress::Strained), vec![]))
                .band,
            ArousalBand::High
        );
        // plus distress behavior (+1) = 5 -> crisis
        assert_eq!(
            classifier
                .classify(&snapshot(
                    0.9,
                    Some(VocalStress::Strained),
                    vec![Behavior::Screaming]
                ))
                .band,
            ArousalBand::Crisis
        );
    }

    #[test]
    fn test_caregiver_stress_not_scored() {
        let classifier = RuleClassifier::default();
        let mut snap = snapshot(0.6, Some(VocalStress::Elevated), vec![]);
        let without = classifier.assess(&snap);

        snap.caregiver_stress = Some(CaregiverStress::High);
        let with = classifier.assess(&snap);
        let decision = classifier.classify(&snap);

        assert_eq!(without.score, with.score);
        assert_eq!(decision.band, ArousalBand::Building);
        assert!(decision.rationale.contains("caregiver stress high"));
    }

    #[test]
    fn test_out_of_range_input_is_clamped() {
        let classifier = RuleClassifier::default();
        let decision = classifier.classify(&snapshot(f64::NAN, None, vec![]));
        assert_eq!(decision.band, ArousalBand::Shutdown);

        let decision = classifier.classify(&snapshot(42.0, None, vec![]));
        assert_eq!(decision.band, ArousalBand::Building);
    }

    #[test]
    fn test_confidence_is_fixed() {
        let classifier = RuleClassifier::default();
        let calm = classifier.classify(&snapshot(0.3, None, vec![]));
        let crisis = classifier.classify(&snapshot(1.0, None, vec![Behavior::Meltdown]));
        assert_eq!(calm.confidence, crisis.confidence);
        assert_eq!(calm.confidence, ClassifierThresholds::default().rule_confidence);
    }

    #[test]
    fn test_decision_carries_tick() {
        let classifier = RuleClassifier::default();
        let snap = snapshot(0.3, None, vec![]);
        let decision = classifier.classify(&snap);
        assert_eq!(decision.tick, snap.tick);
        assert_eq!(decision.timestamp, snap.captured_at);
    }
}
