//! Coaching suggestion generation
//!
//! Suggestions come from a static rule table. A rule fires when the decision's
//! band is one of its bands and its trigger matches the tick's context.
//! Matching rules are ranked by weight, then by category (safety, sensory,
//! relational), then by table order.

use chrono::Duration;

use crate::config::EngineConfig;
use crate::history::SessionHistoryTracker;
use crate::types::{
    ArousalBand, Behavior, BehaviorCategory, CaregiverStress, Decision, EnvironmentDescriptor,
    EnvironmentFlag, Suggestion, SuggestionCategory, SuggestionSeverity,
};

use crate::types::ArousalBand::{Building, Calm, Crisis, High, Shutdown};
use crate::types::SuggestionCategory::{Relational, Safety, Sensory};
use crate::types::SuggestionSeverity::{High as Urgent, Low as Gentle, Medium as Moderate};

/// What has to be present for a rule to fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Fires on band alone
    Always,
    /// A recent behavior of this category
    Behavior(BehaviorCategory),
    /// An active environment flag
    Environment(EnvironmentFlag),
    /// Caregiver stress reads high. Wording addresses the caregiver.
    CaregiverStress,
}

/// One row of the coaching table
#[derive(Debug, Clone, Copy)]
pub struct CoachingRule {
    pub id: &'static str,
    pub bands: &'static [ArousalBand],
    pub trigger: Trigger,
    pub weight: u8,
    pub category: SuggestionCategory,
    pub severity: SuggestionSeverity,
    pub text: &'static str,
}

impl CoachingRule {
    fn suggestion(&self) -> Suggestion {
        Suggestion {
            id: self.id.to_string(),
            severity: self.severity,
            category: self.category,
            text: self.text.to_string(),
        }
    }
}

const fn rule(
    id: &'static str,
    bands: &'static [ArousalBand],
    trigger: Trigger,
    weight: u8,
    category: SuggestionCategory,
    severity: SuggestionSeverity,
    text: &'static str,
) -> CoachingRule {
    CoachingRule {
        id,
        bands,
        trigger,
        weight,
        category,
        severity,
        text,
    }
}

/// The coaching table
pub static RULES: &[CoachingRule] = &[
    // Crisis
    rule(
        "crisis_clear_space",
        &[Crisis],
        Trigger::Always,
        100,
        Safety,
        Urgent,
        "Move hard or sharp objects out of reach and give your child room. Stay close and keep your voice low.",
    ),
    rule(
        "crisis_soft_barrier",
        &[Crisis, High],
        Trigger::Behavior(BehaviorCategory::Crisis),
        95,
        Safety,
        Urgent,
        "Put a cushion or something soft between your child and hard surfaces, and keep exits you care about closed.",
    ),
    rule(
        "crisis_stay_present",
        &[Crisis],
        Trigger::Always,
        90,
        Safety,
        Urgent,
        "Say very little and let the wave pass. Your steady presence nearby is enough right now.",
    ),
    rule(
        "crisis_lower_noise",
        &[Crisis],
        Trigger::Environment(EnvironmentFlag::Loud),
        85,
        Sensory,
        Urgent,
        "Turn off sound sources or move to a quieter spot once it is safe to do so.",
    ),
    // Shutdown
    rule(
        "shutdown_comfort_check",
        &[Shutdown],
        Trigger::Always,
        85,
        Safety,
        Moderate,
        "Quietly check that your child is comfortable, warm and safe without asking for a response.",
    ),
    rule(
        "shutdown_low_demand",
        &[Shutdown],
        Trigger::Always,
        80,
        Relational,
        Moderate,
        "Your child may be withdrawing. Stay near, keep demands very low and wait rather than prompting.",
    ),
    rule(
        "shutdown_quiet_space",
        &[Shutdown],
        Trigger::Environment(EnvironmentFlag::Loud),
        70,
        Sensory,
        Moderate,
        "Reduce the noise around your child so they have a quiet place to recover.",
    ),
    // Sensory environment
    rule(
        "sensory_avoidance_support",
        &[Building, High, Crisis],
        Trigger::Behavior(BehaviorCategory::SensoryAvoidance),
        75,
        Sensory,
        Moderate,
        "Your child is blocking out input. Lower sound and light instead of asking them to look or listen.",
    ),
    rule(
        "soften_lighting",
        &[Building, High, Crisis],
        Trigger::Environment(EnvironmentFlag::HarshLighting),
        70,
        Sensory,
        Moderate,
        "Dim or soften the lights to reduce visual load.",
    ),
    rule(
        "reduce_noise",
        &[Building, High],
        Trigger::Environment(EnvironmentFlag::Loud),
        70,
        Sensory,
        Moderate,
        "Reduce background noise or offer ear defenders if your child uses them.",
    ),
    rule(
        "give_room",
        &[Building, High],
        Trigger::Environment(EnvironmentFlag::Crowded),
        65,
        Sensory,
        Moderate,
        "Give your child more room. Ask others to step back or move somewhere less crowded.",
    ),
    rule(
        "clear_clutter",
        &[Building, High],
        Trigger::Environment(EnvironmentFlag::Cluttered),
        50,
        Sensory,
        Gentle,
        "Clear visual clutter nearby so the space is easier to take in.",
    ),
    // Relational
    rule(
        "distress_fewer_words",
        &[Building, High],
        Trigger::Behavior(BehaviorCategory::Distress),
        68,
        Relational,
        Moderate,
        "Use fewer words and a low, slow voice. Offer a familiar comfort item.",
    ),
    rule(
        "high_pause_demands",
        &[High],
        Trigger::Always,
        60,
        Relational,
        Moderate,
        "Pause demands for now and offer a simple choice between two calming activities.",
    ),
    rule(
        "self_regulation_allow",
        &[Calm, Building, High],
        Trigger::Behavior(BehaviorCategory::SelfRegulatory),
        55,
        Relational,
        Gentle,
        "Let the rocking or flapping continue. It is helping your child regulate.",
    ),
    rule(
        "building_offer_break",
        &[Building],
        Trigger::Always,
        45,
        Relational,
        Gentle,
        "Check in quietly and offer a break before things build further.",
    ),
    rule(
        "calm_connect",
        &[Calm],
        Trigger::Always,
        20,
        Relational,
        Gentle,
        "Things look settled. This is a good moment for connection or a favourite activity.",
    ),
    rule(
        "calm_preview",
        &[Calm],
        Trigger::Always,
        15,
        Relational,
        Gentle,
        "Preview what comes next so the next transition stays predictable.",
    ),
    // Caregiver-facing
    rule(
        "caregiver_steady",
        &[High, Crisis],
        Trigger::CaregiverStress,
        62,
        Relational,
        Moderate,
        "You are doing the right thing by staying. Slow breathing on your part helps your child borrow your calm.",
    ),
    rule(
        "caregiver_validate",
        &[Shutdown, Calm, Building, High, Crisis],
        Trigger::CaregiverStress,
        58,
        Relational,
        Gentle,
        "This is a hard moment and you are showing up for it. Take one slow breath before the next step.",
    ),
];

/// Phrases a suggestion must never contain, matched as whole words
const BLOCKED_PHRASES: &[&str] = &[
    "restrain",
    "restraint",
    "restraining",
    "restrained",
    "hold them down",
    "hold down",
    "pin them",
    "make them stop",
    "stop them",
    "stop the rocking",
    "stop stimming",
    "stop flapping",
    "suppress",
    "suppressing",
    "force",
    "forcing",
    "forcefully",
    "punish",
    "don't let them",
    "calm down",
    "you should have",
    "your fault",
    "you failed",
];

/// Whether text respects the tone constraints: no restraint, no suppression
/// of self-regulation, no critique of the caregiver.
pub fn is_tone_safe(text: &str) -> bool {
    let lower = text.to_lowercase();
    !BLOCKED_PHRASES.iter().any(|p| contains_phrase(&lower, p))
}

fn contains_phrase(text: &str, phrase: &str) -> bool {
    let is_word = |c: char| c.is_alphanumeric();
    text.match_indices(phrase).any(|(start, _)| {
        let end = start + phrase.len();
        let before = text[..start].chars().next_back();
        let after = text[end..].chars().next();
        !before.is_some_and(is_word) && !after.is_some_and(is_word)
    })
}

/// Per-tick context the generator matches rules against
#[derive(Debug, Clone, Copy)]
pub struct CoachingContext<'a> {
    pub decision: &'a Decision,
    pub recent_behaviors: &'a [Behavior],
    pub environment: &'a EnvironmentDescriptor,
    pub caregiver_stress: Option<CaregiverStress>,
}

impl CoachingContext<'_> {
    fn matches(&self, trigger: Trigger) -> bool {
        match trigger {
            Trigger::Always => true,
            Trigger::Behavior(category) => {
                self.recent_behaviors.iter().any(|b| b.category() == category)
                    || (category == BehaviorCategory::Crisis && self.decision.band == Crisis)
            }
            Trigger::Environment(flag) => self.environment.has_flag(flag),
            Trigger::CaregiverStress => self.caregiver_stress == Some(CaregiverStress::High),
        }
    }
}

/// Ranked, de-duplicated suggestion generator
#[derive(Debug, Clone)]
pub struct CoachingGenerator {
    max_suggestions: usize,
    cooldown: Duration,
}

impl CoachingGenerator {
    pub fn new(max_suggestions: usize, cooldown: Duration) -> Self {
        Self {
            max_suggestions: max_suggestions.max(1),
            cooldown,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.max_suggestions, config.suggestion_cooldown())
    }

    pub fn max_suggestions(&self) -> usize {
        self.max_suggestions
    }

    /// Suggestions for one tick, best first, at most `max_suggestions`.
    ///
    /// Cooldown is measured against the decision timestamp using the
    /// tracker's issuance record. The caller records what it presents.
    /// A crisis tick with every safety rule cooling down re-issues only the
    /// highest-weight one, so crisis guidance still leads with safety.
    pub fn suggest(&self, context: &CoachingContext<'_>, history: &SessionHistoryTracker) -> Vec<Suggestion> {
        let band = context.decision.band;
        let now = context.decision.timestamp;

        let candidates: Vec<(usize, &CoachingRule)> = RULES
            .iter()
            .enumerate()
            .filter(|(_, r)| r.bands.contains(&band))
            .filter(|(_, r)| context.matches(r.trigger))
            .filter(|(_, r)| is_tone_safe(r.text))
            .collect();

        let cooled = |r: &CoachingRule| match history.last_issued(r.id) {
            Some(at) => now - at >= self.cooldown,
            None => true,
        };
        let mut matched: Vec<(usize, &CoachingRule)> =
            candidates.iter().copied().filter(|(_, r)| cooled(*r)).collect();

        matched.sort_by(|(ia, a), (ib, b)| {
            b.weight
                .cmp(&a.weight)
                .then(a.category.cmp(&b.category))
                .then(ia.cmp(ib))
        });

        if band == Crisis {
            match matched.iter().position(|(_, r)| r.category == Safety) {
                Some(pos) => {
                    let safety = matched.remove(pos);
                    matched.insert(0, safety);
                }
                // Every safety rule is cooling down: only the strongest one comes back
                None => {
                    let strongest = candidates
                        .iter()
                        .copied()
                        .filter(|(_, r)| r.category == Safety)
                        .min_by(|(ia, a), (ib, b)| b.weight.cmp(&a.weight).then(ia.cmp(ib)));
                    if let Some(safety) = strongest {
                        matched.insert(0, safety);
                    }
                }
            }
        }

        matched
            .into_iter()
            .take(self.max_suggestions)
            .map(|(_, r)| r.suggestion())
            .collect()
    }
}

impl Default for CoachingGenerator {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DecisionSource;
    use chrono::{TimeZone, Utc};
    use std::collections::HashSet;

    fn decision(band: ArousalBand, seconds: i64) -> Decision {
        Decision {
            band,
            confidence: 0.6,
            source: DecisionSource::Rule,
            rationale: String::new(),
            key_indicators: vec![],
            tick: seconds as u64,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap() + Duration::seconds(seconds),
        }
    }

    fn ctx<'a>(
        decision: &'a Decision,
        behaviors: &'a [Behavior],
        environment: &'a EnvironmentDescriptor,
    ) -> CoachingContext<'a> {
        CoachingContext {
            decision,
            recent_behaviors: behaviors,
            environment,
            caregiver_stress: None,
        }
    }

    #[test]
    fn test_rule_table_is_tone_safe() {
        for rule in RULES {
            assert!(is_tone_safe(rule.text), "rule {} fails tone check", rule.id);
        }
    }

    #[test]
    fn test_rule_ids_are_unique() {
        let ids: HashSet<_> = RULES.iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), RULES.len());
    }

    #[test]
    fn test_every_band_has_guidance() {
        for band in ArousalBand::ALL {
            assert!(
                RULES.iter().any(|r| r.bands.contains(&band) && r.trigger == Trigger::Always),
                "no unconditional rule for {}",
                band
            );
        }
    }

    #[test]
    fn test_tone_guard_rejects_restraint() {
        assert!(!is_tone_safe("Hold them down until it passes"));
        assert!(!is_tone_safe("Gently stop the rocking"));
        assert!(!is_tone_safe("Tell them to calm down"));
        assert!(is_tone_safe("Offer a quiet space"));
    }

    #[test]
    fn test_tone_guard_matches_whole_words() {
        assert!(is_tone_safe("Praise to reinforce the calm moment"));
        assert!(is_tone_safe("Name the feeling without unrestrained commentary"));
        assert!(!is_tone_safe("Force them to sit"));
        assert!(!is_tone_safe("Do not let go; use restraint"));
        assert!(!is_tone_safe("Forcefully redirect the hands"));
    }

    #[test]
    fn test_meltdown_leads_with_urgent_safety() {
        let generator = CoachingGenerator::default();
        let history = SessionHistoryTracker::default();
        let d = decision(Crisis, 0);
        let env = EnvironmentDescriptor::default();

        let suggestions = generator.suggest(&ctx(&d, &[Behavior::Meltdown], &env), &history);
        assert!(!suggestions.is_empty());
        assert_eq!(suggestions[0].severity, SuggestionSeverity::High);
        assert_eq!(suggestions[0].category, SuggestionCategory::Safety);
    }

    #[test]
    fn test_length_never_exceeds_max() {
        let generator = CoachingGenerator::new(2, Duration::seconds(30));
        let history = SessionHistoryTracker::default();
        let d = decision(High, 0);
        let env = EnvironmentDescriptor {
            noise_level: crate::types::NoiseLevel::Loud,
            crowded: true,
            cluttered: true,
            ..EnvironmentDescriptor::default()
        };
        let behaviors = [Behavior::Pacing, Behavior::CoveringEars, Behavior::Rocking];

        assert_eq!(generator.suggest(&ctx(&d, &behaviors, &env), &history).len(), 2);
    }

    #[test]
    fn test_ranking_prefers_weight_then_category() {
        let generator = CoachingGenerator::new(10, Duration::seconds(30));
        let history = SessionHistoryTracker::default();
        let d = decision(Building, 0);
        let env = EnvironmentDescriptor {
            noise_level: crate::types::NoiseLevel::Loud,
            lighting: crate::types::Lighting::Bright,
            ..EnvironmentDescriptor::default()
        };

        let ids: Vec<String> = generator
            .suggest(&ctx(&d, &[], &env), &history)
            .into_iter()
            .map(|s| s.id)
            .collect();
        // Equal weights keep table order within the same category
        assert_eq!(ids, vec!["soften_lighting", "reduce_noise", "building_offer_break"]);
    }

    #[test]
    fn test_no_repeat_within_cooldown() {
        let generator = CoachingGenerator::new(3, Duration::seconds(30));
        let mut history = SessionHistoryTracker::default();
        let env = EnvironmentDescriptor::default();
        let behaviors = [Behavior::Pacing];

        let first_decision = decision(High, 0);
        let first = generator.suggest(&ctx(&first_decision, &behaviors, &env), &history);
        history.record_suggestions(&first, first_decision.timestamp);

        let second_decision = decision(High, 5);
        let second = generator.suggest(&ctx(&second_decision, &behaviors, &env), &history);
        for s in &second {
            assert!(!first.iter().any(|f| f.id == s.id), "{} repeated", s.id);
        }

        let later_decision = decision(High, 31);
        let later = generator.suggest(&ctx(&later_decision, &behaviors, &env), &history);
        assert_eq!(later.first().map(|s| s.id.as_str()), first.first().map(|s| s.id.as_str()));
    }

    #[test]
    fn test_crisis_safety_respects_cooldown() {
        let generator = CoachingGenerator::default();
        let mut history = SessionHistoryTracker::default();
        let env = EnvironmentDescriptor::default();

        let d0 = decision(Crisis, 0);
        let first = generator.suggest(&ctx(&d0, &[Behavior::Meltdown], &env), &history);
        history.record_suggestions(&first, d0.timestamp);
        let ids: Vec<&str> = first.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["crisis_clear_space", "crisis_soft_barrier", "crisis_stay_present"]);

        for seconds in 1..=2 {
            let d = decision(Crisis, seconds);
            let next = generator.suggest(&ctx(&d, &[Behavior::Meltdown], &env), &history);
            history.record_suggestions(&next, d.timestamp);

            // Only the strongest safety rule comes back inside the window
            let ids: Vec<&str> = next.iter().map(|s| s.id.as_str()).collect();
            assert_eq!(ids, vec!["crisis_clear_space"]);
            assert_eq!(next[0].severity, SuggestionSeverity::High);
        }

        let later = decision(Crisis, 31);
        let ids: Vec<String> = generator
            .suggest(&ctx(&later, &[Behavior::Meltdown], &env), &history)
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["crisis_soft_barrier", "crisis_stay_present"]);
    }

    #[test]
    fn test_crisis_prefers_a_cooled_safety_rule() {
        let generator = CoachingGenerator::new(1, Duration::seconds(30));
        let mut history = SessionHistoryTracker::default();
        let env = EnvironmentDescriptor::default();

        let d0 = decision(Crisis, 0);
        let first = generator.suggest(&ctx(&d0, &[Behavior::Meltdown], &env), &history);
        history.record_suggestions(&first, d0.timestamp);
        assert_eq!(first[0].id, "crisis_clear_space");

        let d1 = decision(Crisis, 1);
        let second = generator.suggest(&ctx(&d1, &[Behavior::Meltdown], &env), &history);
        assert_eq!(second[0].id, "crisis_soft_barrier");
        assert_eq!(second[0].category, SuggestionCategory::Safety);
    }

    #[test]
    fn test_shutdown_guidance_differs_from_calm() {
        let generator = CoachingGenerator::default();
        let history = SessionHistoryTracker::default();
        let env = EnvironmentDescriptor::default();

        let shutdown = decision(Shutdown, 0);
        let calm = decision(Calm, 0);
        let a = generator.suggest(&ctx(&shutdown, &[], &env), &history);
        let b = generator.suggest(&ctx(&calm, &[], &env), &history);

        assert_eq!(a[0].id, "shutdown_comfort_check");
        assert!(a.iter().all(|s| !b.contains(s)));
    }

    #[test]
    fn test_caregiver_guidance_only_when_stressed() {
        let generator = CoachingGenerator::new(5, Duration::seconds(30));
        let history = SessionHistoryTracker::default();
        let env = EnvironmentDescriptor::default();
        let d = decision(Calm, 0);

        let mut context = ctx(&d, &[], &env);
        assert!(!generator
            .suggest(&context, &history)
            .iter()
            .any(|s| s.id == "caregiver_validate"));

        context.caregiver_stress = Some(CaregiverStress::High);
        let suggestions = generator.suggest(&context, &history);
        assert_eq!(suggestions[0].id, "caregiver_validate");
    }
}
