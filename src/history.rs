//! Session history tracking
//!
//! Keeps aggregate statistics only: band counts, distinct behaviors and
//! suggestion issuance. A short rolling window of recent bands and behaviors
//! feeds coaching and the remote context; nothing else from a tick survives it.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ArousalBand, BandCounts, Behavior, Decision, DecisionSource, SessionAggregate, Suggestion};

/// Default number of recent ticks kept in the rolling window
pub const DEFAULT_RECENT_WINDOW: usize = 10;

/// Number of recent bands included in the remote context
const SUMMARY_BANDS: usize = 5;

/// Short rolling summary sent with remote reasoning requests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySummary {
    /// Most recent published bands, oldest first
    pub recent_bands: Vec<ArousalBand>,
    /// Distinct behaviors across the recent window, in first-seen order
    pub recent_behaviors: Vec<Behavior>,
    /// Most frequent band over the whole session
    pub dominant_band: Option<ArousalBand>,
}

/// Session-scoped history tracker
#[derive(Debug, Clone)]
pub struct SessionHistoryTracker {
    session_id: String,
    started_at: DateTime<Utc>,
    band_counts: BandCounts,
    decisions_published: u64,
    remote_decisions: u64,
    behaviors_observed: Vec<Behavior>,
    suggestion_counts: BTreeMap<String, u32>,
    last_issued: HashMap<String, DateTime<Utc>>,
    recent_bands: VecDeque<ArousalBand>,
    recent_behaviors: VecDeque<Vec<Behavior>>,
    window_size: usize,
}

impl Default for SessionHistoryTracker {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_WINDOW)
    }
}

impl SessionHistoryTracker {
    /// Start tracking a new session with a rolling window of `window_size` ticks
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            session_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            band_counts: BandCounts::default(),
            decisions_published: 0,
            remote_decisions: 0,
            behaviors_observed: Vec::new(),
            suggestion_counts: BTreeMap::new(),
            last_issued: HashMap::new(),
            recent_bands: VecDeque::with_capacity(window_size),
            recent_behaviors: VecDeque::with_capacity(window_size),
            window_size,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Record one published decision. Call exactly once per published decision.
    pub fn record(&mut self, decision: &Decision) {
        self.band_counts.increment(decision.band);
        self.decisions_published += 1;
        if decision.source == DecisionSource::Remote {
            self.remote_decisions += 1;
        }

        self.recent_bands.push_back(decision.band);
        while self.recent_bands.len() > self.window_size {
            self.recent_bands.pop_front();
        }
    }

    /// Note the behaviors seen on the tick just published
    pub fn observe_behaviors(&mut self, behaviors: &[Behavior]) {
        for behavior in behaviors {
            if !self.behaviors_observed.contains(behavior) {
                self.behaviors_observed.push(*behavior);
            }
        }

        self.recent_behaviors.push_back(behaviors.to_vec());
        while self.recent_behaviors.len() > self.window_size {
            self.recent_behaviors.pop_front();
        }
    }

    /// Record suggestions issued at `at`, for counts and cooldown
    pub fn record_suggestions(&mut self, suggestions: &[Suggestion], at: DateTime<Utc>) {
        for suggestion in suggestions {
            let count = self.suggestion_counts.entry(suggestion.id.clone()).or_insert(0);
            *count = count.saturating_add(1);
            self.last_issued.insert(suggestion.id.clone(), at);
        }
    }

    /// When a suggestion was last issued this session
    pub fn last_issued(&self, suggestion_id: &str) -> Option<DateTime<Utc>> {
        self.last_issued.get(suggestion_id).copied()
    }

    /// Distinct behaviors across the recent window, in first-seen order
    pub fn recent_behaviors(&self) -> Vec<Behavior> {
        let mut distinct = Vec::new();
        for behavior in self.recent_behaviors.iter().flatten() {
            if !distinct.contains(behavior) {
                distinct.push(*behavior);
            }
        }
        distinct
    }

    /// Rolling summary for the remote context
    pub fn rolling_summary(&self) -> HistorySummary {
        let skip = self.recent_bands.len().saturating_sub(SUMMARY_BANDS);
        HistorySummary {
            recent_bands: self.recent_bands.iter().skip(skip).copied().collect(),
            recent_behaviors: self.recent_behaviors(),
            dominant_band: self.band_counts.dominant(),
        }
    }

    /// Snapshot of the session aggregate. Side-effect free.
    pub fn summarize(&self) -> SessionAggregate {
        SessionAggregate {
            session_id: self.session_id.clone(),
            started_at: self.started_at,
            decisions_published: self.decisions_published,
            remote_decisions: self.remote_decisions,
            band_counts: self.band_counts,
            behaviors_observed: self.behaviors_observed.clone(),
            suggestion_counts: self.suggestion_counts.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SuggestionCategory, SuggestionSeverity};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn decision(band: ArousalBand, source: DecisionSource) -> Decision {
        Decision {
            band,
            confidence: 0.6,
            source,
            rationale: String::new(),
            key_indicators: vec![],
            tick: 0,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap(),
        }
    }

    fn suggestion(id: &str) -> Suggestion {
        Suggestion {
            id: id.to_string(),
            severity: SuggestionSeverity::Low,
            category: SuggestionCategory::Relational,
            text: "text".to_string(),
        }
    }

    #[test]
    fn test_band_counts_sum_to_published() {
        let mut tracker = SessionHistoryTracker::new(3);
        let bands = [
            ArousalBand::Calm,
            ArousalBand::Calm,
            ArousalBand::Building,
            ArousalBand::High,
            ArousalBand::Shutdown,
        ];
        for band in bands {
            tracker.record(&decision(band, DecisionSource::Rule));
        }
        tracker.record(&decision(ArousalBand::Crisis, DecisionSource::Remote));

        let summary = tracker.summarize();
        assert_eq!(summary.decisions_published, 6);
        assert_eq!(summary.band_counts.total(), 6);
        assert_eq!(summary.band_counts.calm, 2);
        assert_eq!(summary.remote_decisions, 1);
    }

    #[test]
    fn test_summarize_is_idempotent() {
        let mut tracker = SessionHistoryTracker::default();
        tracker.record(&decision(ArousalBand::Calm, DecisionSource::Rule));
        assert_eq!(tracker.summarize(), tracker.summarize());
    }

    #[test]
    fn test_counts_are_monotonic() {
        let mut tracker = SessionHistoryTracker::new(2);
        let mut previous = tracker.summarize();
        for band in [ArousalBand::High, ArousalBand::Calm, ArousalBand::High] {
            tracker.record(&decision(band, DecisionSource::Rule));
            let current = tracker.summarize();
            for b in ArousalBand::ALL {
                assert!(current.band_counts.get(b) >= previous.band_counts.get(b));
            }
            previous = current;
        }
    }

    #[test]
    fn test_distinct_behaviors_and_rolling_window() {
        let mut tracker = SessionHistoryTracker::new(2);
        tracker.observe_behaviors(&[Behavior::Rocking, Behavior::Pacing]);
        tracker.observe_behaviors(&[Behavior::Pacing]);
        tracker.observe_behaviors(&[Behavior::Crying]);

        // Whole session keeps every distinct behavior
        assert_eq!(
            tracker.summarize().behaviors_observed,
            vec![Behavior::Rocking, Behavior::Pacing, Behavior::Crying]
        );
        // Window only covers the last two ticks
        assert_eq!(
            tracker.recent_behaviors(),
            vec![Behavior::Pacing, Behavior::Crying]
        );
    }

    #[test]
    fn test_rolling_summary() {
        let mut tracker = SessionHistoryTracker::new(10);
        for _ in 0..6 {
            tracker.record(&decision(ArousalBand::Calm, DecisionSource::Rule));
        }
        tracker.record(&decision(ArousalBand::Building, DecisionSource::Rule));

        let summary = tracker.rolling_summary();
        assert_eq!(summary.recent_bands.len(), 5);
        assert_eq!(summary.recent_bands.last(), Some(&ArousalBand::Building));
        assert_eq!(summary.dominant_band, Some(ArousalBand::Calm));
    }

    #[test]
    fn test_suggestion_issuance() {
        let mut tracker = SessionHistoryTracker::default();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap();
        let t1 = t0 + chrono::Duration::seconds(40);

        tracker.record_suggestions(&[suggestion("a"), suggestion("b")], t0);
        tracker.record_suggestions(&[suggestion("a")], t1);

        let summary = tracker.summarize();
        assert_eq!(summary.suggestion_counts.get("a"), Some(&2));
        assert_eq!(summary.suggestion_counts.get("b"), Some(&1));
        assert_eq!(tracker.last_issued("a"), Some(t1));
        assert_eq!(tracker.last_issued("c"), None);
    }
}
