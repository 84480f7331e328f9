//! Decision arbiter
//!
//! Publishes exactly one decision per tick. Standard mode publishes the rule
//! decision unconditionally. Personalized mode also asks the remote client and
//! publishes its verdict when it arrives before the tick deadline; every other
//! outcome publishes the rule decision for the same tick.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::classifier::RuleClassifier;
use crate::config::{EngineConfig, EngineMode};
use crate::error::RemoteError;
use crate::history::HistorySummary;
use crate::remote::{ReasoningContext, RemoteReasoningClient};
use crate::types::{ChildProfile, Decision, FeatureSnapshot};

/// Why the rule decision was published in personalized mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// No remote client, no credential, or the transport failed
    Unavailable,
    /// The remote call exceeded its own timeout
    Timeout,
    /// The remote response did not parse into a verdict
    Malformed,
    /// The tick deadline passed first; the call keeps running for the cache
    Abandoned,
    /// The session ended while the call was pending
    Cancelled,
}

impl FallbackReason {
    /// Whether this outcome counts toward the consecutive-failure streak.
    /// A remote that never answers inside a tick is as unusable as one that
    /// errors, so abandoned waits count. Only session end does not.
    pub fn is_failure(self) -> bool {
        !matches!(self, FallbackReason::Cancelled)
    }
}

/// Observability events raised by the arbiter. Never user-facing errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ArbiterEvent {
    /// The remote path keeps failing; the caller may want to leave personalized mode
    PersistentRemoteFailure {
        consecutive_failures: u32,
        last_error: String,
    },
}

/// Result of arbitrating one tick
#[derive(Debug, Clone, PartialEq)]
pub struct ArbiterOutcome {
    pub decision: Decision,
    pub fallback: Option<FallbackReason>,
    pub event: Option<ArbiterEvent>,
}

/// Running counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbiterStats {
    pub ticks: u64,
    pub remote_decisions: u64,
    pub fallback_unavailable: u64,
    pub fallback_timeout: u64,
    pub fallback_malformed: u64,
    pub fallback_abandoned: u64,
    pub fallback_cancelled: u64,
    pub consecutive_failures: u32,
}

impl ArbiterStats {
    pub fn fallbacks(&self) -> u64 {
        self.fallback_unavailable
            + self.fallback_timeout
            + self.fallback_malformed
            + self.fallback_abandoned
            + self.fallback_cancelled
    }

    fn count(&mut self, reason: FallbackReason) {
        let slot = match reason {
            FallbackReason::Unavailable => &mut self.fallback_unavailable,
            FallbackReason::Timeout => &mut self.fallback_timeout,
            FallbackReason::Malformed => &mut self.fallback_malformed,
            FallbackReason::Abandoned => &mut self.fallback_abandoned,
            FallbackReason::Cancelled => &mut self.fallback_cancelled,
        };
        *slot += 1;
    }
}

/// Selects between the rule and remote verdicts for each tick
#[derive(Debug)]
pub struct DecisionArbiter {
    mode: EngineMode,
    classifier: RuleClassifier,
    remote: Option<Arc<RemoteReasoningClient>>,
    profile: ChildProfile,
    failure_alert_threshold: u32,
    stats: ArbiterStats,
    alerted: bool,
}

impl DecisionArbiter {
    pub fn new(config: &EngineConfig, profile: ChildProfile) -> Self {
        Self {
            mode: config.mode,
            classifier: RuleClassifier::new(config.thresholds),
            remote: None,
            profile,
            failure_alert_threshold: config.failure_alert_threshold.max(1),
            stats: ArbiterStats::default(),
            alerted: false,
        }
    }

    /// Attach the remote client used in personalized mode
    pub fn with_remote(mut self, remote: Arc<RemoteReasoningClient>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    pub fn stats(&self) -> &ArbiterStats {
        &self.stats
    }

    pub fn remote(&self) -> Option<&Arc<RemoteReasoningClient>> {
        self.remote.as_ref()
    }

    /// Decide the published decision for one tick.
    ///
    /// Never waits past `deadline`. The rule decision is computed first and
    /// without suspending, so it is ready whatever the remote path does.
    pub async fn decide(
        &mut self,
        snapshot: &FeatureSnapshot,
        history: &HistorySummary,
        deadline: Instant,
    ) -> ArbiterOutcome {
        self.decide_or_abandon(snapshot, history, tokio::time::sleep_until(deadline))
            .await
    }

    /// Like [`decide`](Self::decide), but the remote wait ends as soon as
    /// `abandon` resolves, e.g. when the next snapshot is ready. A verdict
    /// that is already available still wins.
    pub async fn decide_or_abandon<F>(
        &mut self,
        snapshot: &FeatureSnapshot,
        history: &HistorySummary,
        abandon: F,
    ) -> ArbiterOutcome
    where
        F: Future<Output = ()>,
    {
        self.stats.ticks += 1;
        let rule = self.classifier.classify(snapshot);

        if self.mode == EngineMode::Standard {
            return ArbiterOutcome {
                decision: rule,
                fallback: None,
                event: None,
            };
        }

        let Some(remote) = self.remote.clone() else {
            return self.fall_back(rule, FallbackReason::Unavailable, "no remote client configured");
        };

        let context = ReasoningContext::new(&self.profile, snapshot, history.clone());
        tokio::pin!(abandon);
        let result = tokio::select! {
            biased;
            result = remote.evaluate(&context) => Some(result),
            _ = &mut abandon => None,
        };
        match result {
            Some(Ok(verdict)) => {
                self.stats.remote_decisions += 1;
                self.stats.consecutive_failures = 0;
                self.alerted = false;
                let mut decision = verdict.stamped(snapshot.tick, snapshot.captured_at);
                decision.confidence = decision.confidence.clamp(0.0, 1.0);
                debug!(tick = snapshot.tick, band = %decision.band, "published remote decision");
                ArbiterOutcome {
                    decision,
                    fallback: None,
                    event: None,
                }
            }
            Some(Err(e)) => {
                let reason = match &e {
                    RemoteError::Unavailable(_) if remote.is_shut_down() => FallbackReason::Cancelled,
                    RemoteError::Unavailable(_) => FallbackReason::Unavailable,
                    RemoteError::Timeout(_) => FallbackReason::Timeout,
                    RemoteError::MalformedResponse(_) => FallbackReason::Malformed,
                };
                self.fall_back(rule, reason, &e.to_string())
            }
            None => self.fall_back(rule, FallbackReason::Abandoned, "tick deadline reached"),
        }
    }

    fn fall_back(&mut self, rule: Decision, reason: FallbackReason, detail: &str) -> ArbiterOutcome {
        self.stats.count(reason);
        warn!(tick = rule.tick, reason = ?reason, detail, "remote verdict unavailable, publishing rule decision");

        let mut event = None;
        if reason.is_failure() {
            self.stats.consecutive_failures = self.stats.consecutive_failures.saturating_add(1);
            if !self.alerted && self.stats.consecutive_failures >= self.failure_alert_threshold {
                self.alerted = true;
                warn!(
                    consecutive_failures = self.stats.consecutive_failures,
                    "remote reasoning failing persistently, consider standard mode"
                );
                event = Some(ArbiterEvent::PersistentRemoteFailure {
                    consecutive_failures: self.stats.consecutive_failures,
                    last_error: detail.to_string(),
                });
            }
        }

        ArbiterOutcome {
            decision: rule,
            fallback: Some(reason),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{
        provider_for, ProviderId, ProviderRequest, Secret, StaticKeyProvider, StaticTransport,
        Transport,
    };
    use crate::types::{ArousalBand, Behavior, DecisionSource, VocalStress};
    use async_trait::async_trait;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const HIGH_VERDICT: &str = r#"{"content":[{"type":"text","text":"{\"band\":\"high\",\"confidence\":0.9,\"rationale\":\"rising\",\"key_indicators\":[]}"}]}"#;

    struct DownTransport;

    #[async_trait]
    impl Transport for DownTransport {
        async fn send(&self, _request: ProviderRequest) -> Result<String, RemoteError> {
            Err(RemoteError::Unavailable("503".to_string()))
        }
    }

    fn personalized() -> EngineConfig {
        EngineConfig {
            mode: EngineMode::Personalized,
            ..EngineConfig::default()
        }
    }

    fn remote(transport: Arc<dyn Transport>) -> Arc<RemoteReasoningClient> {
        let config = personalized();
        Arc::new(RemoteReasoningClient::new(
            provider_for(&config.provider),
            transport,
            Arc::new(StaticKeyProvider::new().with_key(ProviderId::Anthropic, Secret::new("k"))),
            config.cache_ttl(),
            config.remote_timeout(),
        ))
    }

    fn snapshot(tick: u64) -> FeatureSnapshot {
        FeatureSnapshot {
            movement_intensity: 0.6,
            vocal_stress: Some(VocalStress::Elevated),
            behaviors: vec![Behavior::Pacing],
            ..FeatureSnapshot::neutral(tick, Utc::now())
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(1)
    }

    #[tokio::test(start_paused = true)]
    async fn test_standard_mode_never_calls_remote() {
        let transport = Arc::new(StaticTransport::new(HIGH_VERDICT));
        let mut arbiter = DecisionArbiter::new(&EngineConfig::default(), ChildProfile::default())
            .with_remote(remote(transport.clone()));

        let outcome = arbiter.decide(&snapshot(1), &HistorySummary::default(), deadline()).await;
        assert_eq!(outcome.decision.source, DecisionSource::Rule);
        assert_eq!(outcome.fallback, None);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_success_is_published_for_this_tick() {
        let mut arbiter = DecisionArbiter::new(&personalized(), ChildProfile::default())
            .with_remote(remote(Arc::new(StaticTransport::new(HIGH_VERDICT))));

        let snap = snapshot(7);
        let outcome = arbiter.decide(&snap, &HistorySummary::default(), deadline()).await;
        assert_eq!(outcome.decision.source, DecisionSource::Remote);
        assert_eq!(outcome.decision.band, ArousalBand::High);
        assert_eq!(outcome.decision.tick, 7);
        assert_eq!(outcome.decision.timestamp, snap.captured_at);
        assert_eq!(arbiter.stats().remote_decisions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_publishes_rule_decision() {
        let mut arbiter = DecisionArbiter::new(&personalized(), ChildProfile::default())
            .with_remote(remote(Arc::new(DownTransport)));
        let classifier = RuleClassifier::new(personalized().thresholds);

        let snap = snapshot(3);
        let outcome = arbiter.decide(&snap, &HistorySummary::default(), deadline()).await;
        assert_eq!(outcome.decision, classifier.classify(&snap));
        assert_eq!(outcome.fallback, Some(FallbackReason::Unavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_abandons_slow_remote() {
        let transport = Arc::new(StaticTransport::new(HIGH_VERDICT).with_delay(Duration::from_millis(2_500)));
        let client = remote(transport.clone());
        let mut arbiter =
            DecisionArbiter::new(&personalized(), ChildProfile::default()).with_remote(client.clone());
        let classifier = RuleClassifier::new(personalized().thresholds);

        let snap = snapshot(1);
        let outcome = arbiter.decide(&snap, &HistorySummary::default(), deadline()).await;
        assert_eq!(outcome.fallback, Some(FallbackReason::Abandoned));
        assert_eq!(outcome.decision, classifier.classify(&snap));
        assert_eq!(arbiter.stats().consecutive_failures, 1);

        // The abandoned call lands in the cache for the next matching tick
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(client.cache_len(), 1);
        let next = arbiter.decide(&snapshot(2), &HistorySummary::default(), deadline()).await;
        assert_eq!(next.decision.source, DecisionSource::Remote);
        assert_eq!(transport.calls(), 1);
        assert_eq!(arbiter.stats().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_slower_than_every_tick_raises_event() {
        let transport = Arc::new(StaticTransport::new(HIGH_VERDICT).with_delay(Duration::from_secs(3)));
        let mut arbiter = DecisionArbiter::new(&personalized(), ChildProfile::default())
            .with_remote(remote(transport.clone()));

        let mut events = Vec::new();
        for tick in 1..=6 {
            // A new scene every tick, so no call is ever shared or cached in time
            let snap = FeatureSnapshot {
                movement_intensity: tick as f64 * 0.15,
                ..snapshot(tick)
            };
            let outcome = arbiter.decide(&snap, &HistorySummary::default(), deadline()).await;
            assert_eq!(outcome.fallback, Some(FallbackReason::Abandoned));
            events.push(outcome.event);
        }

        assert_eq!(arbiter.stats().remote_decisions, 0);
        assert_eq!(arbiter.stats().fallback_abandoned, 6);
        assert_eq!(arbiter.stats().consecutive_failures, 6);
        assert_eq!(events.iter().filter(|e| e.is_some()).count(), 1);
        assert!(matches!(
            events[2],
            Some(ArbiterEvent::PersistentRemoteFailure { consecutive_failures: 3, .. })
        ));
        assert_eq!(transport.calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandon_signal_ends_wait_before_deadline() {
        let transport = Arc::new(StaticTransport::new(HIGH_VERDICT).with_delay(Duration::from_millis(500)));
        let mut arbiter = DecisionArbiter::new(&personalized(), ChildProfile::default())
            .with_remote(remote(transport));

        let started = Instant::now();
        let next_ready = tokio::time::sleep(Duration::from_millis(200));
        let outcome = arbiter
            .decide_or_abandon(&snapshot(1), &HistorySummary::default(), next_ready)
            .await;

        assert_eq!(outcome.fallback, Some(FallbackReason::Abandoned));
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_falls_back() {
        let transport = Arc::new(StaticTransport::new(HIGH_VERDICT).with_delay(Duration::from_secs(10)));
        let mut arbiter = DecisionArbiter::new(&personalized(), ChildProfile::default())
            .with_remote(remote(transport));

        let far = Instant::now() + Duration::from_secs(30);
        let outcome = arbiter.decide(&snapshot(1), &HistorySummary::default(), far).await;
        assert_eq!(outcome.fallback, Some(FallbackReason::Timeout));
        assert_eq!(outcome.decision.source, DecisionSource::Rule);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_remote_client_is_unavailable() {
        let mut arbiter = DecisionArbiter::new(&personalized(), ChildProfile::default());
        let outcome = arbiter.decide(&snapshot(1), &HistorySummary::default(), deadline()).await;
        assert_eq!(outcome.fallback, Some(FallbackReason::Unavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_failure_event_once_per_streak() {
        let mut arbiter = DecisionArbiter::new(&personalized(), ChildProfile::default())
            .with_remote(remote(Arc::new(DownTransport)));

        let mut events = Vec::new();
        for tick in 1..=5 {
            let outcome = arbiter.decide(&snapshot(tick), &HistorySummary::default(), deadline()).await;
            events.push(outcome.event);
        }

        assert_eq!(events.iter().filter(|e| e.is_some()).count(), 1);
        assert!(matches!(
            events[2],
            Some(ArbiterEvent::PersistentRemoteFailure { consecutive_failures: 3, .. })
        ));
        assert_eq!(arbiter.stats().fallback_unavailable, 5);
        assert_eq!(arbiter.stats().consecutive_failures, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_reports_cancelled() {
        let client = remote(Arc::new(StaticTransport::new(HIGH_VERDICT)));
        let mut arbiter =
            DecisionArbiter::new(&personalized(), ChildProfile::default()).with_remote(client.clone());
        client.shutdown();

        let outcome = arbiter.decide(&snapshot(1), &HistorySummary::default(), deadline()).await;
        assert_eq!(outcome.fallback, Some(FallbackReason::Cancelled));
        assert_eq!(arbiter.stats().consecutive_failures, 0);
    }
}
