//! Coaching session
//!
//! Drives one tick at a time: arbiter → coaching → history → sink. Ticks are
//! published in strict order and the session never waits on the remote path
//! past the tick deadline.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::{SnapshotReceiver, SnapshotSource};
use crate::arbiter::{ArbiterEvent, ArbiterStats, DecisionArbiter, FallbackReason};
use crate::coaching::{CoachingContext, CoachingGenerator};
use crate::config::EngineConfig;
use crate::error::CoachError;
use crate::history::SessionHistoryTracker;
use crate::remote::{provider_for, KeyProvider, RemoteReasoningClient, Transport};
use crate::types::{ChildProfile, Decision, FeatureSnapshot, SessionAggregate, Suggestion};

/// Everything published for one tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickOutput {
    pub tick: u64,
    pub decision: Decision,
    pub suggestions: Vec<Suggestion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<ArbiterEvent>,
}

/// Presentation collaborator
pub trait TickSink {
    fn publish(&mut self, output: &TickOutput);

    /// Periodic and final session summaries
    fn publish_summary(&mut self, _summary: &SessionAggregate) {}
}

/// Collects everything published; handy for replays and tests
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    pub outputs: Vec<TickOutput>,
    pub summaries: Vec<SessionAggregate>,
}

impl TickSink for CollectingSink {
    fn publish(&mut self, output: &TickOutput) {
        self.outputs.push(output.clone());
    }

    fn publish_summary(&mut self, summary: &SessionAggregate) {
        self.summaries.push(summary.clone());
    }
}

/// One observed caregiving session
#[derive(Debug)]
pub struct CoachingSession {
    config: EngineConfig,
    arbiter: DecisionArbiter,
    coaching: CoachingGenerator,
    history: SessionHistoryTracker,
    last_tick: Option<u64>,
    ended: bool,
}

impl CoachingSession {
    /// Start a session. The configuration is validated and then fixed for
    /// the session's lifetime.
    pub fn new(config: EngineConfig, profile: ChildProfile) -> Result<Self, CoachError> {
        config.validate()?;
        let arbiter = DecisionArbiter::new(&config, profile);
        let coaching = CoachingGenerator::from_config(&config);
        let history = SessionHistoryTracker::new(config.recent_behavior_ticks);

        info!(
            session_id = history.session_id(),
            mode = ?config.mode,
            provider = %config.provider.id,
            "coaching session started"
        );

        Ok(Self {
            config,
            arbiter,
            coaching,
            history,
            last_tick: None,
            ended: false,
        })
    }

    /// Attach an existing remote client
    pub fn with_remote(mut self, remote: Arc<RemoteReasoningClient>) -> Self {
        self.arbiter = self.arbiter.with_remote(remote);
        self
    }

    /// Build a remote client for the configured provider over `transport`
    pub fn with_transport(self, transport: Arc<dyn Transport>, keys: Arc<dyn KeyProvider>) -> Self {
        let remote = RemoteReasoningClient::new(
            provider_for(&self.config.provider),
            transport,
            keys,
            self.config.cache_ttl(),
            self.config.remote_timeout(),
        );
        self.with_remote(Arc::new(remote))
    }

    pub fn session_id(&self) -> &str {
        self.history.session_id()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> &ArbiterStats {
        self.arbiter.stats()
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Current session aggregate
    pub fn summary(&self) -> SessionAggregate {
        self.history.summarize()
    }

    /// Process one snapshot with the default deadline of one tick interval
    pub async fn process_tick(&mut self, snapshot: &FeatureSnapshot) -> Result<TickOutput, CoachError> {
        let deadline = Instant::now() + self.config.tick_interval();
        self.process_tick_until(snapshot, deadline).await
    }

    /// Process one snapshot, waiting on the remote path no later than `deadline`
    pub async fn process_tick_until(
        &mut self,
        snapshot: &FeatureSnapshot,
        deadline: Instant,
    ) -> Result<TickOutput, CoachError> {
        self.process_tick_or_abandon(snapshot, tokio::time::sleep_until(deadline))
            .await
    }

    /// Process one snapshot, giving up on the remote path once `abandon`
    /// resolves
    pub async fn process_tick_or_abandon<F>(
        &mut self,
        snapshot: &FeatureSnapshot,
        abandon: F,
    ) -> Result<TickOutput, CoachError>
    where
        F: Future<Output = ()>,
    {
        if self.ended {
            return Err(CoachError::SessionEnded);
        }
        if let Some(last) = self.last_tick {
            if snapshot.tick <= last {
                return Err(CoachError::OutOfOrderTick {
                    tick: snapshot.tick,
                    last,
                });
            }
        }

        // Stage 1: arbitrate
        let summary = self.history.rolling_summary();
        let outcome = self
            .arbiter
            .decide_or_abandon(snapshot, &summary, abandon)
            .await;

        // Stage 2: commit to history
        self.last_tick = Some(snapshot.tick);
        self.history.record(&outcome.decision);
        self.history.observe_behaviors(&snapshot.behaviors);

        // Stage 3: coaching
        let recent = self.history.recent_behaviors();
        let context = CoachingContext {
            decision: &outcome.decision,
            recent_behaviors: &recent,
            environment: &snapshot.environment,
            caregiver_stress: snapshot.caregiver_stress,
        };
        let suggestions = self.coaching.suggest(&context, &self.history);
        self.history
            .record_suggestions(&suggestions, outcome.decision.timestamp);

        debug!(
            tick = snapshot.tick,
            band = %outcome.decision.band,
            source = ?outcome.decision.source,
            suggestions = suggestions.len(),
            "tick published"
        );

        Ok(TickOutput {
            tick: snapshot.tick,
            decision: outcome.decision,
            suggestions,
            fallback: outcome.fallback,
            event: outcome.event,
        })
    }

    /// Consume live snapshots until the publisher goes away or `token` fires.
    ///
    /// The remote wait for a tick ends at one tick interval or as soon as a
    /// newer snapshot is waiting, whichever comes first. Cancelling mid-tick
    /// discards that tick; nothing from it reaches history.
    pub async fn run<S: TickSink>(
        &mut self,
        mut receiver: SnapshotReceiver,
        sink: &mut S,
        token: CancellationToken,
    ) -> Result<SessionAggregate, CoachError> {
        loop {
            let snapshot = tokio::select! {
                _ = token.cancelled() => break,
                next = receiver.next() => match next {
                    Some(snapshot) => snapshot,
                    None => break,
                },
            };

            let deadline = Instant::now() + self.config.tick_interval();
            let newer = receiver.newer_available();
            let abandon = async move {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = newer => {}
                }
            };
            let result = tokio::select! {
                _ = token.cancelled() => break,
                result = self.process_tick_or_abandon(&snapshot, abandon) => result,
            };
            self.emit(result, sink)?;
        }

        Ok(self.end_with(sink))
    }

    /// Replay a recorded source. With `paced`, ticks are spaced one tick
    /// interval apart; otherwise each tick still gets a full interval as its
    /// remote deadline.
    pub async fn run_source<Src: SnapshotSource, S: TickSink>(
        &mut self,
        source: &mut Src,
        sink: &mut S,
        paced: bool,
    ) -> Result<SessionAggregate, CoachError> {
        let mut next_at = Instant::now();
        while let Some(snapshot) = source.next_snapshot() {
            if paced {
                tokio::time::sleep_until(next_at).await;
            }
            next_at += self.config.tick_interval();

            let deadline = Instant::now() + self.config.tick_interval();
            let result = self.process_tick_until(&snapshot, deadline).await;
            self.emit(result, sink)?;
        }

        Ok(self.end_with(sink))
    }

    fn emit<S: TickSink>(&self, result: Result<TickOutput, CoachError>, sink: &mut S) -> Result<(), CoachError> {
        match result {
            Ok(output) => {
                sink.publish(&output);
                let every = self.config.summary_every_ticks;
                let published = self.history.summarize().decisions_published;
                if every > 0 && published % every == 0 {
                    sink.publish_summary(&self.history.summarize());
                }
                Ok(())
            }
            Err(CoachError::OutOfOrderTick { tick, last }) => {
                warn!(tick, last, "skipping out-of-order snapshot");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn end_with<S: TickSink>(&mut self, sink: &mut S) -> SessionAggregate {
        let summary = self.end();
        sink.publish_summary(&summary);
        summary
    }

    /// End the session: cancel in-flight remote work, drop cached verdicts,
    /// and return the final aggregate. Further ticks are rejected.
    pub fn end(&mut self) -> SessionAggregate {
        if !self.ended {
            self.ended = true;
            if let Some(remote) = self.arbiter.remote() {
                remote.shutdown();
            }
            let stats = self.arbiter.stats();
            info!(
                session_id = self.history.session_id(),
                ticks = stats.ticks,
                remote_decisions = stats.remote_decisions,
                fallbacks = stats.fallbacks(),
                "coaching session ended"
            );
        }
        self.history.summarize()
    }
}
