//! Signal aggregation and tick delivery
//!
//! The aggregator folds whatever typed features the extractors produced for a
//! tick into one immutable [`FeatureSnapshot`]. Missing inputs are neutral,
//! never errors. Raw buffers never reach this module.
//!
//! Snapshots reach the session either through a latest-value channel (live
//! capture, where stale ticks are dropped rather than queued) or a
//! [`SnapshotSource`] (recorded sessions).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::CoachError;
use crate::types::{
    Behavior, CaregiverStress, EnvironmentDescriptor, FeatureSnapshot, VocalStress,
};

/// Pose extractor output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoseFeatures {
    pub movement_intensity: f64,
    #[serde(default)]
    pub tension_score: f64,
    #[serde(default)]
    pub behaviors: Vec<Behavior>,
}

/// Audio extractor output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioFeatures {
    /// `None` when the window contained no voice
    #[serde(default)]
    pub vocal_stress: Option<VocalStress>,
    /// Behaviors only audible (screaming, crying)
    #[serde(default)]
    pub behaviors: Vec<Behavior>,
}

/// Caregiver facial extractor output
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaregiverFeatures {
    pub stress: CaregiverStress,
}

/// Everything the extractors delivered for one tick
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalInputs {
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pose: Option<PoseFeatures>,
    #[serde(default)]
    pub audio: Option<AudioFeatures>,
    #[serde(default)]
    pub environment: Option<EnvironmentDescriptor>,
    #[serde(default)]
    pub caregiver: Option<CaregiverFeatures>,
}

/// A signal that was unavailable this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingSignal {
    Pose,
    Audio,
    Environment,
    Caregiver,
}

/// Aggregation result: the snapshot plus which inputs were degraded
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedSnapshot {
    pub snapshot: FeatureSnapshot,
    pub degraded: Vec<MissingSignal>,
}

impl AggregatedSnapshot {
    pub fn is_complete(&self) -> bool {
        self.degraded.is_empty()
    }
}

/// Builds one snapshot per tick from partial feature inputs
#[derive(Debug, Clone)]
pub struct SignalAggregator {
    dual_signal: bool,
    neutral_movement: f64,
    next_tick: u64,
}

impl SignalAggregator {
    pub fn new(dual_signal: bool, neutral_movement: f64) -> Self {
        Self {
            dual_signal,
            neutral_movement: clamp_unit(neutral_movement),
            next_tick: 0,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.dual_signal, config.neutral_movement)
    }

    /// Continue numbering after `last_tick`, e.g. when resuming a session
    pub fn starting_at(mut self, tick: u64) -> Self {
        self.next_tick = tick;
        self
    }

    /// Aggregate one tick's inputs. Never fails.
    pub fn aggregate(&mut self, inputs: SignalInputs) -> AggregatedSnapshot {
        let tick = self.next_tick;
        self.next_tick += 1;

        let mut degraded = Vec::new();
        let mut behaviors: Vec<Behavior> = Vec::new();

        let (movement_intensity, tension_score) = match inputs.pose {
            Some(pose) => {
                push_unique(&mut behaviors, &pose.behaviors);
                (
                    clamp_unit(pose.movement_intensity),
                    clamp_unit(pose.tension_score),
                )
            }
            None => {
                degraded.push(MissingSignal::Pose);
                (self.neutral_movement, 0.0)
            }
        };

        let vocal_stress = match inputs.audio {
            Some(audio) => {
                push_unique(&mut behaviors, &audio.behaviors);
                audio.vocal_stress
            }
            None => {
                degraded.push(MissingSignal::Audio);
                None
            }
        };

        let environment = inputs.environment.unwrap_or_else(|| {
            degraded.push(MissingSignal::Environment);
            EnvironmentDescriptor::default()
        });

        let caregiver_stress = if self.dual_signal {
            if inputs.caregiver.is_none() {
                degraded.push(MissingSignal::Caregiver);
            }
            inputs.caregiver.map(|c| c.stress)
        } else {
            None
        };

        if !degraded.is_empty() {
            debug!(tick, ?degraded, "aggregation incomplete, using neutral defaults");
        }

        AggregatedSnapshot {
            snapshot: FeatureSnapshot {
                tick,
                captured_at: inputs.captured_at.unwrap_or_else(Utc::now),
                movement_intensity,
                tension_score,
                behaviors,
                vocal_stress,
                environment,
                caregiver_stress,
            },
            degraded,
        }
    }

    /// Tick number the next aggregate will carry
    pub fn next_tick(&self) -> u64 {
        self.next_tick
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn push_unique(into: &mut Vec<Behavior>, from: &[Behavior]) {
    for behavior in from {
        if !into.contains(behavior) {
            into.push(*behavior);
        }
    }
}

// ============================================================================
// Live delivery: latest-value channel
// ============================================================================

/// Create a latest-value snapshot channel.
///
/// Pushing while the previous snapshot is still unconsumed replaces it; the
/// replaced tick is counted as dropped.
pub fn snapshot_channel() -> (SnapshotPublisher, SnapshotReceiver) {
    let (tx, rx) = watch::channel(None);
    let consumed = Arc::new(AtomicU64::new(0));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        SnapshotPublisher {
            tx,
            consumed: Arc::clone(&consumed),
            dropped,
        },
        SnapshotReceiver { rx, consumed },
    )
}

/// Producer half, held by the capture collaborator
#[derive(Debug)]
pub struct SnapshotPublisher {
    tx: watch::Sender<Option<FeatureSnapshot>>,
    /// Last consumed tick + 1 (0 = nothing consumed yet)
    consumed: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl SnapshotPublisher {
    /// Publish a snapshot. Returns `false` once the receiver is gone.
    pub fn push(&self, snapshot: FeatureSnapshot) -> bool {
        let pending = self.tx.borrow().as_ref().map(|s| s.tick);
        if let Some(pending_tick) = pending {
            if self.consumed.load(Ordering::Acquire) <= pending_tick {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(tick = pending_tick, "dropping unconsumed snapshot");
            }
        }
        self.tx.send(Some(snapshot)).is_ok()
    }

    /// Number of snapshots replaced before the session consumed them
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer half, held by the session
#[derive(Debug)]
pub struct SnapshotReceiver {
    rx: watch::Receiver<Option<FeatureSnapshot>>,
    consumed: Arc<AtomicU64>,
}

impl SnapshotReceiver {
    /// Wait for the next unseen snapshot. `None` once the publisher is gone.
    ///
    /// Cancel-safe: dropping the future loses no snapshot.
    pub async fn next(&mut self) -> Option<FeatureSnapshot> {
        loop {
            if self.rx.changed().await.is_err() {
                return None;
            }
            let current = self.rx.borrow_and_update().clone();
            if let Some(snapshot) = current {
                self.consumed
                    .store(snapshot.tick.saturating_add(1), Ordering::Release);
                return Some(snapshot);
            }
        }
    }

    /// Resolve once a snapshot newer than the last one returned by
    /// [`next`](Self::next) is waiting. Consumes nothing. Never resolves
    /// after the publisher is gone.
    pub async fn newer_available(&self) {
        let mut probe = self.rx.clone();
        loop {
            if probe.changed().await.is_err() {
                return std::future::pending().await;
            }
            if probe.borrow_and_update().is_some() {
                return;
            }
        }
    }
}

// ============================================================================
// Recorded delivery
// ============================================================================

/// Lazy, restartable sequence of snapshots
pub trait SnapshotSource {
    fn next_snapshot(&mut self) -> Option<FeatureSnapshot>;

    /// Rewind to the first snapshot
    fn restart(&mut self);
}

/// Replays a recorded session
#[derive(Debug, Clone, Default)]
pub struct ReplaySource {
    snapshots: Vec<FeatureSnapshot>,
    position: usize,
}

impl ReplaySource {
    pub fn new(snapshots: Vec<FeatureSnapshot>) -> Self {
        Self {
            snapshots,
            position: 0,
        }
    }

    /// Parse newline-delimited snapshot JSON; blank lines are skipped
    pub fn from_ndjson(input: &str) -> Result<Self, CoachError> {
        let snapshots = input
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(FeatureSnapshot::from_json)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(snapshots))
    }

    /// Parse newline-delimited extractor output and aggregate each line into
    /// a snapshot, in order
    pub fn from_signal_ndjson(input: &str, aggregator: &mut SignalAggregator) -> Result<Self, CoachError> {
        let mut snapshots = Vec::new();
        for line in input.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let inputs: SignalInputs = serde_json::from_str(line)?;
            snapshots.push(aggregator.aggregate(inputs).snapshot);
        }
        Ok(Self::new(snapshots))
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl SnapshotSource for ReplaySource {
    fn next_snapshot(&mut self) -> Option<FeatureSnapshot> {
        let snapshot = self.snapshots.get(self.position).cloned();
        if snapshot.is_some() {
            self.position += 1;
        }
        snapshot
    }

    fn restart(&mut self) {
        self.position = 0;
    }
}
