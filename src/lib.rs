//! Synheart Coach - On-device arousal decision engine for caregiving sessions
//!
//! Coach turns per-tick multimodal feature snapshots into one published
//! arousal decision per tick plus ranked coaching guidance:
//! signal aggregation → rule classification (and optional remote reasoning)
//! → arbitration → coaching → session history.
//!
//! ## Modules
//!
//! - **Aggregator**: fuse pose, audio, environment and caregiver features into a snapshot
//! - **Classifier**: pure rule-based arousal classification, always available
//! - **Remote**: cached, single-flight remote reasoning over a pluggable transport
//! - **Arbiter**: one decision per tick, with rule fallback for every remote failure
//! - **Coaching**: ranked, de-duplicated, tone-checked suggestions
//! - **Session**: tick loop and aggregate-only session history

pub mod aggregator;
pub mod arbiter;
pub mod classifier;
pub mod coaching;
pub mod config;
pub mod error;
pub mod history;
pub mod remote;
pub mod session;
pub mod types;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use aggregator::{snapshot_channel, ReplaySource, SignalAggregator, SignalInputs, SnapshotSource};
pub use arbiter::{ArbiterEvent, ArbiterOutcome, ArbiterStats, DecisionArbiter, FallbackReason};
pub use classifier::RuleClassifier;
pub use coaching::{is_tone_safe, CoachingContext, CoachingGenerator};
pub use config::{EngineConfig, EngineMode, ProviderConfig};
pub use error::{CoachError, RemoteError};
pub use history::{HistorySummary, SessionHistoryTracker};
pub use remote::RemoteReasoningClient;
pub use session::{CoachingSession, CollectingSink, TickOutput, TickSink};
pub use types::{
    ArousalBand, ChildProfile, Decision, DecisionSource, FeatureSnapshot, SessionAggregate,
    Suggestion,
};

/// Coach version reported by the CLI and FFI
pub const COACH_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name reported by the CLI
pub const PRODUCER_NAME: &str = "synheart-coach";
