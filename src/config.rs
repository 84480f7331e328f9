//! Engine configuration
//!
//! Everything the core needs is supplied here at session start. Nothing in
//! the engine reads ambient global settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoachError;
use crate::remote::ProviderId;

/// Default TTL for cached remote verdicts
pub const DEFAULT_CACHE_TTL_MS: u64 = 2_000;

/// Default hard timeout for one remote call
pub const DEFAULT_REMOTE_TIMEOUT_MS: u64 = 4_000;

/// Default tick interval
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;

/// Decision mode selected by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    /// Rule-based classification only
    #[default]
    Standard,
    /// Rule-based classification with remote override when available
    Personalized,
}

/// Which remote reasoning provider and model to target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: ProviderId,
    pub model: String,
    /// Override for the provider's default endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Maximum tokens requested for the verdict
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_tokens() -> u32 {
    400
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            id: ProviderId::Anthropic,
            model: "claude-sonnet-4-5".to_string(),
            endpoint: None,
            max_tokens: default_max_tokens(),
        }
    }
}

/// Thresholds used by the rule-based classifier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierThresholds {
    /// Movement below this (with no voice and no behaviors) reads as shutdown
    pub movement_low: f64,
    /// Movement above this contributes +1
    pub movement_high: f64,
    /// Movement above this contributes +2
    pub movement_extreme: f64,
    /// Tension above this contributes +1
    pub tension_high: f64,
    /// Fixed confidence reported by the rule path
    pub rule_confidence: f64,
}

impl Default for ClassifierThresholds {
    fn default() -> Self {
        Self {
            movement_low: 0.15,
            movement_high: 0.5,
            movement_extreme: 0.8,
            tension_high: 0.7,
            rule_confidence: 0.6,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub mode: EngineMode,
    pub provider: ProviderConfig,
    pub cache_ttl_ms: u64,
    pub remote_timeout_ms: u64,
    pub tick_interval_ms: u64,
    /// Maximum suggestions per tick
    pub max_suggestions: usize,
    /// A suggestion is not repeated within this window
    pub suggestion_cooldown_ms: u64,
    /// Consecutive remote failures before a persistent-failure event
    pub failure_alert_threshold: u32,
    /// Publish a session summary every this many ticks (0 disables)
    pub summary_every_ticks: u64,
    /// How many recent ticks of behaviors feed the coaching generator
    pub recent_behavior_ticks: usize,
    /// Whether the caregiver facial feed is active
    pub dual_signal: bool,
    /// Movement value assumed when pose features are missing
    pub neutral_movement: f64,
    pub thresholds: ClassifierThresholds,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: EngineMode::Standard,
            provider: ProviderConfig::default(),
            cache_ttl_ms: DEFAULT_CACHE_TTL_MS,
            remote_timeout_ms: DEFAULT_REMOTE_TIMEOUT_MS,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            max_suggestions: 3,
            suggestion_cooldown_ms: 30_000,
            failure_alert_threshold: 3,
            summary_every_ticks: 30,
            recent_behavior_ticks: 10,
            dual_signal: false,
            neutral_movement: 0.3,
            thresholds: ClassifierThresholds::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from JSON; missing fields take defaults
    pub fn from_json(json: &str) -> Result<Self, CoachError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, CoachError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<(), CoachError> {
        let t = &self.thresholds;
        if !(0.0..=1.0).contains(&t.movement_low)
            || !(0.0..=1.0).contains(&t.movement_high)
            || !(0.0..=1.0).contains(&t.movement_extreme)
        {
            return Err(CoachError::InvalidConfig(
                "movement thresholds must lie in 0..=1".to_string(),
            ));
        }
        if !(t.movement_low < t.movement_high && t.movement_high < t.movement_extreme) {
            return Err(CoachError::InvalidConfig(
                "movement thresholds must satisfy low < high < extreme".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&t.rule_confidence) {
            return Err(CoachError::InvalidConfig(
                "rule_confidence must lie in 0..=1".to_string(),
            ));
        }
        if !(t.movement_low..t.movement_high).contains(&self.neutral_movement) {
            return Err(CoachError::InvalidConfig(
                "neutral_movement must lie between movement_low and movement_high".to_string(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(CoachError::InvalidConfig(
                "tick_interval_ms must be positive".to_string(),
            ));
        }
        if self.remote_timeout_ms == 0 {
            return Err(CoachError::InvalidConfig(
                "remote_timeout_ms must be positive".to_string(),
            ));
        }
        if self.max_suggestions == 0 {
            return Err(CoachError::InvalidConfig(
                "max_suggestions must be at least 1".to_string(),
            ));
        }
        if self.provider.model.trim().is_empty() {
            return Err(CoachError::InvalidConfig("provider model is empty".to_string()));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn suggestion_cooldown(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.suggestion_cooldown_ms.min(i64::MAX as u64) as i64)
    }
}
