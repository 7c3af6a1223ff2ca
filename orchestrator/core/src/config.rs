// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Core Configuration
//!
//! Runtime knobs loaded from YAML. Every field has a default so an empty
//! document yields a working single-process configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::application::orchestrator::OrchestratorSettings;
use crate::application::selector::SelectionStrategy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffConfig {
    /// Verify-phase score below this rolls the handoff back.
    #[serde(default = "default_min_verify_score")]
    pub min_verify_score: f64,
    /// Target end-to-end duration feeding the handoff quality score.
    #[serde(default = "default_target_duration_ms")]
    pub target_duration_ms: u64,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            min_verify_score: default_min_verify_score(),
            target_duration_ms: default_target_duration_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Scheduler tick driving assignment, retries, and timeouts.
    pub scheduler_tick_ms: u64,
    /// Agents silent for longer than this are marked offline.
    pub heartbeat_timeout_ms: u64,
    /// Interval of the context retention sweep.
    pub retention_sweep_ms: u64,
    pub event_bus_capacity: usize,
    pub job_queue_capacity: usize,
    pub selection_strategy: SelectionStrategy,
    /// Response budget for tasks that set no explicit budget.
    pub default_task_timeout_ms: u64,
    pub default_max_retries: u32,
    pub default_retry_backoff_ms: u64,
    pub handoff: HandoffConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            scheduler_tick_ms: 250,
            heartbeat_timeout_ms: 15_000,
            retention_sweep_ms: 60_000,
            event_bus_capacity: 1024,
            job_queue_capacity: 256,
            selection_strategy: SelectionStrategy::default(),
            default_task_timeout_ms: 300_000,
            default_max_retries: 3,
            default_retry_backoff_ms: 500,
            handoff: HandoffConfig::default(),
        }
    }
}

impl CoreConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler_tick_ms == 0 {
            return Err(ConfigError::Invalid(
                "scheduler_tick_ms must be positive".to_string(),
            ));
        }
        if self.heartbeat_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_timeout_ms must be positive".to_string(),
            ));
        }
        if self.event_bus_capacity == 0 || self.job_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "channel capacities must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.handoff.min_verify_score) {
            return Err(ConfigError::Invalid(format!(
                "handoff.min_verify_score must be in [0, 1], got {}",
                self.handoff.min_verify_score
            )));
        }
        Ok(())
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            scheduler_tick_ms: self.scheduler_tick_ms,
            default_task_timeout_ms: self.default_task_timeout_ms,
            default_max_retries: self.default_max_retries,
            default_retry_backoff_ms: self.default_retry_backoff_ms,
        }
    }
}

fn default_min_verify_score() -> f64 {
    0.9
}

fn default_target_duration_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = CoreConfig::from_yaml("{}").unwrap();
        assert_eq!(config.scheduler_tick_ms, 250);
        assert_eq!(config.selection_strategy, SelectionStrategy::LeastLoaded);
        assert_eq!(config.handoff.min_verify_score, 0.9);
    }

    #[test]
    fn partial_overrides_keep_other_defaults() {
        let yaml = r#"
scheduler_tick_ms: 50
selection_strategy: round_robin
handoff:
  min_verify_score: 0.8
"#;
        let config = CoreConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.scheduler_tick_ms, 50);
        assert_eq!(config.selection_strategy, SelectionStrategy::RoundRobin);
        assert_eq!(config.handoff.min_verify_score, 0.8);
        assert_eq!(config.handoff.target_duration_ms, 5_000);
        assert_eq!(config.heartbeat_timeout_ms, 15_000);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            CoreConfig::from_yaml("scheduler_tick_ms: 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            CoreConfig::from_yaml("handoff:\n  min_verify_score: 1.5"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            CoreConfig::from_yaml(": not yaml :"),
            Err(ConfigError::Parse(_))
        ));
    }
}
