// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registered agent descriptor.
///
/// The registry is the single source of truth for an agent's status and
/// current load; it is mutated only by heartbeats and by the orchestrator's
/// assign/release calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: AgentId,
    pub name: String,
    /// Free-form agent type (e.g. "education", "research").
    pub agent_type: String,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    pub config: AgentConfig,
    pub performance: AgentPerformance,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Idle,
    Busy,
    Offline,
    Maintenance,
    Error,
}

impl AgentStatus {
    /// Statuses under which the agent may receive new assignments.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Self::Active | Self::Idle | Self::Busy)
    }
}

/// Per-agent execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: u32,

    /// Default execution timeout when a task does not declare its own budget.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff; actual delay is `retry_backoff_ms * 2^attempt`, jittered.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default)]
    pub resources: AgentResourceLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResourceLimits {
    #[serde(default = "default_memory_mb")]
    pub max_memory_mb: u64,
    #[serde(default = "default_cpu_percent")]
    pub max_cpu_percent: u32,
}

/// Rolling performance counters, updated on every task completion/failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentPerformance {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub avg_latency_ms: f64,
    /// Number of tasks currently assigned to this agent.
    pub current_load: u32,
}

impl AgentPerformance {
    pub fn success_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            // No history yet: treat as neutral rather than penalizing new agents.
            return 1.0;
        }
        self.tasks_completed as f64 / total as f64
    }

    fn record_latency(&mut self, latency_ms: u64) {
        let total = (self.tasks_completed + self.tasks_failed) as f64;
        // total already includes the task being recorded
        self.avg_latency_ms = (self.avg_latency_ms * (total - 1.0) + latency_ms as f64) / total;
    }
}

impl AgentDescriptor {
    pub fn new(
        name: impl Into<String>,
        agent_type: impl Into<String>,
        capabilities: impl IntoIterator<Item = String>,
        config: AgentConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::new(),
            name: name.into(),
            agent_type: agent_type.into(),
            capabilities: capabilities.into_iter().collect(),
            status: AgentStatus::Idle,
            config,
            performance: AgentPerformance::default(),
            last_heartbeat: now,
            registered_at: now,
        }
    }

    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }

    /// Schedulable and below its concurrency limit.
    pub fn is_available(&self) -> bool {
        self.status.is_schedulable()
            && self.performance.current_load < self.config.max_concurrent_tasks
    }

    pub fn load_ratio(&self) -> f64 {
        if self.config.max_concurrent_tasks == 0 {
            return 1.0;
        }
        self.performance.current_load as f64 / self.config.max_concurrent_tasks as f64
    }

    pub fn record_completion(&mut self, latency_ms: u64) {
        self.performance.tasks_completed += 1;
        self.performance.record_latency(latency_ms);
    }

    pub fn record_failure(&mut self, latency_ms: u64) {
        self.performance.tasks_failed += 1;
        self.performance.record_latency(latency_ms);
    }
}

// Defaults
fn default_max_concurrent() -> u32 { 4 }
fn default_task_timeout_ms() -> u64 { 300_000 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_backoff_ms() -> u64 { 500 }
fn default_memory_mb() -> u64 { 512 }
fn default_cpu_percent() -> u32 { 100 }

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent(),
            task_timeout_ms: default_task_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            resources: AgentResourceLimits::default(),
        }
    }
}

impl Default for AgentResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: default_memory_mb(),
            max_cpu_percent: default_cpu_percent(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_with_caps(caps: &[&str]) -> AgentDescriptor {
        AgentDescriptor::new(
            "test-agent",
            "education",
            caps.iter().map(|s| s.to_string()),
            AgentConfig::default(),
        )
    }

    #[test]
    fn capability_check_requires_all() {
        let agent = agent_with_caps(&["education", "mentoring"]);
        assert!(agent.has_capabilities(&["education".to_string()]));
        assert!(agent.has_capabilities(&["education".to_string(), "mentoring".to_string()]));
        assert!(!agent.has_capabilities(&["education".to_string(), "trading".to_string()]));
    }

    #[test]
    fn availability_respects_concurrency_limit() {
        let mut agent = agent_with_caps(&["education"]);
        assert!(agent.is_available());
        agent.performance.current_load = agent.config.max_concurrent_tasks;
        assert!(!agent.is_available());
    }

    #[test]
    fn offline_agent_is_not_available() {
        let mut agent = agent_with_caps(&["education"]);
        agent.status = AgentStatus::Offline;
        assert!(!agent.is_available());
    }

    #[test]
    fn success_rate_is_neutral_without_history() {
        let perf = AgentPerformance::default();
        assert_eq!(perf.success_rate(), 1.0);
    }

    #[test]
    fn rolling_latency_average() {
        let mut agent = agent_with_caps(&["education"]);
        agent.record_completion(100);
        agent.record_completion(300);
        assert_eq!(agent.performance.avg_latency_ms, 200.0);
        assert_eq!(agent.performance.success_rate(), 1.0);
        agent.record_failure(200);
        assert!((agent.performance.success_rate() - 2.0 / 3.0).abs() < 1e-9);
    }
}
