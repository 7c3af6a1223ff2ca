// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Agent Registry
//!
//! Single source of truth for agent descriptors, status, and current load.
//! Load is mutated only here: heartbeats update status/load, the orchestrator
//! calls `try_assign`/`release` around task execution. An agent that stops
//! heartbeating is marked offline and excluded from selection without being
//! deregistered.

use chrono::{Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::agent::{AgentDescriptor, AgentId, AgentStatus};
use crate::domain::error::OrchestrationError;
use crate::domain::events::AgentEvent;
use crate::infrastructure::event_bus::EventBus;

#[derive(Clone)]
pub struct AgentRegistry {
    agents: Arc<DashMap<AgentId, AgentDescriptor>>,
    event_bus: EventBus,
}

impl AgentRegistry {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            agents: Arc::new(DashMap::new()),
            event_bus,
        }
    }

    pub fn register(&self, agent: AgentDescriptor) -> AgentId {
        let id = agent.id;
        info!(agent_id = %id, name = %agent.name, "Registering agent");
        self.event_bus.publish_agent_event(AgentEvent::Registered {
            agent_id: id,
            capabilities: agent.capabilities.iter().cloned().collect(),
            registered_at: agent.registered_at,
        });
        self.agents.insert(id, agent);
        id
    }

    pub fn deregister(&self, agent_id: AgentId) -> Result<(), OrchestrationError> {
        match self.agents.remove(&agent_id) {
            Some(_) => {
                info!(agent_id = %agent_id, "Deregistered agent");
                self.event_bus.publish_agent_event(AgentEvent::Deregistered {
                    agent_id,
                    deregistered_at: Utc::now(),
                });
                Ok(())
            }
            None => Err(OrchestrationError::AgentNotFound(agent_id.as_uuid())),
        }
    }

    pub fn heartbeat(
        &self,
        agent_id: AgentId,
        status: AgentStatus,
        load: u32,
    ) -> Result<(), OrchestrationError> {
        let mut agent = self
            .agents
            .get_mut(&agent_id)
            .ok_or(OrchestrationError::AgentNotFound(agent_id.as_uuid()))?;
        if agent.status != status {
            self.event_bus.publish_agent_event(AgentEvent::StatusChanged {
                agent_id,
                from: agent.status,
                to: status,
                changed_at: Utc::now(),
            });
        }
        agent.status = status;
        agent.performance.current_load = load.min(agent.config.max_concurrent_tasks);
        agent.last_heartbeat = Utc::now();
        Ok(())
    }

    pub fn get(&self, agent_id: AgentId) -> Option<AgentDescriptor> {
        self.agents.get(&agent_id).map(|a| a.clone())
    }

    /// Agents holding every required capability, regardless of availability.
    pub fn list_by_capability(&self, capabilities: &[String]) -> Vec<AgentDescriptor> {
        self.agents
            .iter()
            .filter(|a| a.has_capabilities(capabilities))
            .map(|a| a.clone())
            .collect()
    }

    /// Capability-eligible agents that can actually take work right now.
    pub fn eligible(&self, capabilities: &[String]) -> Vec<AgentDescriptor> {
        self.agents
            .iter()
            .filter(|a| a.has_capabilities(capabilities) && a.is_available())
            .map(|a| a.clone())
            .collect()
    }

    /// Whether any registered agent could ever satisfy the capability set.
    /// Used by submit-time validation; availability is not required.
    pub fn any_satisfies(&self, capabilities: &[String]) -> bool {
        self.agents.iter().any(|a| a.has_capabilities(capabilities))
    }

    pub fn snapshot(&self) -> Vec<AgentDescriptor> {
        self.agents.iter().map(|a| a.clone()).collect()
    }

    /// Reserve one task slot. Returns false when the agent is at its
    /// concurrency limit or not schedulable; the caller leaves the task queued.
    pub fn try_assign(&self, agent_id: AgentId) -> bool {
        let Some(mut agent) = self.agents.get_mut(&agent_id) else {
            return false;
        };
        if !agent.is_available() {
            debug!(agent_id = %agent_id, "Assignment refused: agent at capacity or unschedulable");
            return false;
        }
        agent.performance.current_load += 1;
        if agent.performance.current_load >= agent.config.max_concurrent_tasks {
            agent.status = AgentStatus::Busy;
        } else if agent.status == AgentStatus::Idle {
            agent.status = AgentStatus::Active;
        }
        true
    }

    /// Release a slot and fold the outcome into the rolling counters.
    pub fn release(&self, agent_id: AgentId, succeeded: bool, latency_ms: u64) {
        let Some(mut agent) = self.agents.get_mut(&agent_id) else {
            warn!(agent_id = %agent_id, "Release for unknown agent");
            return;
        };
        agent.performance.current_load = agent.performance.current_load.saturating_sub(1);
        if succeeded {
            agent.record_completion(latency_ms);
        } else {
            agent.record_failure(latency_ms);
        }
        if agent.performance.current_load == 0 && agent.status == AgentStatus::Busy {
            agent.status = AgentStatus::Active;
        }
    }

    /// Release a slot without touching the rolling counters. Used when a
    /// task is cancelled or times out, which says nothing about the agent.
    pub fn release_slot(&self, agent_id: AgentId) {
        if let Some(mut agent) = self.agents.get_mut(&agent_id) {
            agent.performance.current_load = agent.performance.current_load.saturating_sub(1);
            if agent.performance.current_load == 0 && agent.status == AgentStatus::Busy {
                agent.status = AgentStatus::Active;
            }
        }
    }

    /// Agents that have gone quiet for longer than `quiet_after_ms` but are
    /// not yet offline. The runtime pings these before the stale sweep would
    /// mark them.
    pub fn ping_candidates(&self, quiet_after_ms: u64) -> Vec<AgentId> {
        let cutoff = Utc::now() - Duration::milliseconds(quiet_after_ms as i64);
        self.agents
            .iter()
            .filter(|a| a.status != AgentStatus::Offline && a.last_heartbeat < cutoff)
            .map(|a| a.id)
            .collect()
    }

    /// Mark agents offline whose last heartbeat is older than `stale_after_ms`.
    /// Returns the agents newly marked offline.
    pub fn sweep_stale(&self, stale_after_ms: u64) -> Vec<AgentId> {
        let cutoff = Utc::now() - Duration::milliseconds(stale_after_ms as i64);
        let mut marked = Vec::new();
        for mut agent in self.agents.iter_mut() {
            if agent.status != AgentStatus::Offline && agent.last_heartbeat < cutoff {
                warn!(agent_id = %agent.id, "Heartbeat stale, marking offline");
                self.event_bus.publish_agent_event(AgentEvent::HeartbeatMissed {
                    agent_id: agent.id,
                    last_heartbeat: agent.last_heartbeat,
                    marked_at: Utc::now(),
                });
                agent.status = AgentStatus::Offline;
                marked.push(agent.id);
            }
        }
        marked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::AgentConfig;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(EventBus::new(64))
    }

    fn agent(caps: &[&str], max_concurrent: u32) -> AgentDescriptor {
        AgentDescriptor::new(
            "a",
            "education",
            caps.iter().map(|s| s.to_string()),
            AgentConfig {
                max_concurrent_tasks: max_concurrent,
                ..Default::default()
            },
        )
    }

    #[test]
    fn capability_lookup() {
        let reg = registry();
        let id = reg.register(agent(&["education", "mentoring"], 2));
        reg.register(agent(&["trading"], 2));

        let hits = reg.list_by_capability(&["education".to_string()]);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
        assert!(reg.any_satisfies(&["education".to_string(), "mentoring".to_string()]));
        assert!(!reg.any_satisfies(&["quantum".to_string()]));
    }

    #[test]
    fn try_assign_enforces_concurrency_limit() {
        let reg = registry();
        let id = reg.register(agent(&["education"], 2));
        assert!(reg.try_assign(id));
        assert!(reg.try_assign(id));
        // at limit now
        assert!(!reg.try_assign(id));
        assert_eq!(reg.get(id).unwrap().status, AgentStatus::Busy);

        reg.release(id, true, 100);
        assert!(reg.try_assign(id));
    }

    #[test]
    fn release_updates_counters() {
        let reg = registry();
        let id = reg.register(agent(&["education"], 4));
        assert!(reg.try_assign(id));
        reg.release(id, false, 250);
        let a = reg.get(id).unwrap();
        assert_eq!(a.performance.tasks_failed, 1);
        assert_eq!(a.performance.current_load, 0);
    }

    #[test]
    fn stale_sweep_marks_offline_without_deregistering() {
        let reg = registry();
        let id = reg.register(agent(&["education"], 2));
        // Force an old heartbeat.
        reg.agents.get_mut(&id).unwrap().last_heartbeat =
            Utc::now() - Duration::milliseconds(10_000);

        let marked = reg.sweep_stale(5_000);
        assert_eq!(marked, vec![id]);
        let a = reg.get(id).unwrap();
        assert_eq!(a.status, AgentStatus::Offline);
        assert!(reg.eligible(&["education".to_string()]).is_empty());
        // still registered; a heartbeat revives it
        reg.heartbeat(id, AgentStatus::Idle, 0).unwrap();
        assert_eq!(reg.eligible(&["education".to_string()]).len(), 1);
    }

    #[test]
    fn ping_candidates_skips_fresh_and_offline_agents() {
        let reg = registry();
        let quiet = reg.register(agent(&["education"], 2));
        let fresh = reg.register(agent(&["education"], 2));
        let dead = reg.register(agent(&["education"], 2));
        reg.agents.get_mut(&quiet).unwrap().last_heartbeat =
            Utc::now() - Duration::milliseconds(4_000);
        reg.agents.get_mut(&dead).unwrap().last_heartbeat =
            Utc::now() - Duration::milliseconds(4_000);
        reg.agents.get_mut(&dead).unwrap().status = AgentStatus::Offline;

        let candidates = reg.ping_candidates(2_500);
        assert_eq!(candidates, vec![quiet]);
        assert!(!candidates.contains(&fresh));
    }

    #[test]
    fn deregister_unknown_agent_errors() {
        let reg = registry();
        assert!(matches!(
            reg.deregister(AgentId::new()),
            Err(OrchestrationError::AgentNotFound(_))
        ));
    }
}
