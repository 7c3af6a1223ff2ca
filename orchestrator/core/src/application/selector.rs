// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Agent Selector
//!
//! Scores capability-eligible agents against a task's requirements and picks
//! one. The capability filter is mandatory and never scored; strategies only
//! rank agents that already passed it. Ties break by lowest current load,
//! then by agent id, so selection is deterministic.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::application::registry::AgentRegistry;
use crate::domain::agent::{AgentDescriptor, AgentId};
use crate::domain::error::OrchestrationError;
use crate::domain::task::TaskRequirements;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    #[default]
    LeastLoaded,
    WeightedSuccessRate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSelection {
    pub agent_id: AgentId,
    pub score: f64,
    pub reasoning: String,
    pub estimated_completion_ms: u64,
}

#[derive(Clone)]
pub struct AgentSelector {
    registry: AgentRegistry,
    strategy: SelectionStrategy,
    // round-robin cursor over the id-sorted eligible list
    rr_cursor: Arc<Mutex<usize>>,
}

impl AgentSelector {
    pub fn new(registry: AgentRegistry, strategy: SelectionStrategy) -> Self {
        Self {
            registry,
            strategy,
            rr_cursor: Arc::new(Mutex::new(0)),
        }
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    pub fn select(
        &self,
        requirements: &TaskRequirements,
        exclude: &[AgentId],
    ) -> Result<AgentSelection, OrchestrationError> {
        let mut eligible: Vec<AgentDescriptor> = self
            .registry
            .eligible(&requirements.capabilities)
            .into_iter()
            .filter(|a| !exclude.contains(&a.id))
            .collect();

        if eligible.is_empty() {
            return Err(OrchestrationError::NoEligibleAgent {
                required: requirements.capabilities.clone(),
            });
        }

        eligible.sort_by_key(|a| a.id);

        let chosen = match self.strategy {
            SelectionStrategy::RoundRobin => {
                let mut cursor = self.rr_cursor.lock();
                let agent = eligible[*cursor % eligible.len()].clone();
                *cursor = cursor.wrapping_add(1);
                agent
            }
            SelectionStrategy::LeastLoaded => self.pick_best(&eligible, requirements, |a, _| {
                1.0 - a.load_ratio()
            }),
            SelectionStrategy::WeightedSuccessRate => {
                self.pick_best(&eligible, requirements, Self::weighted_score)
            }
        };

        let score = Self::weighted_score(&chosen, requirements);
        let estimated_completion_ms = Self::estimate_completion(&chosen);
        debug!(
            agent_id = %chosen.id,
            score,
            strategy = ?self.strategy,
            "Selected agent"
        );
        Ok(AgentSelection {
            agent_id: chosen.id,
            score,
            reasoning: format!(
                "{:?}: load {}/{}, success rate {:.2}, avg latency {:.0}ms",
                self.strategy,
                chosen.performance.current_load,
                chosen.config.max_concurrent_tasks,
                chosen.performance.success_rate(),
                chosen.performance.avg_latency_ms,
            ),
            estimated_completion_ms,
        })
    }

    fn pick_best(
        &self,
        eligible: &[AgentDescriptor],
        requirements: &TaskRequirements,
        score_fn: impl Fn(&AgentDescriptor, &TaskRequirements) -> f64,
    ) -> AgentDescriptor {
        // eligible is id-sorted and non-empty; min_by keeps the first of
        // equal keys, which realizes the load-then-id tiebreak.
        eligible
            .iter()
            .min_by(|a, b| {
                let (sa, sb) = (score_fn(a, requirements), score_fn(b, requirements));
                sb.partial_cmp(&sa)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.performance.current_load.cmp(&b.performance.current_load))
            })
            .cloned()
            .expect("Invariant: eligible set is non-empty")
    }

    /// Blend of success rate (0.5), inverse load (0.3), and response-time fit
    /// against the task budget (0.2). A type-preference match adds a small
    /// nudge without overriding the blend.
    fn weighted_score(agent: &AgentDescriptor, requirements: &TaskRequirements) -> f64 {
        let success = agent.performance.success_rate();
        let inverse_load = 1.0 - agent.load_ratio();
        let time_fit = match requirements.max_response_time_ms {
            Some(budget) if budget > 0 && agent.performance.avg_latency_ms > 0.0 => {
                (budget as f64 / agent.performance.avg_latency_ms).min(1.0)
            }
            _ => 1.0,
        };
        let mut score = 0.5 * success + 0.3 * inverse_load + 0.2 * time_fit;
        if requirements
            .preferred_agent_types
            .iter()
            .any(|t| t == &agent.agent_type)
        {
            score += 0.05;
        }
        score
    }

    fn estimate_completion(agent: &AgentDescriptor) -> u64 {
        let base = if agent.performance.avg_latency_ms > 0.0 {
            agent.performance.avg_latency_ms
        } else {
            agent.config.task_timeout_ms as f64 / 2.0
        };
        // queued-behind work stretches the estimate
        (base * (1.0 + agent.performance.current_load as f64)) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::AgentConfig;
    use crate::infrastructure::event_bus::EventBus;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(EventBus::new(64))
    }

    fn agent(name: &str, caps: &[&str], load: u32) -> AgentDescriptor {
        let mut a = AgentDescriptor::new(
            name,
            "education",
            caps.iter().map(|s| s.to_string()),
            AgentConfig {
                max_concurrent_tasks: 10,
                ..Default::default()
            },
        );
        a.performance.current_load = load;
        a
    }

    fn reqs(caps: &[&str]) -> TaskRequirements {
        TaskRequirements {
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn never_selects_capability_lacking_agent() {
        let reg = registry();
        reg.register(agent("a", &["trading"], 0));
        let edu = reg.register(agent("b", &["education"], 5));
        let selector = AgentSelector::new(reg, SelectionStrategy::LeastLoaded);
        let sel = selector.select(&reqs(&["education"]), &[]).unwrap();
        assert_eq!(sel.agent_id, edu);
    }

    #[test]
    fn zero_eligible_yields_error_not_arbitrary_pick() {
        let reg = registry();
        reg.register(agent("a", &["trading"], 0));
        let selector = AgentSelector::new(reg, SelectionStrategy::LeastLoaded);
        let err = selector.select(&reqs(&["education"]), &[]).unwrap_err();
        assert!(matches!(err, OrchestrationError::NoEligibleAgent { .. }));
    }

    #[test]
    fn least_loaded_prefers_lower_load() {
        let reg = registry();
        reg.register(agent("busy", &["education"], 8));
        let idle = reg.register(agent("idle", &["education"], 1));
        let selector = AgentSelector::new(reg, SelectionStrategy::LeastLoaded);
        let sel = selector.select(&reqs(&["education"]), &[]).unwrap();
        assert_eq!(sel.agent_id, idle);
    }

    #[test]
    fn exclusion_is_honored() {
        let reg = registry();
        let a = reg.register(agent("a", &["education"], 0));
        let b = reg.register(agent("b", &["education"], 0));
        let selector = AgentSelector::new(reg, SelectionStrategy::LeastLoaded);
        let sel = selector.select(&reqs(&["education"]), &[a]).unwrap();
        assert_eq!(sel.agent_id, b);
    }

    #[test]
    fn tie_breaks_by_agent_id() {
        let reg = registry();
        let x = reg.register(agent("x", &["education"], 2));
        let y = reg.register(agent("y", &["education"], 2));
        let expected = x.min(y);
        let selector = AgentSelector::new(reg, SelectionStrategy::LeastLoaded);
        let sel = selector.select(&reqs(&["education"]), &[]).unwrap();
        assert_eq!(sel.agent_id, expected);
    }

    #[test]
    fn round_robin_rotates_deterministically() {
        let reg = registry();
        let a = reg.register(agent("a", &["education"], 0));
        let b = reg.register(agent("b", &["education"], 0));
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let selector = AgentSelector::new(reg, SelectionStrategy::RoundRobin);
        let r = reqs(&["education"]);
        assert_eq!(selector.select(&r, &[]).unwrap().agent_id, first);
        assert_eq!(selector.select(&r, &[]).unwrap().agent_id, second);
        assert_eq!(selector.select(&r, &[]).unwrap().agent_id, first);
    }

    #[test]
    fn weighted_strategy_prefers_higher_success_rate() {
        let reg = registry();
        let mut flaky = agent("flaky", &["education"], 0);
        flaky.performance.tasks_completed = 2;
        flaky.performance.tasks_failed = 8;
        flaky.performance.avg_latency_ms = 100.0;
        reg.register(flaky);

        let mut solid = agent("solid", &["education"], 0);
        solid.performance.tasks_completed = 9;
        solid.performance.tasks_failed = 1;
        solid.performance.avg_latency_ms = 100.0;
        let solid_id = reg.register(solid);

        let selector = AgentSelector::new(reg, SelectionStrategy::WeightedSuccessRate);
        let sel = selector.select(&reqs(&["education"]), &[]).unwrap();
        assert_eq!(sel.agent_id, solid_id);
    }
}
