// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! YAML manifests for the CLI: the agent fleet and a task description.
//! Parsed into core domain objects before anything touches the runtime.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use relay_core::domain::agent::{AgentConfig, AgentDescriptor};
use relay_core::domain::task::{TaskPriority, TaskRequirements};
use relay_core::presentation::api::SubmitTaskRequest;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsManifest {
    pub agents: Vec<AgentSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub max_concurrent_tasks: Option<u32>,
    #[serde(default)]
    pub task_timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl AgentsManifest {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let yaml = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read agent manifest: {:?}", path.as_ref()))?;
        let manifest: Self =
            serde_yaml::from_str(&yaml).context("Failed to parse agent manifest")?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agents.is_empty() {
            bail!("manifest declares no agents");
        }
        let mut names = HashSet::new();
        for agent in &self.agents {
            if agent.name.trim().is_empty() {
                bail!("agent name must not be empty");
            }
            if !names.insert(agent.name.as_str()) {
                bail!("duplicate agent name: {}", agent.name);
            }
            if agent.capabilities.is_empty() {
                bail!("agent {} declares no capabilities", agent.name);
            }
            if agent.max_concurrent_tasks == Some(0) {
                bail!("agent {} has max_concurrent_tasks = 0", agent.name);
            }
        }
        Ok(())
    }
}

impl AgentSpec {
    pub fn to_descriptor(&self) -> AgentDescriptor {
        let defaults = AgentConfig::default();
        AgentDescriptor::new(
            &self.name,
            &self.agent_type,
            self.capabilities.iter().cloned(),
            AgentConfig {
                max_concurrent_tasks: self
                    .max_concurrent_tasks
                    .unwrap_or(defaults.max_concurrent_tasks),
                task_timeout_ms: self.task_timeout_ms.unwrap_or(defaults.task_timeout_ms),
                max_retries: self.max_retries.unwrap_or(defaults.max_retries),
                ..defaults
            },
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskManifest {
    pub task_type: String,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub preferred_agent_types: Vec<String>,
    #[serde(default)]
    pub max_response_time_ms: Option<u64>,
    pub input: serde_json::Value,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

impl TaskManifest {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let yaml = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read task file: {:?}", path.as_ref()))?;
        let manifest: Self = serde_yaml::from_str(&yaml).context("Failed to parse task file")?;
        if manifest.task_type.trim().is_empty() {
            bail!("task_type must not be empty");
        }
        if manifest.capabilities.is_empty() {
            bail!("task declares no required capabilities");
        }
        Ok(manifest)
    }

    pub fn to_request(&self) -> SubmitTaskRequest {
        SubmitTaskRequest {
            task_id: None,
            user_id: self.user_id.clone(),
            conversation_id: self.conversation_id.clone(),
            task_type: self.task_type.clone(),
            requirements: TaskRequirements {
                capabilities: self.capabilities.clone(),
                preferred_agent_types: self.preferred_agent_types.clone(),
                max_response_time_ms: self.max_response_time_ms,
                quality_threshold: None,
            },
            input: self.input.clone(),
            priority: self.priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_fleet_manifest() {
        let yaml = r#"
agents:
  - name: tutor
    agent_type: education
    capabilities: [education, mentoring]
    max_concurrent_tasks: 2
  - name: researcher
    agent_type: research
    capabilities: [search]
"#;
        let manifest: AgentsManifest = serde_yaml::from_str(yaml).unwrap();
        manifest.validate().unwrap();
        let descriptor = manifest.agents[0].to_descriptor();
        assert_eq!(descriptor.config.max_concurrent_tasks, 2);
        assert!(descriptor.has_capabilities(&["mentoring".to_string()]));
    }

    #[test]
    fn rejects_duplicate_names_and_empty_capabilities() {
        let dup = r#"
agents:
  - { name: a, agent_type: t, capabilities: [x] }
  - { name: a, agent_type: t, capabilities: [y] }
"#;
        let manifest: AgentsManifest = serde_yaml::from_str(dup).unwrap();
        assert!(manifest.validate().is_err());

        let empty = r#"
agents:
  - { name: a, agent_type: t, capabilities: [] }
"#;
        let manifest: AgentsManifest = serde_yaml::from_str(empty).unwrap();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn task_manifest_maps_to_a_submit_request() {
        let yaml = r#"
task_type: answer
priority: high
capabilities: [education]
input:
  q: "what is a lifetime?"
"#;
        let manifest: TaskManifest = serde_yaml::from_str(yaml).unwrap();
        let request = manifest.to_request();
        assert_eq!(request.task_type, "answer");
        assert_eq!(request.priority, Some(TaskPriority::High));
        assert_eq!(request.input["q"], "what is a lifetime?");
    }
}
