// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Task Domain Model
//!
//! A task is one unit of work requiring a single agent's capabilities. Its
//! status moves forward-only through a fixed state machine; `Cancelled` and
//! `TimedOut` are reachable from any non-terminal state. The orchestrator
//! owns the task until it is terminal, after which it is retained read-only
//! for status queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agent::AgentId;
use crate::domain::error::OrchestrationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strict queue ordering: `Critical > Urgent > High > Medium > Low`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// Forward-only state machine. Cancellation and timeout are reachable
    /// from every non-terminal state; the only exit from a terminal state is
    /// `Failed -> Queued`, taken by the retry scheduler.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        // a retried failure re-enters the queue, never Pending
        if matches!((self, next), (Self::Failed, Self::Queued)) {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Self::Cancelled | Self::TimedOut) {
            return true;
        }
        matches!(
            (self, next),
            (Self::Pending, Self::Queued)
                | (Self::Queued, Self::Assigned)
                | (Self::Assigned, Self::InProgress)
                | (Self::Assigned, Self::Completed)
                | (Self::Assigned, Self::Failed)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timeout",
        };
        write!(f, "{s}")
    }
}

/// What the task demands from its agent. The capability list is a mandatory
/// filter; the rest feed the selector's scoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequirements {
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub preferred_agent_types: Vec<String>,
    #[serde(default)]
    pub max_response_time_ms: Option<u64>,
    #[serde(default)]
    pub quality_threshold: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub output: serde_json::Value,
    pub quality_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    pub priority: TaskPriority,
    pub input: serde_json::Value,
    pub requirements: TaskRequirements,
    pub user_id: Option<String>,
    pub conversation_id: Option<String>,
    pub assigned_agent: Option<AgentId>,
    pub status: TaskStatus,
    pub result: Option<TaskResult>,
    pub error: Option<TaskError>,
    /// Assignment attempts so far (first assignment counts as attempt 1).
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        task_type: impl Into<String>,
        priority: TaskPriority,
        input: serde_json::Value,
        requirements: TaskRequirements,
    ) -> Self {
        Self {
            id: TaskId::new(),
            task_type: task_type.into(),
            priority,
            input,
            requirements,
            user_id: None,
            conversation_id: None,
            assigned_agent: None,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn transition(&mut self, next: TaskStatus) -> Result<(), OrchestrationError> {
        if !self.status.can_transition_to(next) {
            return Err(OrchestrationError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        match next {
            TaskStatus::InProgress => self.started_at = Some(Utc::now()),
            // a requeued retry is live again; its failure timestamp no longer ends it
            TaskStatus::Queued => self.completed_at = None,
            s if s.is_terminal() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }

    pub fn assign(&mut self, agent_id: AgentId) -> Result<(), OrchestrationError> {
        self.transition(TaskStatus::Assigned)?;
        self.assigned_agent = Some(agent_id);
        self.attempts += 1;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        Ok(())
    }

    /// The time budget while assigned/in-progress, falling back to `default_ms`.
    pub fn response_budget_ms(&self, default_ms: u64) -> u64 {
        self.requirements.max_response_time_ms.unwrap_or(default_ms)
    }

    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        let end = self.completed_at.unwrap_or(now);
        (end - self.created_at).num_milliseconds().max(0) as u64
    }
}

// ============================================================================
// Multi-agent workflow executions
// ============================================================================

/// How a multi-agent workflow fans its steps out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStrategy {
    /// Steps run one after another, each seeing the previous output.
    Chain,
    /// All steps dispatched at once.
    Parallel,
    /// Input array split across eligible agents.
    Distribute,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub step_index: usize,
    pub agent_id: Option<AgentId>,
    pub input: serde_json::Value,
    pub status: TaskStatus,
    pub output: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// An ordered sequence of agent invocations belonging to one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub task_id: TaskId,
    pub strategy: WorkflowStrategy,
    pub steps: Vec<WorkflowStep>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn new(task_id: TaskId, strategy: WorkflowStrategy, inputs: Vec<serde_json::Value>) -> Self {
        let steps = inputs
            .into_iter()
            .enumerate()
            .map(|(step_index, input)| WorkflowStep {
                step_index,
                agent_id: None,
                input,
                status: TaskStatus::Pending,
                output: None,
                started_at: None,
                ended_at: None,
            })
            .collect();
        Self {
            id: Uuid::new_v4(),
            task_id,
            strategy,
            steps,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }
}
