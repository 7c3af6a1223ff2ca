// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agent::{AgentId, AgentStatus};
use crate::domain::context::ContextId;
use crate::domain::handoff::{HandoffId, HandoffPhase};
use crate::domain::sync::SyncStatus;
use crate::domain::task::{TaskId, TaskPriority, TaskStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskEvent {
    Submitted {
        task_id: TaskId,
        priority: TaskPriority,
        submitted_at: DateTime<Utc>,
    },
    Queued {
        task_id: TaskId,
        queued_at: DateTime<Utc>,
    },
    Assigned {
        task_id: TaskId,
        agent_id: AgentId,
        attempt: u32,
        assigned_at: DateTime<Utc>,
    },
    Started {
        task_id: TaskId,
        agent_id: AgentId,
        started_at: DateTime<Utc>,
    },
    Completed {
        task_id: TaskId,
        agent_id: AgentId,
        completed_at: DateTime<Utc>,
    },
    Failed {
        task_id: TaskId,
        error: String,
        will_retry: bool,
        failed_at: DateTime<Utc>,
    },
    Requeued {
        task_id: TaskId,
        attempt: u32,
        backoff_ms: u64,
        requeued_at: DateTime<Utc>,
    },
    Cancelled {
        task_id: TaskId,
        reason: String,
        cancelled_at: DateTime<Utc>,
    },
    TimedOut {
        task_id: TaskId,
        budget_ms: u64,
        timed_out_at: DateTime<Utc>,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Submitted { task_id, .. }
            | Self::Queued { task_id, .. }
            | Self::Assigned { task_id, .. }
            | Self::Started { task_id, .. }
            | Self::Completed { task_id, .. }
            | Self::Failed { task_id, .. }
            | Self::Requeued { task_id, .. }
            | Self::Cancelled { task_id, .. }
            | Self::TimedOut { task_id, .. } => *task_id,
        }
    }

    pub fn status(&self) -> Option<TaskStatus> {
        match self {
            Self::Submitted { .. } => Some(TaskStatus::Pending),
            Self::Queued { .. } | Self::Requeued { .. } => Some(TaskStatus::Queued),
            Self::Assigned { .. } => Some(TaskStatus::Assigned),
            Self::Started { .. } => Some(TaskStatus::InProgress),
            Self::Completed { .. } => Some(TaskStatus::Completed),
            Self::Failed { will_retry, .. } => (!will_retry).then_some(TaskStatus::Failed),
            Self::Cancelled { .. } => Some(TaskStatus::Cancelled),
            Self::TimedOut { .. } => Some(TaskStatus::TimedOut),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AgentEvent {
    Registered {
        agent_id: AgentId,
        capabilities: Vec<String>,
        registered_at: DateTime<Utc>,
    },
    Deregistered {
        agent_id: AgentId,
        deregistered_at: DateTime<Utc>,
    },
    StatusChanged {
        agent_id: AgentId,
        from: AgentStatus,
        to: AgentStatus,
        changed_at: DateTime<Utc>,
    },
    HeartbeatMissed {
        agent_id: AgentId,
        last_heartbeat: DateTime<Utc>,
        marked_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ContextEvent {
    Created {
        context_id: ContextId,
        owner: String,
        created_at: DateTime<Utc>,
    },
    Updated {
        context_id: ContextId,
        new_version: u64,
        author: String,
        updated_at: DateTime<Utc>,
    },
    Deleted {
        context_id: ContextId,
        edges_removed: usize,
        deleted_at: DateTime<Utc>,
    },
    RetentionApplied {
        context_id: ContextId,
        versions_dropped: usize,
        expired: bool,
        applied_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    Started {
        request_id: Uuid,
        contexts: usize,
        targets: usize,
        started_at: DateTime<Utc>,
    },
    ConflictDetected {
        request_id: Uuid,
        context_id: ContextId,
        target_agent: AgentId,
        detected_at: DateTime<Utc>,
    },
    Finished {
        request_id: Uuid,
        status: SyncStatus,
        finished_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HandoffEvent {
    PhaseEntered {
        handoff_id: HandoffId,
        phase: HandoffPhase,
        entered_at: DateTime<Utc>,
    },
    RolledBack {
        handoff_id: HandoffId,
        failed_phase: HandoffPhase,
        reason: String,
        rolled_back_at: DateTime<Utc>,
    },
    Completed {
        handoff_id: HandoffId,
        from_agent: AgentId,
        to_agent: AgentId,
        quality_score: f64,
        completed_at: DateTime<Utc>,
    },
}
