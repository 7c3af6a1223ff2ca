// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agent::AgentId;
use crate::domain::context::ContextId;
use crate::domain::error::OrchestrationError;

/// How much of a context one propagation carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SyncMode {
    /// Replace the entire context on the target.
    Full,
    /// Transfer only version records newer than the target's last known version.
    Incremental,
    /// Limit the sync to caller-specified content fields.
    Selective { fields: Vec<String> },
}

/// Rule deciding the winning value when two context copies diverge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    SourceWins,
    TargetWins,
    LatestWins,
    /// Field-level merge: non-overlapping fields from both, source wins on overlap.
    Merge,
    /// Leave the conflict unresolved and surface it without mutating the target.
    Manual,
}

/// A transient request driving one propagation, discarded once its result is
/// terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub id: Uuid,
    pub source_agent: AgentId,
    pub target_agents: Vec<AgentId>,
    pub context_ids: Vec<ContextId>,
    pub mode: SyncMode,
    pub resolution: ConflictResolution,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl SyncRequest {
    pub fn new(
        source_agent: AgentId,
        target_agents: Vec<AgentId>,
        context_ids: Vec<ContextId>,
        mode: SyncMode,
        resolution: ConflictResolution,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_agent,
            target_agents,
            context_ids,
            mode,
            resolution,
            deadline_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConflict {
    pub context_id: ContextId,
    pub target_agent: AgentId,
    pub source_version: u64,
    pub target_version: u64,
    pub resolved: bool,
    pub resolution: ConflictResolution,
    pub detected_at: DateTime<Utc>,
}

/// Outcome of one (context, target) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Applied { new_version: u64 },
    /// Target already up to date, or the resolution left it alone.
    Unchanged,
    ConflictUnresolved,
    Failed { error: String },
}

impl SyncOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Completed,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub request_id: Uuid,
    pub status: SyncStatus,
    /// Keyed by (context, target) in dispatch order.
    pub outcomes: Vec<(ContextId, AgentId, SyncOutcome)>,
    pub conflicts: Vec<ContextConflict>,
    pub conflicts_detected: usize,
    pub conflicts_resolved: usize,
    pub contexts_synced: usize,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncResult {
    /// Completed if nothing failed, Failed if everything did, Partial otherwise.
    pub fn status_from_outcomes(outcomes: &[(ContextId, AgentId, SyncOutcome)]) -> SyncStatus {
        let failed = outcomes.iter().filter(|(_, _, o)| o.is_failure()).count();
        if failed == 0 {
            SyncStatus::Completed
        } else if failed == outcomes.len() {
            SyncStatus::Failed
        } else {
            SyncStatus::Partial
        }
    }

    /// The error a non-completed result maps to at service boundaries, with
    /// per-pair counts. Completed results map to nothing.
    pub fn as_error(&self) -> Option<OrchestrationError> {
        if self.status == SyncStatus::Completed {
            return None;
        }
        let failed = self
            .outcomes
            .iter()
            .filter(|(_, _, o)| o.is_failure())
            .count();
        Some(OrchestrationError::SyncPartialFailure {
            succeeded: self.outcomes.len() - failed,
            failed,
        })
    }
}
