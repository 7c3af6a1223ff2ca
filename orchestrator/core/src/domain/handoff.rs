// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Handoff Domain Model
//!
//! A handoff transfers an active conversation from one agent to another
//! through a fixed six-phase protocol. Each phase is idempotent and
//! independently retryable; failure in phases 2-5 rolls the handoff back to
//! phase-1 state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agent::AgentId;
use crate::domain::context::ContextId;
use crate::domain::sync::SyncMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandoffId(pub Uuid);

impl HandoffId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HandoffId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for HandoffId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The six phases, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffPhase {
    Freeze,
    Snapshot,
    Select,
    Transfer,
    Verify,
    Commit,
}

impl std::fmt::Display for HandoffPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Freeze => "freeze",
            Self::Snapshot => "snapshot",
            Self::Select => "select",
            Self::Transfer => "transfer",
            Self::Verify => "verify",
            Self::Commit => "commit",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRequest {
    pub conversation_id: String,
    pub from_agent: AgentId,
    /// When absent, the selector picks the destination (excluding the source).
    pub to_agent: Option<AgentId>,
    pub reason: String,
    /// Capabilities the destination must hold. Empty means any agent the
    /// selector considers available.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// The context scope being handed off.
    pub context_ids: Vec<ContextId>,
    pub mode: SyncMode,
    /// Verify-phase score below this triggers rollback.
    #[serde(default = "default_min_verify_score")]
    pub min_verify_score: f64,
    /// Target end-to-end duration feeding the quality score.
    #[serde(default = "default_target_duration_ms")]
    pub target_duration_ms: u64,
}

fn default_min_verify_score() -> f64 { 0.9 }
fn default_target_duration_ms() -> u64 { 5_000 }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    Completed,
    RolledBack,
    /// Transfer succeeded but the commit phase faulted; caller reconciles.
    CommitFaulted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub id: HandoffId,
    pub conversation_id: String,
    pub from_agent: AgentId,
    pub to_agent: Option<AgentId>,
    pub status: HandoffStatus,
    pub phase_reached: HandoffPhase,
    pub verify_score: f64,
    pub quality_score: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// End-to-end quality: transfer fidelity weighted by time-to-complete
/// against the target duration. Finishing under target does not inflate
/// quality beyond the verify score.
pub fn quality_score(verify_score: f64, elapsed_ms: u64, target_duration_ms: u64) -> f64 {
    if target_duration_ms == 0 || elapsed_ms == 0 {
        return verify_score;
    }
    let time_factor = (target_duration_ms as f64 / elapsed_ms as f64).min(1.0);
    verify_score * time_factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_are_ordered() {
        assert!(HandoffPhase::Freeze < HandoffPhase::Snapshot);
        assert!(HandoffPhase::Snapshot < HandoffPhase::Select);
        assert!(HandoffPhase::Select < HandoffPhase::Transfer);
        assert!(HandoffPhase::Transfer < HandoffPhase::Verify);
        assert!(HandoffPhase::Verify < HandoffPhase::Commit);
    }

    #[test]
    fn quality_capped_at_verify_score() {
        // finished twice as fast as target: no bonus
        assert_eq!(quality_score(0.95, 1_000, 2_000), 0.95);
        // finished at target
        assert_eq!(quality_score(0.95, 2_000, 2_000), 0.95);
        // twice as slow: half credit
        assert!((quality_score(0.9, 4_000, 2_000) - 0.45).abs() < 1e-9);
    }
}
