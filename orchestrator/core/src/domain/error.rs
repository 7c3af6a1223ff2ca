// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use thiserror::Error;
use uuid::Uuid;

use crate::domain::handoff::HandoffPhase;

/// Errors that can occur during orchestration operations.
#[derive(Debug, Clone, Error)]
pub enum OrchestrationError {
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("No eligible agent for required capabilities: {required:?}")]
    NoEligibleAgent { required: Vec<String> },

    #[error("Version conflict on context {context_id}: expected {expected}, stored {actual}")]
    VersionConflict {
        context_id: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("Access denied on context {context_id} for principal '{principal}'")]
    AccessDenied { context_id: Uuid, principal: String },

    #[error("Handoff failed in phase {phase}: {reason}")]
    HandoffFailed { phase: HandoffPhase, reason: String },

    #[error("Sync partially failed: {succeeded} succeeded, {failed} failed")]
    SyncPartialFailure { succeeded: usize, failed: usize },

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Context not found: {0}")]
    ContextNotFound(Uuid),

    #[error("Agent not found: {0}")]
    AgentNotFound(Uuid),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Context {0} is frozen for an in-flight handoff")]
    ContextFrozen(Uuid),

    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),
}

impl OrchestrationError {
    /// Whether the error is safe to retry internally with backoff.
    /// Structural errors (invalid input, access denial) surface immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NoEligibleAgent { .. }
                | Self::VersionConflict { .. }
                | Self::ContextFrozen(_)
                | Self::QueueUnavailable(_)
        )
    }
}
