// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Public API Facade
//!
//! Typed request/response surface over the application services. No untyped
//! maps cross this boundary: every request is validated here before it
//! reaches the core, and every response is a concrete struct. Transport
//! bindings (HTTP, gRPC) are built on top of this facade, not on the
//! services directly.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::application::context_service::ContextStore;
use crate::config::HandoffConfig;
use crate::application::handoff::HandoffCoordinator;
use crate::application::orchestrator::{StepSnapshot, TaskOrchestrator};
use crate::application::registry::AgentRegistry;
use crate::domain::agent::AgentId;
use crate::domain::context::{Context, ContextData, ContextId, ContextScope, ContextType};
use crate::domain::error::OrchestrationError;
use crate::domain::handoff::{HandoffRequest, HandoffStatus};
use crate::domain::sync::SyncMode;
use crate::domain::task::{Task, TaskId, TaskPriority, TaskRequirements, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Core(#[from] OrchestrationError),
}

// ---------------------------------------------------------------------------
// Requests / responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTaskRequest {
    /// Client-supplied id for idempotent resubmission; generated when absent.
    #[serde(default)]
    pub task_id: Option<Uuid>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub task_type: String,
    pub requirements: TaskRequirements,
    pub input: serde_json::Value,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub orchestration_id: TaskId,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusRequest {
    pub task_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTaskStatus {
    pub agent_id: AgentId,
    pub step_index: Option<usize>,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Coarse completion fraction derived from the state machine.
    pub progress: f64,
    pub per_agent_status: Vec<AgentTaskStatus>,
    pub elapsed_ms: u64,
    pub estimated_remaining_ms: Option<u64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelTaskRequest {
    pub task_id: Uuid,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelTaskResponse {
    /// Always true for a known task; cancellation is idempotent.
    pub accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchAgentRequest {
    pub conversation_id: String,
    pub from_agent_id: Uuid,
    /// When absent the selector picks the destination.
    #[serde(default)]
    pub to_agent_id: Option<Uuid>,
    pub reason: String,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Explicit transfer scope. Empty means every live context linked to the
    /// conversation.
    #[serde(default)]
    pub context_ids: Vec<Uuid>,
    #[serde(default)]
    pub mode: Option<SyncMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchAgentResponse {
    pub switch_id: Uuid,
    pub status: HandoffStatus,
    pub to_agent: Option<AgentId>,
    pub quality_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreContextRequest {
    pub scope: ContextScope,
    pub context_type: ContextType,
    pub data: ContextData,
    pub owner: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreContextResponse {
    pub context_id: ContextId,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetContextRequest {
    pub context_id: Uuid,
    pub principal: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateContextRequest {
    pub context_id: Uuid,
    pub expected_version: u64,
    pub changes: BTreeMap<String, serde_json::Value>,
    pub principal: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateContextResponse {
    pub new_version: u64,
}

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct OrchestratorApi {
    orchestrator: TaskOrchestrator,
    registry: AgentRegistry,
    store: ContextStore,
    handoff: HandoffCoordinator,
    handoff_defaults: HandoffConfig,
}

impl OrchestratorApi {
    pub fn new(
        orchestrator: TaskOrchestrator,
        registry: AgentRegistry,
        store: ContextStore,
        handoff: HandoffCoordinator,
    ) -> Self {
        Self {
            orchestrator,
            registry,
            store,
            handoff,
            handoff_defaults: HandoffConfig::default(),
        }
    }

    pub fn with_handoff_defaults(mut self, defaults: HandoffConfig) -> Self {
        self.handoff_defaults = defaults;
        self
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn submit_task(&self, request: SubmitTaskRequest) -> Result<SubmitTaskResponse, ApiError> {
        if request.task_type.trim().is_empty() {
            return Err(ApiError::Validation("task_type must not be empty".into()));
        }
        if request.requirements.capabilities.is_empty() {
            return Err(ApiError::Validation(
                "requirements.capabilities must not be empty".into(),
            ));
        }
        if let Some(threshold) = request.requirements.quality_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ApiError::Validation(format!(
                    "quality_threshold must be in [0, 1], got {threshold}"
                )));
            }
        }
        let mut task = Task::new(
            request.task_type,
            request.priority.unwrap_or_default(),
            request.input,
            request.requirements,
        );
        if let Some(id) = request.task_id {
            task.id = TaskId::from_uuid(id);
        }
        task.user_id = request.user_id;
        task.conversation_id = request.conversation_id;

        let orchestration_id = self.orchestrator.submit(task)?;
        Ok(SubmitTaskResponse {
            orchestration_id,
            status: TaskStatus::Queued,
        })
    }

    pub fn task_status(&self, request: TaskStatusRequest) -> Result<TaskStatusResponse, ApiError> {
        let snapshot = self
            .orchestrator
            .status(TaskId::from_uuid(request.task_id))?;
        let progress = match snapshot.status {
            TaskStatus::Pending | TaskStatus::Queued => 0.0,
            TaskStatus::Assigned => 0.25,
            TaskStatus::InProgress => 0.5,
            _ => 1.0,
        };
        let mut per_agent_status: Vec<AgentTaskStatus> = snapshot
            .steps
            .iter()
            .filter_map(|s: &StepSnapshot| {
                s.agent_id.map(|agent_id| AgentTaskStatus {
                    agent_id,
                    step_index: Some(s.step_index),
                    status: s.status,
                })
            })
            .collect();
        if per_agent_status.is_empty() {
            if let Some(agent_id) = snapshot.assigned_agent {
                per_agent_status.push(AgentTaskStatus {
                    agent_id,
                    step_index: None,
                    status: snapshot.status,
                });
            }
        }
        Ok(TaskStatusResponse {
            task_id: snapshot.task_id,
            status: snapshot.status,
            progress,
            per_agent_status,
            elapsed_ms: snapshot.elapsed_ms,
            estimated_remaining_ms: snapshot.estimated_remaining_ms,
            result: snapshot.result.map(|r| r.output),
            error: snapshot.error.map(|e| e.message),
        })
    }

    pub async fn cancel_task(
        &self,
        request: CancelTaskRequest,
    ) -> Result<CancelTaskResponse, ApiError> {
        let accepted = self
            .orchestrator
            .cancel(
                TaskId::from_uuid(request.task_id),
                request.reason.unwrap_or_else(|| "client request".to_string()),
            )
            .await?;
        Ok(CancelTaskResponse { accepted })
    }

    pub async fn switch_agent(
        &self,
        request: SwitchAgentRequest,
    ) -> Result<SwitchAgentResponse, ApiError> {
        if request.conversation_id.trim().is_empty() {
            return Err(ApiError::Validation(
                "conversation_id must not be empty".into(),
            ));
        }
        if request.to_agent_id == Some(request.from_agent_id) {
            return Err(ApiError::Validation(
                "source and destination agent must differ".into(),
            ));
        }
        // the conversation defines the scope unless the caller narrows it
        let context_ids: Vec<ContextId> = if request.context_ids.is_empty() {
            self.store.ids_for_conversation(&request.conversation_id)
        } else {
            request.context_ids.into_iter().map(ContextId).collect()
        };
        if context_ids.is_empty() {
            return Err(ApiError::Validation(format!(
                "no contexts linked to conversation '{}'",
                request.conversation_id
            )));
        }
        let record = self
            .handoff
            .execute(HandoffRequest {
                conversation_id: request.conversation_id,
                from_agent: AgentId(request.from_agent_id),
                to_agent: request.to_agent_id.map(AgentId),
                reason: request.reason,
                required_capabilities: request.required_capabilities,
                context_ids,
                mode: request.mode.unwrap_or(SyncMode::Full),
                min_verify_score: self.handoff_defaults.min_verify_score,
                target_duration_ms: self.handoff_defaults.target_duration_ms,
            })
            .await?;
        Ok(SwitchAgentResponse {
            switch_id: record.id.0,
            status: record.status,
            to_agent: record.to_agent,
            quality_score: record.quality_score,
        })
    }

    pub fn store_context(
        &self,
        request: StoreContextRequest,
    ) -> Result<StoreContextResponse, ApiError> {
        if request.owner.trim().is_empty() {
            return Err(ApiError::Validation("owner must not be empty".into()));
        }
        if matches!(request.ttl_seconds, Some(ttl) if ttl <= 0) {
            return Err(ApiError::Validation("ttl_seconds must be positive".into()));
        }
        let mut context = Context::new(
            request.context_type,
            request.scope,
            request.data,
            request.owner,
        );
        context.conversation_id = request.conversation_id;
        context.lifecycle.ttl_seconds = request.ttl_seconds;
        let version = context.version;
        let context_id = self.store.create(context);
        Ok(StoreContextResponse {
            context_id,
            version,
        })
    }

    pub fn get_context(&self, request: GetContextRequest) -> Result<Context, ApiError> {
        Ok(self
            .store
            .get(ContextId(request.context_id), &request.principal)?)
    }

    pub fn update_context(
        &self,
        request: UpdateContextRequest,
    ) -> Result<UpdateContextResponse, ApiError> {
        if request.changes.is_empty() {
            return Err(ApiError::Validation("changes must not be empty".into()));
        }
        let new_version = self.store.update(
            ContextId(request.context_id),
            request.expected_version,
            request.changes,
            &request.principal,
        )?;
        Ok(UpdateContextResponse { new_version })
    }
}
