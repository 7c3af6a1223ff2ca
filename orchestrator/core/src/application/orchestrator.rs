// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Task Orchestrator
//!
//! Owns the task lifecycle: submission validation, the priority queue,
//! assignment through the selector, retries with exponential backoff, and
//! timeout enforcement. Dispatch hands work to the `JobSink`; agents report
//! back through `report_started` / `report_result`. All scheduling decisions
//! happen inside `tick`, driven by the runtime's interval and a notify wake
//! on submission.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::registry::AgentRegistry;
use crate::application::selector::AgentSelector;
use crate::domain::agent::AgentId;
use crate::domain::error::OrchestrationError;
use crate::domain::events::TaskEvent;
use crate::domain::task::{
    Task, TaskError, TaskId, TaskPriority, TaskResult, TaskStatus, WorkflowExecution,
    WorkflowStrategy,
};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::queue::{JobEnvelope, JobKind, JobSink};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Scheduler tick interval driving assignment, retries, and timeouts.
    pub scheduler_tick_ms: u64,
    /// Response budget for tasks that set no `max_response_time_ms`.
    pub default_task_timeout_ms: u64,
    /// Retry ceiling when the assigned agent is no longer registered.
    pub default_max_retries: u32,
    /// Backoff base when the assigned agent is no longer registered.
    pub default_retry_backoff_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            scheduler_tick_ms: 250,
            default_task_timeout_ms: 300_000,
            default_max_retries: 3,
            default_retry_backoff_ms: 500,
        }
    }
}

/// Heap entry ordering: highest priority first, then submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueEntry {
    priority: TaskPriority,
    seq: u64,
    task_id: TaskId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
struct PendingRetry {
    task_id: TaskId,
    due: DateTime<Utc>,
    backoff_ms: u64,
}

#[derive(Default)]
struct SchedulerState {
    tasks: HashMap<TaskId, Task>,
    queue: BinaryHeap<QueueEntry>,
    next_seq: u64,
    retries: Vec<PendingRetry>,
    workflows: HashMap<Uuid, WorkflowExecution>,
}

/// Point-in-time view of a task for status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub assigned_agent: Option<AgentId>,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub estimated_remaining_ms: Option<u64>,
    pub result: Option<TaskResult>,
    pub error: Option<TaskError>,
    pub steps: Vec<StepSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub step_index: usize,
    pub agent_id: Option<AgentId>,
    pub status: TaskStatus,
}

#[derive(Clone)]
pub struct TaskOrchestrator {
    registry: AgentRegistry,
    selector: AgentSelector,
    event_bus: EventBus,
    job_sink: Arc<dyn JobSink>,
    state: Arc<Mutex<SchedulerState>>,
    notify: Arc<Notify>,
    settings: OrchestratorSettings,
}

impl TaskOrchestrator {
    pub fn new(
        registry: AgentRegistry,
        selector: AgentSelector,
        event_bus: EventBus,
        job_sink: Arc<dyn JobSink>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry,
            selector,
            event_bus,
            job_sink,
            state: Arc::new(Mutex::new(SchedulerState::default())),
            notify: Arc::new(Notify::new()),
            settings,
        }
    }

    // ------------------------------------------------------------------
    // Submission and queries
    // ------------------------------------------------------------------

    /// Validate and queue a task. Rejects tasks no registered agent could
    /// ever satisfy; availability is checked at assignment time, not here.
    pub fn submit(&self, mut task: Task) -> Result<TaskId, OrchestrationError> {
        self.validate(&task)?;
        let task_id = task.id;
        task.transition(TaskStatus::Queued)?;

        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(QueueEntry {
            priority: task.priority,
            seq,
            task_id,
        });
        self.event_bus.publish_task_event(TaskEvent::Submitted {
            task_id,
            priority: task.priority,
            submitted_at: task.created_at,
        });
        self.event_bus.publish_task_event(TaskEvent::Queued {
            task_id,
            queued_at: Utc::now(),
        });
        info!(task_id = %task_id, priority = ?task.priority, "Task queued");
        state.tasks.insert(task_id, task);
        drop(state);

        self.notify.notify_one();
        Ok(task_id)
    }

    /// Queue a multi-agent workflow. The owning task never enters the
    /// single-agent queue; its steps are dispatched by the scheduler tick.
    pub fn submit_workflow(
        &self,
        mut task: Task,
        strategy: WorkflowStrategy,
    ) -> Result<(TaskId, Uuid), OrchestrationError> {
        self.validate(&task)?;
        let inputs = match (&strategy, &task.input) {
            (_, serde_json::Value::Array(items)) => items.clone(),
            (WorkflowStrategy::Distribute, _) => {
                return Err(OrchestrationError::InvalidTask(
                    "distribute workflows require an array input".to_string(),
                ))
            }
            (_, other) => vec![other.clone()],
        };
        if inputs.is_empty() {
            return Err(OrchestrationError::InvalidTask(
                "workflow input must contain at least one step".to_string(),
            ));
        }

        let task_id = task.id;
        task.transition(TaskStatus::Queued)?;
        let workflow = WorkflowExecution::new(task_id, strategy, inputs);
        let workflow_id = workflow.id;

        let mut state = self.state.lock();
        self.event_bus.publish_task_event(TaskEvent::Submitted {
            task_id,
            priority: task.priority,
            submitted_at: task.created_at,
        });
        self.event_bus.publish_task_event(TaskEvent::Queued {
            task_id,
            queued_at: Utc::now(),
        });
        info!(
            task_id = %task_id,
            workflow_id = %workflow_id,
            strategy = ?strategy,
            steps = workflow.steps.len(),
            "Workflow queued"
        );
        state.tasks.insert(task_id, task);
        state.workflows.insert(workflow_id, workflow);
        drop(state);

        self.notify.notify_one();
        Ok((task_id, workflow_id))
    }

    pub fn get(&self, task_id: TaskId) -> Option<Task> {
        self.state.lock().tasks.get(&task_id).cloned()
    }

    pub fn status(&self, task_id: TaskId) -> Result<TaskSnapshot, OrchestrationError> {
        let state = self.state.lock();
        let task = state
            .tasks
            .get(&task_id)
            .ok_or(OrchestrationError::TaskNotFound(task_id.as_uuid()))?;
        let steps = state
            .workflows
            .values()
            .find(|w| w.task_id == task_id)
            .map(|w| {
                w.steps
                    .iter()
                    .map(|s| StepSnapshot {
                        step_index: s.step_index,
                        agent_id: s.agent_id,
                        status: s.status,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(TaskSnapshot {
            task_id,
            status: task.status,
            assigned_agent: task.assigned_agent,
            attempts: task.attempts,
            elapsed_ms: task.elapsed_ms(Utc::now()),
            estimated_remaining_ms: self.estimate_remaining(task),
            result: task.result.clone(),
            error: task.error.clone(),
            steps,
        })
    }

    /// Cancel a task. Always accepted for a known task: cancelling an
    /// already-terminal one is a no-op, except that a failed task waiting on
    /// a retry loses the retry and stays failed. A working agent is told to
    /// stop via a `CancelTask` job and its slot is freed without a stats
    /// penalty.
    pub async fn cancel(
        &self,
        task_id: TaskId,
        reason: impl Into<String>,
    ) -> Result<bool, OrchestrationError> {
        let reason = reason.into();
        let mut notify_agent = None;
        {
            let mut state = self.state.lock();
            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or(OrchestrationError::TaskNotFound(task_id.as_uuid()))?;
            if task.status.is_terminal() {
                state.retries.retain(|r| r.task_id != task_id);
                return Ok(true);
            }
            let was_working = matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress);
            task.transition(TaskStatus::Cancelled)?;
            if was_working {
                notify_agent = task.assigned_agent.map(|a| (a, task.priority));
            }
            state.retries.retain(|r| r.task_id != task_id);
            self.cancel_workflow_steps(&mut state, task_id);
            self.event_bus.publish_task_event(TaskEvent::Cancelled {
                task_id,
                reason: reason.clone(),
                cancelled_at: Utc::now(),
            });
        }
        info!(task_id = %task_id, %reason, "Task cancelled");

        if let Some((agent_id, priority)) = notify_agent {
            self.registry.release_slot(agent_id);
            let envelope = JobEnvelope::new(
                JobKind::CancelTask,
                json!({
                    "task_id": task_id,
                    "agent_id": agent_id,
                    "reason": reason,
                }),
                priority,
            );
            self.job_sink.enqueue(envelope).await?;
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Agent reports
    // ------------------------------------------------------------------

    pub fn report_started(
        &self,
        task_id: TaskId,
        agent_id: AgentId,
    ) -> Result<(), OrchestrationError> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(OrchestrationError::TaskNotFound(task_id.as_uuid()))?;
        if task.assigned_agent != Some(agent_id) {
            return Err(OrchestrationError::InvalidTask(format!(
                "start report from agent {agent_id} which is not assigned to task {task_id}"
            )));
        }
        task.transition(TaskStatus::InProgress)?;
        self.event_bus.publish_task_event(TaskEvent::Started {
            task_id,
            agent_id,
            started_at: Utc::now(),
        });
        Ok(())
    }

    /// Fold an agent's outcome into the task. Retryable failures re-enter
    /// the queue after exponential backoff until the agent's retry ceiling.
    pub fn report_result(
        &self,
        task_id: TaskId,
        outcome: Result<TaskResult, TaskError>,
    ) -> Result<(), OrchestrationError> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(OrchestrationError::TaskNotFound(task_id.as_uuid()))?;
        let agent_id = task
            .assigned_agent
            .ok_or_else(|| OrchestrationError::InvalidTask(format!(
                "result reported for unassigned task {task_id}"
            )))?;
        let latency_ms = task
            .started_at
            .map(|s| (Utc::now() - s).num_milliseconds().max(0) as u64)
            .unwrap_or(0);

        match outcome {
            Ok(result) => {
                task.transition(TaskStatus::Completed)?;
                task.result = Some(result);
                self.event_bus.publish_task_event(TaskEvent::Completed {
                    task_id,
                    agent_id,
                    completed_at: Utc::now(),
                });
                info!(task_id = %task_id, agent_id = %agent_id, latency_ms, "Task completed");
                drop(state);
                self.registry.release(agent_id, true, latency_ms);
            }
            Err(error) => {
                task.transition(TaskStatus::Failed)?;
                task.error = Some(error.clone());
                let will_retry = error.retryable && task.attempts <= self.max_retries(agent_id);
                self.event_bus.publish_task_event(TaskEvent::Failed {
                    task_id,
                    error: error.message.clone(),
                    will_retry,
                    failed_at: Utc::now(),
                });
                if will_retry {
                    let attempts = task.attempts;
                    task.assigned_agent = None;
                    let backoff_ms = self.backoff_ms(agent_id, attempts);
                    warn!(
                        task_id = %task_id,
                        attempt = attempts,
                        backoff_ms,
                        "Task failed, retry scheduled"
                    );
                    state.retries.push(PendingRetry {
                        task_id,
                        due: Utc::now() + ChronoDuration::milliseconds(backoff_ms as i64),
                        backoff_ms,
                    });
                } else {
                    warn!(task_id = %task_id, error = %error.message, "Task failed permanently");
                }
                drop(state);
                self.registry.release(agent_id, false, latency_ms);
            }
        }
        Ok(())
    }

    /// Fold one workflow step's outcome in. Chain workflows feed the output
    /// forward; any failed step fails the remaining steps and the task.
    pub fn report_step_result(
        &self,
        workflow_id: Uuid,
        step_index: usize,
        outcome: Result<serde_json::Value, String>,
    ) -> Result<(), OrchestrationError> {
        let mut release = None;
        let mut finished: Option<(TaskId, Result<TaskResult, String>)> = None;
        {
            let mut state = self.state.lock();
            let workflow = state.workflows.get_mut(&workflow_id).ok_or_else(|| {
                OrchestrationError::InvalidTask(format!("unknown workflow {workflow_id}"))
            })?;
            let strategy = workflow.strategy;
            let step = workflow.steps.get_mut(step_index).ok_or_else(|| {
                OrchestrationError::InvalidTask(format!(
                    "workflow {workflow_id} has no step {step_index}"
                ))
            })?;
            if step.status.is_terminal() {
                return Err(OrchestrationError::InvalidTransition {
                    from: step.status.to_string(),
                    to: "completed".to_string(),
                });
            }
            let latency_ms = step
                .started_at
                .map(|s| (Utc::now() - s).num_milliseconds().max(0) as u64)
                .unwrap_or(0);
            step.ended_at = Some(Utc::now());
            match outcome {
                Ok(output) => {
                    step.status = TaskStatus::Completed;
                    step.output = Some(output.clone());
                    release = step.agent_id.map(|a| (a, true, latency_ms));
                    if strategy == WorkflowStrategy::Chain {
                        if let Some(next) = workflow.steps.get_mut(step_index + 1) {
                            // chain steps see the previous output
                            if let serde_json::Value::Object(map) = &mut next.input {
                                map.insert("previous".to_string(), output);
                            }
                        }
                    }
                }
                Err(message) => {
                    step.status = TaskStatus::Failed;
                    release = step.agent_id.map(|a| (a, false, latency_ms));
                    warn!(
                        workflow_id = %workflow_id,
                        step_index,
                        error = %message,
                        "Workflow step failed"
                    );
                    for pending in workflow
                        .steps
                        .iter_mut()
                        .filter(|s| !s.status.is_terminal())
                    {
                        pending.status = TaskStatus::Cancelled;
                    }
                    workflow.status = TaskStatus::Failed;
                    finished = Some((workflow.task_id, Err(message)));
                }
            }
            if finished.is_none() && workflow.is_complete() {
                let all_ok = workflow
                    .steps
                    .iter()
                    .all(|s| s.status == TaskStatus::Completed);
                if all_ok {
                    workflow.status = TaskStatus::Completed;
                    let outputs: Vec<serde_json::Value> = workflow
                        .steps
                        .iter()
                        .filter_map(|s| s.output.clone())
                        .collect();
                    finished = Some((
                        workflow.task_id,
                        Ok(TaskResult {
                            output: serde_json::Value::Array(outputs),
                            quality_score: None,
                        }),
                    ));
                } else {
                    workflow.status = TaskStatus::Failed;
                    finished = Some((workflow.task_id, Err("one or more steps failed".into())));
                }
            }

            if let Some((task_id, result)) = finished {
                self.finish_workflow_task(&mut state, task_id, result);
            }
        }
        if let Some((agent_id, succeeded, latency_ms)) = release {
            self.registry.release(agent_id, succeeded, latency_ms);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scheduler
    // ------------------------------------------------------------------

    /// One scheduling pass: requeue due retries, enforce timeouts, and
    /// assign queued work. Dispatch failures reschedule the task.
    pub async fn tick(&self) {
        let envelopes = {
            let mut state = self.state.lock();
            self.requeue_due_retries(&mut state);
            self.sweep_timeouts(&mut state);
            let mut envelopes = self.drain_queue(&mut state);
            envelopes.extend(self.dispatch_workflow_steps(&mut state));
            envelopes
        };

        for envelope in envelopes {
            if let Err(e) = self.job_sink.enqueue(envelope.clone()).await {
                warn!(error = %e, "Dispatch failed, rescheduling task");
                self.reschedule_failed_dispatch(&envelope);
            }
        }
    }

    /// Scheduler loop. Ticks on the configured interval and on submission
    /// wakes until the token is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_millis(self.settings.scheduler_tick_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Scheduler stopping");
                    break;
                }
                _ = self.notify.notified() => self.tick().await,
                _ = interval.tick() => self.tick().await,
            }
        }
    }

    fn validate(&self, task: &Task) -> Result<(), OrchestrationError> {
        if task.requirements.capabilities.is_empty() {
            return Err(OrchestrationError::InvalidTask(
                "task requires at least one capability".to_string(),
            ));
        }
        if !self.registry.any_satisfies(&task.requirements.capabilities) {
            return Err(OrchestrationError::InvalidTask(format!(
                "no registered agent satisfies capabilities {:?}",
                task.requirements.capabilities
            )));
        }
        Ok(())
    }

    fn requeue_due_retries(&self, state: &mut SchedulerState) {
        let now = Utc::now();
        let due: Vec<PendingRetry> = {
            let (due, pending) = state.retries.drain(..).partition(|r| r.due <= now);
            state.retries = pending;
            due
        };
        for retry in due {
            let Some(task) = state.tasks.get_mut(&retry.task_id) else {
                continue;
            };
            // the task may have been cancelled while waiting
            if task.transition(TaskStatus::Queued).is_err() {
                continue;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push(QueueEntry {
                priority: task.priority,
                seq,
                task_id: retry.task_id,
            });
            self.event_bus.publish_task_event(TaskEvent::Requeued {
                task_id: retry.task_id,
                attempt: task.attempts,
                backoff_ms: retry.backoff_ms,
                requeued_at: now,
            });
            debug!(task_id = %retry.task_id, "Retry requeued");
        }
    }

    fn sweep_timeouts(&self, state: &mut SchedulerState) {
        let now = Utc::now();
        let default_ms = self.settings.default_task_timeout_ms;
        let mut released = Vec::new();
        for task in state.tasks.values_mut() {
            if !matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
                continue;
            }
            let Some(started) = task.started_at else {
                continue;
            };
            let budget_ms = task.response_budget_ms(default_ms);
            let running_ms = (now - started).num_milliseconds().max(0) as u64;
            if running_ms <= budget_ms {
                continue;
            }
            if task.transition(TaskStatus::TimedOut).is_ok() {
                warn!(task_id = %task.id, budget_ms, running_ms, "Task timed out");
                self.event_bus.publish_task_event(TaskEvent::TimedOut {
                    task_id: task.id,
                    budget_ms,
                    timed_out_at: now,
                });
                if let Some(agent_id) = task.assigned_agent {
                    released.push(agent_id);
                }
            }
        }
        for agent_id in released {
            self.registry.release_slot(agent_id);
        }
    }

    fn drain_queue(&self, state: &mut SchedulerState) -> Vec<JobEnvelope> {
        let mut envelopes = Vec::new();
        let mut kept = Vec::new();
        while let Some(entry) = state.queue.pop() {
            let Some(task) = state.tasks.get_mut(&entry.task_id) else {
                continue;
            };
            if task.status != TaskStatus::Queued {
                // stale entry for a cancelled or retried task
                continue;
            }
            let selection = match self.selector.select(&task.requirements, &[]) {
                Ok(s) => s,
                Err(OrchestrationError::NoEligibleAgent { .. }) => {
                    kept.push(entry);
                    continue;
                }
                Err(e) => {
                    warn!(task_id = %entry.task_id, error = %e, "Selection failed");
                    kept.push(entry);
                    continue;
                }
            };
            if !self.registry.try_assign(selection.agent_id) {
                kept.push(entry);
                continue;
            }
            if let Err(e) = task.assign(selection.agent_id) {
                // should not happen for a Queued task; free the slot
                warn!(task_id = %entry.task_id, error = %e, "Assignment refused by state machine");
                self.registry.release_slot(selection.agent_id);
                continue;
            }
            self.event_bus.publish_task_event(TaskEvent::Assigned {
                task_id: entry.task_id,
                agent_id: selection.agent_id,
                attempt: task.attempts,
                assigned_at: Utc::now(),
            });
            debug!(
                task_id = %entry.task_id,
                agent_id = %selection.agent_id,
                score = selection.score,
                "Task assigned"
            );
            envelopes.push(JobEnvelope::new(
                JobKind::ExecuteTask,
                json!({
                    "task_id": entry.task_id,
                    "agent_id": selection.agent_id,
                    "task_type": task.task_type,
                    "input": task.input,
                    "attempt": task.attempts,
                }),
                task.priority,
            ));
        }
        for entry in kept {
            state.queue.push(entry);
        }
        envelopes
    }

    fn dispatch_workflow_steps(&self, state: &mut SchedulerState) -> Vec<JobEnvelope> {
        let mut envelopes = Vec::new();
        let mut first_assignments = Vec::new();
        for workflow in state.workflows.values_mut() {
            if workflow.status.is_terminal() {
                continue;
            }
            let Some(task) = state.tasks.get(&workflow.task_id) else {
                continue;
            };
            if task.status.is_terminal() {
                continue;
            }
            let used: Vec<AgentId> = workflow.steps.iter().filter_map(|s| s.agent_id).collect();
            let dispatchable: Vec<usize> = match workflow.strategy {
                WorkflowStrategy::Chain => {
                    let next = workflow
                        .steps
                        .iter()
                        .position(|s| s.status == TaskStatus::Pending);
                    match next {
                        Some(0) => vec![0],
                        Some(i)
                            if workflow.steps[i - 1].status == TaskStatus::Completed =>
                        {
                            vec![i]
                        }
                        _ => vec![],
                    }
                }
                WorkflowStrategy::Parallel | WorkflowStrategy::Distribute => workflow
                    .steps
                    .iter()
                    .filter(|s| s.status == TaskStatus::Pending)
                    .map(|s| s.step_index)
                    .collect(),
            };
            for index in dispatchable {
                // distribute spreads across agents when enough are eligible
                let exclude: &[AgentId] = if workflow.strategy == WorkflowStrategy::Distribute {
                    &used
                } else {
                    &[]
                };
                let selection = match self
                    .selector
                    .select(&task.requirements, exclude)
                    .or_else(|_| self.selector.select(&task.requirements, &[]))
                {
                    Ok(s) => s,
                    Err(_) => continue,
                };
                if !self.registry.try_assign(selection.agent_id) {
                    continue;
                }
                let step = &mut workflow.steps[index];
                step.agent_id = Some(selection.agent_id);
                step.status = TaskStatus::Assigned;
                step.started_at = Some(Utc::now());
                if workflow.status == TaskStatus::Pending {
                    workflow.status = TaskStatus::InProgress;
                }
                first_assignments.push((workflow.task_id, selection.agent_id));
                envelopes.push(JobEnvelope::new(
                    JobKind::ExecuteTask,
                    json!({
                        "task_id": workflow.task_id,
                        "workflow_id": workflow.id,
                        "step_index": index,
                        "agent_id": selection.agent_id,
                        "task_type": task.task_type,
                        "input": step.input,
                    }),
                    task.priority,
                ));
            }
        }
        // the owning task leaves Queued on the first step assignment
        for (task_id, agent_id) in first_assignments {
            let Some(task) = state.tasks.get_mut(&task_id) else {
                continue;
            };
            if task.status == TaskStatus::Queued {
                if task.assign(agent_id).is_ok() {
                    self.event_bus.publish_task_event(TaskEvent::Assigned {
                        task_id,
                        agent_id,
                        attempt: task.attempts,
                        assigned_at: Utc::now(),
                    });
                    if task.transition(TaskStatus::InProgress).is_ok() {
                        self.event_bus.publish_task_event(TaskEvent::Started {
                            task_id,
                            agent_id,
                            started_at: Utc::now(),
                        });
                    }
                }
            }
        }
        envelopes
    }

    fn finish_workflow_task(
        &self,
        state: &mut SchedulerState,
        task_id: TaskId,
        result: Result<TaskResult, String>,
    ) {
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return;
        };
        if task.status.is_terminal() {
            return;
        }
        let agent_id = task.assigned_agent;
        match result {
            Ok(task_result) => {
                if task.transition(TaskStatus::Completed).is_ok() {
                    task.result = Some(task_result);
                    if let Some(agent_id) = agent_id {
                        self.event_bus.publish_task_event(TaskEvent::Completed {
                            task_id,
                            agent_id,
                            completed_at: Utc::now(),
                        });
                    }
                    info!(task_id = %task_id, "Workflow task completed");
                }
            }
            Err(message) => {
                if task.transition(TaskStatus::Failed).is_ok() {
                    task.error = Some(TaskError {
                        message: message.clone(),
                        retryable: false,
                    });
                    self.event_bus.publish_task_event(TaskEvent::Failed {
                        task_id,
                        error: message,
                        will_retry: false,
                        failed_at: Utc::now(),
                    });
                }
            }
        }
    }

    fn cancel_workflow_steps(&self, state: &mut SchedulerState, task_id: TaskId) {
        let mut released = Vec::new();
        for workflow in state.workflows.values_mut() {
            if workflow.task_id != task_id || workflow.status.is_terminal() {
                continue;
            }
            for step in workflow.steps.iter_mut() {
                if !step.status.is_terminal() {
                    if matches!(step.status, TaskStatus::Assigned | TaskStatus::InProgress) {
                        if let Some(agent_id) = step.agent_id {
                            released.push(agent_id);
                        }
                    }
                    step.status = TaskStatus::Cancelled;
                }
            }
            workflow.status = TaskStatus::Cancelled;
        }
        for agent_id in released {
            self.registry.release_slot(agent_id);
        }
    }

    fn reschedule_failed_dispatch(&self, envelope: &JobEnvelope) {
        let Some(task_id) = envelope
            .payload
            .get("task_id")
            .and_then(|v| serde_json::from_value::<TaskId>(v.clone()).ok())
        else {
            return;
        };
        let mut state = self.state.lock();
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return;
        };
        let Some(agent_id) = task.assigned_agent.take() else {
            return;
        };
        if task.transition(TaskStatus::Failed).is_err() {
            return;
        }
        let attempts = task.attempts;
        let backoff_ms = self.backoff_ms(agent_id, attempts);
        state.retries.push(PendingRetry {
            task_id,
            due: Utc::now() + ChronoDuration::milliseconds(backoff_ms as i64),
            backoff_ms,
        });
        drop(state);
        self.registry.release_slot(agent_id);
    }

    fn max_retries(&self, agent_id: AgentId) -> u32 {
        self.registry
            .get(agent_id)
            .map(|a| a.config.max_retries)
            .unwrap_or(self.settings.default_max_retries)
    }

    /// Exponential backoff with +/-25% jitter to avoid retry stampedes.
    fn backoff_ms(&self, agent_id: AgentId, attempt: u32) -> u64 {
        let base = self
            .registry
            .get(agent_id)
            .map(|a| a.config.retry_backoff_ms)
            .unwrap_or(self.settings.default_retry_backoff_ms);
        let exp = base.saturating_mul(1u64 << attempt.min(16));
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        (exp as f64 * jitter) as u64
    }

    fn estimate_remaining(&self, task: &Task) -> Option<u64> {
        if !matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
            return None;
        }
        let agent = self.registry.get(task.assigned_agent?)?;
        let started = task.started_at?;
        let running_ms = (Utc::now() - started).num_milliseconds().max(0) as u64;
        let expected = if agent.performance.avg_latency_ms > 0.0 {
            agent.performance.avg_latency_ms as u64
        } else {
            task.response_budget_ms(self.settings.default_task_timeout_ms)
        };
        Some(expected.saturating_sub(running_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::selector::SelectionStrategy;
    use crate::domain::agent::{AgentConfig, AgentDescriptor};
    use crate::domain::task::TaskRequirements;
    use crate::infrastructure::queue::InMemoryJobQueue;

    struct Harness {
        orchestrator: TaskOrchestrator,
        registry: AgentRegistry,
        queue: Arc<InMemoryJobQueue>,
    }

    fn harness() -> Harness {
        let bus = EventBus::new(256);
        let registry = AgentRegistry::new(bus.clone());
        let selector = AgentSelector::new(registry.clone(), SelectionStrategy::LeastLoaded);
        let queue = Arc::new(InMemoryJobQueue::new(64));
        let orchestrator = TaskOrchestrator::new(
            registry.clone(),
            selector,
            bus,
            queue.clone(),
            OrchestratorSettings::default(),
        );
        Harness {
            orchestrator,
            registry,
            queue,
        }
    }

    fn educator(max_concurrent: u32, backoff_ms: u64) -> AgentDescriptor {
        AgentDescriptor::new(
            "tutor",
            "education",
            ["education".to_string()],
            AgentConfig {
                max_concurrent_tasks: max_concurrent,
                retry_backoff_ms: backoff_ms,
                ..Default::default()
            },
        )
    }

    fn task(priority: TaskPriority) -> Task {
        Task::new(
            "answer",
            priority,
            serde_json::json!({"q": "what is ownership?"}),
            TaskRequirements {
                capabilities: vec!["education".to_string()],
                ..Default::default()
            },
        )
    }

    fn envelope_task_id(envelope: &JobEnvelope) -> TaskId {
        serde_json::from_value(envelope.payload["task_id"].clone()).unwrap()
    }

    #[tokio::test]
    async fn submit_assign_complete_lifecycle() {
        let h = harness();
        let agent_id = h.registry.register(educator(2, 100));
        let task_id = h.orchestrator.submit(task(TaskPriority::High)).unwrap();

        h.orchestrator.tick().await;
        let snapshot = h.orchestrator.status(task_id).unwrap();
        assert_eq!(snapshot.status, TaskStatus::Assigned);
        assert_eq!(snapshot.assigned_agent, Some(agent_id));
        assert_eq!(snapshot.attempts, 1);
        let envelope = h.queue.try_dequeue().unwrap();
        assert_eq!(envelope.kind, JobKind::ExecuteTask);
        assert_eq!(envelope_task_id(&envelope), task_id);

        h.orchestrator.report_started(task_id, agent_id).unwrap();
        h.orchestrator
            .report_result(
                task_id,
                Ok(TaskResult {
                    output: serde_json::json!({"a": "memory safety"}),
                    quality_score: Some(0.95),
                }),
            )
            .unwrap();

        let snapshot = h.orchestrator.status(task_id).unwrap();
        assert_eq!(snapshot.status, TaskStatus::Completed);
        let agent = h.registry.get(agent_id).unwrap();
        assert_eq!(agent.performance.tasks_completed, 1);
        assert_eq!(agent.performance.current_load, 0);
    }

    #[tokio::test]
    async fn higher_priority_dispatches_first() {
        let h = harness();
        h.registry.register(educator(1, 100));
        let low = h.orchestrator.submit(task(TaskPriority::Low)).unwrap();
        let critical = h.orchestrator.submit(task(TaskPriority::Critical)).unwrap();

        h.orchestrator.tick().await;
        let envelope = h.queue.try_dequeue().unwrap();
        assert_eq!(envelope_task_id(&envelope), critical);
        // the single slot is taken; the low task stays queued
        assert!(h.queue.try_dequeue().is_none());
        assert_eq!(
            h.orchestrator.status(low).unwrap().status,
            TaskStatus::Queued
        );
    }

    #[tokio::test]
    async fn equal_priority_is_fifo() {
        let h = harness();
        h.registry.register(educator(1, 100));
        let first = h.orchestrator.submit(task(TaskPriority::Medium)).unwrap();
        let _second = h.orchestrator.submit(task(TaskPriority::Medium)).unwrap();

        h.orchestrator.tick().await;
        let envelope = h.queue.try_dequeue().unwrap();
        assert_eq!(envelope_task_id(&envelope), first);
    }

    #[tokio::test]
    async fn unsatisfiable_submission_is_rejected() {
        let h = harness();
        h.registry.register(educator(2, 100));
        let mut t = task(TaskPriority::Medium);
        t.requirements.capabilities = vec!["quantum".to_string()];
        assert!(matches!(
            h.orchestrator.submit(t),
            Err(OrchestrationError::InvalidTask(_))
        ));

        let empty = Task::new(
            "answer",
            TaskPriority::Medium,
            serde_json::json!({}),
            TaskRequirements::default(),
        );
        assert!(matches!(
            h.orchestrator.submit(empty),
            Err(OrchestrationError::InvalidTask(_))
        ));
    }

    #[tokio::test]
    async fn retryable_failure_requeues_with_backoff() {
        let h = harness();
        // zero backoff so the retry is due on the next tick
        let agent_id = h.registry.register(educator(2, 0));
        let task_id = h.orchestrator.submit(task(TaskPriority::Medium)).unwrap();

        h.orchestrator.tick().await;
        h.orchestrator
            .report_result(
                task_id,
                Err(TaskError {
                    message: "model overloaded".to_string(),
                    retryable: true,
                }),
            )
            .unwrap();
        assert_eq!(
            h.orchestrator.status(task_id).unwrap().status,
            TaskStatus::Failed
        );

        h.orchestrator.tick().await;
        let snapshot = h.orchestrator.status(task_id).unwrap();
        assert_eq!(snapshot.status, TaskStatus::Assigned);
        assert_eq!(snapshot.attempts, 2);
        assert_eq!(snapshot.assigned_agent, Some(agent_id));
    }

    #[tokio::test]
    async fn non_retryable_failure_is_terminal() {
        let h = harness();
        h.registry.register(educator(2, 0));
        let task_id = h.orchestrator.submit(task(TaskPriority::Medium)).unwrap();

        h.orchestrator.tick().await;
        h.orchestrator
            .report_result(
                task_id,
                Err(TaskError {
                    message: "malformed input".to_string(),
                    retryable: false,
                }),
            )
            .unwrap();

        h.orchestrator.tick().await;
        let snapshot = h.orchestrator.status(task_id).unwrap();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        assert_eq!(snapshot.attempts, 1);
    }

    #[tokio::test]
    async fn timeout_frees_the_agent_slot() {
        let h = harness();
        let agent_id = h.registry.register(educator(1, 100));
        let mut t = task(TaskPriority::Medium);
        t.requirements.max_response_time_ms = Some(1);
        let task_id = h.orchestrator.submit(t).unwrap();

        h.orchestrator.tick().await;
        assert_eq!(h.registry.get(agent_id).unwrap().performance.current_load, 1);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        h.orchestrator.tick().await;
        let snapshot = h.orchestrator.status(task_id).unwrap();
        assert_eq!(snapshot.status, TaskStatus::TimedOut);
        let agent = h.registry.get(agent_id).unwrap();
        assert_eq!(agent.performance.current_load, 0);
        // no stats penalty for a timeout
        assert_eq!(agent.performance.tasks_failed, 0);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_frees_the_slot() {
        let h = harness();
        let agent_id = h.registry.register(educator(1, 100));
        let task_id = h.orchestrator.submit(task(TaskPriority::Medium)).unwrap();

        h.orchestrator.tick().await;
        h.queue.drain();

        assert!(h.orchestrator.cancel(task_id, "user abort").await.unwrap());
        assert_eq!(
            h.orchestrator.status(task_id).unwrap().status,
            TaskStatus::Cancelled
        );
        assert_eq!(h.registry.get(agent_id).unwrap().performance.current_load, 0);
        let envelope = h.queue.try_dequeue().unwrap();
        assert_eq!(envelope.kind, JobKind::CancelTask);

        // second cancel is an accepted no-op
        assert!(h.orchestrator.cancel(task_id, "again").await.unwrap());
        assert_eq!(
            h.orchestrator.status(task_id).unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn cancel_after_completion_is_accepted() {
        let h = harness();
        let agent_id = h.registry.register(educator(1, 100));
        let task_id = h.orchestrator.submit(task(TaskPriority::Medium)).unwrap();

        h.orchestrator.tick().await;
        h.orchestrator.report_started(task_id, agent_id).unwrap();
        h.orchestrator
            .report_result(
                task_id,
                Ok(TaskResult {
                    output: serde_json::json!("done"),
                    quality_score: None,
                }),
            )
            .unwrap();

        assert!(h.orchestrator.cancel(task_id, "too late").await.unwrap());
        assert_eq!(
            h.orchestrator.status(task_id).unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn cancel_while_awaiting_retry_drops_the_retry() {
        let h = harness();
        // zero backoff: the retry would requeue on the very next tick
        h.registry.register(educator(2, 0));
        let task_id = h.orchestrator.submit(task(TaskPriority::Medium)).unwrap();

        h.orchestrator.tick().await;
        h.orchestrator
            .report_result(
                task_id,
                Err(TaskError {
                    message: "model overloaded".to_string(),
                    retryable: true,
                }),
            )
            .unwrap();

        assert!(h.orchestrator.cancel(task_id, "user abort").await.unwrap());
        h.orchestrator.tick().await;
        let snapshot = h.orchestrator.status(task_id).unwrap();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        assert_eq!(snapshot.attempts, 1);
    }

    #[tokio::test]
    async fn no_eligible_agent_leaves_task_queued() {
        let h = harness();
        let agent_id = h.registry.register(educator(1, 100));
        let a = h.orchestrator.submit(task(TaskPriority::Medium)).unwrap();
        let b = h.orchestrator.submit(task(TaskPriority::Medium)).unwrap();

        h.orchestrator.tick().await;
        assert_eq!(h.orchestrator.status(a).unwrap().status, TaskStatus::Assigned);
        assert_eq!(h.orchestrator.status(b).unwrap().status, TaskStatus::Queued);

        // slot opens, next tick assigns the waiting task
        h.orchestrator
            .report_result(
                a,
                Ok(TaskResult {
                    output: serde_json::json!(null),
                    quality_score: None,
                }),
            )
            .unwrap();
        h.orchestrator.tick().await;
        assert_eq!(h.orchestrator.status(b).unwrap().status, TaskStatus::Assigned);
        assert_eq!(
            h.orchestrator.status(b).unwrap().assigned_agent,
            Some(agent_id)
        );
    }

    #[tokio::test]
    async fn parallel_workflow_aggregates_outputs() {
        let h = harness();
        h.registry.register(educator(4, 100));
        let mut t = task(TaskPriority::Medium);
        t.input = serde_json::json!([{"part": 1}, {"part": 2}]);
        let (task_id, workflow_id) = h
            .orchestrator
            .submit_workflow(t, WorkflowStrategy::Parallel)
            .unwrap();

        h.orchestrator.tick().await;
        let envelopes = h.queue.drain();
        assert_eq!(envelopes.len(), 2);
        assert_eq!(
            h.orchestrator.status(task_id).unwrap().status,
            TaskStatus::InProgress
        );

        h.orchestrator
            .report_step_result(workflow_id, 0, Ok(serde_json::json!("one")))
            .unwrap();
        h.orchestrator
            .report_step_result(workflow_id, 1, Ok(serde_json::json!("two")))
            .unwrap();

        let snapshot = h.orchestrator.status(task_id).unwrap();
        assert_eq!(snapshot.status, TaskStatus::Completed);
        assert_eq!(
            snapshot.result.unwrap().output,
            serde_json::json!(["one", "two"])
        );
    }

    #[tokio::test]
    async fn chain_workflow_feeds_output_forward() {
        let h = harness();
        h.registry.register(educator(4, 100));
        let mut t = task(TaskPriority::Medium);
        t.input = serde_json::json!([{"step": "draft"}, {"step": "review"}]);
        let (task_id, workflow_id) = h
            .orchestrator
            .submit_workflow(t, WorkflowStrategy::Chain)
            .unwrap();

        h.orchestrator.tick().await;
        // only the first step dispatches
        assert_eq!(h.queue.drain().len(), 1);

        h.orchestrator
            .report_step_result(workflow_id, 0, Ok(serde_json::json!("draft text")))
            .unwrap();
        h.orchestrator.tick().await;
        let envelopes = h.queue.drain();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(
            envelopes[0].payload["input"]["previous"],
            serde_json::json!("draft text")
        );

        h.orchestrator
            .report_step_result(workflow_id, 1, Ok(serde_json::json!("final")))
            .unwrap();
        assert_eq!(
            h.orchestrator.status(task_id).unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn failed_step_fails_the_workflow() {
        let h = harness();
        h.registry.register(educator(4, 100));
        let mut t = task(TaskPriority::Medium);
        t.input = serde_json::json!([{"part": 1}, {"part": 2}]);
        let (task_id, workflow_id) = h
            .orchestrator
            .submit_workflow(t, WorkflowStrategy::Parallel)
            .unwrap();

        h.orchestrator.tick().await;
        h.orchestrator
            .report_step_result(workflow_id, 0, Err("boom".to_string()))
            .unwrap();

        let snapshot = h.orchestrator.status(task_id).unwrap();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        assert!(snapshot
            .steps
            .iter()
            .any(|s| s.status == TaskStatus::Cancelled));
    }

    #[tokio::test]
    async fn distribute_requires_array_input() {
        let h = harness();
        h.registry.register(educator(4, 100));
        let t = task(TaskPriority::Medium);
        assert!(matches!(
            h.orchestrator.submit_workflow(t, WorkflowStrategy::Distribute),
            Err(OrchestrationError::InvalidTask(_))
        ));
    }
}
