// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Outbound job envelope for the durable-queue collaborator.
//!
//! The core defines the envelope shape and the priority mapping; delivery
//! mechanics belong to the external queue. `InMemoryJobQueue` backs tests and
//! single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::error::OrchestrationError;
use crate::domain::task::TaskPriority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ExecuteTask,
    CancelTask,
    HealthPing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: Uuid,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    /// Queue priority lane: 0 is most urgent.
    pub priority: u8,
    pub timestamp: DateTime<Utc>,
}

impl JobEnvelope {
    pub fn new(kind: JobKind, payload: serde_json::Value, priority: TaskPriority) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            priority: map_priority(priority),
            timestamp: Utc::now(),
        }
    }
}

/// Critical and urgent work share the top lane.
pub fn map_priority(priority: TaskPriority) -> u8 {
    match priority {
        TaskPriority::Critical | TaskPriority::Urgent => 0,
        TaskPriority::High => 1,
        TaskPriority::Medium => 2,
        TaskPriority::Low => 3,
    }
}

/// Narrow port to the durable queue that carries jobs across process
/// boundaries.
#[async_trait]
pub trait JobSink: Send + Sync {
    async fn enqueue(&self, envelope: JobEnvelope) -> Result<(), OrchestrationError>;
}

/// Bounded in-memory queue for tests and single-process runs.
pub struct InMemoryJobQueue {
    sender: mpsc::Sender<JobEnvelope>,
    receiver: Arc<Mutex<mpsc::Receiver<JobEnvelope>>>,
}

impl InMemoryJobQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    pub fn try_dequeue(&self) -> Option<JobEnvelope> {
        self.receiver.lock().try_recv().ok()
    }

    pub fn drain(&self) -> Vec<JobEnvelope> {
        let mut receiver = self.receiver.lock();
        let mut out = Vec::new();
        while let Ok(envelope) = receiver.try_recv() {
            out.push(envelope);
        }
        out
    }
}

#[async_trait]
impl JobSink for InMemoryJobQueue {
    async fn enqueue(&self, envelope: JobEnvelope) -> Result<(), OrchestrationError> {
        self.sender
            .send(envelope)
            .await
            .map_err(|e| OrchestrationError::QueueUnavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_lanes() {
        assert_eq!(map_priority(TaskPriority::Critical), 0);
        assert_eq!(map_priority(TaskPriority::Urgent), 0);
        assert_eq!(map_priority(TaskPriority::High), 1);
        assert_eq!(map_priority(TaskPriority::Medium), 2);
        assert_eq!(map_priority(TaskPriority::Low), 3);
    }

    #[tokio::test]
    async fn enqueue_dequeue() {
        let queue = InMemoryJobQueue::new(8);
        queue
            .enqueue(JobEnvelope::new(
                JobKind::ExecuteTask,
                serde_json::json!({"task": "t"}),
                TaskPriority::High,
            ))
            .await
            .unwrap();
        let envelope = queue.try_dequeue().unwrap();
        assert_eq!(envelope.kind, JobKind::ExecuteTask);
        assert_eq!(envelope.priority, 1);
        assert!(queue.try_dequeue().is_none());
    }
}
