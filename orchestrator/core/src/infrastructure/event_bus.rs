// Event Bus - Pub/Sub for Domain Events
//
// In-memory event streaming over tokio broadcast channels. Feeds the CLI
// follower and any observer that wants orchestration lifecycle events.
// Events are lost on restart; durable delivery belongs to the external
// queue collaborator.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::events::{AgentEvent, ContextEvent, HandoffEvent, SyncEvent, TaskEvent};
use crate::domain::task::TaskId;

/// Unified domain event type for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    Task(TaskEvent),
    Agent(AgentEvent),
    Context(ContextEvent),
    Sync(SyncEvent),
    Handoff(HandoffEvent),
}

/// Event bus for publishing and subscribing to domain events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity. Capacity
    /// bounds how many events buffer before old ones drop for slow readers.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1024)
    }

    pub fn publish_task_event(&self, event: TaskEvent) {
        self.publish(DomainEvent::Task(event));
    }

    pub fn publish_agent_event(&self, event: AgentEvent) {
        self.publish(DomainEvent::Agent(event));
    }

    pub fn publish_context_event(&self, event: ContextEvent) {
        self.publish(DomainEvent::Context(event));
    }

    pub fn publish_sync_event(&self, event: SyncEvent) {
        self.publish(DomainEvent::Sync(event));
    }

    pub fn publish_handoff_event(&self, event: HandoffEvent) {
        self.publish(DomainEvent::Handoff(event));
    }

    fn publish(&self, event: DomainEvent) {
        debug!("Publishing event: {:?}", event);
        // send() returns the number of receivers; zero subscribers is fine
        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all domain events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe and filter for a specific task id. Useful for following a
    /// single submission to its terminal state.
    pub fn subscribe_task(&self, task_id: TaskId) -> TaskEventReceiver {
        TaskEventReceiver {
            receiver: self.sender.subscribe(),
            task_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Receiver for all domain events
pub struct EventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventBusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }

    pub fn try_recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to one task's events
pub struct TaskEventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
    task_id: TaskId,
}

impl TaskEventReceiver {
    pub async fn recv(&mut self) -> Result<TaskEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(|e| match e {
                broadcast::error::RecvError::Closed => EventBusError::Closed,
                broadcast::error::RecvError::Lagged(n) => {
                    warn!("Event receiver lagged by {} events", n);
                    EventBusError::Lagged(n)
                }
            })?;
            if let DomainEvent::Task(task_event) = event {
                if task_event.task_id() == self.task_id {
                    return Ok(task_event);
                }
            }
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::domain::task::TaskPriority;

    #[tokio::test]
    async fn publish_subscribe_roundtrip() {
        let bus = EventBus::new(16);
        let mut receiver = bus.subscribe();

        let task_id = TaskId::new();
        bus.publish_task_event(TaskEvent::Submitted {
            task_id,
            priority: TaskPriority::High,
            submitted_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            DomainEvent::Task(TaskEvent::Submitted { task_id: id, .. }) => {
                assert_eq!(id, task_id);
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn task_filtering_skips_other_tasks() {
        let bus = EventBus::new(16);
        let task_id = TaskId::new();
        let other = TaskId::new();
        let mut receiver = bus.subscribe_task(task_id);

        bus.publish_task_event(TaskEvent::Queued {
            task_id: other,
            queued_at: Utc::now(),
        });
        bus.publish_task_event(TaskEvent::Queued {
            task_id,
            queued_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            TaskEvent::Queued { task_id: id, .. } => assert_eq!(id, task_id),
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let bus = EventBus::new(16);
        let mut r1 = bus.subscribe();
        let mut r2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish_task_event(TaskEvent::Queued {
            task_id: TaskId::new(),
            queued_at: Utc::now(),
        });
        r1.recv().await.unwrap();
        r2.recv().await.unwrap();
    }
}
