// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Integration tests across the assembled runtime: the scheduler loop,
//! registry, context store, sync engine, and handoff coordinator working
//! together through the public facade.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use relay_core::application::orchestrator::TaskOrchestrator;
use relay_core::config::CoreConfig;
use relay_core::domain::agent::{AgentConfig, AgentDescriptor, AgentId};
use relay_core::domain::context::{ContextData, ContextScope, ContextType};
use relay_core::domain::handoff::HandoffStatus;
use relay_core::domain::task::{TaskId, TaskPriority, TaskRequirements, TaskResult, TaskStatus};
use relay_core::infrastructure::event_bus::DomainEvent;
use relay_core::infrastructure::queue::{InMemoryJobQueue, JobKind};
use relay_core::presentation::api::{
    StoreContextRequest, SubmitTaskRequest, SwitchAgentRequest, TaskStatusRequest,
};
use relay_core::runtime::OrchestratorRuntime;

fn fast_config() -> CoreConfig {
    CoreConfig {
        scheduler_tick_ms: 10,
        ..Default::default()
    }
}

fn agent(name: &str, caps: &[&str], max_concurrent: u32) -> AgentDescriptor {
    AgentDescriptor::new(
        name,
        "education",
        caps.iter().map(|s| s.to_string()),
        AgentConfig {
            max_concurrent_tasks: max_concurrent,
            ..Default::default()
        },
    )
}

fn submit_request(priority: TaskPriority) -> SubmitTaskRequest {
    SubmitTaskRequest {
        task_id: None,
        user_id: None,
        conversation_id: None,
        task_type: "answer".to_string(),
        requirements: TaskRequirements {
            capabilities: vec!["education".to_string()],
            ..Default::default()
        },
        input: serde_json::json!({"q": "?"}),
        priority: Some(priority),
    }
}

/// Echo worker standing in for agent processes.
fn spawn_echo_worker(
    orchestrator: TaskOrchestrator,
    queue: Arc<InMemoryJobQueue>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(envelope) = queue.try_dequeue() else {
                tokio::time::sleep(Duration::from_millis(5)).await;
                continue;
            };
            if envelope.kind != JobKind::ExecuteTask {
                continue;
            }
            let task_id: TaskId =
                serde_json::from_value(envelope.payload["task_id"].clone()).unwrap();
            let agent_id: AgentId =
                serde_json::from_value(envelope.payload["agent_id"].clone()).unwrap();
            if orchestrator.report_started(task_id, agent_id).is_err() {
                continue;
            }
            let _ = orchestrator.report_result(
                task_id,
                Ok(TaskResult {
                    output: envelope.payload["input"].clone(),
                    quality_score: Some(1.0),
                }),
            );
        }
    })
}

#[tokio::test]
async fn every_task_reaches_exactly_one_terminal_state() {
    let runtime = OrchestratorRuntime::start(fast_config()).unwrap();
    runtime
        .registry()
        .register(agent("tutor", &["education"], 1));

    let mut receiver = runtime.event_bus().subscribe();
    let worker = spawn_echo_worker(
        runtime.orchestrator().clone(),
        runtime.job_queue().clone(),
    );

    let mut task_ids = Vec::new();
    for priority in [TaskPriority::Low, TaskPriority::Critical, TaskPriority::Medium] {
        let response = runtime.api().submit_task(submit_request(priority)).unwrap();
        task_ids.push(response.orchestration_id);
    }

    // collect events until every task is terminal
    let mut terminal_counts: HashMap<TaskId, usize> = HashMap::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while terminal_counts.len() < task_ids.len()
            || terminal_counts.values().any(|&c| c == 0)
        {
            if let DomainEvent::Task(event) = receiver.recv().await.unwrap() {
                if event.status().is_some_and(|s| s.is_terminal()) {
                    *terminal_counts.entry(event.task_id()).or_insert(0) += 1;
                }
            }
        }
    })
    .await
    .expect("all tasks terminal within the budget");

    worker.abort();
    for task_id in &task_ids {
        assert_eq!(terminal_counts.get(task_id), Some(&1));
        let status = runtime
            .api()
            .task_status(TaskStatusRequest {
                task_id: task_id.as_uuid(),
            })
            .unwrap();
        assert_eq!(status.status, TaskStatus::Completed);
    }
    runtime.shutdown().await;
}

#[tokio::test]
async fn unattended_task_times_out_and_frees_the_agent() {
    let runtime = OrchestratorRuntime::start(fast_config()).unwrap();
    let agent_id = runtime
        .registry()
        .register(agent("tutor", &["education"], 1));

    let mut request = submit_request(TaskPriority::High);
    request.requirements.max_response_time_ms = Some(30);
    let task_id = runtime.api().submit_task(request).unwrap().orchestration_id;

    // no worker picks the job up, so the budget lapses
    let mut receiver = runtime.event_bus().subscribe_task(task_id);
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = receiver.recv().await.unwrap();
            if event.status() == Some(TaskStatus::TimedOut) {
                break;
            }
        }
    })
    .await
    .expect("timeout within the budget");

    let descriptor = runtime.registry().get(agent_id).unwrap();
    assert_eq!(descriptor.performance.current_load, 0);
    runtime.shutdown().await;
}

#[tokio::test]
async fn conversation_handoff_transfers_context_to_a_new_agent() {
    let runtime = OrchestratorRuntime::start(fast_config()).unwrap();
    let source = runtime
        .registry()
        .register(agent("tutor-a", &["education"], 4));
    let destination = runtime
        .registry()
        .register(agent("tutor-b", &["education"], 4));

    let mut data = ContextData::default();
    data.content
        .insert("topic".to_string(), serde_json::json!("lifetimes"));
    let stored = runtime
        .api()
        .store_context(StoreContextRequest {
            scope: ContextScope::Session,
            context_type: ContextType::Conversation,
            data,
            owner: "tutor-a".to_string(),
            conversation_id: Some("conv-1".to_string()),
            ttl_seconds: None,
        })
        .unwrap();

    // no explicit context ids: the conversation link decides what moves
    let response = runtime
        .api()
        .switch_agent(SwitchAgentRequest {
            conversation_id: "conv-1".to_string(),
            from_agent_id: source.as_uuid(),
            to_agent_id: None,
            reason: "load balancing".to_string(),
            required_capabilities: vec!["education".to_string()],
            context_ids: vec![],
            mode: None,
        })
        .await
        .unwrap();

    assert_eq!(response.status, HandoffStatus::Completed);
    assert_eq!(response.to_agent, Some(destination));
    assert!(response.quality_score > 0.0);
    assert_eq!(
        runtime.handoff().active_agent("conv-1"),
        Some(destination)
    );

    // the destination replica carries the transferred content
    let replica = runtime
        .sync_engine()
        .replica(destination, stored.context_id)
        .expect("destination replica materialized");
    assert_eq!(replica.data.content["topic"], serde_json::json!("lifetimes"));

    runtime.shutdown().await;
}
