// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end demo: boot a runtime, register the manifest fleet, submit the
//! task, and follow its events to a terminal state. A local worker stands in
//! for the real agent processes by echoing each job's input back as output.

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use relay_core::application::orchestrator::TaskOrchestrator;
use relay_core::config::CoreConfig;
use relay_core::domain::agent::AgentId;
use relay_core::domain::task::{TaskId, TaskResult};
use relay_core::infrastructure::queue::{InMemoryJobQueue, JobKind};
use relay_core::runtime::OrchestratorRuntime;

use super::manifest::{AgentsManifest, TaskManifest};

const FOLLOW_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn handle(agents: PathBuf, task: PathBuf, config: Option<PathBuf>) -> Result<()> {
    let config = match config {
        Some(path) => CoreConfig::load(path)?,
        None => CoreConfig {
            // snappy ticks for an interactive run
            scheduler_tick_ms: 50,
            ..Default::default()
        },
    };
    let fleet = AgentsManifest::load(&agents)?;
    let task_manifest = TaskManifest::load(&task)?;

    let runtime = OrchestratorRuntime::start(config)?;
    for spec in &fleet.agents {
        let id = runtime.registry().register(spec.to_descriptor());
        println!("registered agent {} as {id}", spec.name);
    }

    let response = runtime.api().submit_task(task_manifest.to_request())?;
    let task_id = response.orchestration_id;
    println!("submitted task {task_id}");

    let worker = spawn_echo_worker(
        runtime.orchestrator().clone(),
        runtime.job_queue().clone(),
    );

    let mut receiver = runtime.event_bus().subscribe_task(task_id);
    let outcome = tokio::time::timeout(FOLLOW_TIMEOUT, async {
        loop {
            let event = receiver.recv().await?;
            println!("{}", serde_json::to_string(&event)?);
            if let Some(status) = event.status() {
                if status.is_terminal() {
                    return anyhow::Ok(status);
                }
            }
        }
    })
    .await;

    worker.abort();
    runtime.shutdown().await;

    match outcome {
        Ok(Ok(status)) => {
            info!(%task_id, %status, "Demo finished");
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => bail!("task {task_id} did not reach a terminal state within {FOLLOW_TIMEOUT:?}"),
    }
}

/// Stand-in for real agent processes: drains the job queue, reports each
/// task started, and completes it by echoing the input.
fn spawn_echo_worker(
    orchestrator: TaskOrchestrator,
    queue: std::sync::Arc<InMemoryJobQueue>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(envelope) = queue.try_dequeue() else {
                tokio::time::sleep(Duration::from_millis(20)).await;
                continue;
            };
            if envelope.kind != JobKind::ExecuteTask {
                debug!(kind = ?envelope.kind, "Worker ignoring job");
                continue;
            }
            let task_id: Option<TaskId> = envelope
                .payload
                .get("task_id")
                .and_then(|v| serde_json::from_value(v.clone()).ok());
            let agent_id: Option<AgentId> = envelope
                .payload
                .get("agent_id")
                .and_then(|v| serde_json::from_value(v.clone()).ok());
            let (Some(task_id), Some(agent_id)) = (task_id, agent_id) else {
                continue;
            };
            if let Err(e) = orchestrator.report_started(task_id, agent_id) {
                debug!(%task_id, error = %e, "Start report rejected");
                continue;
            }
            // pretend to work
            tokio::time::sleep(Duration::from_millis(50)).await;
            let result = TaskResult {
                output: serde_json::json!({
                    "echo": envelope.payload.get("input"),
                    "agent": agent_id,
                }),
                quality_score: Some(1.0),
            };
            if let Err(e) = orchestrator.report_result(task_id, Ok(result)) {
                debug!(%task_id, error = %e, "Result report rejected");
            }
        }
    })
}
