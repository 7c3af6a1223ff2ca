// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Orchestrator Runtime
//!
//! Wires the services together and runs the background loops: the scheduler
//! tick, the stale-heartbeat sweep, and the context retention sweep. All
//! components are explicit instances handed out by accessors; nothing is
//! global. Shutdown cancels one token and waits for every loop to stop.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::context_service::ContextStore;
use crate::application::handoff::HandoffCoordinator;
use crate::application::orchestrator::TaskOrchestrator;
use crate::application::registry::AgentRegistry;
use crate::application::selector::AgentSelector;
use crate::application::sync_engine::SyncEngine;
use crate::config::{ConfigError, CoreConfig};
use crate::domain::task::TaskPriority;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::queue::{InMemoryJobQueue, JobEnvelope, JobKind, JobSink};
use crate::presentation::api::OrchestratorApi;

pub struct OrchestratorRuntime {
    api: OrchestratorApi,
    orchestrator: TaskOrchestrator,
    registry: AgentRegistry,
    store: ContextStore,
    sync_engine: SyncEngine,
    handoff: HandoffCoordinator,
    event_bus: EventBus,
    job_queue: Arc<InMemoryJobQueue>,
    shutdown: CancellationToken,
    loops: Vec<JoinHandle<()>>,
}

impl OrchestratorRuntime {
    /// Build every component and spawn the background loops.
    pub fn start(config: CoreConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        info!(
            tick_ms = config.scheduler_tick_ms,
            strategy = ?config.selection_strategy,
            "Starting orchestrator runtime"
        );

        let event_bus = EventBus::new(config.event_bus_capacity);
        let registry = AgentRegistry::new(event_bus.clone());
        let selector = AgentSelector::new(registry.clone(), config.selection_strategy);
        let store = ContextStore::new(event_bus.clone());
        let sync_engine = SyncEngine::new(store.clone(), event_bus.clone());
        let job_queue = Arc::new(InMemoryJobQueue::new(config.job_queue_capacity));
        let orchestrator = TaskOrchestrator::new(
            registry.clone(),
            selector.clone(),
            event_bus.clone(),
            job_queue.clone(),
            config.orchestrator_settings(),
        );
        let handoff = HandoffCoordinator::new(
            registry.clone(),
            selector,
            store.clone(),
            sync_engine.clone(),
            event_bus.clone(),
        );
        let api = OrchestratorApi::new(
            orchestrator.clone(),
            registry.clone(),
            store.clone(),
            handoff.clone(),
        )
        .with_handoff_defaults(config.handoff.clone());

        let shutdown = CancellationToken::new();
        let mut loops = Vec::new();

        let scheduler = orchestrator.clone();
        let token = shutdown.clone();
        loops.push(tokio::spawn(async move {
            scheduler.run(token).await;
        }));

        loops.push(Self::spawn_heartbeat_sweep(
            registry.clone(),
            job_queue.clone(),
            config.heartbeat_timeout_ms,
            shutdown.clone(),
        ));
        loops.push(Self::spawn_retention_sweep(
            store.clone(),
            config.retention_sweep_ms,
            shutdown.clone(),
        ));

        Ok(Self {
            api,
            orchestrator,
            registry,
            store,
            sync_engine,
            handoff,
            event_bus,
            job_queue,
            shutdown,
            loops,
        })
    }

    pub fn api(&self) -> &OrchestratorApi {
        &self.api
    }

    pub fn orchestrator(&self) -> &TaskOrchestrator {
        &self.orchestrator
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn store(&self) -> &ContextStore {
        &self.store
    }

    pub fn sync_engine(&self) -> &SyncEngine {
        &self.sync_engine
    }

    pub fn handoff(&self) -> &HandoffCoordinator {
        &self.handoff
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn job_queue(&self) -> &Arc<InMemoryJobQueue> {
        &self.job_queue
    }

    /// Cancel the shutdown token and wait for every loop to finish.
    pub async fn shutdown(self) {
        info!("Shutting down orchestrator runtime");
        self.shutdown.cancel();
        for handle in self.loops {
            let _ = handle.await;
        }
    }

    fn spawn_heartbeat_sweep(
        registry: AgentRegistry,
        sink: Arc<dyn JobSink>,
        timeout_ms: u64,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        // sweep at half the timeout so staleness is caught within one period
        let interval_ms = (timeout_ms / 2).max(1);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        // ping agents that went quiet for half a period; the
                        // discovery collaborator delivers the ping and the
                        // agent's answer comes back as a normal heartbeat
                        for agent_id in registry.ping_candidates(interval_ms) {
                            let envelope = JobEnvelope::new(
                                JobKind::HealthPing,
                                serde_json::json!({ "agent_id": agent_id }),
                                TaskPriority::Low,
                            );
                            if let Err(e) = sink.enqueue(envelope).await {
                                warn!(agent_id = %agent_id, error = %e, "Health ping not enqueued");
                            }
                        }
                        let marked = registry.sweep_stale(timeout_ms);
                        if !marked.is_empty() {
                            debug!(count = marked.len(), "Heartbeat sweep marked agents offline");
                        }
                    }
                }
            }
        })
    }

    fn spawn_retention_sweep(
        store: ContextStore,
        interval_ms: u64,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms.max(1)));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let touched = store.sweep_retention();
                        if touched > 0 {
                            debug!(touched, "Retention sweep applied");
                        }
                    }
                }
            }
        })
    }
}
