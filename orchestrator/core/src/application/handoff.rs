// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Handoff Coordinator
//!
//! Drives agent-to-agent conversation handoff as a fixed six-phase sequence:
//! freeze, snapshot, select, transfer, verify, commit. Any failure in phases
//! 2-5 rolls back to phase-1 state: the source stays active, the destination
//! is left untouched, and the frozen contexts are released. Commit failures
//! are reported without rollback since the transfer already succeeded.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::application::context_service::ContextStore;
use crate::application::registry::AgentRegistry;
use crate::application::selector::AgentSelector;
use crate::application::sync_engine::{ContextReplica, SyncEngine};
use crate::domain::agent::AgentId;
use crate::domain::context::ContextId;
use crate::domain::error::OrchestrationError;
use crate::domain::events::HandoffEvent;
use crate::domain::handoff::{
    quality_score, HandoffId, HandoffPhase, HandoffRecord, HandoffRequest, HandoffStatus,
};
use crate::domain::sync::{ConflictResolution, SyncRequest};
use crate::domain::task::TaskRequirements;
use crate::infrastructure::event_bus::EventBus;

/// Scores a transfer's fidelity in the verify phase. The default compares
/// per-context checksums; tests inject low scores to exercise rollback.
pub trait TransferVerifier: Send + Sync {
    /// `expected` is the snapshot checksum per context, `actual` the
    /// destination replica checksum (absent when the replica is missing).
    fn score(&self, expected: &[(ContextId, String)], actual: &[(ContextId, Option<String>)]) -> f64;
}

pub struct ChecksumVerifier;

impl TransferVerifier for ChecksumVerifier {
    fn score(&self, expected: &[(ContextId, String)], actual: &[(ContextId, Option<String>)]) -> f64 {
        if expected.is_empty() {
            return 1.0;
        }
        let matched = expected
            .iter()
            .filter(|(id, sum)| {
                actual
                    .iter()
                    .any(|(aid, asum)| aid == id && asum.as_deref() == Some(sum.as_str()))
            })
            .count();
        matched as f64 / expected.len() as f64
    }
}

#[derive(Clone)]
pub struct HandoffCoordinator {
    registry: AgentRegistry,
    selector: AgentSelector,
    store: ContextStore,
    sync_engine: SyncEngine,
    event_bus: EventBus,
    verifier: Arc<dyn TransferVerifier>,
    /// Active agent per conversation scope, updated on commit.
    active: Arc<RwLock<HashMap<String, AgentId>>>,
    records: Arc<RwLock<Vec<HandoffRecord>>>,
}

impl HandoffCoordinator {
    pub fn new(
        registry: AgentRegistry,
        selector: AgentSelector,
        store: ContextStore,
        sync_engine: SyncEngine,
        event_bus: EventBus,
    ) -> Self {
        Self::with_verifier(
            registry,
            selector,
            store,
            sync_engine,
            event_bus,
            Arc::new(ChecksumVerifier),
        )
    }

    pub fn with_verifier(
        registry: AgentRegistry,
        selector: AgentSelector,
        store: ContextStore,
        sync_engine: SyncEngine,
        event_bus: EventBus,
        verifier: Arc<dyn TransferVerifier>,
    ) -> Self {
        Self {
            registry,
            selector,
            store,
            sync_engine,
            event_bus,
            verifier,
            active: Arc::new(RwLock::new(HashMap::new())),
            records: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// The agent currently active for a conversation scope, if a handoff has
    /// committed one.
    pub fn active_agent(&self, conversation_id: &str) -> Option<AgentId> {
        self.active.read().get(conversation_id).copied()
    }

    pub fn records(&self) -> Vec<HandoffRecord> {
        self.records.read().clone()
    }

    pub async fn execute(
        &self,
        request: HandoffRequest,
    ) -> Result<HandoffRecord, OrchestrationError> {
        let handoff_id = HandoffId::new();
        let started = Instant::now();
        let started_at = Utc::now();
        info!(
            handoff = %handoff_id,
            conversation = %request.conversation_id,
            from = %request.from_agent,
            "Handoff starting"
        );

        // Phase 1: Freeze. Failure here needs no rollback; nothing happened.
        self.enter_phase(handoff_id, HandoffPhase::Freeze);
        self.store.freeze(&request.context_ids, handoff_id)?;

        match self
            .run_transfer_phases(handoff_id, &request)
            .await
        {
            Ok((destination, verify_score)) => {
                // Phase 6: Commit.
                self.enter_phase(handoff_id, HandoffPhase::Commit);
                self.store.unfreeze(&request.context_ids, handoff_id);

                let status = if self.registry.get(destination).is_none() {
                    // Destination vanished after transfer: report, don't roll back.
                    warn!(handoff = %handoff_id, "Destination deregistered before commit");
                    HandoffStatus::CommitFaulted
                } else {
                    self.active
                        .write()
                        .insert(request.conversation_id.clone(), destination);
                    HandoffStatus::Completed
                };

                let elapsed_ms = started.elapsed().as_millis() as u64;
                let quality = quality_score(verify_score, elapsed_ms, request.target_duration_ms);
                let record = HandoffRecord {
                    id: handoff_id,
                    conversation_id: request.conversation_id.clone(),
                    from_agent: request.from_agent,
                    to_agent: Some(destination),
                    status,
                    phase_reached: HandoffPhase::Commit,
                    verify_score,
                    quality_score: quality,
                    started_at,
                    completed_at: Utc::now(),
                };
                self.records.write().push(record.clone());
                if status == HandoffStatus::Completed {
                    self.event_bus.publish_handoff_event(HandoffEvent::Completed {
                        handoff_id,
                        from_agent: request.from_agent,
                        to_agent: destination,
                        quality_score: quality,
                        completed_at: record.completed_at,
                    });
                    info!(handoff = %handoff_id, to = %destination, quality, "Handoff committed");
                }
                Ok(record)
            }
            Err(HandoffFault { phase, reason, destination, prior_replicas }) => {
                self.rollback(handoff_id, &request, phase, &reason, destination, prior_replicas);
                Err(OrchestrationError::HandoffFailed { phase, reason })
            }
        }
    }

    /// Phases 2-5. Returns the chosen destination and verify score, or a
    /// fault naming the failing phase plus everything rollback needs.
    async fn run_transfer_phases(
        &self,
        handoff_id: HandoffId,
        request: &HandoffRequest,
    ) -> Result<(AgentId, f64), HandoffFault> {
        // Phase 2: Snapshot.
        self.enter_phase(handoff_id, HandoffPhase::Snapshot);
        let mut snapshots = Vec::with_capacity(request.context_ids.len());
        for &id in &request.context_ids {
            match self.store.source_snapshot(id) {
                Ok(ctx) => snapshots.push((id, ctx.data.checksum())),
                Err(e) => return Err(HandoffFault::early(HandoffPhase::Snapshot, e.to_string())),
            }
        }

        // Phase 3: Select, always excluding the source.
        self.enter_phase(handoff_id, HandoffPhase::Select);
        let destination = match request.to_agent {
            Some(explicit) => {
                if explicit == request.from_agent {
                    return Err(HandoffFault::early(
                        HandoffPhase::Select,
                        "destination equals source".to_string(),
                    ));
                }
                match self.registry.get(explicit) {
                    Some(agent) if agent.is_available() => explicit,
                    Some(_) => {
                        return Err(HandoffFault::early(
                            HandoffPhase::Select,
                            format!("agent {explicit} is not available"),
                        ))
                    }
                    None => {
                        return Err(HandoffFault::early(
                            HandoffPhase::Select,
                            format!("agent {explicit} is not registered"),
                        ))
                    }
                }
            }
            None => {
                let requirements = TaskRequirements {
                    capabilities: request.required_capabilities.clone(),
                    ..Default::default()
                };
                match self.selector.select(&requirements, &[request.from_agent]) {
                    Ok(selection) => selection.agent_id,
                    Err(e) => {
                        return Err(HandoffFault::early(HandoffPhase::Select, e.to_string()))
                    }
                }
            }
        };

        // Destination replica state before transfer, so rollback can leave
        // the destination exactly as it was.
        let prior_replicas: Vec<(ContextId, Option<ContextReplica>)> = request
            .context_ids
            .iter()
            .map(|&id| (id, self.sync_engine.replica(destination, id)))
            .collect();

        // Phase 4: Transfer.
        self.enter_phase(handoff_id, HandoffPhase::Transfer);
        let sync_request = SyncRequest::new(
            request.from_agent,
            vec![destination],
            request.context_ids.clone(),
            request.mode.clone(),
            ConflictResolution::SourceWins,
        );
        let sync_result = self.sync_engine.sync(sync_request);
        if let Some(err) = sync_result.as_error() {
            return Err(HandoffFault {
                phase: HandoffPhase::Transfer,
                reason: format!("{err}: {}", sync_result.errors.join("; ")),
                destination: Some(destination),
                prior_replicas,
            });
        }

        // Phase 5: Verify.
        self.enter_phase(handoff_id, HandoffPhase::Verify);
        let actual: Vec<(ContextId, Option<String>)> = request
            .context_ids
            .iter()
            .map(|&id| {
                (
                    id,
                    self.sync_engine
                        .replica(destination, id)
                        .map(|r| r.data.checksum()),
                )
            })
            .collect();
        let verify_score = self.verifier.score(&snapshots, &actual);
        if verify_score < request.min_verify_score {
            return Err(HandoffFault {
                phase: HandoffPhase::Verify,
                reason: format!(
                    "verify score {verify_score:.3} below threshold {:.3}",
                    request.min_verify_score
                ),
                destination: Some(destination),
                prior_replicas,
            });
        }

        Ok((destination, verify_score))
    }

    /// Restore phase-1 invariants: source active, destination untouched,
    /// contexts unfrozen. Idempotent.
    fn rollback(
        &self,
        handoff_id: HandoffId,
        request: &HandoffRequest,
        failed_phase: HandoffPhase,
        reason: &str,
        destination: Option<AgentId>,
        prior_replicas: Vec<(ContextId, Option<ContextReplica>)>,
    ) {
        warn!(
            handoff = %handoff_id,
            phase = %failed_phase,
            reason,
            "Handoff rolling back"
        );
        // Undo any replicas the transfer phase installed on the destination.
        if let Some(dest) = destination {
            let prior: HashMap<ContextId, Option<ContextReplica>> =
                prior_replicas.into_iter().collect();
            for &id in &request.context_ids {
                match prior.get(&id) {
                    Some(Some(replica)) => self.sync_engine.report_replica(replica.clone()),
                    _ => self.sync_engine.remove_replica(dest, id),
                }
            }
        }
        self.store.unfreeze(&request.context_ids, handoff_id);

        let now = Utc::now();
        self.records.write().push(HandoffRecord {
            id: handoff_id,
            conversation_id: request.conversation_id.clone(),
            from_agent: request.from_agent,
            to_agent: destination,
            status: HandoffStatus::RolledBack,
            phase_reached: failed_phase,
            verify_score: 0.0,
            quality_score: 0.0,
            started_at: now,
            completed_at: now,
        });
        self.event_bus.publish_handoff_event(HandoffEvent::RolledBack {
            handoff_id,
            failed_phase,
            reason: reason.to_string(),
            rolled_back_at: now,
        });
    }

    fn enter_phase(&self, handoff_id: HandoffId, phase: HandoffPhase) {
        self.event_bus.publish_handoff_event(HandoffEvent::PhaseEntered {
            handoff_id,
            phase,
            entered_at: Utc::now(),
        });
    }
}

struct HandoffFault {
    phase: HandoffPhase,
    reason: String,
    destination: Option<AgentId>,
    prior_replicas: Vec<(ContextId, Option<ContextReplica>)>,
}

impl HandoffFault {
    /// A fault before any destination state could change.
    fn early(phase: HandoffPhase, reason: String) -> Self {
        Self {
            phase,
            reason,
            destination: None,
            prior_replicas: Vec::new(),
        }
    }
}
