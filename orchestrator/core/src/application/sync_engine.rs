// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Sync Engine
//!
//! Propagates context between agents under a chosen consistency mode. The
//! context store stays the single source of truth; per-agent replicas track
//! what each agent last received. A conflict is recorded when the target's
//! replica version is at or ahead of the source version with differing
//! content; the request's resolution policy decides the outcome. One
//! context's failure never aborts the batch.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::context_service::ContextStore;
use crate::domain::agent::AgentId;
use crate::domain::context::{Context, ContextData, ContextId, ContextVersion};
use crate::domain::events::SyncEvent;
use crate::domain::sync::{
    ConflictResolution, ContextConflict, SyncMode, SyncOutcome, SyncRequest, SyncResult,
};
use crate::infrastructure::event_bus::EventBus;

/// An agent's local copy of a context, as last reported or synced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextReplica {
    pub context_id: ContextId,
    pub agent_id: AgentId,
    pub version: u64,
    pub data: ContextData,
    pub updated_at: DateTime<Utc>,
    /// Version records transferred so far.
    pub versions: Vec<ContextVersion>,
}

#[derive(Clone)]
pub struct SyncEngine {
    store: ContextStore,
    replicas: Arc<RwLock<HashMap<(AgentId, ContextId), ContextReplica>>>,
    event_bus: EventBus,
}

impl SyncEngine {
    pub fn new(store: ContextStore, event_bus: EventBus) -> Self {
        Self {
            store,
            replicas: Arc::new(RwLock::new(HashMap::new())),
            event_bus,
        }
    }

    /// Record an agent's local copy of a context (heartbeat piggyback or
    /// explicit report). This is how target-side divergence becomes visible.
    pub fn report_replica(&self, replica: ContextReplica) {
        self.replicas
            .write()
            .insert((replica.agent_id, replica.context_id), replica);
    }

    pub fn replica(&self, agent_id: AgentId, context_id: ContextId) -> Option<ContextReplica> {
        self.replicas.read().get(&(agent_id, context_id)).cloned()
    }

    /// Drop a target's replica. Used by handoff rollback to leave the
    /// destination exactly as it was before the transfer.
    pub(crate) fn remove_replica(&self, agent_id: AgentId, context_id: ContextId) {
        self.replicas.write().remove(&(agent_id, context_id));
    }

    /// Drive one propagation. Per-context errors accumulate in the result;
    /// the overall status is `Partial` when some pairs succeeded and some
    /// failed, `Failed` when all failed.
    pub fn sync(&self, request: SyncRequest) -> SyncResult {
        let started_at = Utc::now();
        self.event_bus.publish_sync_event(SyncEvent::Started {
            request_id: request.id,
            contexts: request.context_ids.len(),
            targets: request.target_agents.len(),
            started_at,
        });

        let mut outcomes = Vec::new();
        let mut conflicts = Vec::new();
        let mut errors = Vec::new();

        for &context_id in &request.context_ids {
            let source = match self.store.source_snapshot(context_id) {
                Ok(ctx) => ctx,
                Err(e) => {
                    warn!(context_id = %context_id, error = %e, "Sync source fetch failed");
                    for &target in &request.target_agents {
                        outcomes.push((
                            context_id,
                            target,
                            SyncOutcome::Failed { error: e.to_string() },
                        ));
                    }
                    errors.push(format!("{context_id}: {e}"));
                    continue;
                }
            };

            for &target in &request.target_agents {
                let outcome =
                    self.sync_pair(&request, &source, target, &mut conflicts);
                outcomes.push((context_id, target, outcome));
            }
        }

        let status = SyncResult::status_from_outcomes(&outcomes);
        let conflicts_detected = conflicts.len();
        let conflicts_resolved = conflicts.iter().filter(|c| c.resolved).count();
        let contexts_synced = outcomes
            .iter()
            .filter(|(_, _, o)| matches!(o, SyncOutcome::Applied { .. }))
            .count();

        let finished_at = Utc::now();
        self.event_bus.publish_sync_event(SyncEvent::Finished {
            request_id: request.id,
            status,
            finished_at,
        });
        info!(
            request_id = %request.id,
            ?status,
            conflicts_detected,
            contexts_synced,
            "Sync finished"
        );

        SyncResult {
            request_id: request.id,
            status,
            outcomes,
            conflicts,
            conflicts_detected,
            conflicts_resolved,
            contexts_synced,
            errors,
            started_at,
            finished_at,
        }
    }

    fn sync_pair(
        &self,
        request: &SyncRequest,
        source: &Context,
        target: AgentId,
        conflicts: &mut Vec<ContextConflict>,
    ) -> SyncOutcome {
        let key = (target, source.id);
        let existing = self.replicas.read().get(&key).cloned();

        // Absent target replica is treated as version 0: never a conflict.
        let Some(replica) = existing else {
            let fresh = self.materialize(source, target, &request.mode, None);
            self.replicas.write().insert(key, fresh.clone());
            return SyncOutcome::Applied { new_version: fresh.version };
        };

        let conflicting = replica.version >= source.version && replica.data != source.data;
        if !conflicting {
            if replica.version >= source.version {
                // same content at or past the source: nothing to do
                return SyncOutcome::Unchanged;
            }
            let updated = self.materialize(source, target, &request.mode, Some(&replica));
            let new_version = updated.version;
            self.replicas.write().insert(key, updated);
            return SyncOutcome::Applied { new_version };
        }

        self.event_bus.publish_sync_event(SyncEvent::ConflictDetected {
            request_id: request.id,
            context_id: source.id,
            target_agent: target,
            detected_at: Utc::now(),
        });
        debug!(
            context_id = %source.id,
            target = %target,
            source_version = source.version,
            target_version = replica.version,
            "Sync conflict"
        );

        let mut conflict = ContextConflict {
            context_id: source.id,
            target_agent: target,
            source_version: source.version,
            target_version: replica.version,
            resolved: true,
            resolution: request.resolution,
            detected_at: Utc::now(),
        };

        let outcome = match request.resolution {
            ConflictResolution::SourceWins => {
                let updated = self.materialize(source, target, &request.mode, Some(&replica));
                let new_version = updated.version;
                self.replicas.write().insert(key, updated);
                SyncOutcome::Applied { new_version }
            }
            ConflictResolution::TargetWins => SyncOutcome::Unchanged,
            ConflictResolution::LatestWins => {
                if source.updated_at > replica.updated_at {
                    let updated = self.materialize(source, target, &request.mode, Some(&replica));
                    let new_version = updated.version;
                    self.replicas.write().insert(key, updated);
                    SyncOutcome::Applied { new_version }
                } else {
                    SyncOutcome::Unchanged
                }
            }
            ConflictResolution::Merge => {
                let merged_data = Self::merge_content(&source.data, &replica.data);
                let new_version = source.version.max(replica.version) + 1;
                let mut updated = replica.clone();
                updated.data = merged_data;
                updated.version = new_version;
                updated.updated_at = Utc::now();
                updated.versions.push(ContextVersion {
                    version: new_version,
                    changes: vec!["merge".to_string()],
                    author: "sync-engine".to_string(),
                    checksum: updated.data.checksum(),
                    created_at: updated.updated_at,
                });
                self.replicas.write().insert(key, updated);
                SyncOutcome::Applied { new_version }
            }
            ConflictResolution::Manual => {
                conflict.resolved = false;
                SyncOutcome::ConflictUnresolved
            }
        };
        conflicts.push(conflict);
        outcome
    }

    /// Build the replica state a successful transfer leaves on the target.
    fn materialize(
        &self,
        source: &Context,
        target: AgentId,
        mode: &SyncMode,
        previous: Option<&ContextReplica>,
    ) -> ContextReplica {
        match mode {
            SyncMode::Full => ContextReplica {
                context_id: source.id,
                agent_id: target,
                version: source.version,
                data: source.data.clone(),
                updated_at: source.updated_at,
                versions: source.history.clone(),
            },
            SyncMode::Incremental => {
                // Ship only version records newer than the target's last
                // known version; content catches up to the source snapshot.
                let last_known = previous.map(|r| r.version).unwrap_or(0);
                let mut versions = previous.map(|r| r.versions.clone()).unwrap_or_default();
                versions.extend(
                    source
                        .history
                        .iter()
                        .filter(|v| v.version > last_known)
                        .cloned(),
                );
                ContextReplica {
                    context_id: source.id,
                    agent_id: target,
                    version: source.version,
                    data: source.data.clone(),
                    updated_at: source.updated_at,
                    versions,
                }
            }
            SyncMode::Selective { fields } => {
                let mut data = previous.map(|r| r.data.clone()).unwrap_or_default();
                for field in fields {
                    match source.data.content.get(field) {
                        Some(value) => {
                            data.content.insert(field.clone(), value.clone());
                        }
                        None => {
                            data.content.remove(field);
                        }
                    }
                }
                let version = previous.map(|r| r.version).unwrap_or(0).max(source.version);
                let mut versions = previous.map(|r| r.versions.clone()).unwrap_or_default();
                versions.push(ContextVersion {
                    version,
                    changes: fields.clone(),
                    author: "sync-engine".to_string(),
                    checksum: data.checksum(),
                    created_at: Utc::now(),
                });
                ContextReplica {
                    context_id: source.id,
                    agent_id: target,
                    version,
                    data,
                    updated_at: Utc::now(),
                    versions,
                }
            }
        }
    }

    /// Field-level merge: non-overlapping content fields from both sides,
    /// source wins on overlap. Derived metadata lists union with dedup,
    /// source order first.
    fn merge_content(source: &ContextData, target: &ContextData) -> ContextData {
        let mut merged = target.clone();
        for (key, value) in &source.content {
            merged.content.insert(key.clone(), value.clone());
        }
        merged.keywords = union(&source.keywords, &target.keywords);
        merged.entities = union(&source.entities, &target.entities);
        merged.insights = union(&source.insights, &target.insights);
        merged.references = union(&source.references, &target.references);
        merged
    }
}

fn union(a: &[String], b: &[String]) -> Vec<String> {
    let mut out: Vec<String> = a.to_vec();
    for item in b {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

impl ContextStore {
    /// Read a context for propagation, bypassing per-principal ACLs (the
    /// engine acts as the system). Deleted contexts still error.
    pub(crate) fn source_snapshot(
        &self,
        id: ContextId,
    ) -> Result<Context, crate::domain::error::OrchestrationError> {
        self.with_context_mut(id, |ctx| ctx.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::context::{ContextScope, ContextType};
    use crate::domain::sync::SyncStatus;
    use std::collections::BTreeMap;

    fn harness() -> (ContextStore, SyncEngine) {
        let bus = EventBus::new(64);
        let store = ContextStore::new(bus.clone());
        let engine = SyncEngine::new(store.clone(), bus);
        (store, engine)
    }

    fn seeded_context(store: &ContextStore, fields: &[(&str, serde_json::Value)]) -> ContextId {
        let mut data = ContextData::default();
        for (k, v) in fields {
            data.content.insert(k.to_string(), v.clone());
        }
        store.create(Context::new(
            ContextType::Shared,
            ContextScope::Agent,
            data,
            "source-agent",
        ))
    }

    fn request(
        ctx: ContextId,
        target: AgentId,
        mode: SyncMode,
        resolution: ConflictResolution,
    ) -> SyncRequest {
        SyncRequest::new(AgentId::new(), vec![target], vec![ctx], mode, resolution)
    }

    fn diverged_replica(engine: &SyncEngine, store: &ContextStore, ctx: ContextId, target: AgentId) {
        // target holds a same-or-newer version with different content
        let source = store.source_snapshot(ctx).unwrap();
        let mut data = source.data.clone();
        data.content
            .insert("local_note".to_string(), serde_json::json!("target edit"));
        engine.report_replica(ContextReplica {
            context_id: ctx,
            agent_id: target,
            version: source.version,
            data,
            updated_at: Utc::now(),
            versions: vec![],
        });
    }

    #[test]
    fn absent_target_is_version_zero_and_applies() {
        let (store, engine) = harness();
        let ctx = seeded_context(&store, &[("k", serde_json::json!(1))]);
        let target = AgentId::new();
        let result = engine.sync(request(ctx, target, SyncMode::Full, ConflictResolution::SourceWins));
        assert_eq!(result.status, SyncStatus::Completed);
        assert_eq!(result.conflicts_detected, 0);
        let replica = engine.replica(target, ctx).unwrap();
        assert_eq!(replica.version, 1);
    }

    #[test]
    fn source_wins_makes_target_equal_source() {
        let (store, engine) = harness();
        let ctx = seeded_context(&store, &[("k", serde_json::json!(1))]);
        let target = AgentId::new();
        diverged_replica(&engine, &store, ctx, target);

        let result = engine.sync(request(ctx, target, SyncMode::Full, ConflictResolution::SourceWins));
        assert_eq!(result.conflicts_detected, 1);
        assert_eq!(result.conflicts_resolved, 1);
        let replica = engine.replica(target, ctx).unwrap();
        let source = store.source_snapshot(ctx).unwrap();
        assert_eq!(replica.data, source.data);
        assert_eq!(replica.data.checksum(), source.data.checksum());
    }

    #[test]
    fn target_wins_leaves_target_byte_identical() {
        let (store, engine) = harness();
        let ctx = seeded_context(&store, &[("k", serde_json::json!(1))]);
        let target = AgentId::new();
        diverged_replica(&engine, &store, ctx, target);
        let before = engine.replica(target, ctx).unwrap();

        let result = engine.sync(request(ctx, target, SyncMode::Full, ConflictResolution::TargetWins));
        assert_eq!(result.conflicts_detected, 1);
        let after = engine.replica(target, ctx).unwrap();
        assert_eq!(after.data.checksum(), before.data.checksum());
        assert_eq!(after.version, before.version);
    }

    #[test]
    fn manual_surfaces_conflict_without_mutation() {
        let (store, engine) = harness();
        let ctx = seeded_context(&store, &[("k", serde_json::json!(1))]);
        let target = AgentId::new();
        diverged_replica(&engine, &store, ctx, target);
        let before = engine.replica(target, ctx).unwrap();

        let result = engine.sync(request(ctx, target, SyncMode::Full, ConflictResolution::Manual));
        assert_eq!(result.conflicts_detected, 1);
        assert_eq!(result.conflicts_resolved, 0);
        assert!(matches!(
            result.outcomes[0].2,
            SyncOutcome::ConflictUnresolved
        ));
        let after = engine.replica(target, ctx).unwrap();
        assert_eq!(after.data.checksum(), before.data.checksum());
    }

    #[test]
    fn merge_unions_fields_source_wins_overlap() {
        let (store, engine) = harness();
        let ctx = seeded_context(
            &store,
            &[("shared", serde_json::json!("source")), ("s_only", serde_json::json!(1))],
        );
        let target = AgentId::new();
        let source = store.source_snapshot(ctx).unwrap();
        let mut data = ContextData::default();
        data.content
            .insert("shared".to_string(), serde_json::json!("target"));
        data.content
            .insert("t_only".to_string(), serde_json::json!(2));
        engine.report_replica(ContextReplica {
            context_id: ctx,
            agent_id: target,
            version: source.version + 1,
            data,
            updated_at: Utc::now(),
            versions: vec![],
        });

        let result = engine.sync(request(ctx, target, SyncMode::Full, ConflictResolution::Merge));
        assert_eq!(result.conflicts_resolved, 1);
        let replica = engine.replica(target, ctx).unwrap();
        assert_eq!(replica.data.content["shared"], serde_json::json!("source"));
        assert_eq!(replica.data.content["s_only"], serde_json::json!(1));
        assert_eq!(replica.data.content["t_only"], serde_json::json!(2));
        // merge produced a new version past both sides
        assert_eq!(replica.version, source.version + 2);
    }

    #[test]
    fn incremental_ships_only_newer_version_records() {
        let (store, engine) = harness();
        let ctx = seeded_context(&store, &[("k", serde_json::json!(0))]);
        let target = AgentId::new();

        // replica at version 1
        engine.sync(request(ctx, target, SyncMode::Incremental, ConflictResolution::SourceWins));
        assert_eq!(engine.replica(target, ctx).unwrap().versions.len(), 1);

        // source advances to version 3
        for i in 1..=2u64 {
            let mut changes = BTreeMap::new();
            changes.insert(format!("k{i}"), serde_json::json!(i));
            store.update(ctx, i, changes, "source-agent").unwrap();
        }

        engine.sync(request(ctx, target, SyncMode::Incremental, ConflictResolution::SourceWins));
        let replica = engine.replica(target, ctx).unwrap();
        assert_eq!(replica.version, 3);
        // 1 initial + exactly the 2 newer records, nothing re-shipped
        assert_eq!(replica.versions.len(), 3);
        let nums: Vec<u64> = replica.versions.iter().map(|v| v.version).collect();
        assert_eq!(nums, vec![1, 2, 3]);
    }

    #[test]
    fn selective_limits_to_named_fields() {
        let (store, engine) = harness();
        let ctx = seeded_context(
            &store,
            &[("a", serde_json::json!(1)), ("b", serde_json::json!(2))],
        );
        let target = AgentId::new();
        let result = engine.sync(request(
            ctx,
            target,
            SyncMode::Selective { fields: vec!["a".to_string()] },
            ConflictResolution::SourceWins,
        ));
        assert_eq!(result.status, SyncStatus::Completed);
        let replica = engine.replica(target, ctx).unwrap();
        assert!(replica.data.content.contains_key("a"));
        assert!(!replica.data.content.contains_key("b"));
    }

    #[test]
    fn partial_failure_does_not_abort_batch() {
        let (store, engine) = harness();
        let good = seeded_context(&store, &[("k", serde_json::json!(1))]);
        let missing = ContextId::new();
        let target = AgentId::new();
        let req = SyncRequest::new(
            AgentId::new(),
            vec![target],
            vec![good, missing],
            SyncMode::Full,
            ConflictResolution::SourceWins,
        );
        let result = engine.sync(req);
        assert_eq!(result.status, SyncStatus::Partial);
        assert_eq!(result.contexts_synced, 1);
        assert_eq!(result.errors.len(), 1);
        assert!(engine.replica(target, good).is_some());
    }

    #[test]
    fn all_failed_yields_failed_status() {
        let (_store, engine) = harness();
        let req = SyncRequest::new(
            AgentId::new(),
            vec![AgentId::new()],
            vec![ContextId::new()],
            SyncMode::Full,
            ConflictResolution::SourceWins,
        );
        assert_eq!(engine.sync(req).status, SyncStatus::Failed);
    }
}
