// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Context Store
//!
//! Single source of truth for context content and version. All mutations go
//! through `update`/`delete`; the optimistic-version check and the apply run
//! atomically under one lock, so concurrent writers against the same base
//! version cannot both succeed.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::context::{
    Context, ContextId, ContextRelationship, ContextStatus, Permission, RelationshipKind,
};
use crate::domain::error::OrchestrationError;
use crate::domain::events::ContextEvent;
use crate::domain::handoff::HandoffId;
use crate::infrastructure::event_bus::EventBus;

struct StoreState {
    contexts: HashMap<ContextId, Context>,
    relationships: Vec<ContextRelationship>,
    /// Contexts frozen for an in-flight handoff, keyed to the freezing
    /// coordinator so freeze/unfreeze are idempotent per handoff.
    frozen: HashMap<ContextId, HandoffId>,
}

#[derive(Clone)]
pub struct ContextStore {
    state: Arc<RwLock<StoreState>>,
    event_bus: EventBus,
}

impl ContextStore {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState {
                contexts: HashMap::new(),
                relationships: Vec::new(),
                frozen: HashMap::new(),
            })),
            event_bus,
        }
    }

    /// Store a context. Version is forced to 1 with its initial version
    /// record; the creating principal is the owner.
    pub fn create(&self, context: Context) -> ContextId {
        debug_assert_eq!(context.version, 1, "Context::new assigns version 1");
        let id = context.id;
        let owner = context.access.owner.clone();
        self.state.write().contexts.insert(id, context);
        info!(context_id = %id, owner = %owner, "Context created");
        self.event_bus.publish_context_event(ContextEvent::Created {
            context_id: id,
            owner,
            created_at: Utc::now(),
        });
        id
    }

    pub fn get(&self, id: ContextId, principal: &str) -> Result<Context, OrchestrationError> {
        let state = self.state.read();
        let ctx = state
            .contexts
            .get(&id)
            .filter(|c| c.lifecycle.status != ContextStatus::Deleted)
            .ok_or(OrchestrationError::ContextNotFound(id.as_uuid()))?;
        if !ctx.access.can_read(principal) {
            return Err(OrchestrationError::AccessDenied {
                context_id: id.as_uuid(),
                principal: principal.to_string(),
            });
        }
        Ok(ctx.clone())
    }

    /// Optimistic update: fails with `VersionConflict` when `expected_version`
    /// does not match the stored version. Exactly one of N concurrent writers
    /// with the same base version succeeds.
    pub fn update(
        &self,
        id: ContextId,
        expected_version: u64,
        changes: BTreeMap<String, serde_json::Value>,
        principal: &str,
    ) -> Result<u64, OrchestrationError> {
        let mut state = self.state.write();
        if state.frozen.contains_key(&id) {
            return Err(OrchestrationError::ContextFrozen(id.as_uuid()));
        }
        let ctx = state
            .contexts
            .get_mut(&id)
            .filter(|c| c.lifecycle.status != ContextStatus::Deleted)
            .ok_or(OrchestrationError::ContextNotFound(id.as_uuid()))?;
        if !ctx.access.can(principal, Permission::Write) {
            return Err(OrchestrationError::AccessDenied {
                context_id: id.as_uuid(),
                principal: principal.to_string(),
            });
        }
        if ctx.version != expected_version {
            return Err(OrchestrationError::VersionConflict {
                context_id: id.as_uuid(),
                expected: expected_version,
                actual: ctx.version,
            });
        }
        let new_version = ctx.apply_changes(changes, principal);
        ctx.apply_version_retention();
        drop(state);

        self.event_bus.publish_context_event(ContextEvent::Updated {
            context_id: id,
            new_version,
            author: principal.to_string(),
            updated_at: Utc::now(),
        });
        Ok(new_version)
    }

    /// Requires DELETE permission; cascades relationship cleanup so no edge
    /// dangles.
    pub fn delete(&self, id: ContextId, principal: &str) -> Result<(), OrchestrationError> {
        let mut state = self.state.write();
        let ctx = state
            .contexts
            .get_mut(&id)
            .filter(|c| c.lifecycle.status != ContextStatus::Deleted)
            .ok_or(OrchestrationError::ContextNotFound(id.as_uuid()))?;
        if !ctx.access.can(principal, Permission::Delete) {
            return Err(OrchestrationError::AccessDenied {
                context_id: id.as_uuid(),
                principal: principal.to_string(),
            });
        }
        ctx.lifecycle.status = ContextStatus::Deleted;
        let before = state.relationships.len();
        state.relationships.retain(|r| !r.touches(id));
        let edges_removed = before - state.relationships.len();
        state.frozen.remove(&id);
        drop(state);

        info!(context_id = %id, edges_removed, "Context deleted");
        self.event_bus.publish_context_event(ContextEvent::Deleted {
            context_id: id,
            edges_removed,
            deleted_at: Utc::now(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Relationships
    // ------------------------------------------------------------------

    pub fn relate(
        &self,
        from: ContextId,
        to: ContextId,
        kind: RelationshipKind,
        bidirectional: bool,
        strength: f64,
    ) -> Result<ContextRelationship, OrchestrationError> {
        let mut state = self.state.write();
        for endpoint in [from, to] {
            if !state
                .contexts
                .get(&endpoint)
                .is_some_and(|c| c.lifecycle.status != ContextStatus::Deleted)
            {
                return Err(OrchestrationError::ContextNotFound(endpoint.as_uuid()));
            }
        }
        let edge = ContextRelationship::new(from, to, kind, bidirectional, strength)?;
        state.relationships.push(edge.clone());
        Ok(edge)
    }

    /// Live contexts linked to a conversation. This is how a handoff resolves
    /// its transfer scope when the caller names only the conversation.
    pub fn ids_for_conversation(&self, conversation_id: &str) -> Vec<ContextId> {
        self.state
            .read()
            .contexts
            .values()
            .filter(|c| {
                c.lifecycle.status != ContextStatus::Deleted
                    && c.conversation_id.as_deref() == Some(conversation_id)
            })
            .map(|c| c.id)
            .collect()
    }

    pub fn relationships_of(&self, id: ContextId) -> Vec<ContextRelationship> {
        self.state
            .read()
            .relationships
            .iter()
            .filter(|r| r.from == id || (r.bidirectional && r.to == id))
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Handoff freeze protocol
    // ------------------------------------------------------------------

    /// Mark contexts read-only for a handoff's scope. Idempotent for the same
    /// handoff; a different in-flight handoff owning the context is an error.
    pub fn freeze(
        &self,
        ids: &[ContextId],
        handoff: HandoffId,
    ) -> Result<(), OrchestrationError> {
        let mut state = self.state.write();
        for id in ids {
            match state.frozen.get(id) {
                Some(owner) if *owner != handoff => {
                    return Err(OrchestrationError::ContextFrozen(id.as_uuid()));
                }
                _ => {}
            }
        }
        for id in ids {
            state.frozen.insert(*id, handoff);
            if let Some(ctx) = state.contexts.get_mut(id) {
                ctx.lifecycle.status = ContextStatus::Frozen;
            }
        }
        debug!(handoff = %handoff, count = ids.len(), "Contexts frozen");
        Ok(())
    }

    /// Release the freeze. Only the owning handoff's unfreeze has effect, so
    /// rollback and commit stay idempotent.
    pub fn unfreeze(&self, ids: &[ContextId], handoff: HandoffId) {
        let mut state = self.state.write();
        for id in ids {
            if state.frozen.get(id) == Some(&handoff) {
                state.frozen.remove(id);
                if let Some(ctx) = state.contexts.get_mut(id) {
                    if ctx.lifecycle.status == ContextStatus::Frozen {
                        ctx.lifecycle.status = ContextStatus::Active;
                    }
                }
            }
        }
    }

    pub fn is_frozen(&self, id: ContextId) -> bool {
        self.state.read().frozen.contains_key(&id)
    }

    /// Internal write path for the sync engine and handoff coordinator.
    /// Bypasses the freeze check (the coordinator writes while holding the
    /// freeze) but never the version discipline: all mutation still flows
    /// through `Context::apply_changes`/`replace_data`.
    pub(crate) fn with_context_mut<T>(
        &self,
        id: ContextId,
        f: impl FnOnce(&mut Context) -> T,
    ) -> Result<T, OrchestrationError> {
        let mut state = self.state.write();
        let ctx = state
            .contexts
            .get_mut(&id)
            .filter(|c| c.lifecycle.status != ContextStatus::Deleted)
            .ok_or(OrchestrationError::ContextNotFound(id.as_uuid()))?;
        Ok(f(ctx))
    }

    // ------------------------------------------------------------------
    // Retention
    // ------------------------------------------------------------------

    /// Background sweep: expire TTL'd contexts past their age limit and drop
    /// version records beyond `max_versions`. Archival never renumbers
    /// retained versions.
    pub fn sweep_retention(&self) -> usize {
        let now = Utc::now();
        let mut touched = 0;
        let mut events = Vec::new();
        {
            let mut state = self.state.write();
            let frozen: HashSet<ContextId> = state.frozen.keys().copied().collect();
            for (id, ctx) in state.contexts.iter_mut() {
                if !ctx.lifecycle.retention.auto_cleanup || frozen.contains(id) {
                    continue;
                }
                let expired = matches!(ctx.lifecycle.status, ContextStatus::Active)
                    && ctx.is_expired(now);
                if expired {
                    ctx.lifecycle.status = ContextStatus::Expired;
                }
                let dropped = ctx.apply_version_retention();
                if expired || dropped > 0 {
                    touched += 1;
                    events.push(ContextEvent::RetentionApplied {
                        context_id: *id,
                        versions_dropped: dropped,
                        expired,
                        applied_at: now,
                    });
                }
            }
        }
        for event in events {
            self.event_bus.publish_context_event(event);
        }
        touched
    }
}
