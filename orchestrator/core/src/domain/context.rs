// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Context Domain Model
//!
//! A context is versioned shared state (conversation history, agent memory,
//! insights) consumable by agents. The version integer strictly increases by
//! one per committed mutation, and every committed version carries a checksum
//! of the content snapshot it produced.
//!
//! # Invariants
//! - `version` == `history.last().version` for every committed context
//! - a version's checksum is a pure function of the content snapshot
//! - shared access is additive and never transfers ownership

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

use crate::domain::error::OrchestrationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(pub Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    Session,
    Conversation,
    TaskExecution,
    AgentMemory,
    Knowledge,
    Learning,
    Workflow,
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextScope {
    Global,
    Agent,
    User,
    Session,
    Task,
    Temporary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    Delete,
    Share,
}

/// Structured payload of a context.
///
/// `content` is a flat field map; the sync engine's merge policy operates on
/// its top-level keys. Keywords/entities/insights are derived metadata that
/// merge by union.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextData {
    #[serde(default)]
    pub content: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub insights: Vec<String>,
    #[serde(default)]
    pub references: Vec<String>,
}

impl ContextData {
    /// SHA-256 over the canonical JSON of the content snapshot. BTreeMap keys
    /// serialize in sorted order, so equal content yields equal digests.
    pub fn checksum(&self) -> String {
        let canonical =
            serde_json::to_vec(&self.content).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessControl {
    pub owner: String,
    /// Per-principal grants beyond the owner's implicit full access.
    #[serde(default)]
    pub permissions: HashMap<String, BTreeSet<Permission>>,
    #[serde(default)]
    pub shared_with: Vec<String>,
    #[serde(default)]
    pub is_public: bool,
}

impl AccessControl {
    pub fn owned_by(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            permissions: HashMap::new(),
            shared_with: Vec::new(),
            is_public: false,
        }
    }

    pub fn can_read(&self, principal: &str) -> bool {
        self.is_public
            || self.owner == principal
            || self.shared_with.iter().any(|p| p == principal)
            || self.has_permission(principal, Permission::Read)
    }

    pub fn can(&self, principal: &str, permission: Permission) -> bool {
        self.owner == principal || self.has_permission(principal, permission)
    }

    fn has_permission(&self, principal: &str, permission: Permission) -> bool {
        self.permissions
            .get(principal)
            .is_some_and(|set| set.contains(&permission))
    }

    /// Additive share; ownership never transfers.
    pub fn share_with(&mut self, principal: impl Into<String>, grants: &[Permission]) {
        let principal = principal.into();
        if !self.shared_with.contains(&principal) {
            self.shared_with.push(principal.clone());
        }
        self.permissions
            .entry(principal)
            .or_default()
            .extend(grants.iter().copied());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    Active,
    /// Read-only while a handoff is in flight for its scope.
    Frozen,
    Archived,
    Expired,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Contexts older than this are expired on sweep (when auto_cleanup).
    #[serde(default)]
    pub max_age_seconds: Option<i64>,
    /// Oldest version records beyond this count are dropped on sweep.
    #[serde(default = "default_max_versions")]
    pub max_versions: usize,
    #[serde(default = "default_true")]
    pub auto_cleanup: bool,
}

fn default_max_versions() -> usize { 50 }
fn default_true() -> bool { true }

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age_seconds: None,
            max_versions: default_max_versions(),
            auto_cleanup: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lifecycle {
    pub status: ContextStatus,
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
    #[serde(default)]
    pub retention: RetentionPolicy,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            status: ContextStatus::Active,
            ttl_seconds: None,
            retention: RetentionPolicy::default(),
        }
    }
}

/// One committed mutation in a context's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextVersion {
    pub version: u64,
    pub changes: Vec<String>,
    pub author: String,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub id: ContextId,
    pub context_type: ContextType,
    pub scope: ContextScope,
    /// Conversation this context belongs to, when any. Handoffs resolve
    /// their transfer scope through this link.
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub data: ContextData,
    pub access: AccessControl,
    pub lifecycle: Lifecycle,
    pub version: u64,
    pub history: Vec<ContextVersion>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Context {
    pub fn new(
        context_type: ContextType,
        scope: ContextScope,
        data: ContextData,
        owner: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let owner = owner.into();
        let checksum = data.checksum();
        Self {
            id: ContextId::new(),
            context_type,
            scope,
            conversation_id: None,
            data,
            access: AccessControl::owned_by(owner.clone()),
            lifecycle: Lifecycle::default(),
            version: 1,
            history: vec![ContextVersion {
                version: 1,
                changes: vec!["created".to_string()],
                author: owner,
                checksum,
                created_at: now,
            }],
            created_at: now,
            updated_at: now,
        }
    }

    pub fn for_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Merge `changes` into content, bump the version by exactly one, and
    /// append the version record. The caller (context store) is responsible
    /// for the optimistic-version check and lock.
    pub fn apply_changes(
        &mut self,
        changes: BTreeMap<String, serde_json::Value>,
        author: impl Into<String>,
    ) -> u64 {
        let changed_keys: Vec<String> = changes.keys().cloned().collect();
        for (key, value) in changes {
            self.data.content.insert(key, value);
        }
        self.commit_version(changed_keys, author)
    }

    /// Replace the whole data block (full sync / snapshot restore).
    pub fn replace_data(&mut self, data: ContextData, author: impl Into<String>) -> u64 {
        self.data = data;
        self.commit_version(vec!["replaced".to_string()], author)
    }

    fn commit_version(&mut self, changes: Vec<String>, author: impl Into<String>) -> u64 {
        self.version += 1;
        self.updated_at = Utc::now();
        self.history.push(ContextVersion {
            version: self.version,
            changes,
            author: author.into(),
            checksum: self.data.checksum(),
            created_at: self.updated_at,
        });
        self.version
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age_limit = match (
            self.lifecycle.ttl_seconds,
            self.lifecycle.retention.max_age_seconds,
        ) {
            (Some(ttl), Some(max)) => Some(ttl.min(max)),
            (Some(ttl), None) => Some(ttl),
            (None, Some(max)) => Some(max),
            (None, None) => None,
        };
        age_limit.is_some_and(|secs| now - self.created_at > Duration::seconds(secs))
    }

    /// Drop oldest versions beyond `max_versions`. Retained versions keep
    /// their numbers; archival never renumbers.
    pub fn apply_version_retention(&mut self) -> usize {
        let max = self.lifecycle.retention.max_versions;
        if max == 0 || self.history.len() <= max {
            return 0;
        }
        let drop = self.history.len() - max;
        self.history.drain(..drop);
        drop
    }
}

// ============================================================================
// Relationship graph
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    Extends,
    Contains,
    References,
    Conflicts,
    Supports,
    Supersedes,
    DerivedFrom,
}

/// Typed edge between two contexts. Exists only while both endpoints exist;
/// deleting a context cascades edge removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRelationship {
    pub id: Uuid,
    pub from: ContextId,
    pub to: ContextId,
    pub kind: RelationshipKind,
    pub bidirectional: bool,
    /// Strength score in [0, 1].
    pub strength: f64,
    pub created_at: DateTime<Utc>,
}

impl ContextRelationship {
    pub fn new(
        from: ContextId,
        to: ContextId,
        kind: RelationshipKind,
        bidirectional: bool,
        strength: f64,
    ) -> Result<Self, OrchestrationError> {
        if !(0.0..=1.0).contains(&strength) {
            return Err(OrchestrationError::InvalidTask(format!(
                "relationship strength must be in [0, 1], got {strength}"
            )));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            from,
            to,
            kind,
            bidirectional,
            strength,
            created_at: Utc::now(),
        })
    }

    pub fn touches(&self, id: ContextId) -> bool {
        self.from == id || self.to == id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_context() -> Context {
        let mut data = ContextData::default();
        data.content
            .insert("topic".to_string(), serde_json::json!("fractions"));
        Context::new(ContextType::Conversation, ContextScope::Session, data, "user-1")
    }

    #[test]
    fn new_context_starts_at_version_one() {
        let ctx = sample_context();
        assert_eq!(ctx.version, 1);
        assert_eq!(ctx.history.len(), 1);
        assert_eq!(ctx.history[0].version, 1);
        assert_eq!(ctx.history[0].checksum, ctx.data.checksum());
    }

    #[test]
    fn apply_changes_bumps_version_by_one() {
        let mut ctx = sample_context();
        let mut changes = BTreeMap::new();
        changes.insert("grade".to_string(), serde_json::json!(5));
        let v = ctx.apply_changes(changes, "agent-a");
        assert_eq!(v, 2);
        assert_eq!(ctx.version, 2);
        assert_eq!(ctx.history.last().unwrap().version, 2);
        assert_eq!(ctx.history.last().unwrap().changes, vec!["grade".to_string()]);
    }

    #[test]
    fn checksum_is_content_function() {
        let a = sample_context();
        let mut b = sample_context();
        assert_eq!(a.data.checksum(), b.data.checksum());
        b.data
            .content
            .insert("extra".to_string(), serde_json::json!(true));
        assert_ne!(a.data.checksum(), b.data.checksum());
    }

    #[test]
    fn sharing_is_additive_and_keeps_owner() {
        let mut ctx = sample_context();
        assert!(!ctx.access.can_read("agent-b"));
        ctx.access.share_with("agent-b", &[Permission::Read, Permission::Write]);
        assert!(ctx.access.can_read("agent-b"));
        assert!(ctx.access.can("agent-b", Permission::Write));
        assert!(!ctx.access.can("agent-b", Permission::Delete));
        assert_eq!(ctx.access.owner, "user-1");
    }

    #[test]
    fn version_retention_never_renumbers() {
        let mut ctx = sample_context();
        ctx.lifecycle.retention.max_versions = 3;
        for i in 0..5 {
            let mut changes = BTreeMap::new();
            changes.insert(format!("k{i}"), serde_json::json!(i));
            ctx.apply_changes(changes, "agent-a");
        }
        assert_eq!(ctx.version, 6);
        let dropped = ctx.apply_version_retention();
        assert_eq!(dropped, 3);
        let retained: Vec<u64> = ctx.history.iter().map(|v| v.version).collect();
        assert_eq!(retained, vec![4, 5, 6]);
    }

    #[test]
    fn ttl_expiry() {
        let mut ctx = sample_context();
        ctx.lifecycle.ttl_seconds = Some(60);
        assert!(!ctx.is_expired(Utc::now()));
        assert!(ctx.is_expired(Utc::now() + Duration::seconds(61)));
    }

    #[test]
    fn relationship_strength_is_bounded() {
        let a = ContextId::new();
        let b = ContextId::new();
        assert!(ContextRelationship::new(a, b, RelationshipKind::Extends, false, 0.7).is_ok());
        assert!(ContextRelationship::new(a, b, RelationshipKind::Extends, false, 1.2).is_err());
    }
}
