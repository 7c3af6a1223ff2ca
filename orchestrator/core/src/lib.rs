// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! RELAY orchestrator core
//!
//! Coordination domain for multi-agent systems: task orchestration, agent
//! registry and selection, shared context with optimistic versioning,
//! cross-agent sync, and conversation handoff.
//!
//! # Architecture
//!
//! - `domain`: entities, state machines, and events
//! - `application`: the services that coordinate them
//! - `infrastructure`: event bus and job queue ports
//! - `presentation`: the typed API facade

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod presentation;
pub mod runtime;

pub use domain::*;
