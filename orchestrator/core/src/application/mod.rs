// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod context_service;
pub mod handoff;
pub mod orchestrator;
pub mod registry;
pub mod selector;
pub mod sync_engine;
