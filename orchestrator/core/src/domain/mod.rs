// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod agent;
pub mod context;
pub mod error;
pub mod events;
pub mod handoff;
pub mod sync;
pub mod task;
