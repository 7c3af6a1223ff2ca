// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use anyhow::Result;
use std::path::PathBuf;

use super::manifest::AgentsManifest;

pub fn handle(agents: PathBuf) -> Result<()> {
    let manifest = AgentsManifest::load(&agents)?;
    println!("{} OK: {} agent(s)", agents.display(), manifest.agents.len());
    for agent in &manifest.agents {
        println!(
            "  {} ({}) capabilities: {}",
            agent.name,
            agent.agent_type,
            agent.capabilities.join(", ")
        );
    }
    Ok(())
}
