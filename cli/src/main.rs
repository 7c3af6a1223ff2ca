// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # RELAY Orchestrator CLI
//!
//! The `relay` binary drives a single-process orchestrator runtime for
//! demos and manifest validation.
//!
//! ## Commands
//!
//! - `relay demo --agents <agents.yaml> --task <task.yaml>` - boot a runtime,
//!   register the manifest agents, submit the task, and follow its events
//!   until it reaches a terminal state
//! - `relay validate --agents <agents.yaml>` - parse and validate a manifest

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

/// RELAY orchestrator - multi-agent task coordination
#[derive(Parser)]
#[command(name = "relay")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an end-to-end demo against an in-process runtime
    Demo {
        /// Agent manifest (YAML)
        #[arg(long, value_name = "FILE")]
        agents: PathBuf,

        /// Task description (YAML)
        #[arg(long, value_name = "FILE")]
        task: PathBuf,

        /// Core configuration (YAML); defaults apply when omitted
        #[arg(long, value_name = "FILE", env = "RELAY_CONFIG_PATH")]
        config: Option<PathBuf>,
    },

    /// Parse and validate an agent manifest
    Validate {
        /// Agent manifest (YAML)
        #[arg(long, value_name = "FILE")]
        agents: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Demo {
            agents,
            task,
            config,
        } => commands::demo::handle(agents, task, config).await,
        Commands::Validate { agents } => commands::validate::handle(agents),
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    Ok(())
}
