// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! One-shot CLI surface: run a single prompt through the Coordinator and
//! print the final assistant text.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use mimir_core::Coordinator;
use mimir_mcp::McpManager;
use mimir_session::{FinishReason, Messages, Sessions};

#[derive(Parser, Debug)]
#[command(name = "mimir", version, about = "A terminal AI coding agent")]
struct Cli {
    /// The prompt to run.
    #[arg(short, long)]
    prompt: String,

    /// Explicit config file (merged over the discovered layers).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Working directory for the session's tools.
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Print the effective configuration and exit.
    #[arg(long)]
    show_config: bool,

    /// Log to stderr (RUST_LOG controls the filter).
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = mimir_config::load(cli.config.as_deref())?;
    if let Some(cwd) = &cli.cwd {
        config.working_dir = Some(cwd.display().to_string());
    }
    if cli.show_config {
        println!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }
    let config = Arc::new(config);

    let sessions = Sessions::new();
    let messages = Messages::new();
    let mcp = McpManager::start(config.mcp.clone()).await;

    let coordinator = Coordinator::new(
        Arc::clone(&config),
        sessions.clone(),
        messages,
        Arc::clone(&mcp),
    )
    .await
    .context("building coordinator")?;

    let session = sessions.create("CLI session").await;
    let result = coordinator.run(&session.id, &cli.prompt, vec![]).await;
    mcp.shutdown().await;

    let message = result?.context("prompt was unexpectedly queued")?;
    match message.finish_reason() {
        Some(FinishReason::EndTurn) | Some(FinishReason::MaxTokens) | None => {
            println!("{}", message.text());
            Ok(())
        }
        Some(reason) => {
            println!("{}", message.text());
            anyhow::bail!("turn ended with {reason:?}")
        }
    }
}

fn init_logging(verbose: bool) {
    if !verbose && std::env::var("RUST_LOG").is_err() {
        return;
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mimir=info,mimir_core=info,mimir_mcp=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
