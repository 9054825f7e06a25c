// src/main.rs
//! Agent Toolkit CLI
//!
//! Usage:
//!   agent-toolkit --config toolkit.yaml run --agent bug_fix_agent -- cargo test
//!   agent-toolkit --config toolkit.yaml stats --prometheus
//!   agent-toolkit --config toolkit.yaml check-config

use agent_toolkit_engine::observability::{init_metrics, init_tracing};
use agent_toolkit_engine::{EventBus, ToolkitConfig, ToolkitContext};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "agent-toolkit")]
#[command(author, version, about = "Resource pooling and sandboxed execution for agents")]
struct Cli {
    /// Config file (YAML, TOML or JSON); built-in defaults when omitted
    #[arg(short, long, env = "AGENT_TOOLKIT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one command in the sandbox and print the result as JSON
    Run {
        /// Configured agent to run as
        #[arg(short, long)]
        agent: String,

        /// Override the agent's sandbox strategy
        #[arg(short, long)]
        strategy: Option<String>,

        /// Command to run (passed to /bin/sh -c)
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Print dependency pool and event bus statistics
    Stats {
        /// Also print the Prometheus metrics snapshot
        #[arg(long)]
        prometheus: bool,
    },

    /// Validate the configuration and print it resolved
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ToolkitConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ToolkitConfig::default(),
    };

    if let Commands::CheckConfig = cli.command {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let event_bus = Arc::new(EventBus::new(config.observability.event_buffer_size));
    init_tracing(&config.logging, Some(Arc::clone(&event_bus)))?;
    let metrics = init_metrics()?;

    info!("Starting Agent Toolkit v{}", agent_toolkit_engine::VERSION);

    let ctx = ToolkitContext::initialize_with_event_bus(config, event_bus).await?;

    let succeeded = match cli.command {
        Commands::Run { agent, strategy, command } => {
            let mut session = ctx.create_agent_session(&agent, strategy.as_deref())?;
            let result = ctx.sandbox().run(&mut session, &command.join(" ")).await;
            ctx.sandbox().cleanup(&session).await;

            println!("{}", serde_json::to_string_pretty(&result)?);
            result.success
        }
        Commands::Stats { prometheus } => {
            let stats = json!({
                "dependencies": ctx.dependencies().stats().await,
                "event_bus": ctx.event_bus().stats(),
                "strategies": ctx.sandbox().strategy_names(),
            });
            println!("{}", serde_json::to_string_pretty(&stats)?);

            if prometheus {
                println!("{}", metrics.render());
            }
            true
        }
        Commands::CheckConfig => true,
    };

    ctx.shutdown().await;

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}
