//! CLI entry point for Herald.
//!
//! Provides the `herald` command: `run` an agent from a YAML file,
//! `validate` a file without connecting anywhere, and `version`.
//!
//! `run` uses the standalone in-process platform; the LLM endpoint is taken
//! from `HERALD_LLM_BASE_URL` / `HERALD_LLM_API_KEY` (OpenAI-compatible).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use herald_config::Config;
use herald_mcp::McpManager;
use herald_runner::broker::ToolBroker;
use herald_runner::llm::{LlmClient, LlmClientConfig};
use herald_runner::{Runner, StandalonePlatform, event_channel};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Herald — YAML-driven LLM message-routing agent.
#[derive(Parser)]
#[command(
    name = "herald",
    version,
    about = "Herald — YAML-driven LLM message-routing agent",
    long_about = "Routes pub/sub events through an LLM completion/tool loop and dispatches \
                  results to platform topics or sandboxed Lua adapters."
)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an agent from a YAML file.
    Run {
        /// Path to the agent YAML file.
        file: PathBuf,

        /// Only show errors.
        #[arg(long, conflicts_with = "verbose")]
        quiet: bool,
    },

    /// Validate an agent YAML file.
    Validate {
        /// Path to the agent YAML file.
        file: PathBuf,
    },

    /// Print version information.
    Version,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, quiet } => cmd_run(file, cli.verbose, quiet).await,
        Commands::Validate { file } => cmd_validate(file),
        Commands::Version => {
            println!("herald {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

async fn cmd_run(file: PathBuf, verbose: bool, quiet: bool) -> Result<()> {
    init_tracing(if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    });

    let cfg = Config::from_file(&file)
        .with_context(|| format!("failed to load {}", file.display()))?;
    cfg.validate().context("invalid agent configuration")?;

    info!(agent = %cfg.agent.name, config = %file.display(), "starting agent");

    // Standalone mode: in-process topics, completions over an
    // OpenAI-compatible endpoint from the environment.
    let platform = Arc::new(match llm_from_env()? {
        Some(llm) => StandalonePlatform::with_llm(llm),
        None => {
            info!("HERALD_LLM_BASE_URL not set; completions will fail until configured");
            StandalonePlatform::new()
        }
    });

    let broker: Option<Arc<dyn ToolBroker>> = if cfg.agent.mcp.servers.is_empty() {
        None
    } else {
        let manager = McpManager::new();
        let connected = manager.connect_all(&cfg.agent.mcp.servers).await;
        info!(
            connected,
            configured = cfg.agent.mcp.servers.len(),
            tools = manager.tools().len(),
            "MCP servers ready"
        );
        Some(Arc::new(manager))
    };

    // The event stream is drained to the log in headless mode; a richer
    // frontend would render it instead.
    let (events, mut event_rx) = event_channel(256);
    let drain = tokio::spawn(async move { while event_rx.recv().await.is_some() {} });

    let runner = Runner::new(cfg, platform, broker, Some(events))
        .await
        .context("failed to start agent")?;

    let result = runner
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await;

    drain.abort();
    result.context("agent terminated with an error")
}

fn llm_from_env() -> Result<Option<LlmClient>> {
    let Ok(base_url) = std::env::var("HERALD_LLM_BASE_URL") else {
        return Ok(None);
    };
    let api_key = std::env::var("HERALD_LLM_API_KEY").unwrap_or_default();

    let client = LlmClient::new(LlmClientConfig::compatible(base_url, api_key))
        .context("failed to build LLM client")?;
    Ok(Some(client))
}

// ---------------------------------------------------------------------------
// Subcommand: validate
// ---------------------------------------------------------------------------

fn cmd_validate(file: PathBuf) -> Result<()> {
    let cfg = Config::from_file(&file)
        .with_context(|| format!("failed to load {}", file.display()))?;

    match cfg.validate() {
        Ok(()) => {
            println!("{} is valid", file.display());
            println!("  agent: {}", cfg.agent.name);
            println!("  model: {}", cfg.agent.model);
            println!("  subscribe: {}", cfg.agent.topics.subscribe.join(", "));
            println!("  publish: {}", cfg.agent.topics.publish.join(", "));
            if !cfg.agent.plugins.is_empty() {
                let names: Vec<&str> =
                    cfg.agent.plugins.iter().map(|p| p.name.as_str()).collect();
                println!("  plugins: {}", names.join(", "));
            }
            if cfg.agent.topics.has_routes() {
                println!("  routes: {}", cfg.agent.topics.routes.len());
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
