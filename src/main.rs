//! # shell-mcp
//!
//! Remote shell control plane for AI agents, spoken over MCP on stdio.
//!
//! shell-mcp multiplexes persistent shell sessions — a local PTY or an
//! authenticated SSH connection with an interactive shell — behind a small
//! tool surface: create a session, run a command, provide follow-up input,
//! interrupt, move files (whole, chunked-resumable, or recursive), tunnel
//! ports, close.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use shell_mcp::{mcp, Config, Server};

/// Remote shell control plane for AI agents (MCP stdio server).
#[derive(Parser)]
#[command(name = "shell-mcp", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the MCP stdio server (default when no subcommand given).
    Serve {
        /// Path to the YAML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };

    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("shell-mcp: {e}");
            std::process::exit(1);
        }
    };

    // stdout carries the protocol; all logging goes to stderr.
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    info!("shell-mcp v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "{} configured server(s), max {} session(s)",
        config.servers.len(),
        config.limits.max_sessions
    );

    let server = Arc::new(Server::new(config, config_path));

    // Background sweep: expired sudo cache entries.
    let sweep_server = Arc::clone(&server);
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            let removed = sweep_server.sudo_cache.sweep();
            if removed > 0 {
                info!("swept {removed} expired sudo cache entries");
            }
        }
    });

    mcp::run_stdio(Arc::clone(&server)).await;

    // stdin closed — the orchestrator is gone. Tear everything down.
    info!("shutting down...");
    sweep_task.abort();
    server.sessions.close_all(&server.sudo_cache).await;
    info!("goodbye");
}
