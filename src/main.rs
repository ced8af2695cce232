//! Keel - remote-control RPC server for compose deployments
//!
//! This is the main entry point for the Keel server.

use anyhow::Context;
use clap::Parser;
use keel::controller::OrchestrationController;
use keel::engine::DockerEngine;
use keel::registry::RegistryClient;
use keel::rpc::{RpcHandler, RpcServer, ServerConfig, DEFAULT_BIND_ADDRESS};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Keel - remote-control RPC server for compose deployments
#[derive(Parser)]
#[command(name = "keel")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "A remote-control RPC layer for compose deployments", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, env = "KEEL_BIND", default_value = DEFAULT_BIND_ADDRESS)]
    bind: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServerConfig::from_address(&cli.bind)
        .with_context(|| format!("cannot listen on {}", cli.bind))?;

    let controller = OrchestrationController::new(
        Arc::new(DockerEngine::new()),
        Arc::new(RegistryClient::new()),
    );
    let handler = RpcHandler::new(Arc::new(controller));

    let server = RpcServer::bind(&config, handler)
        .await
        .with_context(|| format!("cannot bind {}", config.bind))?;
    server.run().await?;

    Ok(())
}
