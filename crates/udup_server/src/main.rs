//! UDUP agent
//!
//! Runs a udup agent until interrupted or until a background task reports a
//! fatal error.

#![warn(missing_docs)]
#![warn(clippy::all)]

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use udup_cluster::{
    Agent, AgentConfig, LocalScheduler, MemoryStore, ServerDeps, SystemInterfaces, TcpConnector,
    Transport,
};
use udup_server::{ApiServer, Overrides, load_config};

#[derive(Parser)]
#[command(name = "udup")]
#[command(about = "udup agent - cluster membership, leader election and job routing", long_about = None)]
struct Args {
    /// Configuration file (TOML or JSON)
    #[arg(short, long, env = "UDUP_CONFIG")]
    config: Option<PathBuf>,

    /// Node name
    #[arg(long)]
    node: Option<String>,

    /// Gossip bind address
    #[arg(long)]
    bind: Option<String>,

    /// Network interface to bind gossip to
    #[arg(long)]
    iface: Option<String>,

    /// Run as a server
    #[arg(long)]
    server: bool,

    /// Peer to join at startup (repeatable)
    #[arg(long)]
    join: Vec<String>,

    /// RPC port
    #[arg(long)]
    rpc_port: Option<u16>,

    /// HTTP API address
    #[arg(long)]
    http_addr: Option<String>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            node: self.node.clone(),
            bind: self.bind.clone(),
            iface: self.iface.clone(),
            server: self.server,
            join: self.join.clone(),
            rpc_port: self.rpc_port,
            http_addr: self.http_addr.clone(),
        }
    }
}

/// Filter used when `RUST_LOG` is unset; gossip chatter stays below the agent's own logs
fn default_directives(level: &str) -> String {
    format!("{level},tower_http=info,udup_cluster::gossip=warn")
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_agent(config: AgentConfig) -> Agent {
    let mut builder = Agent::builder(config.clone())
        .with_transport(Transport::Udp)
        .with_interfaces(Arc::new(SystemInterfaces))
        .with_connector(Arc::new(TcpConnector::new()));

    if config.server {
        warn!(
            node = %config.node_name,
            "In-memory store: leadership is only coordinated within this process, run a single server"
        );
        let store = MemoryStore::new();
        let scheduler = LocalScheduler::new();
        builder = builder
            .with_server(ServerDeps::new(
                Arc::new(store),
                Arc::new(scheduler.clone()),
                Arc::new(scheduler),
            ))
            .with_surface(Arc::new(ApiServer::new(config.http_addr.clone())));
    }
    builder.build()
}

async fn run(args: Args) -> Result<ExitCode> {
    let mut config = match &args.config {
        Some(path) => load_config(path).with_context(|| format!("loading {}", path.display()))?,
        None => AgentConfig::default(),
    };
    args.overrides().apply(&mut config);

    let agent = build_agent(config);
    agent.start().await.context("starting agent")?;

    let code = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for interrupt")?;
            info!("Interrupt received, shutting down");
            ExitCode::SUCCESS
        }
        fatal = agent.fatal() => {
            if let Some(e) = fatal {
                error!(error = %e, "Fatal error, shutting down");
            }
            ExitCode::FAILURE
        }
    };

    agent.shutdown().await.context("shutting down agent")?;
    Ok(code)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level, args.log_json);

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("udup agent failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}
