//! Spectrograph control server binary.
//!
//! Loads configuration, builds the simulated hardware rig and serves
//! commands until Ctrl+C.

use anyhow::{Context, Result};
use clap::Parser;
use dualspec::config::ServerConfig;
use dualspec::context::ServerContext;
use dualspec::dispatcher::CommandDispatcher;
use dualspec::hardware::mock::MockRig;
use dualspec::server;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Dual-arm spectrograph control server")]
struct Args {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding `server.bind`.
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level, overriding `server.log_level`.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = ServerConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(level) = args.log_level {
        config.server.log_level = level;
    }
    init_tracing(&config.server.log_level, args.json_logs)?;

    std::fs::create_dir_all(&config.server.data_dir)
        .with_context(|| format!("creating {}", config.server.data_dir.display()))?;
    warn!("Running against simulated hardware");
    let rig = MockRig::default();
    let bind = config.server.bind.clone();
    let ctx = ServerContext::new(config, rig.hardware()).context("loading persisted state")?;
    let dispatcher = CommandDispatcher::new(Arc::new(ctx));

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    server::serve(listener, dispatcher, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler failed");
        }
    })
    .await?;
    info!("Server stopped");
    Ok(())
}
