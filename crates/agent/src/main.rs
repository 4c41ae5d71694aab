//! Certrelay agent - main entry point.
//!
//! Wires the shared context, connects the cache store, and runs the
//! connector, dispatcher, and heartbeat until a shutdown signal arrives.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use certrelay_agent::{
    AgentContext, CacheStore, Dispatcher, Gateway, HeartbeatEmitter, MemoryStore, RedisStore,
};
use certrelay_config::AgentConfig;

/// Certrelay - remote-controlled DNS-01 certificate issuance agent
#[derive(Parser, Debug)]
#[command(name = "certrelay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "CERTRELAY_CONFIG")]
    config: Option<String>,

    /// Controller websocket URL (overrides the config file)
    #[arg(long = "connect-url", env = "CERTRELAY_CONNECT_URL")]
    connect_url: Option<String>,

    /// Controller auth token (overrides the config file)
    #[arg(
        long = "connect-token",
        env = "CERTRELAY_CONNECT_TOKEN",
        hide_env_values = true
    )]
    connect_token: Option<String>,

    /// Use the in-process memory store instead of redis
    #[arg(long = "memory-cache")]
    memory_cache: bool,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => {
            AgentConfig::from_file(path).context("failed to load configuration file")?
        }
        None => AgentConfig::default(),
    };
    if let Some(url) = cli.connect_url {
        config.gateway.connect_url = url;
    }
    if let Some(token) = cli.connect_token {
        config.gateway.connect_token = token;
    }
    config.validate().context("invalid configuration")?;

    let cache: Arc<dyn CacheStore> = if cli.memory_cache {
        Arc::new(MemoryStore::with_cleanup_task())
    } else {
        Arc::new(
            RedisStore::connect(&config.cache.url)
                .await
                .context("failed to connect to cache store")?,
        )
    };

    // Workflow state is process-scoped; reset it on init.
    cache
        .flush_all()
        .await
        .map_err(|e| anyhow::anyhow!("failed to flush cache store: {e}"))?;

    let (ctx, receivers) = AgentContext::new(config, cache);
    info!(url = %ctx.config.gateway.connect_url, "Starting certrelay agent");

    let gateway = tokio::spawn(Gateway::new(ctx.clone()).run(receivers.outbound));
    let dispatcher = tokio::spawn(Dispatcher::new(ctx.clone()).run(receivers.inbound));
    let heartbeat = tokio::spawn(HeartbeatEmitter::new(ctx.clone()).run());

    wait_for_signal().await?;
    info!("Shutdown signal received");
    ctx.shutdown.cancel();

    // Join domain workflows first, then the long-lived tasks.
    ctx.workflows.join_all().await;
    for (name, handle) in [
        ("gateway", gateway),
        ("dispatcher", dispatcher),
        ("heartbeat", heartbeat),
    ] {
        if let Err(e) = handle.await {
            warn!(task = name, error = %e, "Task ended abnormally");
        }
    }

    info!("Agent stopped");
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for SIGINT")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}
