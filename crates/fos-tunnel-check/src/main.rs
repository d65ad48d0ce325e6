//! fos-tunnel-check: offline network settings preview
//!
//! Loads a tunnel configuration and a negotiated session configuration (as
//! a server would push it) and prints the settings the host would be asked
//! to apply.

use anyhow::{Context, Result};
use clap::Parser;
use fos_tunnel::{
    derive_network_settings, EndpointStrategy, RouteTable, SessionConfig, SettingsInput,
    StaticRouteTable, TunnelConfig,
};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "fos-tunnel-check", about = "Preview the network settings of a tunnel")]
struct Cli {
    /// Tunnel configuration (TOML or JSON).
    config: PathBuf,

    /// Negotiated session configuration (JSON).
    negotiated: PathBuf,

    /// Host route table (JSON list of routes), used by the block-local rule.
    #[arg(long)]
    routes: Option<PathBuf>,

    /// Remote address the session connected to.
    #[arg(long)]
    remote: Option<std::net::IpAddr>,
}

fn main() -> Result<()> {
    let _subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    let config = TunnelConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let strategy = EndpointStrategy::new(&config)?;
    info!("{} endpoint candidates", strategy.len());
    let mut candidates = vec![strategy.current().clone()];
    let mut cursor = strategy.clone();
    while cursor.advance() {
        candidates.push(cursor.current().clone());
    }
    for (i, candidate) in candidates.iter().enumerate() {
        info!("  #{}: {}", i + 1, candidate);
    }

    let negotiated: SessionConfig = serde_json::from_str(
        &std::fs::read_to_string(&cli.negotiated)
            .with_context(|| format!("reading {}", cli.negotiated.display()))?,
    )
    .context("parsing negotiated configuration")?;

    let route_table = match &cli.routes {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Some(StaticRouteTable::new(
                serde_json::from_str(&content).context("parsing route table")?,
            ))
        }
        None => None,
    };

    let input = SettingsInput {
        local: &config.session,
        negotiated: &negotiated,
        remote_address: cli.remote,
        capabilities: config.capabilities,
    };
    let table = route_table.as_ref().map(|t| t as &dyn RouteTable);
    let settings = match derive_network_settings(&input, table) {
        Ok(settings) => settings,
        Err(e) => {
            warn!("Tunnel would be torn down: {}", e);
            return Err(e.into());
        }
    };

    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}
