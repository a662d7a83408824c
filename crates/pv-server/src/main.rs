//! Process-variable access server entry point.
//!
//! Loads the configuration, overlays the EPICS environment variables, and
//! runs the server until Ctrl-C.
//!
//! # Usage
//!
//! ```text
//! pv-server [OPTIONS]
//!
//! Options:
//!   --config <PATH>        TOML configuration file [default: pv-server.toml]
//!   --report-level <N>     Print the diagnostic report at startup and shutdown
//!   --demo-points          Serve a few demonstration points
//! ```
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config() + apply_env()
//!  └─ server::start()
//!       ├─ UDP discovery   (one thread per socket)
//!       ├─ beacon task
//!       └─ TCP acceptors   (reader + outbound task per client)
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pv_server::application::data_source::OpenAccess;
use pv_server::application::report::report;
use pv_server::infrastructure::data::memory_source::MemoryDataSource;
use pv_server::infrastructure::storage::config::load_config;
use pv_server::server;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Process-variable access server.
#[derive(Debug, Parser)]
#[command(name = "pv-server", about = "Process-variable access server", version)]
struct Cli {
    /// TOML configuration file.  A missing file means all defaults.
    #[arg(long, default_value = "pv-server.toml", env = "PV_SERVER_CONFIG")]
    config: PathBuf,

    /// Print the diagnostic report at this level (0-4) after startup and
    /// before exit.
    #[arg(long, value_parser = clap::value_parser!(u32).range(0..=4))]
    report_level: Option<u32>,

    /// Seed the in-memory data source with demonstration points.
    #[arg(long)]
    demo_points: bool,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    // `RUST_LOG` wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&config.server.log_level))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    config
        .apply_env(|name| std::env::var(name).ok())
        .context("applying environment overrides")?;

    let source = if cli.demo_points {
        MemoryDataSource::with_demo_points()
    } else {
        MemoryDataSource::new()
    };
    info!("serving {} point(s)", source.names().len());

    let handle = server::start(&config, Arc::new(source), Arc::new(OpenAccess))
        .await
        .context("starting server")?;

    if let Some(level) = cli.report_level {
        println!("{}", report(handle.context(), level));
    }

    info!("PV access server ready.  Press Ctrl-C to exit.");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutdown signal received");

    if let Some(level) = cli.report_level {
        println!("{}", report(handle.context(), level));
    }
    handle.shutdown().await;
    Ok(())
}
