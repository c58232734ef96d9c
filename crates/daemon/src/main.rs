//! qaflow daemon
//!
//! Hosts the run engine behind the HTTP API and event stream.

use clap::Parser;
use qaflow_engine::{QaflowConfig, RunEngine};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;

#[derive(Parser)]
#[command(name = "qaflowd")]
#[command(about = "qaflow daemon - plain-language browser test runner")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "QAFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Store directory (database and screenshots)
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// HTTP listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Base URL that `Go to` paths resolve against
    #[arg(long)]
    base_url: Option<String>,

    /// Show the browser window
    #[arg(long)]
    headed: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("qaflow daemon v{}", qaflow_common::VERSION);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(qaflow_common::default_config_path);
    let mut config = QaflowConfig::load(&config_path)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    if let Some(base_url) = cli.base_url {
        config.browser.base_url = base_url;
    }
    if cli.headed {
        config.browser.headless = false;
    }

    tokio::fs::create_dir_all(&config.store_path).await?;

    let engine = RunEngine::from_config(&config)?;
    engine.db().recover_interrupted_runs()?;
    for state in engine.browsers().refresh().await {
        info!(
            "Browser {}: {}",
            state.browser,
            if state.installed { "installed" } else { "not installed" }
        );
    }

    let addr: SocketAddr = config.server.listen.parse()?;
    let server = tokio::spawn(api::serve(engine.clone(), addr));

    info!("Screenshots under {}", engine.artifacts().root().display());
    info!("Resolving pages against {}", config.browser.base_url);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            if let Some(active) = engine.active_context() {
                info!("Cancelling active run {}", active.run_id);
                engine.cancel(&active.run_id);
            }
        }
        result = server => {
            match result {
                Ok(Err(e)) => error!("HTTP server error: {}", e),
                Err(e) => error!("HTTP server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    info!("Daemon shutdown complete");
    Ok(())
}
