//! qaflow CLI - Main Entry Point
//!
//! Authors plain-language test cases and runs them against a local store,
//! in-process, without a daemon.

use anyhow::Result;
use clap::{Parser, Subcommand};
use qaflow_engine::{QaflowConfig, RunEngine};
use std::path::PathBuf;

mod commands;
mod output;

use commands::{browsers, parse, project, run, test};

/// qaflow CLI - plain-language browser tests
#[derive(Parser)]
#[command(name = "qaflow")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "QAFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Store directory (database and screenshots)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Base URL that `Go to` paths resolve against
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check how steps are interpreted
    Parse(parse::ParseArgs),

    /// Manage projects
    #[command(subcommand)]
    Project(project::ProjectCommands),

    /// Manage test cases
    #[command(subcommand)]
    Test(test::TestCommands),

    /// Run a test case
    Run(run::RunArgs),

    /// List the runs of a test case, newest first
    History {
        /// Test case ID
        test_id: String,
    },

    /// Show the step results of a run
    Results {
        /// Run ID
        run_id: String,
    },

    /// Print the bug-report input of a run as JSON
    Report {
        /// Run ID
        run_id: String,
    },

    /// Manage browser engines
    #[command(subcommand)]
    Browsers(browsers::BrowserCommands),

    /// Show version information
    Version,
}

fn load_config(cli: &Cli) -> Result<QaflowConfig> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(qaflow_common::default_config_path);
    let mut config = QaflowConfig::load(&path)?;
    if let Some(store) = &cli.store {
        config.store_path = store.clone();
    }
    if let Some(base_url) = &cli.base_url {
        config.browser.base_url = base_url.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    let format = cli.format;
    let config = load_config(&cli)?;
    let open = || RunEngine::from_config(&config);

    let ok = match cli.command {
        Commands::Parse(args) => parse::execute(args, format)?,
        Commands::Project(cmd) => {
            project::execute(cmd, &open()?, format)?;
            true
        }
        Commands::Test(cmd) => {
            test::execute(cmd, &open()?, format)?;
            true
        }
        Commands::Run(args) => run::execute(args, &open()?, format).await?,
        Commands::History { test_id } => {
            run::history(&test_id, &open()?, format)?;
            true
        }
        Commands::Results { run_id } => {
            run::results(&run_id, &open()?, format)?;
            true
        }
        Commands::Report { run_id } => {
            run::report(&run_id, &open()?)?;
            true
        }
        Commands::Browsers(cmd) => {
            browsers::execute(cmd, &open()?, format).await?;
            true
        }
        Commands::Version => {
            println!("qaflow CLI v{}", qaflow_common::VERSION);
            println!("Store: {}", config.store_path.display());
            println!("Base URL: {}", config.browser.base_url);
            true
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
