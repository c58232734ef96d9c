//! Browser Commands

use anyhow::{bail, Result};
use clap::Subcommand;
use qaflow_common::{Browser, BrowserInstallState};
use qaflow_engine::{InstallPhase, RunEngine};

use crate::output::{print_info, print_item, print_list, print_success, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum BrowserCommands {
    /// Show which browser engines are installed
    Status,

    /// Install a browser engine
    Install {
        /// Browser engine (chromium, firefox, webkit)
        browser: Browser,
    },
}

impl TableDisplay for BrowserInstallState {
    fn headers() -> Vec<&'static str> {
        vec!["Browser", "Installed", "Installing", "Last error"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.browser.to_string(),
            if self.installed { "yes" } else { "no" }.to_string(),
            if self.install_in_progress { "yes" } else { "no" }.to_string(),
            self.last_error.clone().unwrap_or_default(),
        ]
    }
}

pub async fn execute(cmd: BrowserCommands, engine: &RunEngine, format: OutputFormat) -> Result<()> {
    match cmd {
        BrowserCommands::Status => {
            let states = engine.browsers().refresh().await;
            print_list(&states, format);
        }

        BrowserCommands::Install { browser } => {
            let mut events = engine.browsers().subscribe();
            let printer = tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    if event.browser != browser {
                        continue;
                    }
                    match event.phase {
                        InstallPhase::Installing => print_info(&format!("Installing {}...", browser)),
                        InstallPhase::Completed | InstallPhase::Failed => break,
                        InstallPhase::Starting => {}
                    }
                }
            });

            let result = engine.browsers().ensure_installed(browser).await;
            printer.abort();
            match result {
                Ok(state) => {
                    print_success(&format!("{} is installed", browser));
                    print_item(&state, format);
                }
                Err(e) => bail!("Failed to install {}: {}", browser, e),
            }
        }
    }

    Ok(())
}
