//! Run Commands
//!
//! `run` drives a test case to completion in this process, printing step
//! progress as it happens. Ctrl-C asks the engine to cancel; the run still
//! finalizes normally.

use anyhow::Result;
use clap::Args;
use qaflow_common::{Browser, Run, RunStatus, StepResult, StepStatus};
use qaflow_engine::{RunEngine, RunEvent, RunOptions};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use crate::output::{
    format_duration, format_millis, print_error, print_info, print_json, print_list,
    print_success, print_warning, truncate, OutputFormat, TableDisplay,
};

#[derive(Args)]
pub struct RunArgs {
    /// Test case ID
    test_id: String,

    /// Browser engine (chromium, firefox, webkit)
    #[arg(short, long, default_value = "chromium")]
    browser: Browser,

    /// Keep executing after a failed step
    #[arg(long)]
    continue_on_failure: bool,

    /// Per-step timeout in seconds
    #[arg(long)]
    step_timeout: Option<u64>,
}

#[derive(Serialize)]
pub struct RunDisplay {
    pub id: String,
    pub browser: String,
    pub status: RunStatus,
    pub started: String,
    pub duration: String,
    pub error: Option<String>,
}

impl From<&Run> for RunDisplay {
    fn from(run: &Run) -> Self {
        Self {
            id: run.id.clone(),
            browser: run.browser.to_string(),
            status: run.status,
            started: format_millis(run.started_at),
            duration: format_duration(run.started_at, run.ended_at),
            error: run.error.clone(),
        }
    }
}

impl TableDisplay for RunDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Browser", "Status", "Started", "Duration", "Error"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.browser.clone(),
            self.status.to_string(),
            self.started.clone(),
            self.duration.clone(),
            self.error.as_deref().map(|e| truncate(e, 48)).unwrap_or_default(),
        ]
    }
}

#[derive(Serialize)]
pub struct StepResultDisplay {
    pub order: u32,
    pub status: StepStatus,
    pub duration: String,
    pub error: Option<String>,
    pub screenshot: Option<String>,
}

impl From<&StepResult> for StepResultDisplay {
    fn from(result: &StepResult) -> Self {
        Self {
            order: result.order,
            status: result.status,
            duration: format_duration(result.started_at, result.ended_at),
            error: result.error_text.clone(),
            screenshot: result.screenshot_path.clone(),
        }
    }
}

impl TableDisplay for StepResultDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["#", "Status", "Duration", "Error", "Screenshot"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.order.to_string(),
            self.status.to_string(),
            self.duration.clone(),
            self.error.as_deref().map(|e| truncate(e, 48)).unwrap_or_default(),
            self.screenshot.clone().unwrap_or_else(|| "-".to_string()),
        ]
    }
}

fn status_mark(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Passed => "✓",
        StepStatus::Failed => "✗",
        StepStatus::Cancelled => "⊘",
        StepStatus::Pending => "…",
    }
}

/// Execute a run; returns whether it passed
pub async fn execute(args: RunArgs, engine: &RunEngine, format: OutputFormat) -> Result<bool> {
    let test_case = engine.get_test_case(&args.test_id)?;
    let step_text: HashMap<String, String> = engine
        .list_steps(&test_case.id)?
        .into_iter()
        .map(|s| (s.id, s.raw_text))
        .collect();

    let defaults = engine.options();
    let options = RunOptions {
        continue_on_failure: args.continue_on_failure || defaults.continue_on_failure,
        step_timeout: args
            .step_timeout
            .map(Duration::from_secs)
            .unwrap_or(defaults.step_timeout),
    };

    let progress = format != OutputFormat::Json;
    let mut events = engine.subscribe();
    let handle = engine.start_with(&test_case.id, args.browser, options).await?;
    let run_id = handle.run_id().to_string();
    if progress {
        print_info(&format!(
            "Running '{}' on {} (run {})",
            test_case.title, args.browser, run_id
        ));
    }

    let wait = handle.wait();
    tokio::pin!(wait);
    let mut cancel_sent = false;

    let run = loop {
        tokio::select! {
            run = &mut wait => break run?,
            event = events.recv() => match event {
                Ok(RunEvent::StepFinished { run_id: id, step_id, order, status }) if id == run_id && progress => {
                    let text = step_text.get(&step_id).map(String::as_str).unwrap_or("?");
                    println!("  {} {:>2}. {}", status_mark(status), order, text);
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => {}
            },
            _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                cancel_sent = true;
                engine.cancel(&run_id);
                print_warning("Cancelling after the current step...");
            }
        }
    };

    let results = engine.step_results(&run.id)?;
    if format == OutputFormat::Json {
        print_json(&serde_json::json!({ "run": run, "steps": results }));
    } else {
        let displays: Vec<StepResultDisplay> = results.iter().map(StepResultDisplay::from).collect();
        print_list(&displays, format);
        let summary = format!(
            "Run {} {} in {}",
            run.id,
            run.status,
            format_duration(run.started_at, run.ended_at)
        );
        match run.status {
            RunStatus::Passed => print_success(&summary),
            RunStatus::Cancelled => print_warning(&summary),
            _ => print_error(&summary),
        }
        if let Some(error) = &run.error {
            print_error(error);
        }
    }

    Ok(run.status == RunStatus::Passed)
}

pub fn history(test_id: &str, engine: &RunEngine, format: OutputFormat) -> Result<()> {
    let runs = engine.history(test_id)?;
    let displays: Vec<RunDisplay> = runs.iter().map(RunDisplay::from).collect();
    print_list(&displays, format);
    Ok(())
}

pub fn results(run_id: &str, engine: &RunEngine, format: OutputFormat) -> Result<()> {
    let status = engine.status(run_id)?;
    if format == OutputFormat::Json {
        print_json(&status);
        return Ok(());
    }
    print_list(&[RunDisplay::from(&status.run)], format);
    let displays: Vec<StepResultDisplay> = status.steps.iter().map(StepResultDisplay::from).collect();
    print_list(&displays, format);
    Ok(())
}

/// The bug-report input for a run, as JSON
pub fn report(run_id: &str, engine: &RunEngine) -> Result<()> {
    let report = engine.report(run_id)?;
    print_json(&report);
    Ok(())
}
