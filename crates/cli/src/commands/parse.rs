//! Parse Command

use anyhow::Result;
use clap::Args;
use qaflow_engine::parser::{self, LineReport, ParseSource};
use serde::Serialize;
use std::path::PathBuf;

use crate::output::{print_list, OutputFormat, TableDisplay};

#[derive(Args)]
pub struct ParseArgs {
    /// Step text to parse (repeatable)
    steps: Vec<String>,

    /// Read steps from a script file, one per line
    #[arg(short, long)]
    file: Option<PathBuf>,
}

#[derive(Serialize)]
pub struct LineDisplay {
    pub line: usize,
    pub text: String,
    pub source: Option<ParseSource>,
    pub action: Option<String>,
    pub error: Option<String>,
}

impl From<LineReport> for LineDisplay {
    fn from(report: LineReport) -> Self {
        Self {
            line: report.line,
            text: report.text,
            source: report.parsed.as_ref().map(|p| p.source),
            action: report.parsed.as_ref().map(|p| parser::describe(&p.action)),
            error: report.error,
        }
    }
}

impl TableDisplay for LineDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Line", "Step", "Match", "Action"]
    }

    fn row(&self) -> Vec<String> {
        let source = match self.source {
            Some(ParseSource::Strict) => "strict",
            Some(ParseSource::Fallback) => "fallback",
            None => "error",
        };
        vec![
            self.line.to_string(),
            self.text.clone(),
            source.to_string(),
            self.action
                .clone()
                .or_else(|| self.error.clone())
                .unwrap_or_default(),
        ]
    }
}

pub fn execute(args: ParseArgs, format: OutputFormat) -> Result<bool> {
    let lines = super::collect_steps(args.steps, args.file.as_deref())?;
    let reports: Vec<LineDisplay> = parser::validate_steps(&lines)
        .into_iter()
        .map(LineDisplay::from)
        .collect();
    let valid = reports.iter().all(|r| r.error.is_none());
    print_list(&reports, format);
    Ok(valid)
}
