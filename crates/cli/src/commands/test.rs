//! Test Case Commands

use anyhow::Result;
use clap::Subcommand;
use qaflow_common::{Step, TestCase};
use qaflow_engine::{parser, RunEngine};
use serde::Serialize;
use std::path::PathBuf;

use crate::output::{
    format_millis, print_item, print_json, print_list, print_success, OutputFormat, TableDisplay,
};

#[derive(Subcommand)]
pub enum TestCommands {
    /// Create a test case from plain-language steps
    Add {
        /// Project ID
        #[arg(short, long)]
        project: String,

        /// Test case title
        #[arg(short, long)]
        title: String,

        /// Step text (repeatable, kept in order)
        #[arg(short, long = "step")]
        steps: Vec<String>,

        /// Read steps from a script file, one per line
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// List the test cases of a project
    List {
        /// Project ID
        project: String,
    },

    /// Show a test case and its steps
    Show {
        /// Test case ID
        id: String,
    },

    /// Replace the steps of a test case
    Edit {
        /// Test case ID
        id: String,

        /// Step text (repeatable, kept in order)
        #[arg(short, long = "step")]
        steps: Vec<String>,

        /// Read steps from a script file, one per line
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Delete a test case with its runs and screenshots
    Delete {
        /// Test case ID
        id: String,
    },
}

#[derive(Serialize)]
pub struct TestCaseDisplay {
    pub id: String,
    pub title: String,
    pub steps: usize,
    pub runs: usize,
    pub updated: String,
}

impl TableDisplay for TestCaseDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Title", "Steps", "Runs", "Updated"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.title.clone(),
            self.steps.to_string(),
            self.runs.to_string(),
            self.updated.clone(),
        ]
    }
}

#[derive(Serialize)]
pub struct StepDisplay {
    pub order: u32,
    pub text: String,
    pub action: String,
}

impl From<&Step> for StepDisplay {
    fn from(step: &Step) -> Self {
        let action = step
            .parsed_action_json
            .as_deref()
            .and_then(|json| serde_json::from_str::<parser::ParsedAction>(json).ok())
            .map(|a| parser::describe(&a))
            .unwrap_or_else(|| "-".to_string());
        Self {
            order: step.order,
            text: step.raw_text.clone(),
            action,
        }
    }
}

impl TableDisplay for StepDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["#", "Step", "Action"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.order.to_string(), self.text.clone(), self.action.clone()]
    }
}

fn display(engine: &RunEngine, test_case: TestCase) -> Result<TestCaseDisplay> {
    Ok(TestCaseDisplay {
        steps: engine.list_steps(&test_case.id)?.len(),
        runs: engine.db().count_runs(&test_case.id)?,
        updated: format_millis(test_case.updated_at),
        id: test_case.id,
        title: test_case.title,
    })
}

fn print_test_case(test_case: &TestCase, steps: &[Step], format: OutputFormat) {
    let displays: Vec<StepDisplay> = steps.iter().map(StepDisplay::from).collect();
    if format == OutputFormat::Json {
        print_json(&serde_json::json!({ "test_case": test_case, "steps": displays }));
        return;
    }
    println!("{} ({})", test_case.title, test_case.id);
    print_list(&displays, format);
}

pub fn execute(cmd: TestCommands, engine: &RunEngine, format: OutputFormat) -> Result<()> {
    match cmd {
        TestCommands::Add {
            project,
            title,
            steps,
            file,
        } => {
            let lines = super::collect_steps(steps, file.as_deref())?;
            let (test_case, steps) = engine.create_test_case(&project, &title, &lines)?;
            print_success(&format!(
                "Test case '{}' created with {} step(s)",
                test_case.title,
                steps.len()
            ));
            print_test_case(&test_case, &steps, format);
        }

        TestCommands::List { project } => {
            let mut displays = Vec::new();
            for test_case in engine.list_test_cases(&project)? {
                displays.push(display(engine, test_case)?);
            }
            print_list(&displays, format);
        }

        TestCommands::Show { id } => {
            let test_case = engine.get_test_case(&id)?;
            let steps = engine.list_steps(&id)?;
            print_test_case(&test_case, &steps, format);
        }

        TestCommands::Edit { id, steps, file } => {
            let lines = super::collect_steps(steps, file.as_deref())?;
            let steps = engine.update_steps(&id, &lines)?;
            let test_case = engine.get_test_case(&id)?;
            print_success(&format!("Test case '{}' now has {} step(s)", test_case.title, steps.len()));
            print_item(&display(engine, test_case)?, format);
        }

        TestCommands::Delete { id } => {
            engine.delete_test_case(&id)?;
            print_success(&format!("Test case '{}' deleted", id));
        }
    }

    Ok(())
}
