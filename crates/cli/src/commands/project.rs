//! Project Commands

use anyhow::Result;
use clap::Subcommand;
use qaflow_common::Project;
use qaflow_engine::RunEngine;
use serde::Serialize;

use crate::output::{format_millis, print_item, print_list, print_success, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum ProjectCommands {
    /// Create a project
    Add {
        /// Project name
        name: String,
    },

    /// List projects
    List,

    /// Delete a project with its test cases, runs and screenshots
    Delete {
        /// Project ID
        id: String,
    },
}

#[derive(Serialize)]
pub struct ProjectDisplay {
    pub id: String,
    pub name: String,
    pub test_cases: usize,
    pub created: String,
}

impl ProjectDisplay {
    fn new(project: Project, test_cases: usize) -> Self {
        Self {
            id: project.id,
            name: project.name,
            test_cases,
            created: format_millis(project.created_at),
        }
    }
}

impl TableDisplay for ProjectDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Name", "Test cases", "Created"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            self.test_cases.to_string(),
            self.created.clone(),
        ]
    }
}

pub fn execute(cmd: ProjectCommands, engine: &RunEngine, format: OutputFormat) -> Result<()> {
    match cmd {
        ProjectCommands::Add { name } => {
            let project = engine.create_project(&name)?;
            print_success(&format!("Project '{}' created", project.name));
            print_item(&ProjectDisplay::new(project, 0), format);
        }

        ProjectCommands::List => {
            let mut displays = Vec::new();
            for project in engine.list_projects()? {
                let count = engine.list_test_cases(&project.id)?.len();
                displays.push(ProjectDisplay::new(project, count));
            }
            print_list(&displays, format);
        }

        ProjectCommands::Delete { id } => {
            engine.delete_project(&id)?;
            print_success(&format!("Project '{}' deleted", id));
        }
    }

    Ok(())
}
