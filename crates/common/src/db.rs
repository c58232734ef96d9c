//! SQLite database for qaflow state persistence

use crate::types::*;
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS test_cases (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_test_cases_project ON test_cases(project_id);

            CREATE TABLE IF NOT EXISTS steps (
                id TEXT PRIMARY KEY,
                test_case_id TEXT NOT NULL REFERENCES test_cases(id) ON DELETE CASCADE,
                step_order INTEGER NOT NULL,
                raw_text TEXT NOT NULL,
                parsed_action_json TEXT,
                UNIQUE (test_case_id, step_order)
            );

            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                test_case_id TEXT NOT NULL REFERENCES test_cases(id) ON DELETE CASCADE,
                browser TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                ended_at INTEGER,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_runs_test_case ON runs(test_case_id);

            CREATE TABLE IF NOT EXISTS step_results (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                step_id TEXT NOT NULL,
                step_order INTEGER NOT NULL,
                status TEXT NOT NULL,
                error_text TEXT,
                screenshot_path TEXT,
                started_at INTEGER NOT NULL,
                ended_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_step_results_run ON step_results(run_id);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Projects
    // ========================================================================

    pub fn create_project(&self, name: &str) -> Result<Project> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("Project name cannot be empty.".to_string()));
        }

        let project = Project {
            id: new_id(),
            name: name.to_string(),
            created_at: now_millis(),
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO projects (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![project.id, project.name, project.created_at],
        )?;

        debug!("Created project {} ({})", project.name, project.id);
        Ok(project)
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let conn = self.conn.lock();
        let project = conn
            .query_row(
                "SELECT id, name, created_at FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(project)
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, name, created_at FROM projects ORDER BY created_at ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(Project {
                id: row.get(0)?,
                name: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Delete a project together with its test cases, steps and runs
    pub fn delete_project(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM projects WHERE id = ?1", params![id])?;
        if rows > 0 {
            debug!("Deleted project {}", id);
        }
        Ok(rows > 0)
    }

    // ========================================================================
    // Test cases and steps
    // ========================================================================

    /// Create a test case and its ordered steps in one transaction
    pub fn create_test_case(
        &self,
        project_id: &str,
        title: &str,
        steps: &[NewStep],
    ) -> Result<(TestCase, Vec<Step>)> {
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::Validation("Title cannot be empty.".to_string()));
        }
        if self.get_project(project_id)?.is_none() {
            return Err(Error::not_found("project", project_id));
        }

        let now = now_millis();
        let test_case = TestCase {
            id: new_id(),
            project_id: project_id.to_string(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        };

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO test_cases (id, project_id, title, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                test_case.id,
                test_case.project_id,
                test_case.title,
                test_case.created_at,
                test_case.updated_at
            ],
        )?;
        let stored = insert_steps(&tx, &test_case.id, steps)?;
        tx.commit()?;

        debug!("Created test case {} with {} step(s)", test_case.id, stored.len());
        Ok((test_case, stored))
    }

    /// Replace the whole step list of a test case, renumbering from 1
    pub fn replace_steps(&self, test_case_id: &str, steps: &[NewStep]) -> Result<Vec<Step>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE test_cases SET updated_at = ?1 WHERE id = ?2",
            params![now_millis(), test_case_id],
        )?;
        if updated == 0 {
            return Err(Error::not_found("test case", test_case_id));
        }
        tx.execute("DELETE FROM steps WHERE test_case_id = ?1", params![test_case_id])?;
        let stored = insert_steps(&tx, test_case_id, steps)?;
        tx.commit()?;
        Ok(stored)
    }

    pub fn get_test_case(&self, id: &str) -> Result<Option<TestCase>> {
        let conn = self.conn.lock();
        let test_case = conn
            .query_row(
                "SELECT id, project_id, title, created_at, updated_at FROM test_cases WHERE id = ?1",
                params![id],
                |row| {
                    Ok(TestCase {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        title: row.get(2)?,
                        created_at: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(test_case)
    }

    pub fn list_test_cases(&self, project_id: &str) -> Result<Vec<TestCase>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, project_id, title, created_at, updated_at FROM test_cases
             WHERE project_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![project_id], |row| {
            Ok(TestCase {
                id: row.get(0)?,
                project_id: row.get(1)?,
                title: row.get(2)?,
                created_at: row.get(3)?,
                updated_at: row.get(4)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Steps of a test case in ascending order
    pub fn list_steps(&self, test_case_id: &str) -> Result<Vec<Step>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, test_case_id, step_order, raw_text, parsed_action_json FROM steps
             WHERE test_case_id = ?1 ORDER BY step_order ASC",
        )?;
        let rows = stmt.query_map(params![test_case_id], |row| {
            Ok(Step {
                id: row.get(0)?,
                test_case_id: row.get(1)?,
                order: row.get(2)?,
                raw_text: row.get(3)?,
                parsed_action_json: row.get(4)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn delete_test_case(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM test_cases WHERE id = ?1", params![id])?;
        if rows > 0 {
            debug!("Deleted test case {}", id);
        }
        Ok(rows > 0)
    }

    // ========================================================================
    // Runs
    // ========================================================================

    pub fn insert_run(&self, run: &Run) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO runs (id, test_case_id, browser, status, started_at, ended_at, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.id,
                run.test_case_id,
                run.browser.as_str(),
                run.status.as_str(),
                run.started_at,
                run.ended_at,
                run.error,
            ],
        )?;
        debug!("Inserted run {} ({})", run.id, run.status);
        Ok(())
    }

    /// Move a run to `next`, enforcing the run state machine.
    ///
    /// Terminal transitions stamp `ended_at`; it is never overwritten.
    pub fn transition_run(&self, id: &str, next: RunStatus, error: Option<&str>) -> Result<Run> {
        let mut run = self
            .get_run(id)?
            .ok_or_else(|| Error::not_found("run", id))?;

        if !run.status.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: run.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = now_millis();
        run.status = next;
        if next == RunStatus::Running {
            run.started_at = now;
        }
        if next.is_terminal() {
            run.ended_at = Some(now);
        }
        if let Some(error) = error {
            run.error = Some(error.to_string());
        }

        let conn = self.conn.lock();
        conn.execute(
            "UPDATE runs SET status = ?1, started_at = ?2, ended_at = ?3, error = ?4 WHERE id = ?5",
            params![run.status.as_str(), run.started_at, run.ended_at, run.error, run.id],
        )?;

        debug!("Run {} -> {}", run.id, run.status);
        Ok(run)
    }

    /// Remove a run that never left `queued`, with any step results
    pub fn delete_queued_run(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM step_results WHERE run_id = ?1", params![id])?;
        let rows = conn.execute(
            "DELETE FROM runs WHERE id = ?1 AND status = 'queued'",
            params![id],
        )?;
        Ok(rows > 0)
    }

    pub fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                "SELECT id, test_case_id, browser, status, started_at, ended_at, error
                 FROM runs WHERE id = ?1",
                params![id],
                RawRun::from_row,
            )
            .optional()?;
        raw.map(RawRun::parse).transpose()
    }

    /// Runs of a test case, newest first
    pub fn list_runs(&self, test_case_id: &str) -> Result<Vec<Run>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, test_case_id, browser, status, started_at, ended_at, error
             FROM runs WHERE test_case_id = ?1 ORDER BY started_at DESC, rowid DESC",
        )?;
        let rows = stmt.query_map(params![test_case_id], RawRun::from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?.parse()?);
        }
        Ok(results)
    }

    /// Ids of every run recorded against a project's test cases
    pub fn list_run_ids_for_project(&self, project_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT runs.id FROM runs JOIN test_cases ON runs.test_case_id = test_cases.id
             WHERE test_cases.project_id = ?1",
        )?;
        let rows = stmt.query_map(params![project_id], |row| row.get(0))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn count_runs(&self, test_case_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE test_case_id = ?1",
            params![test_case_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Mark runs left non-terminal by a previous process as failed.
    ///
    /// Returns the number of runs repaired.
    pub fn recover_interrupted_runs(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let now = now_millis();
        conn.execute(
            "UPDATE step_results SET status = 'failed', error_text = 'Run was interrupted', ended_at = ?1
             WHERE status = 'pending'",
            params![now],
        )?;
        let rows = conn.execute(
            "UPDATE runs SET status = 'failed', ended_at = ?1, error = 'Run was interrupted'
             WHERE status IN ('queued', 'running')",
            params![now],
        )?;
        if rows > 0 {
            warn!("Recovered {} interrupted run(s)", rows);
        }
        Ok(rows)
    }

    // ========================================================================
    // Step results
    // ========================================================================

    pub fn insert_step_result(&self, result: &StepResult) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO step_results
             (id, run_id, step_id, step_order, status, error_text, screenshot_path, started_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                result.id,
                result.run_id,
                result.step_id,
                result.order,
                result.status.as_str(),
                result.error_text,
                result.screenshot_path,
                result.started_at,
                result.ended_at,
            ],
        )?;
        Ok(())
    }

    /// Record the terminal outcome of a step
    pub fn finish_step_result(&self, result: &StepResult) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE step_results SET status = ?1, error_text = ?2, screenshot_path = ?3, ended_at = ?4
             WHERE id = ?5 AND status = 'pending'",
            params![
                result.status.as_str(),
                result.error_text,
                result.screenshot_path,
                result.ended_at,
                result.id,
            ],
        )?;
        if rows == 0 {
            return Err(Error::InvalidStateTransition {
                from: "terminal".to_string(),
                to: result.status.to_string(),
            });
        }
        Ok(())
    }

    /// Fail every step result of a run still `pending`; returns how many
    pub fn fail_pending_step_results(&self, run_id: &str, error: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE step_results SET status = 'failed', error_text = ?1, ended_at = ?2
             WHERE run_id = ?3 AND status = 'pending'",
            params![error, now_millis(), run_id],
        )?;
        Ok(rows)
    }

    pub fn list_step_results(&self, run_id: &str) -> Result<Vec<StepResult>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, step_id, step_order, status, error_text, screenshot_path, started_at, ended_at
             FROM step_results WHERE run_id = ?1 ORDER BY step_order ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(RawStepResult {
                id: row.get(0)?,
                run_id: row.get(1)?,
                step_id: row.get(2)?,
                order: row.get(3)?,
                status: row.get(4)?,
                error_text: row.get(5)?,
                screenshot_path: row.get(6)?,
                started_at: row.get(7)?,
                ended_at: row.get(8)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?.parse()?);
        }
        Ok(results)
    }
}

fn insert_steps(tx: &rusqlite::Transaction<'_>, test_case_id: &str, steps: &[NewStep]) -> Result<Vec<Step>> {
    let mut stored = Vec::with_capacity(steps.len());
    for (index, step) in steps.iter().enumerate() {
        let step = Step {
            id: new_id(),
            test_case_id: test_case_id.to_string(),
            order: index as u32 + 1,
            raw_text: step.raw_text.clone(),
            parsed_action_json: step.parsed_action_json.clone(),
        };
        tx.execute(
            "INSERT INTO steps (id, test_case_id, step_order, raw_text, parsed_action_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![step.id, step.test_case_id, step.order, step.raw_text, step.parsed_action_json],
        )?;
        stored.push(step);
    }
    Ok(stored)
}

/// Raw run row before parsing
struct RawRun {
    id: String,
    test_case_id: String,
    browser: String,
    status: String,
    started_at: i64,
    ended_at: Option<i64>,
    error: Option<String>,
}

impl RawRun {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            test_case_id: row.get(1)?,
            browser: row.get(2)?,
            status: row.get(3)?,
            started_at: row.get(4)?,
            ended_at: row.get(5)?,
            error: row.get(6)?,
        })
    }

    fn parse(self) -> Result<Run> {
        Ok(Run {
            id: self.id,
            test_case_id: self.test_case_id,
            browser: self.browser.parse()?,
            status: self.status.parse()?,
            started_at: self.started_at,
            ended_at: self.ended_at,
            error: self.error,
        })
    }
}

struct RawStepResult {
    id: String,
    run_id: String,
    step_id: String,
    order: u32,
    status: String,
    error_text: Option<String>,
    screenshot_path: Option<String>,
    started_at: i64,
    ended_at: Option<i64>,
}

impl RawStepResult {
    fn parse(self) -> Result<StepResult> {
        Ok(StepResult {
            id: self.id,
            run_id: self.run_id,
            step_id: self.step_id,
            order: self.order,
            status: self.status.parse()?,
            error_text: self.error_text,
            screenshot_path: self.screenshot_path,
            started_at: self.started_at,
            ended_at: self.ended_at,
        })
    }
}
