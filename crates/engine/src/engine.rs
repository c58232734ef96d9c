//! Run execution engine
//!
//! Owns the run lifecycle `queued -> running -> {passed, failed, cancelled}`.
//! A run is started synchronously up to the point where its row exists and
//! the registry slot is active, then the step loop continues on a spawned
//! task. Every state change is written to the store before the matching
//! [`RunEvent`] is emitted.

use qaflow_common::{
    new_id, now_millis, ActiveRunContext, Browser, Database, NewStep, Project, Run, RunStatus,
    Step, StepResult, StepStatus, TestCase,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::artifact::ArtifactStore;
use crate::browser::{BrowserRuntime, PlaywrightInstaller};
use crate::config::{EngineSettings, QaflowConfig};
use crate::driver::{BrowserDriver, BrowserSession, PlaywrightDriver};
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, RunEvent};
use crate::parser::{self, ParsedAction};
use crate::registry::{ActiveRun, RunRegistry};

/// Per-run execution policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub continue_on_failure: bool,
    pub step_timeout: Duration,
}

/// Longest per-step timeout a run accepts
pub const MAX_STEP_TIMEOUT: Duration = Duration::from_secs(3600);

impl RunOptions {
    /// Reject timeouts the step loop cannot honour
    pub fn validate(&self) -> EngineResult<()> {
        if self.step_timeout.is_zero() || self.step_timeout > MAX_STEP_TIMEOUT {
            return Err(EngineError::Validation(format!(
                "Step timeout must be greater than zero and at most {}s.",
                MAX_STEP_TIMEOUT.as_secs()
            )));
        }
        Ok(())
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from(&EngineSettings::default())
    }
}

impl From<&EngineSettings> for RunOptions {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            continue_on_failure: settings.continue_on_failure,
            step_timeout: settings.step_timeout(),
        }
    }
}

/// A started run; the step loop keeps going if this is dropped
#[derive(Debug)]
pub struct RunHandle {
    run: Run,
    task: JoinHandle<Run>,
}

impl RunHandle {
    /// The run as it was when the step loop was spawned (status `running`)
    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn run_id(&self) -> &str {
        &self.run.id
    }

    /// Wait for the run to reach a terminal status
    pub async fn wait(self) -> EngineResult<Run> {
        self.task
            .await
            .map_err(|e| EngineError::Internal(format!("run task failed: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Accepted,
    NoActiveRun,
}

impl CancelOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            CancelOutcome::Accepted => "cancel requested",
            CancelOutcome::NoActiveRun => "no active run to cancel",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStatusReport {
    pub run: Run,
    pub steps: Vec<StepResult>,
}

/// One step of a [`RunReport`]
#[derive(Debug, Clone, Serialize)]
pub struct ReportStep {
    pub order: u32,
    pub step_id: String,
    pub raw_text: Option<String>,
    pub action: Option<String>,
    pub status: StepStatus,
    pub error_text: Option<String>,
    pub screenshot_path: Option<String>,
    pub screenshot_sha256: Option<String>,
}

/// Everything a bug report about one run needs
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run: Run,
    pub test_case: TestCase,
    pub steps: Vec<ReportStep>,
}

struct EngineInner {
    db: Database,
    registry: Arc<RunRegistry>,
    browsers: Arc<BrowserRuntime>,
    driver: Arc<dyn BrowserDriver>,
    artifacts: ArtifactStore,
    options: RunOptions,
    events: EventBus<RunEvent>,
}

#[derive(Clone)]
pub struct RunEngine {
    inner: Arc<EngineInner>,
}

impl RunEngine {
    pub fn new(
        db: Database,
        browsers: Arc<BrowserRuntime>,
        driver: Arc<dyn BrowserDriver>,
        artifacts: ArtifactStore,
        options: RunOptions,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                db,
                registry: RunRegistry::new(),
                browsers,
                driver,
                artifacts,
                options,
                events: EventBus::new(),
            }),
        }
    }

    /// Wire up the production stack: SQLite store, Playwright installer and driver
    pub fn from_config(config: &QaflowConfig) -> EngineResult<Self> {
        let db = Database::open(config.db_path())?;
        let artifacts = ArtifactStore::new(config.artifacts_path())?;
        let installer = PlaywrightInstaller::new(config.browser.browsers_path.clone());
        let browsers = BrowserRuntime::new(Arc::new(installer));
        let driver = PlaywrightDriver::new(config.browser.clone(), config.engine.step_timeout());

        Ok(Self::new(
            db,
            browsers,
            Arc::new(driver),
            artifacts,
            RunOptions::from(&config.engine),
        ))
    }

    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    pub fn browsers(&self) -> &Arc<BrowserRuntime> {
        &self.inner.browsers
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.inner.artifacts
    }

    pub fn options(&self) -> RunOptions {
        self.inner.options
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.events.subscribe()
    }

    // ========================================================================
    // Runs
    // ========================================================================

    /// Start a run with the engine's default options
    pub async fn start(&self, test_case_id: &str, browser: Browser) -> EngineResult<RunHandle> {
        self.start_with(test_case_id, browser, self.inner.options).await
    }

    pub async fn start_with(
        &self,
        test_case_id: &str,
        browser: Browser,
        options: RunOptions,
    ) -> EngineResult<RunHandle> {
        let inner = &self.inner;
        options.validate()?;

        let test_case = inner
            .db
            .get_test_case(test_case_id)?
            .ok_or_else(|| EngineError::not_found("test case", test_case_id))?;
        let steps = inner.db.list_steps(&test_case.id)?;
        if steps.is_empty() {
            return Err(EngineError::Validation("Test case has no steps.".to_string()));
        }

        let reservation = inner.registry.reserve(&test_case.project_id, &test_case.id)?;

        if let Err(e) = inner.browsers.ensure_installed(browser).await {
            warn!("Cannot start run on {}: {}", browser, e);
            return Err(EngineError::Environment(e.to_string()));
        }

        let queued = Run {
            id: new_id(),
            test_case_id: test_case.id.clone(),
            browser,
            status: RunStatus::Queued,
            started_at: now_millis(),
            ended_at: None,
            error: None,
        };
        inner.db.insert_run(&queued)?;
        let run = match inner.db.transition_run(&queued.id, RunStatus::Running, None) {
            Ok(run) => run,
            Err(e) => {
                if let Err(cleanup) = inner.db.delete_queued_run(&queued.id) {
                    warn!("Failed to remove unstarted run {}: {}", queued.id, cleanup);
                }
                return Err(e.into());
            }
        };
        let active = reservation.activate(&run.id);

        info!(
            "Run {} started for test case {} on {} ({} step(s))",
            run.id,
            test_case.id,
            browser,
            steps.len()
        );
        inner.events.emit(RunEvent::RunStarted {
            run_id: run.id.clone(),
            test_case_id: test_case.id.clone(),
            browser,
        });

        let task_inner = Arc::clone(inner);
        let task_run = run.clone();
        let task = tokio::spawn(async move { task_inner.drive(task_run, steps, active, options).await });

        Ok(RunHandle { run, task })
    }

    /// Start a run and wait for it to finish
    pub async fn execute(&self, test_case_id: &str, browser: Browser) -> EngineResult<Run> {
        self.start(test_case_id, browser).await?.wait().await
    }

    /// Ask the active run to stop; never an error
    pub fn cancel(&self, run_id: &str) -> CancelOutcome {
        if self.inner.registry.request_cancel(run_id) {
            info!("Cancel requested for run {}", run_id);
            CancelOutcome::Accepted
        } else {
            debug!("Ignoring cancel for run {}: not active", run_id);
            CancelOutcome::NoActiveRun
        }
    }

    pub fn active_context(&self) -> Option<ActiveRunContext> {
        self.inner.registry.active_context()
    }

    pub fn status(&self, run_id: &str) -> EngineResult<RunStatusReport> {
        let run = self.get_run(run_id)?;
        let steps = self.inner.db.list_step_results(run_id)?;
        Ok(RunStatusReport { run, steps })
    }

    /// Runs of a test case, newest first
    pub fn history(&self, test_case_id: &str) -> EngineResult<Vec<Run>> {
        self.get_test_case(test_case_id)?;
        Ok(self.inner.db.list_runs(test_case_id)?)
    }

    pub fn step_results(&self, run_id: &str) -> EngineResult<Vec<StepResult>> {
        self.get_run(run_id)?;
        Ok(self.inner.db.list_step_results(run_id)?)
    }

    /// Collect a run with its step text, actions and screenshot digests
    pub fn report(&self, run_id: &str) -> EngineResult<RunReport> {
        let run = self.get_run(run_id)?;
        let test_case = self.get_test_case(&run.test_case_id)?;
        let steps = self.inner.db.list_steps(&test_case.id)?;

        let report_steps = self
            .inner
            .db
            .list_step_results(run_id)?
            .into_iter()
            .map(|result| {
                let step = steps.iter().find(|s| s.id == result.step_id);
                let action = step
                    .and_then(|s| resolve_action(s).ok())
                    .map(|a| parser::describe(&a));
                let screenshot_sha256 = result
                    .screenshot_path
                    .as_ref()
                    .and_then(|p| self.inner.artifacts.digest(p).ok());
                ReportStep {
                    order: result.order,
                    step_id: result.step_id,
                    raw_text: step.map(|s| s.raw_text.clone()),
                    action,
                    status: result.status,
                    error_text: result.error_text,
                    screenshot_path: result.screenshot_path,
                    screenshot_sha256,
                }
            })
            .collect();

        Ok(RunReport {
            run,
            test_case,
            steps: report_steps,
        })
    }

    pub fn get_run(&self, run_id: &str) -> EngineResult<Run> {
        self.inner
            .db
            .get_run(run_id)?
            .ok_or_else(|| EngineError::not_found("run", run_id))
    }

    // ========================================================================
    // Projects and test cases
    // ========================================================================

    pub fn create_project(&self, name: &str) -> EngineResult<Project> {
        Ok(self.inner.db.create_project(name)?)
    }

    pub fn list_projects(&self) -> EngineResult<Vec<Project>> {
        Ok(self.inner.db.list_projects()?)
    }

    pub fn get_project(&self, id: &str) -> EngineResult<Project> {
        self.inner
            .db
            .get_project(id)?
            .ok_or_else(|| EngineError::not_found("project", id))
    }

    /// Delete a project, its test cases, runs and screenshots
    pub fn delete_project(&self, id: &str) -> EngineResult<()> {
        let inner = &self.inner;
        let run_ids = inner.db.list_run_ids_for_project(id)?;

        inner.registry.delete_project_guarded(id, || {
            if inner.db.delete_project(id)? {
                Ok(())
            } else {
                Err(EngineError::not_found("project", id))
            }
        })?;

        self.remove_artifacts(&run_ids);
        info!("Deleted project {}", id);
        Ok(())
    }

    pub fn list_test_cases(&self, project_id: &str) -> EngineResult<Vec<TestCase>> {
        self.get_project(project_id)?;
        Ok(self.inner.db.list_test_cases(project_id)?)
    }

    pub fn get_test_case(&self, id: &str) -> EngineResult<TestCase> {
        self.inner
            .db
            .get_test_case(id)?
            .ok_or_else(|| EngineError::not_found("test case", id))
    }

    pub fn list_steps(&self, test_case_id: &str) -> EngineResult<Vec<Step>> {
        self.get_test_case(test_case_id)?;
        Ok(self.inner.db.list_steps(test_case_id)?)
    }

    /// Create a test case from script lines; every line must parse
    pub fn create_test_case(
        &self,
        project_id: &str,
        title: &str,
        lines: &[String],
    ) -> EngineResult<(TestCase, Vec<Step>)> {
        let steps = materialize(lines)?;
        Ok(self.inner.db.create_test_case(project_id, title, &steps)?)
    }

    /// Replace the steps of a test case; runs already started keep their snapshot
    pub fn update_steps(&self, test_case_id: &str, lines: &[String]) -> EngineResult<Vec<Step>> {
        let steps = materialize(lines)?;
        Ok(self.inner.db.replace_steps(test_case_id, &steps)?)
    }

    pub fn delete_test_case(&self, id: &str) -> EngineResult<()> {
        let inner = &self.inner;
        let run_ids: Vec<String> = inner.db.list_runs(id)?.into_iter().map(|r| r.id).collect();

        inner.registry.delete_test_case_guarded(id, || {
            if inner.db.delete_test_case(id)? {
                Ok(())
            } else {
                Err(EngineError::not_found("test case", id))
            }
        })?;

        self.remove_artifacts(&run_ids);
        info!("Deleted test case {}", id);
        Ok(())
    }

    fn remove_artifacts(&self, run_ids: &[String]) {
        for run_id in run_ids {
            if let Err(e) = self.inner.artifacts.remove_run(run_id) {
                warn!("Failed to remove artifacts of run {}: {}", run_id, e);
            }
        }
    }
}

impl EngineInner {
    /// Step loop plus finalization; always yields a terminal run
    async fn drive(
        self: Arc<Self>,
        run: Run,
        steps: Vec<Step>,
        active: ActiveRun,
        options: RunOptions,
    ) -> Run {
        let mut session = match self.driver.launch(run.browser).await {
            Ok(session) => session,
            Err(e) => {
                error!("Run {} could not launch {}: {}", run.id, run.browser, e);
                return self.finalize(&run, active, Some(e.to_string()), false);
            }
        };

        let outcome = self
            .run_steps(&run, &steps, session.as_mut(), &active, &options)
            .await;
        session.close().await;

        match outcome {
            Ok(any_failed) => self.finalize(&run, active, None, any_failed),
            Err(e) => {
                error!("Run {} aborted: {}", run.id, e);
                let reason = e.to_string();
                if let Err(e) = self.db.fail_pending_step_results(&run.id, &reason) {
                    warn!("Failed to close step results of run {}: {}", run.id, e);
                }
                self.finalize(&run, active, Some(reason), true)
            }
        }
    }

    /// Execute steps in order; returns whether any step failed
    async fn run_steps(
        &self,
        run: &Run,
        steps: &[Step],
        session: &mut dyn BrowserSession,
        active: &ActiveRun,
        options: &RunOptions,
    ) -> EngineResult<bool> {
        let mut any_failed = false;

        for step in steps {
            if active.cancel_requested() {
                debug!("Run {} cancelled before step {}", run.id, step.order);
                break;
            }

            match self.execute_step(run, step, session, active, options).await? {
                StepStatus::Failed => {
                    any_failed = true;
                    if !options.continue_on_failure {
                        break;
                    }
                }
                StepStatus::Cancelled => break,
                _ => {}
            }
        }

        Ok(any_failed)
    }

    async fn execute_step(
        &self,
        run: &Run,
        step: &Step,
        session: &mut dyn BrowserSession,
        active: &ActiveRun,
        options: &RunOptions,
    ) -> EngineResult<StepStatus> {
        let mut result = StepResult {
            id: new_id(),
            run_id: run.id.clone(),
            step_id: step.id.clone(),
            order: step.order,
            status: StepStatus::Pending,
            error_text: None,
            screenshot_path: None,
            started_at: now_millis(),
            ended_at: None,
        };
        self.db.insert_step_result(&result)?;
        self.events.emit(RunEvent::StepStarted {
            run_id: run.id.clone(),
            step_id: step.id.clone(),
            order: step.order,
        });

        let outcome = match resolve_action(step) {
            Ok(action) => {
                let budget = options.step_timeout.saturating_add(action.requested_wait());
                debug!("Step {}: {}", step.order, parser::describe(&action));
                match tokio::time::timeout(budget, session.execute(&action)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("Step timed out after {}s", budget.as_secs_f64())),
                }
            }
            Err(e) => Err(e.to_string()),
        };

        result.screenshot_path = self
            .capture(&run.id, &step.id, session, options.step_timeout)
            .await;

        result.status = if active.cancel_requested() {
            StepStatus::Cancelled
        } else if outcome.is_ok() {
            StepStatus::Passed
        } else {
            StepStatus::Failed
        };
        if result.status == StepStatus::Failed {
            result.error_text = outcome.err();
        }
        result.ended_at = Some(now_millis());

        self.db.finish_step_result(&result)?;
        if let Some(err) = &result.error_text {
            debug!("Step {} failed: {}", step.order, err);
        }
        self.events.emit(RunEvent::StepFinished {
            run_id: run.id.clone(),
            step_id: step.id.clone(),
            order: step.order,
            status: result.status,
        });

        Ok(result.status)
    }

    /// Screenshot the page; failures only cost the artifact
    async fn capture(
        &self,
        run_id: &str,
        step_id: &str,
        session: &mut dyn BrowserSession,
        timeout: Duration,
    ) -> Option<String> {
        let png = match tokio::time::timeout(timeout, session.screenshot()).await {
            Ok(Ok(png)) => png,
            Ok(Err(e)) => {
                warn!("Screenshot for step {} failed: {}", step_id, e);
                return None;
            }
            Err(_) => {
                warn!("Screenshot for step {} timed out", step_id);
                return None;
            }
        };

        let artifacts = self.artifacts.clone();
        let run_id = run_id.to_string();
        let step_id = step_id.to_string();
        match tokio::task::spawn_blocking(move || artifacts.capture(&run_id, &step_id, &png)).await {
            Ok(Ok(path)) => Some(path.to_string_lossy().into_owned()),
            Ok(Err(e)) => {
                warn!("Failed to store screenshot: {}", e);
                None
            }
            Err(e) => {
                warn!("Screenshot writer failed: {}", e);
                None
            }
        }
    }

    fn finalize(&self, run: &Run, active: ActiveRun, fatal: Option<String>, any_failed: bool) -> Run {
        let status = if active.cancel_requested() {
            RunStatus::Cancelled
        } else if fatal.is_some() || any_failed {
            RunStatus::Failed
        } else {
            RunStatus::Passed
        };

        let finished = match self.db.transition_run(&run.id, status, fatal.as_deref()) {
            Ok(finished) => finished,
            Err(e) => {
                error!("Failed to record end of run {}: {}", run.id, e);
                let mut fallback = run.clone();
                fallback.status = status;
                fallback.ended_at = Some(now_millis());
                fallback.error = fatal;
                fallback
            }
        };

        drop(active);
        info!("Run {} finished: {}", finished.id, finished.status);
        self.events.emit(RunEvent::RunFinished {
            run_id: finished.id.clone(),
            status: finished.status,
        });
        finished
    }
}

/// Stored action if it still deserializes, else a fresh parse of the text
fn resolve_action(step: &Step) -> Result<ParsedAction, parser::ParseError> {
    if let Some(json) = &step.parsed_action_json {
        if let Ok(action) = serde_json::from_str::<ParsedAction>(json) {
            return Ok(action);
        }
    }
    parser::parse(&step.raw_text).map(|parsed| parsed.action)
}

/// Validate script lines and attach the parsed action to each
fn materialize(lines: &[String]) -> EngineResult<Vec<NewStep>> {
    parser::validate_steps(lines)
        .into_iter()
        .map(|report| match (report.parsed, report.error) {
            (Some(parsed), _) => Ok(NewStep {
                raw_text: report.text.trim().to_string(),
                parsed_action_json: serde_json::to_string(&parsed.action).ok(),
            }),
            (None, error) => Err(EngineError::Validation(format!(
                "Step {}: {}",
                report.line,
                error.unwrap_or_else(|| "invalid step".to_string())
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(raw: &str, json: Option<&str>) -> Step {
        Step {
            id: "s1".into(),
            test_case_id: "t1".into(),
            order: 1,
            raw_text: raw.into(),
            parsed_action_json: json.map(str::to_string),
        }
    }

    #[test]
    fn test_resolve_prefers_stored_action() {
        let stored = r#"{"action":"goto","path":"/stored"}"#;
        let action = resolve_action(&step(r#"Go to "/raw""#, Some(stored))).unwrap();
        assert_eq!(action, ParsedAction::Goto { path: "/stored".into() });
    }

    #[test]
    fn test_resolve_reparses_unreadable_json() {
        let action = resolve_action(&step(r#"Go to "/raw""#, Some("{broken"))).unwrap();
        assert_eq!(action, ParsedAction::Goto { path: "/raw".into() });
        assert!(resolve_action(&step("  ", None)).is_err());
    }

    #[test]
    fn test_materialize_reports_line_number() {
        let lines = vec!["Go to \"/\"".to_string(), "".to_string()];
        let err = materialize(&lines).unwrap_err();
        assert_eq!(err.to_string(), "Step 2: Step cannot be empty.");

        let ok = materialize(&lines[..1]).unwrap();
        assert_eq!(ok.len(), 1);
        assert!(ok[0].parsed_action_json.as_deref().unwrap().contains("goto"));
    }

    #[test]
    fn test_run_options_validation() {
        assert!(RunOptions::default().validate().is_ok());
        let at = |step_timeout| RunOptions {
            continue_on_failure: false,
            step_timeout,
        };
        assert!(at(MAX_STEP_TIMEOUT).validate().is_ok());
        assert!(at(Duration::ZERO).validate().is_err());
        assert!(at(Duration::from_secs(u64::MAX)).validate().is_err());
    }

    #[test]
    fn test_cancel_outcome_messages() {
        assert_eq!(CancelOutcome::NoActiveRun.message(), "no active run to cancel");
    }
}
