//! Scripted browser driver and installer for engine tests
//!
//! Steps are keyed by their action target (`Go to` path, `Click`/`Enter`
//! target, `Expect` assertion); anything unscripted passes.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use qaflow_common::{Browser, Database, TestCase};
use qaflow_engine::driver::{BrowserDriver, BrowserSession, DriverError};
use qaflow_engine::{
    ArtifactStore, BrowserRuntime, EngineInstaller, ParsedAction, RunEngine, RunEvent, RunOptions,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub const FAKE_PNG: &[u8] = b"\x89PNG\r\n\x1a\nfake";

#[derive(Debug, Clone)]
pub enum Behavior {
    Pass,
    Fail(String),
    Delay(Duration),
    Hang,
}

fn key(action: &ParsedAction) -> String {
    match action {
        ParsedAction::Enter { target, .. } | ParsedAction::Click { target, .. } => target.clone(),
        ParsedAction::Goto { path } => path.clone(),
        ParsedAction::Expect { assertion, .. } => assertion.clone(),
    }
}

#[derive(Default)]
pub struct ScriptedDriver {
    script: Mutex<HashMap<String, Behavior>>,
    launch_error: Mutex<Option<String>>,
    screenshot_error: Mutex<bool>,
    executed: Arc<Mutex<Vec<ParsedAction>>>,
    launches: AtomicUsize,
}

impl ScriptedDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(&self, target: &str, behavior: Behavior) {
        self.script.lock().insert(target.to_string(), behavior);
    }

    pub fn fail_launch(&self, reason: &str) {
        *self.launch_error.lock() = Some(reason.to_string());
    }

    pub fn fail_screenshots(&self) {
        *self.screenshot_error.lock() = true;
    }

    pub fn executed(&self) -> Vec<ParsedAction> {
        self.executed.lock().clone()
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserDriver for ScriptedDriver {
    async fn launch(&self, _browser: Browser) -> Result<Box<dyn BrowserSession>, DriverError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.launch_error.lock().clone() {
            return Err(DriverError::Launch(reason));
        }
        Ok(Box::new(ScriptedSession {
            script: self.script.lock().clone(),
            screenshot_error: *self.screenshot_error.lock(),
            executed: Arc::clone(&self.executed),
        }))
    }
}

struct ScriptedSession {
    script: HashMap<String, Behavior>,
    screenshot_error: bool,
    executed: Arc<Mutex<Vec<ParsedAction>>>,
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    async fn execute(&mut self, action: &ParsedAction) -> Result<(), DriverError> {
        self.executed.lock().push(action.clone());
        match self.script.get(&key(action)).cloned().unwrap_or(Behavior::Pass) {
            Behavior::Pass => Ok(()),
            Behavior::Fail(msg) => Err(DriverError::Action(msg)),
            Behavior::Delay(d) => {
                tokio::time::sleep(d).await;
                Ok(())
            }
            Behavior::Hang => std::future::pending().await,
        }
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, DriverError> {
        if self.screenshot_error {
            Err(DriverError::Screenshot("page crashed".to_string()))
        } else {
            Ok(FAKE_PNG.to_vec())
        }
    }

    async fn close(&mut self) {}
}

pub struct ScriptedInstaller {
    installed: Mutex<bool>,
    failure: Option<String>,
    delay: Duration,
    pub calls: AtomicUsize,
}

impl ScriptedInstaller {
    pub fn installed() -> Arc<Self> {
        Arc::new(Self {
            installed: Mutex::new(true),
            failure: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn missing(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            installed: Mutex::new(false),
            failure: None,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn broken(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            installed: Mutex::new(false),
            failure: Some(reason.to_string()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl EngineInstaller for ScriptedInstaller {
    async fn is_installed(&self, _browser: Browser) -> bool {
        *self.installed.lock()
    }

    async fn install(&self, _browser: Browser) -> Result<(), String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        match &self.failure {
            Some(reason) => Err(reason.clone()),
            None => {
                *self.installed.lock() = true;
                Ok(())
            }
        }
    }
}

pub struct Harness {
    pub engine: RunEngine,
    pub driver: Arc<ScriptedDriver>,
    pub installer: Arc<ScriptedInstaller>,
    pub dir: TempDir,
}

pub fn options(continue_on_failure: bool) -> RunOptions {
    RunOptions {
        continue_on_failure,
        step_timeout: Duration::from_secs(2),
    }
}

pub fn harness_with(installer: Arc<ScriptedInstaller>, options: RunOptions) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let driver = ScriptedDriver::new();
    let engine = RunEngine::new(
        Database::open_memory().unwrap(),
        BrowserRuntime::new(installer.clone()),
        driver.clone(),
        ArtifactStore::new(dir.path().join("artifacts")).unwrap(),
        options,
    );
    Harness {
        engine,
        driver,
        installer,
        dir,
    }
}

pub fn harness() -> Harness {
    harness_with(ScriptedInstaller::installed(), options(false))
}

/// Create a project holding one test case with the given script
pub fn seed(engine: &RunEngine, lines: &[&str]) -> TestCase {
    let project = engine.create_project("Shop").unwrap();
    let lines: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
    engine
        .create_test_case(&project.id, "Checkout", &lines)
        .unwrap()
        .0
}

/// Collect events until the run finishes
pub async fn collect_until_finished(rx: &mut broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("run did not finish in time")
            .expect("event channel closed");
        let done = matches!(event, RunEvent::RunFinished { .. });
        events.push(event);
        if done {
            return events;
        }
    }
}
