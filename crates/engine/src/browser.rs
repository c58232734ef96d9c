//! Browser engine availability and installation
//!
//! Installs are single-flight per engine: the first caller spawns the
//! install task and every concurrent caller awaits the same shared future.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use qaflow_common::{Browser, BrowserInstallState};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::events::{EventBus, InstallEvent, InstallPhase};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstallError {
    #[error("{0}")]
    Failed(String),
}

/// Probes and installs browser engines on this host
#[async_trait]
pub trait EngineInstaller: Send + Sync {
    async fn is_installed(&self, browser: Browser) -> bool;

    /// Install the engine; the error string becomes `lastError`
    async fn install(&self, browser: Browser) -> Result<(), String>;
}

/// Installer backed by the Playwright CLI and its browser cache
#[derive(Debug, Clone)]
pub struct PlaywrightInstaller {
    npx: String,
    browsers_path: PathBuf,
}

impl PlaywrightInstaller {
    pub fn new(browsers_path: Option<PathBuf>) -> Self {
        Self {
            npx: "npx".to_string(),
            browsers_path: browsers_path.unwrap_or_else(default_browsers_path),
        }
    }
}

/// `PLAYWRIGHT_BROWSERS_PATH`, else the per-user Playwright cache
pub fn default_browsers_path() -> PathBuf {
    if let Some(path) = std::env::var_os("PLAYWRIGHT_BROWSERS_PATH") {
        return PathBuf::from(path);
    }
    qaflow_common::dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cache")
        .join("ms-playwright")
}

/// Whether a cache entry name looks like `<engine>-<revision>`
fn is_engine_dir(name: &str, browser: Browser) -> bool {
    name.strip_prefix(browser.as_str())
        .and_then(|rest| rest.strip_prefix('-'))
        .map(|rev| !rev.is_empty() && rev.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

#[async_trait]
impl EngineInstaller for PlaywrightInstaller {
    async fn is_installed(&self, browser: Browser) -> bool {
        let mut entries = match tokio::fs::read_dir(&self.browsers_path).await {
            Ok(entries) => entries,
            Err(_) => return false,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if is_engine_dir(&name.to_string_lossy(), browser) {
                return true;
            }
        }
        false
    }

    async fn install(&self, browser: Browser) -> Result<(), String> {
        info!("Running {} playwright install {}", self.npx, browser);

        let output = Command::new(&self.npx)
            .args(["playwright", "install", browser.as_str()])
            .env("PLAYWRIGHT_BROWSERS_PATH", &self.browsers_path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| format!("Failed to run {}: {}", self.npx, e))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no output")
            .trim()
            .to_string();
        Err(format!(
            "playwright install {} exited with {}: {}",
            browser, output.status, detail
        ))
    }
}

type InstallFuture = Shared<BoxFuture<'static, Result<(), InstallError>>>;

/// Tracks install state per engine and coordinates installs
pub struct BrowserRuntime {
    installer: Arc<dyn EngineInstaller>,
    states: Mutex<HashMap<Browser, BrowserInstallState>>,
    inflight: Mutex<HashMap<Browser, InstallFuture>>,
    events: EventBus<InstallEvent>,
}

impl BrowserRuntime {
    pub fn new(installer: Arc<dyn EngineInstaller>) -> Arc<Self> {
        let states = Browser::ALL
            .iter()
            .map(|b| (*b, BrowserInstallState::new(*b)))
            .collect();
        Arc::new(Self {
            installer,
            states: Mutex::new(states),
            inflight: Mutex::new(HashMap::new()),
            events: EventBus::new(),
        })
    }

    /// Snapshot of every supported engine
    pub fn status(&self) -> Vec<BrowserInstallState> {
        let states = self.states.lock();
        Browser::ALL
            .iter()
            .map(|b| states.get(b).cloned().unwrap_or_else(|| BrowserInstallState::new(*b)))
            .collect()
    }

    pub fn state(&self, browser: Browser) -> BrowserInstallState {
        self.states
            .lock()
            .get(&browser)
            .cloned()
            .unwrap_or_else(|| BrowserInstallState::new(browser))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstallEvent> {
        self.events.subscribe()
    }

    /// Re-probe the installer for every engine not currently installing
    pub async fn refresh(&self) -> Vec<BrowserInstallState> {
        for browser in Browser::ALL {
            if self.state(browser).install_in_progress {
                continue;
            }
            let installed = self.installer.is_installed(browser).await;
            self.update(browser, |s| s.installed = installed);
        }
        self.status()
    }

    /// Make sure `browser` is usable, installing it if needed
    pub async fn ensure_installed(
        self: &Arc<Self>,
        browser: Browser,
    ) -> Result<BrowserInstallState, InstallError> {
        let state = self.state(browser);
        if state.installed {
            return Ok(state);
        }
        if !state.install_in_progress && self.installer.is_installed(browser).await {
            self.update(browser, |s| s.installed = true);
            return Ok(self.state(browser));
        }

        let install = {
            let mut inflight = self.inflight.lock();
            match inflight.get(&browser) {
                Some(existing) => {
                    debug!("Joining in-flight install of {}", browser);
                    existing.clone()
                }
                None => {
                    if self.state(browser).installed {
                        return Ok(self.state(browser));
                    }
                    // Mark in progress before the lock drops so status never
                    // shows an idle engine that has an install queued.
                    self.update(browser, |s| {
                        s.install_in_progress = true;
                        s.last_error = None;
                    });
                    let runtime = Arc::clone(self);
                    let task = tokio::spawn(async move { runtime.run_install(browser).await });
                    let install = async move {
                        task.await
                            .map_err(|e| InstallError::Failed(format!("Install task failed: {}", e)))?
                    }
                    .boxed()
                    .shared();
                    inflight.insert(browser, install.clone());
                    install
                }
            }
        };

        install.await?;
        Ok(self.state(browser))
    }

    async fn run_install(&self, browser: Browser) -> Result<(), InstallError> {
        self.emit(browser, InstallPhase::Starting, None);
        info!("Installing browser engine {}", browser);
        self.emit(browser, InstallPhase::Installing, None);

        let result = self.installer.install(browser).await;

        match &result {
            Ok(()) => self.update(browser, |s| {
                s.installed = true;
                s.install_in_progress = false;
                s.last_error = None;
            }),
            Err(e) => self.update(browser, |s| {
                s.installed = false;
                s.install_in_progress = false;
                s.last_error = Some(e.clone());
            }),
        }
        self.inflight.lock().remove(&browser);

        match result {
            Ok(()) => {
                info!("Browser engine {} installed", browser);
                self.emit(browser, InstallPhase::Completed, None);
                Ok(())
            }
            Err(e) => {
                warn!("Browser engine {} install failed: {}", browser, e);
                self.emit(browser, InstallPhase::Failed, Some(e.clone()));
                Err(InstallError::Failed(e))
            }
        }
    }

    fn update(&self, browser: Browser, f: impl FnOnce(&mut BrowserInstallState)) {
        let mut states = self.states.lock();
        let state = states
            .entry(browser)
            .or_insert_with(|| BrowserInstallState::new(browser));
        f(state);
    }

    fn emit(&self, browser: Browser, phase: InstallPhase, error: Option<String>) {
        self.events.emit(InstallEvent {
            browser,
            phase,
            error,
        });
    }
}
