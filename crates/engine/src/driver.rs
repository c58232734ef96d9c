//! Browser sessions
//!
//! A run drives exactly one [`BrowserSession`]. The production driver hosts
//! Playwright in a `node` bridge process and talks to it with
//! newline-delimited JSON on stdio.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use qaflow_common::Browser;
use serde::Deserialize;
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::config::BrowserSettings;
use crate::parser::{Assertion, ParsedAction};

const BRIDGE_SCRIPT: &str = include_str!("bridge.js");

/// How long the bridge may take to launch the browser
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Failed to launch browser: {0}")]
    Launch(String),

    #[error("{0}")]
    Action(String),

    #[error("Browser session closed")]
    Closed,

    #[error("Screenshot failed: {0}")]
    Screenshot(String),
}

/// One open page in one browser engine
#[async_trait]
pub trait BrowserSession: Send {
    async fn execute(&mut self, action: &ParsedAction) -> Result<(), DriverError>;

    /// PNG of the current viewport
    async fn screenshot(&mut self) -> Result<Vec<u8>, DriverError>;

    async fn close(&mut self);
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn launch(&self, browser: Browser) -> Result<Box<dyn BrowserSession>, DriverError>;
}

/// Resolve a `Go to` path against the base URL; absolute URLs pass through
pub fn resolve_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Driver that runs the Playwright bridge under Node.js
#[derive(Debug, Clone)]
pub struct PlaywrightDriver {
    settings: BrowserSettings,
    action_timeout: Duration,
}

impl PlaywrightDriver {
    pub fn new(settings: BrowserSettings, action_timeout: Duration) -> Self {
        Self {
            settings,
            action_timeout,
        }
    }
}

#[async_trait]
impl BrowserDriver for PlaywrightDriver {
    async fn launch(&self, browser: Browser) -> Result<Box<dyn BrowserSession>, DriverError> {
        let workdir = tempfile::Builder::new()
            .prefix("qaflow-bridge-")
            .tempdir()
            .map_err(|e| DriverError::Launch(e.to_string()))?;
        let script = workdir.path().join("bridge.js");
        tokio::fs::write(&script, BRIDGE_SCRIPT)
            .await
            .map_err(|e| DriverError::Launch(e.to_string()))?;

        let mut command = Command::new(&self.settings.node_binary);
        command
            .arg(&script)
            .env("QAFLOW_BROWSER", browser.as_str())
            .env("QAFLOW_HEADLESS", if self.settings.headless { "1" } else { "0" })
            .env("QAFLOW_VIEWPORT_WIDTH", self.settings.viewport_width.to_string())
            .env("QAFLOW_VIEWPORT_HEIGHT", self.settings.viewport_height.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(path) = &self.settings.browsers_path {
            command.env("PLAYWRIGHT_BROWSERS_PATH", path);
        }

        let mut child = command.spawn().map_err(|e| {
            DriverError::Launch(format!("{}: {}", self.settings.node_binary, e))
        })?;
        let stdin = child.stdin.take().ok_or(DriverError::Closed)?;
        let stdout = child.stdout.take().ok_or(DriverError::Closed)?;

        let mut session = PlaywrightSession {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 1,
            base_url: self.settings.base_url.clone(),
            action_timeout: self.action_timeout,
            _workdir: workdir,
        };

        match tokio::time::timeout(LAUNCH_TIMEOUT, session.read_message()).await {
            Ok(Ok(ready)) if ready.get("ready") == Some(&Value::Bool(true)) => {}
            Ok(Ok(ready)) => {
                let reason = ready
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("bridge refused to start")
                    .to_string();
                return Err(DriverError::Launch(reason));
            }
            Ok(Err(e)) => return Err(DriverError::Launch(e.to_string())),
            Err(_) => {
                return Err(DriverError::Launch(format!(
                    "{} did not start within {}s",
                    browser,
                    LAUNCH_TIMEOUT.as_secs()
                )))
            }
        }

        info!("Launched {} session", browser);
        Ok(Box::new(session))
    }
}

#[derive(Debug, Deserialize)]
struct Reply {
    id: u64,
    ok: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

struct PlaywrightSession {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
    base_url: String,
    action_timeout: Duration,
    _workdir: TempDir,
}

impl PlaywrightSession {
    async fn read_message(&mut self) -> Result<Value, DriverError> {
        loop {
            let line = self
                .stdout
                .next_line()
                .await
                .map_err(|_| DriverError::Closed)?
                .ok_or(DriverError::Closed)?;
            match serde_json::from_str(&line) {
                Ok(value) => return Ok(value),
                Err(_) => debug!("Ignoring bridge output: {}", line),
            }
        }
    }

    /// Send one command and wait for the reply with the same id.
    ///
    /// Replies to earlier commands abandoned by a step timeout are skipped.
    async fn request(
        &mut self,
        mut command: Value,
        timeout: Duration,
    ) -> Result<Option<Value>, DriverError> {
        let id = self.next_id;
        self.next_id += 1;
        command["id"] = json!(id);
        command["timeout_ms"] = json!(timeout.as_millis() as u64);

        let mut line =
            serde_json::to_string(&command).map_err(|e| DriverError::Action(e.to_string()))?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|_| DriverError::Closed)?;
        self.stdin.flush().await.map_err(|_| DriverError::Closed)?;

        loop {
            let message = self.read_message().await?;
            let reply: Reply = match serde_json::from_value(message) {
                Ok(reply) => reply,
                Err(_) => continue,
            };
            if reply.id != id {
                debug!("Skipping stale bridge reply {}", reply.id);
                continue;
            }
            return if reply.ok {
                Ok(reply.data)
            } else {
                Err(DriverError::Action(
                    reply.error.unwrap_or_else(|| "action failed".to_string()),
                ))
            };
        }
    }
}

fn command_for(action: &ParsedAction, base_url: &str) -> Value {
    match action {
        ParsedAction::Goto { path } => json!({
            "cmd": "goto",
            "url": resolve_url(base_url, path),
        }),
        ParsedAction::Enter { target, value } => json!({
            "cmd": "enter",
            "target": target,
            "value": value,
        }),
        ParsedAction::Click { target, wait_after } => json!({
            "cmd": "click",
            "target": target,
            "wait_after_ms": wait_after.map(|d| d.as_millis() as u64),
        }),
        ParsedAction::Expect { assertion, .. } => {
            let (kind, value) = match Assertion::interpret(assertion) {
                Assertion::UrlContains(v) => ("url_contains", v),
                Assertion::TitleIs(v) => ("title_is", v),
                Assertion::Visible(v) => ("visible", v),
                Assertion::Hidden(v) => ("hidden", v),
                Assertion::TextPresent(v) => ("text_present", v),
            };
            json!({ "cmd": "expect", "kind": kind, "value": value })
        }
    }
}

#[async_trait]
impl BrowserSession for PlaywrightSession {
    async fn execute(&mut self, action: &ParsedAction) -> Result<(), DriverError> {
        let command = command_for(action, &self.base_url);
        let timeout = self.action_timeout.saturating_add(action.requested_wait());
        self.request(command, timeout).await.map(|_| ())
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, DriverError> {
        let data = self
            .request(json!({ "cmd": "screenshot" }), self.action_timeout)
            .await
            .map_err(|e| DriverError::Screenshot(e.to_string()))?;
        let encoded = data
            .as_ref()
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::Screenshot("bridge returned no image".to_string()))?;
        STANDARD
            .decode(encoded)
            .map_err(|e| DriverError::Screenshot(e.to_string()))
    }

    async fn close(&mut self) {
        if self.request(json!({ "cmd": "close" }), self.action_timeout).await.is_err() {
            debug!("Bridge already gone");
        }
        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("Bridge did not exit, killing it");
                let _ = self.child.kill().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    #[test]
    fn test_resolve_url() {
        assert_eq!(resolve_url("http://localhost:3000", "/login"), "http://localhost:3000/login");
        assert_eq!(resolve_url("http://localhost:3000/", "login"), "http://localhost:3000/login");
        assert_eq!(resolve_url("http://localhost:3000", "/"), "http://localhost:3000/");
        assert_eq!(
            resolve_url("http://localhost:3000", "https://example.com/a"),
            "https://example.com/a"
        );
    }

    #[test]
    fn test_commands_for_actions() {
        let goto = command_for(&parse(r#"Go to "/login""#).unwrap().action, "http://app");
        assert_eq!(goto["cmd"], "goto");
        assert_eq!(goto["url"], "http://app/login");

        let click = command_for(&parse(r#"Click "Save" after 2s"#).unwrap().action, "http://app");
        assert_eq!(click["wait_after_ms"], 2000);

        let expect = command_for(&parse("Expect URL contains /dashboard").unwrap().action, "http://app");
        assert_eq!(expect["kind"], "url_contains");
        assert_eq!(expect["value"], "/dashboard");
    }

    #[test]
    fn test_bridge_script_is_embedded() {
        assert!(BRIDGE_SCRIPT.contains("ready: true"));
    }
}
