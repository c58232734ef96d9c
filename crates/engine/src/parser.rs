//! Step DSL parser
//!
//! Turns one line of a test case script into a [`ParsedAction`]. Four strict
//! shapes are recognised; anything else that is not blank falls back to an
//! `Expect` on the whole line so every authored step stays executable.
//!
//! ```text
//! Enter "<value>" in "<field>" field
//! Click "<text>" [after <N>s]
//! Go to "<path>"
//! Expect <assertion> [within <N>s]
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Longest `after`/`within` wait a step may request
pub const MAX_STEP_WAIT: Duration = Duration::from_secs(3600);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Step cannot be empty.")]
    Empty,
}

/// A single executable browser action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ParsedAction {
    /// Type a value into a form field
    Enter { target: String, value: String },

    /// Click an element by its visible text
    Click {
        target: String,
        #[serde(default, with = "opt_duration_ms", skip_serializing_if = "Option::is_none")]
        wait_after: Option<Duration>,
    },

    /// Navigate to a path relative to the base URL
    Goto { path: String },

    /// Check something about the current page
    Expect {
        assertion: String,
        #[serde(default, with = "opt_duration_ms", skip_serializing_if = "Option::is_none")]
        within: Option<Duration>,
    },
}

impl ParsedAction {
    /// Extra time the action itself asks for, on top of the step timeout
    pub fn requested_wait(&self) -> Duration {
        match self {
            ParsedAction::Click { wait_after, .. } => wait_after.unwrap_or_default(),
            ParsedAction::Expect { within, .. } => within.unwrap_or_default(),
            _ => Duration::ZERO,
        }
    }
}

/// Whether a step matched the strict grammar or was interpreted loosely
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseSource {
    Strict,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parsed {
    pub action: ParsedAction,
    pub source: ParseSource,
}

type Matcher = fn(&str) -> Option<ParsedAction>;

/// Strict matchers, tried in order. [`fallback`] runs after all of them.
const STRICT_MATCHERS: [Matcher; 4] = [match_enter, match_click, match_goto, match_expect];

static ENTER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^Enter "([^"]*)" in "([^"]+)" field$"#).expect("valid regex"));
static CLICK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^Click "([^"]+)"(?: after (\d+(?:\.\d+)?)s)?$"#).expect("valid regex")
});
static GOTO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^Go to "([^"]+)"$"#).expect("valid regex"));
static EXPECT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^Expect (.+?)(?: within (\d+(?:\.\d+)?)s)?$"#).expect("valid regex")
});

/// Parse one line of step text.
///
/// Pure and deterministic: the same input always yields the same output.
pub fn parse(raw: &str) -> Result<Parsed, ParseError> {
    let line = raw.trim();
    if line.is_empty() {
        return Err(ParseError::Empty);
    }

    for matcher in STRICT_MATCHERS {
        if let Some(action) = matcher(line) {
            return Ok(Parsed {
                action,
                source: ParseSource::Strict,
            });
        }
    }

    Ok(Parsed {
        action: fallback(line),
        source: ParseSource::Fallback,
    })
}

fn match_enter(line: &str) -> Option<ParsedAction> {
    let caps = ENTER_RE.captures(line)?;
    Some(ParsedAction::Enter {
        value: caps[1].to_string(),
        target: caps[2].to_string(),
    })
}

fn match_click(line: &str) -> Option<ParsedAction> {
    let caps = CLICK_RE.captures(line)?;
    Some(ParsedAction::Click {
        target: caps[1].to_string(),
        wait_after: optional_seconds(caps.get(2))?,
    })
}

fn match_goto(line: &str) -> Option<ParsedAction> {
    let caps = GOTO_RE.captures(line)?;
    Some(ParsedAction::Goto {
        path: caps[1].to_string(),
    })
}

fn match_expect(line: &str) -> Option<ParsedAction> {
    let caps = EXPECT_RE.captures(line)?;
    let assertion = caps[1].trim();
    if assertion.is_empty() {
        return None;
    }
    Some(ParsedAction::Expect {
        assertion: assertion.to_string(),
        within: optional_seconds(caps.get(2))?,
    })
}

/// Catch-all: the whole line becomes an assertion
fn fallback(line: &str) -> ParsedAction {
    ParsedAction::Expect {
        assertion: line.to_string(),
        within: None,
    }
}

/// `Some(None)` when no wait was written; `None` when the written wait is
/// unusable, which makes the strict match fail
fn optional_seconds(m: Option<regex::Match<'_>>) -> Option<Option<Duration>> {
    match m {
        None => Some(None),
        Some(m) => seconds(m.as_str()).map(Some),
    }
}

fn seconds(raw: &str) -> Option<Duration> {
    let secs = raw.parse::<f64>().ok()?;
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| *d <= MAX_STEP_WAIT)
}

/// Short human label for an action, used in logs and CLI output
pub fn describe(action: &ParsedAction) -> String {
    match action {
        ParsedAction::Enter { target, value } => format!("enter \"{}\" into {}", value, target),
        ParsedAction::Click { target, wait_after } => match wait_after {
            Some(wait) => format!("click {} (wait {}s)", target, wait.as_secs_f64()),
            None => format!("click {}", target),
        },
        ParsedAction::Goto { path } => format!("go to {}", path),
        ParsedAction::Expect { assertion, within } => match within {
            Some(within) => format!("expect {} (within {}s)", assertion, within.as_secs_f64()),
            None => format!("expect {}", assertion),
        },
    }
}

/// Validation outcome for one line of an authored script
#[derive(Debug, Clone, Serialize)]
pub struct LineReport {
    /// 1-based line number
    pub line: usize,
    pub text: String,
    pub parsed: Option<Parsed>,
    pub error: Option<String>,
}

/// Parse every line of a script, reporting each one independently
pub fn validate_steps(lines: &[String]) -> Vec<LineReport> {
    lines
        .iter()
        .enumerate()
        .map(|(index, text)| match parse(text) {
            Ok(parsed) => LineReport {
                line: index + 1,
                text: text.clone(),
                parsed: Some(parsed),
                error: None,
            },
            Err(e) => LineReport {
                line: index + 1,
                text: text.clone(),
                parsed: None,
                error: Some(e.to_string()),
            },
        })
        .collect()
}

/// Concrete page check derived from the free text of an `Expect`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Assertion {
    UrlContains(String),
    TitleIs(String),
    Visible(String),
    Hidden(String),
    TextPresent(String),
}

static URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^(?:the )?(?:page )?url (?:contains|includes) "?([^"]+?)"?$"#)
        .expect("valid regex")
});
static TITLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^(?:the )?(?:page )?title is "?([^"]+?)"?$"#).expect("valid regex")
});
static HIDDEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^"?([^"]+?)"? (?:is not visible|is hidden|is not displayed)$"#)
        .expect("valid regex")
});
static VISIBLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^"?([^"]+?)"? (?:is visible|is displayed|is shown|appears)$"#)
        .expect("valid regex")
});

impl Assertion {
    pub fn interpret(text: &str) -> Self {
        let text = text.trim();
        if let Some(caps) = URL_RE.captures(text) {
            return Assertion::UrlContains(caps[1].to_string());
        }
        if let Some(caps) = TITLE_RE.captures(text) {
            return Assertion::TitleIs(caps[1].to_string());
        }
        if let Some(caps) = HIDDEN_RE.captures(text) {
            return Assertion::Hidden(caps[1].to_string());
        }
        if let Some(caps) = VISIBLE_RE.captures(text) {
            return Assertion::Visible(caps[1].to_string());
        }
        Assertion::TextPresent(text.trim_matches('"').to_string())
    }
}

/// Serde helper storing optional durations as integer milliseconds
mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
