//! CLI Commands

pub mod browsers;
pub mod parse;
pub mod project;
pub mod run;
pub mod test;

use anyhow::{Context, Result};
use std::path::Path;

/// Script lines from repeated `--step` flags and/or a script file
pub fn collect_steps(steps: Vec<String>, file: Option<&Path>) -> Result<Vec<String>> {
    let mut lines = steps;
    if let Some(file) = file {
        let content = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read script {}", file.display()))?;
        lines.extend(
            content
                .lines()
                .filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
                .map(str::to_string),
        );
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_steps_skips_blank_and_comment_lines() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("login.txt");
        std::fs::write(&file, "# login flow\nGo to \"/login\"\n\nClick \"Login\"\n").unwrap();

        let lines = collect_steps(vec!["Go to \"/\"".to_string()], Some(&file)).unwrap();
        assert_eq!(lines, vec!["Go to \"/\"", "Go to \"/login\"", "Click \"Login\""]);
        assert!(collect_steps(vec![], Some(&dir.path().join("missing"))).is_err());
    }
}
