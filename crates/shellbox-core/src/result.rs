//! Result mapper: turns an [`ExecutionOutcome`] into the caller-facing result

use serde::{Deserialize, Serialize};

use crate::engine::ExecutionOutcome;

/// What callers receive for every execution, success or not
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Machine-consumable text: raw stdout for clean runs, a composite report otherwise
    pub content: String,
    /// Human-facing text with labelled streams
    pub display_text: String,
}

/// Map an outcome. Total over every outcome, launch failures included.
pub fn map(outcome: &ExecutionOutcome) -> ExecutionResult {
    let content = if outcome.is_clean() {
        outcome.stdout.clone()
    } else {
        composite(outcome)
    };

    let mut display = String::new();
    if !outcome.stdout.is_empty() {
        display.push_str("=== STDOUT ===\n");
        display.push_str(&outcome.stdout);
        if !outcome.stdout.ends_with('\n') {
            display.push('\n');
        }
    }
    if !outcome.stderr.is_empty() {
        display.push_str("=== STDERR ===\n");
        display.push_str(&outcome.stderr);
        if !outcome.stderr.ends_with('\n') {
            display.push('\n');
        }
    }
    if outcome.is_clean() {
        if display.is_empty() {
            display.push_str("(no output)\n");
        }
    } else {
        display.push_str(&status_line(outcome));
        display.push('\n');
    }

    ExecutionResult {
        content,
        display_text: display,
    }
}

fn or_empty(s: &str) -> &str {
    if s.is_empty() { "(empty)" } else { s }
}

fn composite(outcome: &ExecutionOutcome) -> String {
    let exit_code = outcome
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "(none)".to_string());
    let error = outcome
        .failure
        .as_ref()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "(none)".to_string());

    format!(
        "Stdout: {}\nStderr: {}\nExit Code: {}\nSignal: {}\nTimed Out: {}\nCancelled: {}\nError: {}",
        or_empty(&outcome.stdout),
        or_empty(&outcome.stderr),
        exit_code,
        outcome.signal.as_deref().unwrap_or("(none)"),
        outcome.timed_out,
        outcome.cancelled,
        error,
    )
}

fn status_line(outcome: &ExecutionOutcome) -> String {
    if let Some(error) = &outcome.failure {
        return format!("Command could not run: {}", error);
    }
    if outcome.timed_out {
        return format!("Command timed out after {}ms", outcome.duration_ms);
    }
    if outcome.cancelled {
        return "Command was cancelled".to_string();
    }
    match (&outcome.signal, outcome.exit_code) {
        (Some(signal), _) => format!("Command terminated by signal {}", signal),
        (None, Some(code)) => format!("Command exited with code {}", code),
        (None, None) => "Command ended without an exit status".to_string(),
    }
}
