//! Prompt rendering shared by all backends.

use std::fmt::Write as _;

use crate::domain::run::WorkflowRun;
use crate::domain::signal::FailureSignal;
use crate::domain::validation::ValidationReport;

/// System instructions sent ahead of every prompt.
pub const SYSTEM_PROMPT: &str = "You are a CI repair assistant. You receive structured failure \
signals from a failed continuous-integration run and answer with exactly one JSON object \
describing the root cause and a minimal set of file edits that make the build and tests pass. \
Do not include any prose outside the JSON object.";

const REPLY_SCHEMA: &str = r#"{
  "root_cause": "<one or two sentences>",
  "confidence": <number between 0 and 1>,
  "remediation_steps": ["<step>", "..."],
  "edits": [
    {"path": "<repo-relative path>", "kind": "modify", "find": "<exact existing text>", "replace": "<new text>"},
    {"path": "<repo-relative path>", "kind": "modify", "content": "<full new file content>"},
    {"path": "<repo-relative path>", "kind": "create", "content": "<file content>"},
    {"path": "<repo-relative path>", "kind": "delete"}
  ]
}"#;

/// Maximum characters of one signal excerpt embedded in a prompt.
const MAX_EXCERPT_CHARS: usize = 1_500;

fn clip(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Render the user prompt for one proposal round.
pub fn build_prompt(
    run: &WorkflowRun,
    signals: &[FailureSignal],
    previous: Option<&ValidationReport>,
    protected_globs: &[String],
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "## Failed run\n{}\n", run.describe());

    let _ = writeln!(out, "## Failure signals ({})", signals.len());
    for (i, signal) in signals.iter().enumerate() {
        let _ = writeln!(out, "\n### {}. {}", i + 1, signal.headline());
        let _ = writeln!(out, "```\n{}\n```", clip(&signal.excerpt, MAX_EXCERPT_CHARS));
    }

    if let Some(report) = previous {
        let _ = writeln!(out, "\n## Previous attempt");
        match &report.detail {
            Some(detail) => {
                let _ = writeln!(
                    out,
                    "Your previous fix was applied and validated, but {detail}"
                );
            }
            None => {
                let _ = writeln!(out, "Your previous fix did not pass validation.");
            }
        }
        let _ = writeln!(out, "({})", report.metrics_line());
        let _ = writeln!(
            out,
            "Propose a different fix. Edits are applied to the original tree, not on top of the previous attempt."
        );
    }

    if !protected_globs.is_empty() {
        let _ = writeln!(
            out,
            "\n## Constraints\nDo not edit paths matching: {}",
            protected_globs.join(", ")
        );
    }

    let _ = writeln!(out, "\n## Reply format\n{REPLY_SCHEMA}");
    out
}
