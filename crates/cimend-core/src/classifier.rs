//! Failure classifier: extracts ordered [`FailureSignal`]s from raw job logs.
//!
//! Detection is table-driven. Each [`PatternRule`] maps a regex to a
//! [`SignalCategory`]; optional named captures `test`, `file` and `line`
//! fill the structured fields. Rules are tried in table order and the first
//! match on a line wins, so new categories are added by extending the table.
//!
//! Classification is pure and deterministic for identical log text. When no
//! rule matches, a single `unknown` signal carries the log tail.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::run::{Conclusion, JobResult, WorkflowRun};
use crate::domain::signal::{FailureSignal, SignalCategory, SourceLocation};

/// Uncompiled `{category -> pattern}` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRule {
    pub category: SignalCategory,
    pub pattern: String,
}

impl PatternRule {
    pub fn new(category: SignalCategory, pattern: impl Into<String>) -> Self {
        Self {
            category,
            pattern: pattern.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    category: SignalCategory,
    regex: Regex,
}

/// Compiled, ordered detection table.
#[derive(Debug, Clone)]
pub struct PatternTable {
    rules: Vec<CompiledRule>,
}

impl PatternTable {
    pub fn new(rules: &[PatternRule]) -> Result<Self, regex::Error> {
        let rules = rules
            .iter()
            .map(|r| {
                Ok(CompiledRule {
                    category: r.category,
                    regex: Regex::new(&r.pattern)?,
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { rules })
    }

    /// Append rules after the builtin ones.
    pub fn with_rules(mut self, extra: &[PatternRule]) -> Result<Self, regex::Error> {
        self.rules.extend(Self::new(extra)?.rules);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn first_match<'a>(&self, line: &'a str) -> Option<(SignalCategory, regex::Captures<'a>)> {
        self.rules
            .iter()
            .find_map(|r| r.regex.captures(line).map(|c| (r.category, c)))
    }
}

impl Default for PatternTable {
    fn default() -> Self {
        // Builtin patterns are static and covered by tests.
        Self::new(&builtin_rules()).unwrap_or(Self { rules: Vec::new() })
    }
}

/// Builtin detection rules, most specific categories first.
pub fn builtin_rules() -> Vec<PatternRule> {
    use SignalCategory::*;
    vec![
        // timeout
        PatternRule::new(Timeout, r"(?i)has exceeded the maximum execution time"),
        PatternRule::new(Timeout, r"(?i)\b(timed out|timeout expired|deadline exceeded)\b"),
        // security
        PatternRule::new(Security, r"\bRUSTSEC-\d{4}-\d{4}\b"),
        PatternRule::new(Security, r"\bCVE-\d{4}-\d{4,}\b"),
        PatternRule::new(Security, r"(?i)\b\d+ (high|critical|moderate) severity vulnerabilit"),
        // dependency
        PatternRule::new(Dependency, r"failed to select a version for"),
        PatternRule::new(Dependency, r"no matching package named"),
        PatternRule::new(Dependency, r"npm ERR! code ERESOLVE"),
        PatternRule::new(Dependency, r"Could not find a version that satisfies the requirement"),
        PatternRule::new(Dependency, r"ModuleNotFoundError: No module named"),
        PatternRule::new(Dependency, r"Cannot find module '[^']+'"),
        PatternRule::new(Dependency, r"(?i)checksum (mismatch|failed) for"),
        // lint
        PatternRule::new(Lint, r"^Diff in (?P<file>\S+?) at line (?P<line>\d+)"),
        PatternRule::new(Lint, r"^would reformat (?P<file>\S+)"),
        PatternRule::new(Lint, r"clippy::[a-z_]+"),
        PatternRule::new(Lint, r"^(?P<file>\S+?):(?P<line>\d+):\d+: [A-Z]\d{3,4} "),
        PatternRule::new(Lint, r"^\s*\d+:\d+\s+error\s+.+\s{2,}[@a-z/-]+$"),
        // test
        PatternRule::new(Test, r"^test (?P<test>\S+) \.\.\. FAILED"),
        PatternRule::new(
            Test,
            r"thread '(?P<test>[^']+)' panicked at (?P<file>[^:\s]+):(?P<line>\d+)",
        ),
        PatternRule::new(Test, r"^FAILED (?P<file>[^:\s]+)::(?P<test>\S+)"),
        PatternRule::new(Test, r"^--- FAIL: (?P<test>\S+)"),
        PatternRule::new(Test, r"^\s*● (?P<test>.+)$"),
        PatternRule::new(Test, r"^error: test failed"),
        PatternRule::new(Test, r"test result: FAILED"),
        // build
        PatternRule::new(
            Build,
            r"^(?P<file>\S+\.tsx?)\((?P<line>\d+),\d+\): error TS\d+",
        ),
        PatternRule::new(
            Build,
            r"^(?P<file>\S+\.(c|cc|cpp|h|hpp|java|go)):(?P<line>\d+):(\d+:)? error",
        ),
        PatternRule::new(Build, r"^error(\[E\d{4}\])?: "),
        PatternRule::new(Build, r"(?i)\b(compilation failed|build failed)\b"),
    ]
}

/// Limits applied while extracting signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Lines after a match included in the excerpt.
    pub context_lines: usize,
    /// Maximum signals emitted per run.
    pub max_signals: usize,
    /// Lines of log tail carried by the `unknown` fallback signal.
    pub tail_lines: usize,
    /// Character cap per excerpt.
    pub max_excerpt_chars: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            context_lines: 3,
            max_signals: 25,
            tail_lines: 200,
            max_excerpt_chars: 2_000,
        }
    }
}

fn timestamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?Z ?").expect("static regex")
    })
}

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("static regex"))
}

fn location_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"-->\s+(?P<file>[^:\s]+):(?P<line>\d+)(:\d+)?").expect("static regex")
    })
}

fn exit_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:process completed with|exited with) exit code (?P<code>-?\d+)")
            .expect("static regex")
    })
}

/// Strip CI timestamps and ANSI colour codes from a raw log line.
pub fn normalize_line(raw: &str) -> String {
    let no_ts = timestamp_re().replace(raw, "");
    ansi_re().replace_all(&no_ts, "").trim_end().to_string()
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

/// Pure, table-driven failure classifier.
#[derive(Debug, Clone, Default)]
pub struct FailureClassifier {
    table: PatternTable,
    config: ClassifierConfig,
}

impl FailureClassifier {
    pub fn new(table: PatternTable, config: ClassifierConfig) -> Self {
        Self { table, config }
    }

    /// Extract signals from every failed job, preserving log order.
    ///
    /// Never fails: a run without any recognisable failure yields exactly one
    /// `unknown` signal carrying the bounded log tail.
    pub fn classify(&self, run: &WorkflowRun) -> Vec<FailureSignal> {
        let mut signals = Vec::new();
        for job in run.failed_jobs() {
            if signals.len() >= self.config.max_signals {
                break;
            }
            self.classify_job(job, &mut signals);
        }

        if signals.is_empty() {
            signals.push(self.unknown_signal(run));
        }
        signals
    }

    /// Classify a single log without job context (used for offline tuning).
    pub fn classify_log(&self, log: &str) -> Vec<FailureSignal> {
        let job = JobResult {
            id: 0,
            name: String::new(),
            conclusion: Conclusion::Failure,
            steps: Vec::new(),
            log: log.to_string(),
            exit_code: None,
        };
        let mut signals = Vec::new();
        self.classify_job(&job, &mut signals);
        for s in &mut signals {
            s.job = None;
        }
        if signals.is_empty() {
            let mut fallback = FailureSignal::new(SignalCategory::Unknown, self.tail(log));
            fallback.log_line = log.lines().count().saturating_sub(self.config.tail_lines);
            signals.push(fallback);
        }
        signals
    }

    fn classify_job(&self, job: &JobResult, out: &mut Vec<FailureSignal>) {
        let lines: Vec<String> = job.log.lines().map(normalize_line).collect();
        let exit_code = job.exit_code.or_else(|| {
            lines.iter().rev().find_map(|l| {
                exit_code_re()
                    .captures(l)
                    .and_then(|c| c.name("code"))
                    .and_then(|m| m.as_str().parse().ok())
            })
        });
        let step = job.failing_step().map(|s| s.name.clone());
        let mut saw_timeout = false;
        let mut last_headline: Option<(SignalCategory, String)> = None;

        for (idx, line) in lines.iter().enumerate() {
            if out.len() >= self.config.max_signals {
                return;
            }
            let Some((category, caps)) = self.table.first_match(line) else {
                continue;
            };

            let key = (category, line.clone());
            if last_headline.as_ref() == Some(&key) {
                continue;
            }
            last_headline = Some(key);

            let end = (idx + 1 + self.config.context_lines).min(lines.len());
            let excerpt = truncate_chars(&lines[idx..end].join("\n"), self.config.max_excerpt_chars);

            let mut signal = FailureSignal::new(category, excerpt);
            signal.job = Some(job.name.clone());
            signal.step = step.clone();
            signal.exit_code = exit_code;
            signal.log_line = idx;
            signal.test_name = caps.name("test").map(|m| m.as_str().trim().to_string());
            signal.location = caps
                .name("file")
                .map(|f| SourceLocation {
                    file: f.as_str().to_string(),
                    line: caps.name("line").and_then(|l| l.as_str().parse().ok()),
                })
                .or_else(|| Self::lookahead_location(&lines[idx + 1..end]));

            saw_timeout |= category == SignalCategory::Timeout;
            out.push(signal);
        }

        if job.conclusion == Conclusion::TimedOut && !saw_timeout && out.len() < self.config.max_signals
        {
            let mut signal = FailureSignal::new(
                SignalCategory::Timeout,
                format!("job '{}' exceeded its time limit", job.name),
            );
            signal.job = Some(job.name.clone());
            signal.step = step;
            signal.exit_code = exit_code;
            signal.log_line = lines.len();
            out.push(signal);
        }
    }

    fn lookahead_location(lines: &[String]) -> Option<SourceLocation> {
        lines.iter().find_map(|l| {
            location_re().captures(l).map(|c| SourceLocation {
                file: c["file"].to_string(),
                line: c.name("line").and_then(|m| m.as_str().parse().ok()),
            })
        })
    }

    fn tail(&self, log: &str) -> String {
        let lines: Vec<String> = log.lines().map(normalize_line).collect();
        let start = lines.len().saturating_sub(self.config.tail_lines);
        lines[start..].join("\n")
    }

    fn unknown_signal(&self, run: &WorkflowRun) -> FailureSignal {
        let failed: Vec<&JobResult> = run.failed_jobs().collect();
        let jobs: Vec<&JobResult> = if failed.is_empty() {
            run.jobs.iter().collect()
        } else {
            failed
        };
        let combined = jobs
            .iter()
            .map(|j| j.log.as_str())
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        let mut signal = FailureSignal::new(SignalCategory::Unknown, self.tail(&combined));
        if let [job] = jobs.as_slice() {
            signal.job = Some(job.name.clone());
            signal.step = job.failing_step().map(|s| s.name.clone());
            signal.exit_code = job.exit_code;
        }
        signal.log_line = combined.lines().count().saturating_sub(self.config.tail_lines);
        signal
    }
}
