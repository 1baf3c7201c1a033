//! Failure signals extracted from CI logs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Likely cause of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalCategory {
    Build,
    Test,
    Dependency,
    Lint,
    Security,
    Timeout,
    Unknown,
}

impl fmt::Display for SignalCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalCategory::Build => "build",
            SignalCategory::Test => "test",
            SignalCategory::Dependency => "dependency",
            SignalCategory::Lint => "lint",
            SignalCategory::Security => "security",
            SignalCategory::Timeout => "timeout",
            SignalCategory::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A `file:line` location referenced by a log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: Option<u32>,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}", self.file, line),
            None => f.write_str(&self.file),
        }
    }
}

/// One structured extraction from failure evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSignal {
    pub category: SignalCategory,

    /// Log text around the match (or the log tail for `unknown`).
    pub excerpt: String,

    /// Job the signal was found in.
    pub job: Option<String>,

    /// Failing step of that job.
    pub step: Option<String>,

    pub test_name: Option<String>,
    pub location: Option<SourceLocation>,
    pub exit_code: Option<i32>,

    /// Zero-based line index inside the job log.
    pub log_line: usize,
}

impl FailureSignal {
    pub fn new(category: SignalCategory, excerpt: impl Into<String>) -> Self {
        Self {
            category,
            excerpt: excerpt.into(),
            job: None,
            step: None,
            test_name: None,
            location: None,
            exit_code: None,
            log_line: 0,
        }
    }

    /// Set test name.
    pub fn with_test(mut self, test_name: impl Into<String>) -> Self {
        self.test_name = Some(test_name.into());
        self
    }

    /// Set file location.
    pub fn with_location(mut self, file: impl Into<String>, line: Option<u32>) -> Self {
        self.location = Some(SourceLocation {
            file: file.into(),
            line,
        });
        self
    }

    /// One-line header used when rendering signals into prompts.
    pub fn headline(&self) -> String {
        let mut parts = vec![format!("[{}]", self.category)];
        if let Some(job) = &self.job {
            parts.push(format!("job={job}"));
        }
        if let Some(step) = &self.step {
            parts.push(format!("step={step}"));
        }
        if let Some(test) = &self.test_name {
            parts.push(format!("test={test}"));
        }
        if let Some(loc) = &self.location {
            parts.push(format!("at={loc}"));
        }
        if let Some(code) = self.exit_code {
            parts.push(format!("exit={code}"));
        }
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headline_includes_structured_fields() {
        let mut signal = FailureSignal::new(SignalCategory::Test, "assertion failed")
            .with_test("tests::parses_empty")
            .with_location("src/parser.rs", Some(42));
        signal.job = Some("test".into());
        signal.exit_code = Some(101);

        let h = signal.headline();
        assert!(h.starts_with("[test]"));
        assert!(h.contains("test=tests::parses_empty"));
        assert!(h.contains("at=src/parser.rs:42"));
        assert!(h.contains("exit=101"));
    }

    #[test]
    fn test_category_serde_snake_case() {
        let json = serde_json::to_string(&SignalCategory::Dependency).unwrap();
        assert_eq!(json, "\"dependency\"");
    }
}
