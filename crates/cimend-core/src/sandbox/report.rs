//! Test-count and coverage extraction from build/test output.
//!
//! Recognized formats:
//! - cargo: `test result: FAILED. 10 passed; 2 failed; ...` (summed per binary)
//! - jest: `Tests:       1 failed, 5 passed, 6 total`
//! - pytest: `==== 2 failed, 8 passed in 1.23s ====`
//! - go: `--- PASS:` / `--- FAIL:` lines

use std::sync::OnceLock;

use regex::Regex;

/// Passed/failed test counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestCounts {
    pub passed: u32,
    pub failed: u32,
}

impl TestCounts {
    fn add(&mut self, other: TestCounts) {
        self.passed += other.passed;
        self.failed += other.failed;
    }
}

/// Default coverage pattern: first number followed by `%` after "coverage".
pub const DEFAULT_COVERAGE_REGEX: &str = r"(?i)coverage[^0-9\n]*(\d+(?:\.\d+)?)\s*%";

fn cargo_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"test result: \w+\. (\d+) passed; (\d+) failed").expect("static regex")
    })
}

fn jest_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^Tests:\s+(.*)\btotal\b").expect("static regex"))
}

fn pytest_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^=+ (.*\b(?:passed|failed)\b.*) in [\d.]+s").expect("static regex")
    })
}

fn count_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+) (passed|failed)").expect("static regex"))
}

fn tally(summary: &str) -> TestCounts {
    let mut counts = TestCounts::default();
    for cap in count_re().captures_iter(summary) {
        let n: u32 = cap[1].parse().unwrap_or(0);
        match &cap[2] {
            "passed" => counts.passed += n,
            _ => counts.failed += n,
        }
    }
    counts
}

/// Extract test counts from output, `None` if no known format is present.
pub fn parse_test_counts(output: &str) -> Option<TestCounts> {
    let mut cargo = TestCounts::default();
    let mut seen = false;
    for cap in cargo_re().captures_iter(output) {
        seen = true;
        cargo.add(TestCounts {
            passed: cap[1].parse().unwrap_or(0),
            failed: cap[2].parse().unwrap_or(0),
        });
    }
    if seen {
        return Some(cargo);
    }

    if let Some(cap) = jest_re().captures_iter(output).last() {
        return Some(tally(&cap[1]));
    }
    if let Some(cap) = pytest_re().captures_iter(output).last() {
        return Some(tally(&cap[1]));
    }

    let go = TestCounts {
        passed: output.matches("--- PASS:").count() as u32,
        failed: output.matches("--- FAIL:").count() as u32,
    };
    if go != TestCounts::default() {
        return Some(go);
    }
    None
}

/// Last coverage percentage matched by `pattern` (capture group 1).
pub fn parse_coverage(pattern: &Regex, output: &str) -> Option<f64> {
    pattern
        .captures_iter(output)
        .filter_map(|cap| cap.get(1)?.as_str().parse::<f64>().ok())
        .last()
}

/// The last `lines` lines of `text`.
pub fn tail_lines(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
