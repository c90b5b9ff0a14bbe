//! Pass/fail counts scraped from test runner output.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static UNITTEST_RAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Ran (\d+) tests? in ").expect("valid regex"));
static UNITTEST_FAILED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^FAILED \(([^)]*)\)").expect("valid regex"));
static UNITTEST_OK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^OK(?: \(([^)]*)\))?\s*$").expect("valid regex"));
static PYTEST_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^=+ (.*\b(?:passed|failed|error|errors)\b.*) in [0-9.]+s.* =+$")
        .expect("valid regex")
});
static COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\w+)=(\d+)|(\d+) (\w+)").expect("valid regex"));

/// Outcome counts of one test-suite run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    pub ran: u64,
    pub failures: u64,
    pub errors: u64,
    pub skipped: u64,
}

impl TestSummary {
    /// Parse the summary block of unittest-style (`Ran 120 tests in 3.2s` /
    /// `FAILED (failures=2)`) or pytest-style (`== 118 passed, 2 failed in 3.1s ==`)
    /// output. Runners such as Django's print the summary on stderr, so both
    /// streams are searched.
    pub fn parse(stdout: &str, stderr: &str) -> Option<Self> {
        let combined = format!("{stdout}\n{stderr}");
        Self::parse_unittest(&combined).or_else(|| Self::parse_pytest(&combined))
    }

    fn parse_unittest(text: &str) -> Option<Self> {
        let ran = UNITTEST_RAN
            .captures_iter(text)
            .last()
            .and_then(|c| c[1].parse().ok())?;
        let mut summary = TestSummary {
            ran,
            ..Default::default()
        };

        let detail = UNITTEST_FAILED
            .captures_iter(text)
            .last()
            .or_else(|| UNITTEST_OK.captures_iter(text).last())
            .and_then(|c| c.get(1).map(|m| m.as_str().to_string()))
            .unwrap_or_default();
        for cap in COUNT.captures_iter(&detail) {
            if let (Some(key), Some(n)) = (cap.get(1), cap.get(2)) {
                summary.apply(key.as_str(), n.as_str());
            }
        }
        Some(summary)
    }

    fn parse_pytest(text: &str) -> Option<Self> {
        let line = PYTEST_LINE.captures_iter(text).last()?;
        let mut summary = TestSummary::default();
        let mut passed = 0;
        for cap in COUNT.captures_iter(&line[1]) {
            if let (Some(n), Some(key)) = (cap.get(3), cap.get(4)) {
                if key.as_str() == "passed" {
                    passed = n.as_str().parse().unwrap_or(0);
                } else {
                    summary.apply(key.as_str(), n.as_str());
                }
            }
        }
        summary.ran = passed + summary.failures + summary.errors + summary.skipped;
        Some(summary)
    }

    fn apply(&mut self, key: &str, n: &str) {
        let n: u64 = n.parse().unwrap_or(0);
        match key {
            "failures" | "failed" => self.failures = n,
            "errors" | "error" => self.errors = n,
            "skipped" => self.skipped = n,
            _ => {}
        }
    }

    pub fn passed(&self) -> u64 {
        self.ran.saturating_sub(self.failures + self.errors + self.skipped)
    }

    pub fn has_failures(&self) -> bool {
        self.failures + self.errors > 0
    }
}

impl std::fmt::Display for TestSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ran, {} failed, {} errors, {} skipped",
            self.ran, self.failures, self.errors, self.skipped
        )
    }
}
