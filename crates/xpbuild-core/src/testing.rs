//! Integration-test records and run-status tracking.

use crate::error::{Result, XpBuildError};
use crate::output::InterpretedOutput;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Directory under a rule holding its test files.
pub const TESTS_DIRNAME: &str = "tests";

/// Verification state of one integration test.
///
/// `Unknown` means "not verified" — distinct from both success and failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Unknown,
    Success,
    Failed,
}

/// One integration test of a rule: a condition file plus raw events.
///
/// Identity is the 1-based number, which matches the numbered pair of files
/// on disk (`test_conds_<N>.tc`, `raw_events_<N>.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationTest {
    pub number: u32,
    pub test_code: String,
    pub raw_events: String,
    pub status: TestStatus,
}

impl IntegrationTest {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            test_code: String::new(),
            raw_events: String::new(),
            status: TestStatus::Unknown,
        }
    }

    /// Whether the test carries everything a run needs.
    pub fn is_complete(&self) -> bool {
        !self.test_code.trim().is_empty() && !self.raw_events.trim().is_empty()
    }

    pub fn test_code_path(rule_dir: &Path, number: u32) -> PathBuf {
        rule_dir
            .join(TESTS_DIRNAME)
            .join(format!("test_conds_{number}.tc"))
    }

    pub fn raw_events_path(rule_dir: &Path, number: u32) -> PathBuf {
        rule_dir
            .join(TESTS_DIRNAME)
            .join(format!("raw_events_{number}.json"))
    }

    /// Scan a rule directory for its tests, sorted by number. A numbered
    /// condition file without its raw-events twin (or vice versa) means the
    /// test files are corrupted.
    pub fn load_all(rule_dir: &Path) -> Result<Vec<IntegrationTest>> {
        let tests_dir = rule_dir.join(TESTS_DIRNAME);
        if !tests_dir.is_dir() {
            return Ok(Vec::new());
        }

        let number_re = Regex::new(r"^test_conds_(\d+)\.tc$").expect("static regex");
        let mut tests = Vec::new();

        for entry in std::fs::read_dir(&tests_dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(cap) = number_re.captures(name) else {
                continue;
            };
            let number: u32 = cap[1]
                .parse()
                .map_err(|_| XpBuildError::Validation(format!("bad test number in '{name}'")))?;

            let test_code = std::fs::read_to_string(entry.path())?;
            let raw_events_path = Self::raw_events_path(rule_dir, number);
            if !raw_events_path.is_file() {
                return Err(XpBuildError::Validation(format!(
                    "test files are corrupted: missing '{}'",
                    raw_events_path.display()
                )));
            }
            let raw_events = std::fs::read_to_string(&raw_events_path)?;

            tests.push(IntegrationTest {
                number,
                test_code,
                raw_events,
                status: TestStatus::Unknown,
            });
        }

        // Numeric sort; lexicographic order would put 10 before 2.
        tests.sort_by_key(|t| t.number);
        Ok(tests)
    }

    /// Persist both files of the pair.
    pub fn save(&self, rule_dir: &Path) -> Result<()> {
        let tests_dir = rule_dir.join(TESTS_DIRNAME);
        std::fs::create_dir_all(&tests_dir)?;
        std::fs::write(Self::test_code_path(rule_dir, self.number), &self.test_code)?;
        std::fs::write(Self::raw_events_path(rule_dir, self.number), &self.raw_events)?;
        Ok(())
    }

    /// Delete both files of the pair.
    pub fn remove(&self, rule_dir: &Path) -> Result<()> {
        std::fs::remove_file(Self::test_code_path(rule_dir, self.number))?;
        std::fs::remove_file(Self::raw_events_path(rule_dir, self.number))?;
        Ok(())
    }
}

/// Applies interpreter results to an ordered list of tests.
pub struct TestStatusTracker;

impl TestStatusTracker {
    /// Correlate outcomes by position: test N is the N-th test in execution
    /// order.
    ///
    /// The toolchain only reports failures, so a run that produced per-test
    /// outcomes marks every non-failed, previously-unknown test as passed.
    /// A run that died before reporting any outcome (status message only)
    /// leaves unknown tests unknown — "not verified", never silently passed
    /// or failed.
    pub fn apply(tests: &mut [IntegrationTest], outcome: &InterpretedOutput) {
        if outcome.tests_passed {
            for test in tests.iter_mut() {
                test.status = TestStatus::Success;
            }
            return;
        }

        if outcome.failed_test_numbers.is_empty() {
            info!(
                reached = outcome.started_test_numbers.len(),
                "run produced no per-test outcomes, statuses left unverified"
            );
            return;
        }

        for test in tests.iter_mut() {
            if outcome.failed_test_numbers.contains(&test.number) {
                test.status = TestStatus::Failed;
            } else if test.status == TestStatus::Unknown {
                test.status = TestStatus::Success;
            }
        }
    }
}
