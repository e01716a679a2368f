//! Interprets the toolchain's free-text output into typed results.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Substring the test stage prints when every integration test passed.
const ALL_TESTS_OK: &str = "All tests OK";

/// Substring printed inside a test block when expected results differ.
const TEST_FAILED_MARKER: &str = "Expected results are not obtained";

/// Substring printed when a raw-events file is malformed or its envelope
/// cannot be parsed; per-test outcomes are meaningless past this point.
const ENVELOPE_ERROR_MARKER: &str = "Error: can't parse raw events";

/// Diagnostic severity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// 0-based source range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Range {
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
}

/// A structured record derived from one toolchain error line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Diagnostic {
    pub file_path: String,
    pub range: Range,
    pub message: String,
    pub severity: Severity,
}

/// All diagnostics reported against one file, in encounter order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileDiagnostics {
    pub file_path: String,
    pub diagnostics: Vec<Diagnostic>,
}

/// Receives per-file diagnostics; one call per file replaces that file's
/// previous set.
pub trait DiagnosticsSink {
    fn publish(&mut self, file_path: &str, diagnostics: &[Diagnostic]);
}

/// Publish every file's diagnostics to a sink, one call per file.
pub fn publish_all(sink: &mut dyn DiagnosticsSink, files: &[FileDiagnostics]) {
    for file in files {
        sink.publish(&file.file_path, &file.diagnostics);
    }
}

/// Typed view of one toolchain run's output.
#[derive(Debug, Clone, Default)]
pub struct InterpretedOutput {
    /// Compiler diagnostics grouped by file.
    pub file_diagnostics: Vec<FileDiagnostics>,

    /// Whether the test stage reported a clean pass.
    pub tests_passed: bool,

    /// 1-based numbers of the tests that failed.
    pub failed_test_numbers: Vec<u32>,

    /// 1-based numbers of the tests the toolchain reached, in order.
    pub started_test_numbers: Vec<u32>,

    /// User-facing explanation when the run died without per-test outcomes
    /// (malformed raw events, subprocess failure).
    pub status_message: Option<String>,
}

impl InterpretedOutput {
    /// Whether any error-severity diagnostic was reported.
    pub fn has_errors(&self) -> bool {
        self.file_diagnostics
            .iter()
            .any(|f| f.diagnostics.iter().any(|d| d.severity == Severity::Error))
    }
}

/// Parses raw toolchain output line-by-line.
///
/// Pure apart from re-reading referenced source files for column correction;
/// deterministic for a given output plus filesystem snapshot.
pub struct OutputInterpreter {
    diagnostic: Regex,
    test_started: Regex,
    subprocess_exit: Regex,
}

impl OutputInterpreter {
    pub fn new() -> Self {
        Self {
            // BUILD_RULES [Err] :: /path/rule.co:27:29: syntax error, unexpected '='
            // The lazy path group tolerates Windows drive colons.
            diagnostic: Regex::new(r"([A-Z_]+) \[Err\] :: (\S+?):(\d+):(\d+):([^\r\n]+)")
                .expect("static regex"),
            test_started: Regex::new(r"Test Started: \S*raw_events_(\d+)\.json")
                .expect("static regex"),
            subprocess_exit: Regex::new(r"SUBPROCESS EXIT CODE: (\d+)").expect("static regex"),
        }
    }

    pub fn parse(&self, raw_output: &str) -> InterpretedOutput {
        let mut result = InterpretedOutput {
            tests_passed: raw_output.contains(ALL_TESTS_OK),
            ..Default::default()
        };

        self.extract_diagnostics(raw_output, &mut result);
        self.correct_columns(&mut result.file_diagnostics);
        self.extract_test_outcomes(raw_output, &mut result);

        if let Some(cap) = self.subprocess_exit.captures(raw_output) {
            let code: i64 = cap[1].parse().unwrap_or(-1);
            if code != 0 {
                result.status_message =
                    Some(format!("toolchain subprocess exited with code {code}"));
            }
        }

        result
    }

    fn extract_diagnostics(&self, raw_output: &str, result: &mut InterpretedOutput) {
        for cap in self.diagnostic.captures_iter(raw_output) {
            let file_path = cap[2].trim().to_string();
            let line: u32 = match cap[3].parse::<u32>() {
                // Reported lines are 1-based.
                Ok(n) if n > 0 => n - 1,
                _ => continue,
            };
            let col: u32 = match cap[4].parse() {
                Ok(n) => n,
                Err(_) => continue,
            };
            let mut message = cap[5].trim().to_string();

            let severity = if message.contains("warning: ") {
                message = message.replace("warning: ", "");
                Severity::Warning
            } else {
                Severity::Error
            };

            let diagnostic = Diagnostic {
                file_path: file_path.clone(),
                // The toolchain reports a single character; start at column 0
                // and let the correction pass tighten it.
                range: Range {
                    start_line: line,
                    start_col: 0,
                    end_line: line,
                    end_col: col,
                },
                message,
                severity,
            };

            match result
                .file_diagnostics
                .iter_mut()
                .find(|f| f.file_path == file_path)
            {
                Some(file) => file.diagnostics.push(diagnostic),
                None => result.file_diagnostics.push(FileDiagnostics {
                    file_path,
                    diagnostics: vec![diagnostic],
                }),
            }
        }
    }

    /// Move each diagnostic's start column to the first non-whitespace
    /// character of the reported line, compensating for the toolchain
    /// pointing at a single offending character. Read failures keep the
    /// uncorrected position rather than dropping the diagnostic.
    fn correct_columns(&self, files: &mut [FileDiagnostics]) {
        for file in files {
            let content = match std::fs::read_to_string(Path::new(&file.file_path)) {
                Ok(content) => content,
                Err(err) => {
                    warn!(file = %file.file_path, %err, "cannot re-read source for column correction");
                    continue;
                }
            };
            let lines: Vec<&str> = content.lines().collect();

            for diagnostic in &mut file.diagnostics {
                let Some(line) = lines.get(diagnostic.range.start_line as usize) else {
                    warn!(
                        file = %file.file_path,
                        line = diagnostic.range.start_line,
                        "reported line is past end of file"
                    );
                    continue;
                };
                if let Some(first) = line.find(|c: char| !c.is_whitespace()) {
                    let first = first as u32;
                    if first < diagnostic.range.end_col {
                        diagnostic.range.start_col = first;
                    }
                }
            }
        }
    }

    fn extract_test_outcomes(&self, raw_output: &str, result: &mut InterpretedOutput) {
        let mut current_test: Option<u32> = None;
        for line in raw_output.lines() {
            if let Some(cap) = self.test_started.captures(line) {
                if let Ok(number) = cap[1].parse::<u32>() {
                    result.started_test_numbers.push(number);
                    current_test = Some(number);
                }
            } else if line.contains(TEST_FAILED_MARKER) {
                // End-of-output is an implicit block boundary; the marker
                // belongs to the most recently started test.
                if let Some(number) = current_test {
                    if !result.failed_test_numbers.contains(&number) {
                        result.failed_test_numbers.push(number);
                    }
                }
            }
        }

        if result.tests_passed {
            result.failed_test_numbers.clear();
            return;
        }

        if raw_output.contains(ENVELOPE_ERROR_MARKER) {
            result.failed_test_numbers.clear();
            result.status_message = Some(
                "Raw events could not be parsed. Check that each test's events \
                 carry a valid envelope."
                    .to_string(),
            );
        }
    }
}

impl Default for OutputInterpreter {
    fn default() -> Self {
        Self::new()
    }
}
