//! Result persistence: one directory per case plus a combined summary.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use ct_runtime::ResourceConsumption;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{CaseStatus, CorrectnessReport, HarnessError};

pub const RESULTS_JSON: &str = "correctness_results.json";
pub const RESULTS_MARKDOWN: &str = "CORRECTNESSRESULTS.md";

/// Maps test names to directories under one results root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultsDir {
    root: PathBuf,
}

impl ResultsDir {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates (if needed) and returns the directory for `test_name`.
    pub fn case_dir(&self, test_name: &str) -> Result<PathBuf, HarnessError> {
        let dir = self.root.join(sanitize(test_name));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Writes the full report and its forensic timeline for one case.
    pub fn write_case(&self, report: &CorrectnessReport) -> Result<PathBuf, HarnessError> {
        let dir = self.case_dir(&report.verdict.test_name)?;
        let report_path = dir.join("report.json");
        fs::write(&report_path, serde_json::to_string_pretty(report)?)?;
        report.forensic_log.write_jsonl(&dir.join("forensic.jsonl"))?;
        Ok(report_path)
    }
}

fn sanitize(name: &str) -> String {
    let cleaned = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect::<String>();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "unnamed".to_owned()
    } else {
        trimmed.to_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub test_name: String,
    pub result: CaseStatus,
    pub diff_count: usize,
    pub failures: Vec<String>,
    pub expected_records: usize,
    pub observed_records: usize,
    pub elapsed_ms: u64,
    pub resources: ResourceConsumption,
}

impl From<&CorrectnessReport> for ResultRow {
    fn from(report: &CorrectnessReport) -> Self {
        Self {
            test_name: report.verdict.test_name.clone(),
            result: report.verdict.result,
            diff_count: report.verdict.diff_count,
            failures: report.failures.iter().map(ToString::to_string).collect(),
            expected_records: report.expected_records,
            observed_records: report.observed_records,
            elapsed_ms: report.elapsed_ms,
            resources: report.resources,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsDocument {
    pub report_hash: String,
    pub passed: usize,
    pub failed: usize,
    pub rows: Vec<ResultRow>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenResults {
    pub json_path: PathBuf,
    pub markdown_path: PathBuf,
    pub report_hash: String,
}

/// Verdict rows collected over a session.
#[derive(Debug, Clone, Default)]
pub struct CorrectnessResults {
    rows: Vec<ResultRow>,
}

impl CorrectnessResults {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, report: &CorrectnessReport) {
        self.rows.push(ResultRow::from(report));
    }

    #[must_use]
    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    #[must_use]
    pub fn passed(&self) -> usize {
        self.rows
            .iter()
            .filter(|row| row.result == CaseStatus::Pass)
            .count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.rows.len() - self.passed()
    }

    #[must_use]
    pub fn is_green(&self) -> bool {
        !self.rows.is_empty() && self.failed() == 0
    }

    /// Digest over the rows with timings zeroed, so identical outcomes
    /// hash identically across runs.
    #[must_use]
    pub fn report_hash(&self) -> String {
        let stable = self
            .rows
            .iter()
            .map(|row| ResultRow {
                elapsed_ms: 0,
                resources: ResourceConsumption::default(),
                ..row.clone()
            })
            .collect::<Vec<_>>();
        let payload = serde_json::to_vec(&stable).unwrap_or_default();
        format!("{:x}", Sha256::digest(&payload))
    }

    #[must_use]
    pub fn render_markdown(&self) -> String {
        let mut out = String::from("# Correctness Results\n\n");
        out.push_str("| Test | Result | Diff count | Observed | Failures |\n");
        out.push_str("|------|--------|------------|----------|----------|\n");
        for row in &self.rows {
            let failures = if row.failures.is_empty() {
                "-".to_owned()
            } else {
                row.failures.join("; ")
            };
            let _ = writeln!(
                out,
                "| {} | {} | {} | {}/{} | {} |",
                row.test_name,
                row.result.as_str(),
                row.diff_count,
                row.observed_records,
                row.expected_records,
                failures
            );
        }
        let _ = write!(
            out,
            "\n{} passed, {} failed\n",
            self.passed(),
            self.failed()
        );
        out
    }

    pub fn write(&self, dir: &ResultsDir) -> Result<WrittenResults, HarnessError> {
        fs::create_dir_all(dir.root())?;
        let report_hash = self.report_hash();
        let document = ResultsDocument {
            report_hash: report_hash.clone(),
            passed: self.passed(),
            failed: self.failed(),
            rows: self.rows.clone(),
        };
        let json_path = dir.root().join(RESULTS_JSON);
        fs::write(&json_path, serde_json::to_string_pretty(&document)?)?;
        let markdown_path = dir.root().join(RESULTS_MARKDOWN);
        fs::write(&markdown_path, self.render_markdown())?;
        tracing::info!(
            path = %json_path.display(),
            rows = self.rows.len(),
            report_hash = %report_hash,
            "wrote correctness results"
        );
        Ok(WrittenResults {
            json_path,
            markdown_path,
            report_hash,
        })
    }
}
