#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;

use ct_types::{DiffKind, FieldDiff, FieldValue, Record, RecordKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Computes field-level differences between an expected and an emitted record.
pub trait RecordDiffer: Send + Sync {
    fn diff(&self, expected: &Record, actual: &Record) -> Vec<FieldDiff>;
}

impl<F> RecordDiffer for F
where
    F: Fn(&Record, &Record) -> Vec<FieldDiff> + Send + Sync,
{
    fn diff(&self, expected: &Record, actual: &Record) -> Vec<FieldDiff> {
        self(expected, actual)
    }
}

/// Float comparison budget. A pair matches when
/// `|a - b| <= absolute + relative * max(|a|, |b|)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tolerance {
    pub absolute: f64,
    pub relative: f64,
}

impl Tolerance {
    pub const EXACT: Self = Self {
        absolute: 0.0,
        relative: 0.0,
    };

    #[must_use]
    pub fn floats_match(&self, expected: f64, actual: f64) -> bool {
        if expected.is_nan() || actual.is_nan() {
            return expected.is_nan() && actual.is_nan();
        }
        if expected == actual {
            return true;
        }
        if expected.is_infinite() || actual.is_infinite() {
            return false;
        }
        let budget = self.absolute + self.relative * expected.abs().max(actual.abs());
        (expected - actual).abs() <= budget
    }
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            absolute: 1e-9,
            relative: 1e-9,
        }
    }
}

/// Default differ over the record field maps.
#[derive(Debug, Clone, Default)]
pub struct FieldDiffer {
    tolerance: Tolerance,
    ignored_fields: BTreeSet<String>,
}

impl FieldDiffer {
    #[must_use]
    pub fn new(tolerance: Tolerance) -> Self {
        Self {
            tolerance,
            ignored_fields: BTreeSet::new(),
        }
    }

    /// Skips a field the pipeline is allowed to rewrite (timestamps, ids).
    #[must_use]
    pub fn ignoring(mut self, field: impl Into<String>) -> Self {
        self.ignored_fields.insert(field.into());
        self
    }

    #[must_use]
    pub fn tolerance(&self) -> Tolerance {
        self.tolerance
    }

    fn compare_values(
        &self,
        field: &str,
        expected: &FieldValue,
        actual: &FieldValue,
    ) -> Option<FieldDiff> {
        let kind = match (expected, actual) {
            (FieldValue::Float64(e), FieldValue::Float64(a)) => {
                if self.tolerance.floats_match(*e, *a) {
                    return None;
                }
                DiffKind::ValueMismatch
            }
            (e, a) if e.field_type() != a.field_type() => DiffKind::TypeMismatch,
            (e, a) if e == a => return None,
            _ => DiffKind::ValueMismatch,
        };
        Some(FieldDiff {
            field: field.to_owned(),
            kind,
            expected: Some(expected.clone()),
            actual: Some(actual.clone()),
        })
    }
}

impl RecordDiffer for FieldDiffer {
    fn diff(&self, expected: &Record, actual: &Record) -> Vec<FieldDiff> {
        let mut diffs = Vec::new();
        for (name, expected_value) in &expected.fields {
            if self.ignored_fields.contains(name) {
                continue;
            }
            match actual.fields.get(name) {
                Some(actual_value) => {
                    diffs.extend(self.compare_values(name, expected_value, actual_value));
                }
                None => diffs.push(FieldDiff {
                    field: name.clone(),
                    kind: DiffKind::MissingField,
                    expected: Some(expected_value.clone()),
                    actual: None,
                }),
            }
        }
        for (name, actual_value) in &actual.fields {
            if self.ignored_fields.contains(name) || expected.fields.contains_key(name) {
                continue;
            }
            diffs.push(FieldDiff {
                field: name.clone(),
                kind: DiffKind::UnexpectedField,
                expected: None,
                actual: Some(actual_value.clone()),
            });
        }
        diffs
    }
}

/// One mismatching record as kept for diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffLogEntry {
    pub key: RecordKey,
    pub diffs: Vec<FieldDiff>,
}

impl DiffLogEntry {
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = format!("record {} has {} difference(s):", self.key, self.diffs.len());
        for diff in &self.diffs {
            let _ = write!(out, "\n  - {diff}");
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub accepted: usize,
    pub mismatched_records: usize,
    pub field_diffs: usize,
}

#[derive(Debug, Default)]
struct AccumulatorState {
    summary: DiffSummary,
    entries: Vec<DiffLogEntry>,
}

/// Tally of per-record diffs, shared between the receive path and the
/// orchestrator that reads it at verdict time.
#[derive(Debug, Clone, Default)]
pub struct DiffAccumulator {
    state: Arc<Mutex<AccumulatorState>>,
}

impl DiffAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&self, key: &RecordKey, diffs: Vec<FieldDiff>) {
        let mut state = self.state.lock();
        state.summary.accepted += 1;
        if diffs.is_empty() {
            return;
        }
        state.summary.mismatched_records += 1;
        state.summary.field_diffs += diffs.len();
        let entry = DiffLogEntry {
            key: key.clone(),
            diffs,
        };
        tracing::warn!(
            key = %entry.key,
            field_diffs = entry.diffs.len(),
            detail = %entry.render(),
            "record differs from expectation"
        );
        state.entries.push(entry);
    }

    /// Number of records that arrived with at least one difference.
    #[must_use]
    pub fn diff_count(&self) -> usize {
        self.state.lock().summary.mismatched_records
    }

    #[must_use]
    pub fn summary(&self) -> DiffSummary {
        self.state.lock().summary.clone()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<DiffLogEntry> {
        self.state.lock().entries.clone()
    }
}
