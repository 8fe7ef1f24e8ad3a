#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use csv::ReaderBuilder;
use ct_types::{Corpus, FieldValue, Fields, Record, RecordKey, TypeError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error("corpus line {line}: {message}")]
    Format { line: usize, message: String },
    #[error("csv input has no headers")]
    MissingHeaders,
}

/// Hands out corpus records in order, one per call.
#[derive(Debug, Clone)]
pub struct RecordSupplier {
    corpus: Corpus,
    cursor: usize,
}

impl RecordSupplier {
    #[must_use]
    pub fn new(corpus: Corpus) -> Self {
        Self { corpus, cursor: 0 }
    }

    /// Returns the next record, or `None` once the corpus is exhausted.
    pub fn next_record(&mut self) -> Option<Record> {
        let record = self.corpus.get(self.cursor)?.clone();
        self.cursor += 1;
        Some(record)
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.cursor >= self.corpus.len()
    }

    #[must_use]
    pub fn dispensed(&self) -> usize {
        self.cursor.min(self.corpus.len())
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.corpus.len().saturating_sub(self.cursor)
    }
}

/// What to do when a record arrives for a key that was already observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Count the repeat and otherwise leave the index untouched.
    #[default]
    Ignore,
    /// Report the repeat as a delivery fault.
    Anomaly,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexEntry {
    pub key: RecordKey,
    pub expected: Record,
    pub observed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    FirstObservation,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("key {key} is not part of the corpus")]
    UnknownKey { key: RecordKey },
    #[error("key {key} was delivered more than once")]
    DuplicateDelivery { key: RecordKey },
}

#[derive(Debug)]
struct IndexState {
    positions: BTreeMap<RecordKey, usize>,
    observed: Vec<bool>,
    observed_count: usize,
    repeats: BTreeMap<RecordKey, usize>,
}

/// Expected records keyed by identity, each with a one-way observed flag.
///
/// Clones share state: the receive path marks entries while the orchestrator
/// polls [`ReceivedIndex::all_observed`] from another thread.
#[derive(Debug, Clone)]
pub struct ReceivedIndex {
    corpus: Corpus,
    policy: DuplicatePolicy,
    state: Arc<Mutex<IndexState>>,
}

impl ReceivedIndex {
    #[must_use]
    pub fn new(corpus: Corpus, policy: DuplicatePolicy) -> Self {
        let positions = corpus
            .iter()
            .enumerate()
            .map(|(position, record)| (record.key.clone(), position))
            .collect::<BTreeMap<_, _>>();
        let observed = vec![false; corpus.len()];
        Self {
            corpus,
            policy,
            state: Arc::new(Mutex::new(IndexState {
                positions,
                observed,
                observed_count: 0,
                repeats: BTreeMap::new(),
            })),
        }
    }

    #[must_use]
    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    #[must_use]
    pub fn lookup(&self, key: &RecordKey) -> Option<IndexEntry> {
        let state = self.state.lock();
        let position = *state.positions.get(key)?;
        Some(self.entry_at(&state, position))
    }

    pub fn mark_observed(&self, key: &RecordKey) -> Result<MarkOutcome, IndexError> {
        let mut state = self.state.lock();
        let position = state
            .positions
            .get(key)
            .copied()
            .ok_or_else(|| IndexError::UnknownKey { key: key.clone() })?;
        self.mark_position(&mut state, key, position)
    }

    /// Looks up `key` and marks it observed under a single lock.
    ///
    /// Returns the entry as it was before this arrival, so a duplicate can be
    /// told apart from a first observation by the `observed` flag.
    pub fn observe(&self, key: &RecordKey) -> Result<(IndexEntry, MarkOutcome), IndexError> {
        let mut state = self.state.lock();
        let position = state
            .positions
            .get(key)
            .copied()
            .ok_or_else(|| IndexError::UnknownKey { key: key.clone() })?;
        let entry = self.entry_at(&state, position);
        let outcome = self.mark_position(&mut state, key, position)?;
        Ok((entry, outcome))
    }

    #[must_use]
    pub fn all_observed(&self) -> bool {
        let state = self.state.lock();
        state.observed.iter().all(|observed| *observed)
    }

    #[must_use]
    pub fn observed_count(&self) -> usize {
        self.state.lock().observed_count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.corpus.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.corpus.is_empty()
    }

    /// Keys still waiting for an arrival, in corpus order.
    #[must_use]
    pub fn unobserved_keys(&self) -> Vec<RecordKey> {
        let state = self.state.lock();
        self.corpus
            .iter()
            .zip(state.observed.iter())
            .filter(|(_, observed)| !**observed)
            .map(|(record, _)| record.key.clone())
            .collect()
    }

    /// Keys that arrived more than once, each listed once, in key order.
    #[must_use]
    pub fn duplicate_keys(&self) -> Vec<RecordKey> {
        self.state.lock().repeats.keys().cloned().collect()
    }

    /// Arrivals beyond the first, summed over all keys.
    #[must_use]
    pub fn repeat_arrivals(&self) -> usize {
        self.state.lock().repeats.values().sum()
    }

    fn entry_at(&self, state: &IndexState, position: usize) -> IndexEntry {
        let record = &self.corpus.records()[position];
        IndexEntry {
            key: record.key.clone(),
            expected: record.clone(),
            observed: state.observed[position],
        }
    }

    fn mark_position(
        &self,
        state: &mut IndexState,
        key: &RecordKey,
        position: usize,
    ) -> Result<MarkOutcome, IndexError> {
        if state.observed[position] {
            *state.repeats.entry(key.clone()).or_default() += 1;
            tracing::debug!(key = %key, policy = ?self.policy, "repeat delivery");
            return match self.policy {
                DuplicatePolicy::Ignore => Ok(MarkOutcome::Duplicate),
                DuplicatePolicy::Anomaly => {
                    Err(IndexError::DuplicateDelivery { key: key.clone() })
                }
            };
        }
        state.observed[position] = true;
        state.observed_count += 1;
        Ok(MarkOutcome::FirstObservation)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CorpusLine {
    Keyed(Record),
    Bare(Fields),
}

/// Parses one record per line. A line is either a serialized [`Record`]
/// (`{"key": .., "fields": {..}}`) or a bare field object whose key is
/// derived from `key_fields`. Blank lines are skipped.
pub fn corpus_from_jsonl_str(input: &str, key_fields: &[String]) -> Result<Corpus, CorpusError> {
    let mut records = Vec::new();
    for (idx, line) in input.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let parsed: CorpusLine =
            serde_json::from_str(trimmed).map_err(|err| CorpusError::Format {
                line: idx + 1,
                message: err.to_string(),
            })?;
        let record = match parsed {
            CorpusLine::Keyed(record) => record,
            CorpusLine::Bare(fields) => Record::keyed_by(fields, key_fields)?,
        };
        records.push(record);
    }
    Ok(Corpus::new(records)?)
}

pub fn read_corpus_jsonl(path: &Path, key_fields: &[String]) -> Result<Corpus, CorpusError> {
    let input = fs::read_to_string(path)?;
    corpus_from_jsonl_str(&input, key_fields)
}

pub fn corpus_from_csv_str(input: &str, key_fields: &[String]) -> Result<Corpus, CorpusError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_reader(input.as_bytes());
    let headers = reader.headers().cloned()?;
    if headers.is_empty() {
        return Err(CorpusError::MissingHeaders);
    }

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let fields = headers
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.to_owned(), parse_field(row.get(idx).unwrap_or_default())))
            .collect::<Fields>();
        records.push(Record::keyed_by(fields, key_fields)?);
    }
    Ok(Corpus::new(records)?)
}

pub fn read_corpus_csv(path: &Path, key_fields: &[String]) -> Result<Corpus, CorpusError> {
    let input = fs::read_to_string(path)?;
    corpus_from_csv_str(&input, key_fields)
}

fn parse_field(field: &str) -> FieldValue {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        return FieldValue::Null;
    }

    if let Ok(value) = trimmed.parse::<i64>() {
        return FieldValue::Int64(value);
    }
    if let Ok(value) = trimmed.parse::<f64>() {
        return FieldValue::Float64(value);
    }
    if let Ok(value) = trimmed.parse::<bool>() {
        return FieldValue::Bool(value);
    }

    FieldValue::Utf8(trimmed.to_owned())
}
