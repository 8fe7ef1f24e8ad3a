#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Null,
    Bool,
    Int64,
    Float64,
    Utf8,
}

/// One field of a record payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

impl FieldValue {
    #[must_use]
    pub fn field_type(&self) -> FieldType {
        match self {
            Self::Null => FieldType::Null,
            Self::Bool(_) => FieldType::Bool,
            Self::Int64(_) => FieldType::Int64,
            Self::Float64(_) => FieldType::Float64,
            Self::Utf8(_) => FieldType::Utf8,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Canonical text used when the value takes part in a record key.
    #[must_use]
    pub fn key_fragment(&self) -> String {
        match self {
            Self::Null => "null".to_owned(),
            Self::Bool(v) => v.to_string(),
            Self::Int64(v) => v.to_string(),
            Self::Float64(v) => format!("{v:?}"),
            Self::Utf8(v) => v.clone(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Utf8(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float64(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

pub type Fields = BTreeMap<String, FieldValue>;

/// Identifying key of a record, unique within one corpus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(String);

impl RecordKey {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Builds a key from the named fields, in the order given.
    ///
    /// The same content always yields the same key, so a record that went
    /// through the pipeline can be matched back by re-deriving it. `\\`, `;`
    /// and `=` inside names and values are backslash-escaped, so distinct
    /// field contents never share a key.
    pub fn derive(fields: &Fields, key_fields: &[String]) -> Result<Self, TypeError> {
        if key_fields.is_empty() {
            return Err(TypeError::EmptyKeyFields);
        }
        let mut parts = Vec::with_capacity(key_fields.len());
        for name in key_fields {
            let value = fields
                .get(name)
                .ok_or_else(|| TypeError::MissingKeyField { field: name.clone() })?;
            parts.push(format!(
                "{}={}",
                escape_key_part(name),
                escape_key_part(&value.key_fragment())
            ));
        }
        Ok(Self(parts.join(";")))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn escape_key_part(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    for ch in part.chars() {
        if matches!(ch, '\\' | ';' | '=') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    pub fields: Fields,
}

impl Record {
    #[must_use]
    pub fn new(key: impl Into<RecordKey>, fields: Fields) -> Self {
        Self {
            key: key.into(),
            fields,
        }
    }

    pub fn keyed_by(fields: Fields, key_fields: &[String]) -> Result<Self, TypeError> {
        let key = RecordKey::derive(&fields, key_fields)?;
        Ok(Self { key, fields })
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

impl From<String> for RecordKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Ordered, immutable set of records for one run.
///
/// Cloning shares the underlying records; the supplier and the received index
/// hold clones of the same corpus.
#[derive(Debug, Clone, PartialEq)]
pub struct Corpus {
    records: Arc<[Record]>,
}

impl Corpus {
    pub fn new(records: Vec<Record>) -> Result<Self, TypeError> {
        let mut seen = BTreeSet::new();
        for record in &records {
            if !seen.insert(&record.key) {
                return Err(TypeError::DuplicateKey {
                    key: record.key.clone(),
                });
            }
        }
        Ok(Self {
            records: records.into(),
        })
    }

    #[must_use]
    pub fn empty() -> Self {
        Self {
            records: Arc::from(Vec::new()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn get(&self, position: usize) -> Option<&Record> {
        self.records.get(position)
    }

    #[must_use]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    /// Expected field absent from the emitted record.
    MissingField,
    /// Emitted record carries a field the expectation does not have.
    UnexpectedField,
    TypeMismatch,
    ValueMismatch,
}

/// A single field-level discrepancy between expected and actual payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: String,
    pub kind: DiffKind,
    pub expected: Option<FieldValue>,
    pub actual: Option<FieldValue>,
}

impl fmt::Display for FieldDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |value: &Option<FieldValue>| {
            value
                .as_ref()
                .map_or_else(|| "<absent>".to_owned(), ToString::to_string)
        };
        write!(
            f,
            "{}: {:?} expected={} actual={}",
            self.field,
            self.kind,
            show(&self.expected),
            show(&self.actual)
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("record key needs at least one key field")]
    EmptyKeyFields,
    #[error("key field {field:?} is missing from the record")]
    MissingKeyField { field: String },
    #[error("corpus contains key {key} more than once")]
    DuplicateKey { key: RecordKey },
}
