//! Source record transformers
//!
//! Each source kind has a pure transform from one file's text to staging
//! rows whose fields line up with that kind's [`ColumnSpec`]. Rows are then
//! encoded for `COPY` by [`copy_text`].
//!
//! Null handling is shared: a JSON `null`, an absent key and an empty string
//! all become SQL NULL. Numbers keep their JSON text, so `0` stays `0`.

pub mod catalog;
pub mod copy_text;
pub mod event_log;

use serde::{Deserialize, Serialize};
use serde_json::Number;
use sparkify_common::columns::{ColumnSpec, ColumnType};
use sparkify_common::CommonError;
use thiserror::Error;

pub use catalog::CatalogEntry;
pub use event_log::{EventLogEntry, EventTime};

/// Why a source file could not be transformed
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("malformed JSON at line {line}, column {column}: {source}")]
    Json {
        line: usize,
        column: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("missing required field '{field}' at line {line}")]
    MissingField { line: usize, field: &'static str },

    #[error("timestamp {value} at line {line} is out of range")]
    InvalidTimestamp { line: usize, value: String },

    /// PostgreSQL text values cannot hold a NUL character
    #[error("NUL character in '{field}' at line {line}")]
    InvalidText { line: usize, field: &'static str },
}

impl TransformError {
    /// Wrap a serde error raised while reading the record that starts on
    /// `first_line` (1-based) of the file.
    pub(crate) fn json(first_line: usize, source: serde_json::Error) -> Self {
        Self::Json {
            line: first_line + source.line().saturating_sub(1),
            column: source.column(),
            source,
        }
    }
}

/// One field of a staging row; `None` is SQL NULL
pub type Field = Option<String>;

/// Tabular projection of one source record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingRow(Vec<Field>);

impl StagingRow {
    pub fn new(fields: Vec<Field>) -> Self {
        Self(fields)
    }

    pub fn fields(&self) -> &[Field] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).and_then(|f| f.as_deref())
    }
}

/// The two kinds of source data, each with its own transformer and columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Song catalog entries (songs and artists)
    Catalog,
    /// User listening-session events
    EventLog,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Catalog => "catalog",
            SourceKind::EventLog => "event_log",
        }
    }

    /// Staging columns this kind's transformer emits, in order
    pub fn columns(self) -> Result<ColumnSpec, CommonError> {
        match self {
            SourceKind::Catalog => catalog::columns(),
            SourceKind::EventLog => event_log::columns(),
        }
    }

    /// Transform the full text of one source file
    pub fn transform(self, content: &str) -> Result<Vec<StagingRow>, TransformError> {
        match self {
            SourceKind::Catalog => catalog::transform(content),
            SourceKind::EventLog => event_log::transform(content),
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A JSON value that may arrive as either a string or a number
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Text(String),
    Number(Number),
    Bool(bool),
}

impl Scalar {
    fn to_field(&self) -> Field {
        match self {
            Scalar::Text(s) => text(Some(s)),
            Scalar::Number(n) => Some(n.to_string()),
            Scalar::Bool(b) => Some(b.to_string()),
        }
    }

    fn is_blank(&self) -> bool {
        matches!(self, Scalar::Text(s) if s.trim().is_empty())
    }
}

/// Fail the row if any field carries a NUL, naming the first such column
fn reject_nul(
    row: &StagingRow,
    columns: &[(&'static str, ColumnType)],
    line: usize,
) -> Result<(), TransformError> {
    let nul = row
        .fields()
        .iter()
        .position(|f| f.as_deref().is_some_and(|s| s.contains('\0')));

    match nul {
        Some(index) => Err(TransformError::InvalidText {
            line,
            field: columns.get(index).map_or("unknown", |(name, _)| *name),
        }),
        None => Ok(()),
    }
}

fn text(value: Option<&str>) -> Field {
    value.filter(|s| !s.is_empty()).map(str::to_string)
}

fn number(value: Option<&Number>) -> Field {
    value.map(Number::to_string)
}

fn scalar(value: Option<&Scalar>) -> Field {
    value.and_then(Scalar::to_field)
}
