//! Typed staging column declarations
//!
//! A staging table is described by an ordered list of `(name, type)` pairs.
//! The order is load-bearing: it is the order of the fields a transformer
//! emits and the column list handed to `COPY`.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{CommonError, Result};

#[allow(clippy::expect_used)]
static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]{0,62}$").expect("identifier pattern compiles"));

/// Check that `name` is a plain, unquoted PostgreSQL identifier
///
/// Table and column names are interpolated into DDL and COPY statements, so
/// anything outside `[a-z_][a-z0-9_]*` is rejected up front.
pub fn validate_identifier(name: &str) -> Result<&str> {
    if IDENTIFIER.is_match(name) {
        Ok(name)
    } else {
        Err(CommonError::InvalidIdentifier(name.to_string()))
    }
}

/// Declared semantic type of a staging column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Text,
    Integer,
    Decimal,
    Timestamp,
    Boolean,
}

impl ColumnType {
    pub fn sql(self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Decimal => "DECIMAL",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Boolean => "BOOLEAN",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
}

/// Ordered, non-empty, duplicate-free column declarations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    columns: Vec<Column>,
}

impl ColumnSpec {
    pub fn new<'a, I>(columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, ColumnType)>,
    {
        let mut declared: Vec<Column> = Vec::new();

        for (name, ty) in columns {
            validate_identifier(name)?;
            if declared.iter().any(|c| c.name == name) {
                return Err(CommonError::DuplicateColumn(name.to_string()));
            }
            declared.push(Column {
                name: name.to_string(),
                ty,
            });
        }

        if declared.is_empty() {
            return Err(CommonError::EmptyColumnSpec);
        }

        Ok(Self { columns: declared })
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// `a, b, c` for COPY and INSERT column lists
    pub fn names(&self) -> String {
        self.columns
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `a TEXT, b DECIMAL` for CREATE TABLE
    pub fn definitions(&self) -> String {
        self.columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.ty))
            .collect::<Vec<_>>()
            .join(", ")
    }
}
