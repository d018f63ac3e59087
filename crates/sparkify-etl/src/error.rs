//! Error types for the ETL pipeline
//!
//! The variants follow the life of a load unit: discovering files,
//! transforming them, bulk loading staging, merging into the star schema and
//! cleaning up the staging table.

use std::path::PathBuf;

use thiserror::Error;

use crate::transform::TransformError;

/// Result type alias for ETL operations
pub type Result<T> = std::result::Result<T, EtlError>;

#[derive(Error, Debug)]
pub enum EtlError {
    /// Walking the source tree failed; fatal to the whole run
    #[error("Failed to read source tree: {0}")]
    Extract(#[from] walkdir::Error),

    /// A source file could not be transformed
    #[error("Failed to parse '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: TransformError,
    },

    /// Creating or bulk loading a staging table failed
    #[error("Failed to load staging table '{table}': {source}")]
    Load {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    /// A merge statement failed; the merge transaction was rolled back
    #[error("Failed to merge into '{table}': {source}")]
    Merge {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    /// Dropping a staging table failed
    #[error("Failed to drop staging table '{table}': {source}")]
    Cleanup {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Database connection failed: {0}. Check DATABASE_URL and that PostgreSQL is reachable.")]
    Connect(#[source] sqlx::Error),

    #[error("Database query failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Failed to apply migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("IO error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Common(#[from] sparkify_common::CommonError),
}

impl EtlError {
    pub fn parse(path: impl Into<PathBuf>, source: TransformError) -> Self {
        Self::Parse {
            path: path.into(),
            source,
        }
    }

    pub fn load(table: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Load {
            table: table.into(),
            source,
        }
    }

    pub fn merge(table: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Merge {
            table: table.into(),
            source,
        }
    }

    pub fn cleanup(table: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Cleanup {
            table: table.into(),
            source,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
