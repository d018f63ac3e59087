//! Error types shared by the Sparkify crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

#[derive(Error, Debug)]
pub enum CommonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid SQL identifier '{0}': expected lowercase letters, digits and underscores")]
    InvalidIdentifier(String),

    #[error("Column '{0}' is declared more than once")]
    DuplicateColumn(String),

    #[error("A column spec needs at least one column")]
    EmptyColumnSpec,

    #[error("Configuration error: {0}")]
    Config(String),
}
