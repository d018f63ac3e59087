//! Sparkify Common Library
//!
//! Database-free building blocks shared by the Sparkify ETL workspace.
//!
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Logging**: `tracing` subscriber setup driven by [`logging::LogConfig`]
//! - **Columns**: typed staging column declarations ([`columns::ColumnSpec`])
//!
//! # Example
//!
//! ```
//! use sparkify_common::columns::{ColumnSpec, ColumnType};
//!
//! let spec = ColumnSpec::new([("song_id", ColumnType::Text), ("duration", ColumnType::Decimal)])?;
//! assert_eq!(spec.names(), "song_id, duration");
//! # Ok::<(), sparkify_common::CommonError>(())
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod columns;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
