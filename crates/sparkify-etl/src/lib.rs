//! Sparkify ETL
//!
//! Loads the JSON song catalog and listening-event logs into the Sparkify
//! star schema (`songplays`, `users`, `songs`, `artists`, `time`).
//!
//! Each kind of source data is a [`pipeline::LoadUnit`]: its files are
//! transformed into tabular rows, bulk loaded into an unlogged staging table
//! with one `COPY`, merged into the star schema with insert-or-skip
//! statements, and the staging table is dropped. Re-running the ETL over the
//! same files inserts nothing new.
//!
//! # Example
//!
//! ```no_run
//! use sparkify_etl::config::EtlConfig;
//! use sparkify_etl::pipeline::Pipeline;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EtlConfig::from_env()?;
//!     let mut pipeline = Pipeline::connect(&config).await?;
//!     let report = pipeline.run().await?;
//!     println!("{report}");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod constraints;
pub mod db;
pub mod error;
pub mod extract;
pub mod merge;
pub mod pipeline;
pub mod report;
pub mod staging;
pub mod transform;

pub use error::{EtlError, Result};
