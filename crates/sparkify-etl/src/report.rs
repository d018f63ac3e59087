//! Run reporting
//!
//! A [`RunReport`] is returned by a successful run. It is printed by the CLI
//! and inspected by the integration tests.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::constraints::ConstraintOutcome;
use crate::merge::MergeOutcome;
use crate::transform::SourceKind;

/// Lifecycle of one load unit's staging table
///
/// States only move forward: `Idle -> StagingCreated -> Loaded -> Merged ->
/// Dropped`. A unit that fails part way is still dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    #[default]
    Idle,
    StagingCreated,
    Loaded,
    Merged,
    Dropped,
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoadState::Idle => "idle",
            LoadState::StagingCreated => "staging_created",
            LoadState::Loaded => "loaded",
            LoadState::Merged => "merged",
            LoadState::Dropped => "dropped",
        })
    }
}

/// A source file left out of the load
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadUnitReport {
    pub kind: SourceKind,
    pub staging_table: String,
    pub state: LoadState,
    pub files_seen: usize,
    pub files_loaded: usize,
    pub skipped: Vec<SkippedFile>,
    pub rows_staged: u64,
    pub inserted: Vec<MergeOutcome>,
    pub elapsed: Duration,
}

impl LoadUnitReport {
    pub fn new(kind: SourceKind, staging_table: impl Into<String>) -> Self {
        Self {
            kind,
            staging_table: staging_table.into(),
            state: LoadState::Idle,
            files_seen: 0,
            files_loaded: 0,
            skipped: Vec::new(),
            rows_staged: 0,
            inserted: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// Move to `next`; moving backwards is ignored
    pub fn advance(&mut self, next: LoadState) {
        if next > self.state {
            debug!(
                unit = %self.kind,
                from = %self.state,
                to = %next,
                "Load unit state change"
            );
            self.state = next;
        }
    }

    /// Rows inserted into `table` by this unit's merge, if it targets it
    pub fn inserted_into(&self, table: &str) -> Option<u64> {
        self.inserted
            .iter()
            .find(|o| o.target == table)
            .map(|o| o.inserted)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub units: Vec<LoadUnitReport>,
    pub constraints: Vec<ConstraintOutcome>,
    /// Songplays whose song and artist were resolved
    pub resolved_songplays: i64,
    pub total_songplays: i64,
}

impl RunReport {
    pub fn unit(&self, kind: SourceKind) -> Option<&LoadUnitReport> {
        self.units.iter().find(|u| u.kind == kind)
    }

    pub fn skipped_files(&self) -> impl Iterator<Item = &SkippedFile> {
        self.units.iter().flat_map(|u| u.skipped.iter())
    }

    pub fn failed_constraints(&self) -> impl Iterator<Item = &ConstraintOutcome> {
        self.constraints.iter().filter(|c| c.is_failed())
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for unit in &self.units {
            writeln!(
                f,
                "{}: {}/{} files loaded, {} rows staged into {} ({}, {:.2?})",
                unit.kind,
                unit.files_loaded,
                unit.files_seen,
                unit.rows_staged,
                unit.staging_table,
                unit.state,
                unit.elapsed,
            )?;
            for outcome in &unit.inserted {
                writeln!(f, "  {:<10} +{}", outcome.target, outcome.inserted)?;
            }
            for skipped in &unit.skipped {
                writeln!(f, "  skipped {}: {}", skipped.path.display(), skipped.error)?;
            }
        }

        for constraint in self.failed_constraints() {
            if let ConstraintOutcome::Failed { name, message } = constraint {
                writeln!(f, "constraint {name} failed: {message}")?;
            }
        }

        write!(
            f,
            "songplays with a resolved song and artist: {} of {}",
            self.resolved_songplays, self.total_songplays
        )
    }
}
