//! Pipeline driver
//!
//! Runs the catalog load unit and then the event-log load unit over one
//! database connection. For each unit:
//!
//! 1. create the staging table
//! 2. stream every source file into a single COPY
//! 3. merge staging into the star schema in one transaction
//! 4. drop the staging table, whether or not the earlier steps succeeded
//!
//! The event-log unit resolves songplays against the catalog staging rows as
//! well as songs and artists, so it runs nested inside the catalog unit: the
//! catalog staging table is dropped only after the event-log unit finishes.
//! A failing unit ends the run.

use std::path::Path;
use std::time::{Duration, Instant};

use sqlx::postgres::PgConnection;
use tracing::{error, info, instrument, warn};

use crate::config::{EtlConfig, ParseFailurePolicy};
use crate::constraints;
use crate::db;
use crate::error::{EtlError, Result};
use crate::extract::SourceTree;
use crate::merge::MergeEngine;
use crate::report::{LoadState, LoadUnitReport, RunReport, SkippedFile};
use crate::staging::{BulkAppend, StagingTable};
use crate::transform::{SourceKind, StagingRow};

/// Staging table for the song catalog
pub const CATALOG_STAGING: &str = "song_staging";

/// Staging table for the event logs
pub const EVENT_LOG_STAGING: &str = "log_staging";

/// Everything needed to move one kind of source data into the star schema
#[derive(Debug, Clone)]
pub struct LoadUnit {
    pub kind: SourceKind,
    pub source: SourceTree,
    pub staging: StagingTable,
    pub merge: MergeEngine,
}

impl LoadUnit {
    pub fn catalog(dir: impl AsRef<Path>, extension: &str) -> Result<Self> {
        Self::new(SourceKind::Catalog, CATALOG_STAGING, dir, extension)
    }

    pub fn event_log(dir: impl AsRef<Path>, extension: &str) -> Result<Self> {
        Self::new(SourceKind::EventLog, EVENT_LOG_STAGING, dir, extension)
    }

    fn new(
        kind: SourceKind,
        staging: &str,
        dir: impl AsRef<Path>,
        extension: &str,
    ) -> Result<Self> {
        let staging = StagingTable::new(staging, kind.columns()?)?;
        let merge = match kind {
            SourceKind::Catalog => MergeEngine::catalog(&staging),
            SourceKind::EventLog => MergeEngine::event_log(
                &staging,
                &StagingTable::new(CATALOG_STAGING, SourceKind::Catalog.columns()?)?,
            ),
        };

        Ok(Self {
            kind,
            source: SourceTree::new(dir, extension)?,
            staging,
            merge,
        })
    }

    /// Create, load, merge and drop this unit's staging table
    #[instrument(skip_all, fields(unit = %self.kind, staging = %self.staging.name()))]
    pub async fn run(
        &self,
        conn: &mut PgConnection,
        policy: ParseFailurePolicy,
    ) -> Result<LoadUnitReport> {
        let started = Instant::now();
        let mut report = LoadUnitReport::new(self.kind, self.staging.name());

        info!(root = %self.source.root().display(), "Starting load unit");

        let loaded = self.load_and_merge(conn, policy, &mut report).await;
        report.elapsed = started.elapsed();

        self.settle(conn, loaded, report).await
    }

    /// Run this unit, keeping its staging table alive until `inner` has run
    ///
    /// Reports come back outer first. The staging table is still dropped when
    /// either unit fails, and the first failure wins.
    #[instrument(skip_all, fields(unit = %self.kind, staging = %self.staging.name()))]
    pub async fn run_around(
        &self,
        inner: &LoadUnit,
        conn: &mut PgConnection,
        policy: ParseFailurePolicy,
    ) -> Result<Vec<LoadUnitReport>> {
        let started = Instant::now();
        let mut report = LoadUnitReport::new(self.kind, self.staging.name());

        info!(root = %self.source.root().display(), "Starting load unit");

        let merged = self.load_and_merge(conn, policy, &mut report).await;
        report.elapsed = started.elapsed();

        let mut nested = None;
        let loaded = match merged {
            Ok(()) => inner.run(conn, policy).await.map(|r| nested = Some(r)),
            Err(e) => Err(e),
        };

        let outer = self.settle(conn, loaded, report).await?;
        Ok(std::iter::once(outer).chain(nested).collect())
    }

    /// Drop the staging table and combine the outcome with the load result
    ///
    /// A cleanup failure never hides an earlier load failure.
    async fn settle(
        &self,
        conn: &mut PgConnection,
        loaded: Result<()>,
        mut report: LoadUnitReport,
    ) -> Result<LoadUnitReport> {
        let dropping = Instant::now();
        let cleanup = self.staging.drop(conn).await;
        report.elapsed += dropping.elapsed();

        match (loaded, cleanup) {
            (Ok(()), Ok(())) => {
                report.advance(LoadState::Dropped);
                info!(
                    files_loaded = report.files_loaded,
                    files_skipped = report.skipped.len(),
                    rows_staged = report.rows_staged,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Load unit complete"
                );
                Ok(report)
            },
            (Ok(()), Err(cleanup)) => Err(cleanup),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup)) => {
                error!(error = %cleanup, "Staging table left behind after failed load");
                Err(e)
            },
        }
    }

    async fn load_and_merge(
        &self,
        conn: &mut PgConnection,
        policy: ParseFailurePolicy,
        report: &mut LoadUnitReport,
    ) -> Result<()> {
        self.staging.create(conn).await?;
        report.advance(LoadState::StagingCreated);

        let mut copy = self.staging.bulk_append(conn).await?;
        match self.stream_files(&mut copy, policy, report).await {
            Ok(()) => report.rows_staged = copy.finish().await?,
            Err(e) => {
                if let Err(abort) = copy.abort(&e.to_string()).await {
                    warn!(error = %abort, "Failed to abort COPY");
                }
                return Err(e);
            },
        }
        report.advance(LoadState::Loaded);

        report.inserted = self.merge.run(conn).await?;
        report.advance(LoadState::Merged);

        Ok(())
    }

    async fn stream_files(
        &self,
        copy: &mut BulkAppend<'_>,
        policy: ParseFailurePolicy,
        report: &mut LoadUnitReport,
    ) -> Result<()> {
        for path in self.source.files() {
            let path = path?;
            report.files_seen += 1;

            let rows = match read_source(self.kind, &path).await {
                Ok(rows) => rows,
                Err(e) if policy == ParseFailurePolicy::Skip => {
                    warn!(path = %path.display(), error = %e, "Skipping source file");
                    report.skipped.push(SkippedFile {
                        path,
                        error: e.to_string(),
                    });
                    continue;
                },
                Err(e) => return Err(e),
            };

            copy.send(&rows).await?;
            report.files_loaded += 1;
        }

        if report.files_seen == 0 {
            warn!(root = %self.source.root().display(), "No source files found");
        }

        Ok(())
    }
}

/// Read one source file and transform it into staging rows
///
/// Nothing is sent to the database until the whole file has transformed, so
/// a bad file never leaves partial rows in staging.
pub async fn read_source(kind: SourceKind, path: &Path) -> Result<Vec<StagingRow>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| EtlError::io(path, e))?;
    kind.transform(&content).map_err(|e| EtlError::parse(path, e))
}

/// The whole ETL run over one exclusive connection
pub struct Pipeline {
    conn: PgConnection,
    catalog: LoadUnit,
    event_log: LoadUnit,
    policy: ParseFailurePolicy,
    apply_constraints: bool,
}

impl Pipeline {
    /// Connect and build the catalog and event-log units from `config`
    pub async fn connect(config: &EtlConfig) -> Result<Self> {
        config.validate()?;
        let conn = db::connect(
            &config.database_url,
            Duration::from_secs(config.connect_timeout_secs),
        )
        .await?;
        Self::new(conn, config)
    }

    /// Build a pipeline over an already open connection
    pub fn new(conn: PgConnection, config: &EtlConfig) -> Result<Self> {
        Ok(Self {
            conn,
            catalog: LoadUnit::catalog(&config.song_data_dir, &config.extension)?,
            event_log: LoadUnit::event_log(&config.log_data_dir, &config.extension)?,
            policy: config.on_parse_error,
            apply_constraints: config.apply_constraints,
        })
    }

    pub fn catalog(&self) -> &LoadUnit {
        &self.catalog
    }

    pub fn event_log(&self) -> &LoadUnit {
        &self.event_log
    }

    pub async fn migrate(&mut self) -> Result<()> {
        db::migrate(&mut self.conn).await
    }

    /// Run the catalog unit around the event-log unit, then apply constraints
    #[instrument(skip_all)]
    pub async fn run(&mut self) -> Result<RunReport> {
        let started = Instant::now();
        let mut report = RunReport::default();

        report.units = self
            .catalog
            .run_around(&self.event_log, &mut self.conn, self.policy)
            .await?;

        if self.apply_constraints {
            report.constraints = constraints::apply_all(&mut self.conn).await;
        }

        let (resolved, total) = db::songplay_counts(&mut self.conn).await?;
        report.resolved_songplays = resolved;
        report.total_songplays = total;

        info!(
            units = report.units.len(),
            skipped_files = report.skipped_files().count(),
            failed_constraints = report.failed_constraints().count(),
            resolved_songplays = resolved,
            total_songplays = total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ETL run complete"
        );

        Ok(report)
    }

    /// Hand the connection back, e.g. to inspect the loaded tables
    pub fn into_connection(self) -> PgConnection {
        self.conn
    }
}
