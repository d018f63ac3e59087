//! Set-based merges from staging into the star schema
//!
//! Every statement is an `INSERT ... SELECT` that skips rows whose key is
//! already present, so re-running a merge against the same staging data
//! inserts nothing. Statements run in foreign-key order inside one
//! transaction per load unit:
//!
//! 1. `artists`, 2. `songs` (catalog unit)
//! 3. `users`, 4. `time`, 5. `songplays` (event-log unit)
//!
//! `songplays` resolves `song_id`/`artist_id` by exact title and artist name,
//! first against the catalog staging rows of the current run (which keep
//! every spelling of an artist's name), then against the merged `songs` and
//! `artists` tables for catalog data loaded by earlier runs. Unmatched plays
//! are kept with NULL references.

use serde::Serialize;
use sqlx::postgres::PgConnection;
use sqlx::Connection;
use tracing::{debug, info};

use crate::error::{EtlError, Result};
use crate::staging::StagingTable;

/// One insert-or-skip statement and the table it fills
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeStatement {
    pub target: &'static str,
    pub sql: String,
}

/// Rows a merge statement inserted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub target: &'static str,
    pub inserted: u64,
}

/// Ordered merge statements for one load unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeEngine {
    statements: Vec<MergeStatement>,
}

impl MergeEngine {
    pub fn new(statements: Vec<MergeStatement>) -> Self {
        Self { statements }
    }

    /// `artists` then `songs` from catalog staging
    pub fn catalog(staging: &StagingTable) -> Self {
        let s = staging.name();

        Self::new(vec![
            MergeStatement {
                target: "artists",
                sql: format!(
                    "INSERT INTO artists (artist_id, name, location, latitude, longitude) \
                     SELECT c.artist_id, c.artist_name, c.artist_location, \
                            c.artist_latitude, c.artist_longitude \
                     FROM {s} AS c \
                     WHERE c.artist_id IS NOT NULL \
                     ORDER BY c.id \
                     ON CONFLICT (artist_id) DO NOTHING"
                ),
            },
            MergeStatement {
                target: "songs",
                sql: format!(
                    "INSERT INTO songs (song_id, title, artist_id, year, duration) \
                     SELECT c.song_id, c.title, c.artist_id, c.year, c.duration \
                     FROM {s} AS c \
                     WHERE c.song_id IS NOT NULL \
                     ORDER BY c.id \
                     ON CONFLICT (song_id) DO NOTHING"
                ),
            },
        ])
    }

    /// `users`, `time` and then `songplays` from event-log staging
    ///
    /// `catalog` must still hold this run's catalog rows when the merge runs.
    pub fn event_log(staging: &StagingTable, catalog: &StagingTable) -> Self {
        let s = staging.name();
        let c = catalog.name();

        Self::new(vec![
            MergeStatement {
                target: "users",
                sql: format!(
                    "INSERT INTO users (user_id, first_name, last_name, gender, level) \
                     SELECT DISTINCT ON (l.user_id::INTEGER) \
                            l.user_id::INTEGER, l.first_name, l.last_name, l.gender, l.level \
                     FROM {s} AS l \
                     WHERE l.user_id IS NOT NULL \
                     ORDER BY l.user_id::INTEGER, l.ts DESC \
                     ON CONFLICT (user_id) DO NOTHING"
                ),
            },
            MergeStatement {
                target: "time",
                sql: format!(
                    "INSERT INTO time (start_time, hour, day, week, month, year, weekday) \
                     SELECT DISTINCT l.ts, l.hour, l.day, l.week, l.month, l.year, l.weekday \
                     FROM {s} AS l \
                     WHERE l.ts IS NOT NULL \
                     ON CONFLICT (start_time) DO NOTHING"
                ),
            },
            MergeStatement {
                target: "songplays",
                sql: format!(
                    "INSERT INTO songplays \
                         (start_time, user_id, level, song_id, artist_id, session_id, location, user_agent) \
                     SELECT p.ts, p.user_id, p.level, m.song_id, m.artist_id, \
                            p.session_id, p.location, p.user_agent \
                     FROM ( \
                         SELECT DISTINCT ON (l.ts, l.user_id::INTEGER, l.session_id::INTEGER) \
                                l.ts, l.user_id::INTEGER AS user_id, l.level, l.song, l.artist, \
                                l.session_id::INTEGER AS session_id, l.location, l.user_agent \
                         FROM {s} AS l \
                         WHERE l.ts IS NOT NULL AND l.user_id IS NOT NULL \
                         ORDER BY l.ts, l.user_id::INTEGER, l.session_id::INTEGER, l.id \
                     ) AS p \
                     LEFT JOIN LATERAL ( \
                         SELECT r.song_id, r.artist_id \
                         FROM ( \
                             SELECT 0 AS source, c.song_id, c.artist_id \
                             FROM {c} AS c \
                             WHERE c.song_id IS NOT NULL \
                               AND c.title = p.song AND c.artist_name = p.artist \
                             UNION ALL \
                             SELECT 1 AS source, so.song_id, so.artist_id \
                             FROM songs AS so \
                             JOIN artists AS a ON a.artist_id = so.artist_id \
                             WHERE so.title = p.song AND a.name = p.artist \
                         ) AS r \
                         ORDER BY r.source, r.song_id \
                         LIMIT 1 \
                     ) AS m ON TRUE \
                     WHERE NOT EXISTS ( \
                         SELECT 1 FROM songplays AS sp \
                         WHERE sp.start_time = p.ts \
                           AND sp.user_id = p.user_id \
                           AND sp.session_id IS NOT DISTINCT FROM p.session_id \
                     )"
                ),
            },
        ])
    }

    pub fn statements(&self) -> &[MergeStatement] {
        &self.statements
    }

    pub fn targets(&self) -> Vec<&'static str> {
        self.statements.iter().map(|s| s.target).collect()
    }

    /// Run every statement in order inside one transaction
    ///
    /// On error the transaction is rolled back and no target table changes.
    pub async fn run(&self, conn: &mut PgConnection) -> Result<Vec<MergeOutcome>> {
        let mut tx = conn.begin().await?;
        let mut outcomes = Vec::with_capacity(self.statements.len());

        for statement in &self.statements {
            let result = sqlx::query(&statement.sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| EtlError::merge(statement.target, e))?;

            debug!(
                table = statement.target,
                inserted = result.rows_affected(),
                "Merged staging rows"
            );

            outcomes.push(MergeOutcome {
                target: statement.target,
                inserted: result.rows_affected(),
            });
        }

        tx.commit().await?;

        info!(
            tables = ?self.targets(),
            inserted = outcomes.iter().map(|o| o.inserted).sum::<u64>(),
            "Merge committed"
        );

        Ok(outcomes)
    }
}
