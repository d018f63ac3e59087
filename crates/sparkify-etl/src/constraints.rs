//! Foreign keys and indexes applied after the merges
//!
//! Each statement runs on its own. One that fails is reported and the rest
//! still run.

use serde::Serialize;
use sqlx::postgres::PgConnection;
use tracing::{info, warn};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    ForeignKey,
    Index,
}

/// A named schema object and the DDL that creates it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub name: &'static str,
    pub kind: ConstraintKind,
    pub sql: &'static str,
}

impl Constraint {
    const fn foreign_key(name: &'static str, sql: &'static str) -> Self {
        Self {
            name,
            kind: ConstraintKind::ForeignKey,
            sql,
        }
    }

    const fn index(name: &'static str, sql: &'static str) -> Self {
        Self {
            name,
            kind: ConstraintKind::Index,
            sql,
        }
    }

    async fn exists(&self, conn: &mut PgConnection) -> Result<bool> {
        let query = match self.kind {
            ConstraintKind::ForeignKey => {
                "SELECT EXISTS (SELECT 1 FROM pg_constraint WHERE conname = $1)"
            },
            ConstraintKind::Index => "SELECT to_regclass($1) IS NOT NULL",
        };

        let exists: bool = sqlx::query_scalar(query)
            .bind(self.name)
            .fetch_one(&mut *conn)
            .await?;
        Ok(exists)
    }

    /// Create the object unless it is already there
    pub async fn apply(&self, conn: &mut PgConnection) -> ConstraintOutcome {
        match self.exists(conn).await {
            Ok(true) => return ConstraintOutcome::AlreadyPresent { name: self.name },
            Ok(false) => {},
            Err(e) => {
                return ConstraintOutcome::Failed {
                    name: self.name,
                    message: e.to_string(),
                }
            },
        }

        match sqlx::query(self.sql).execute(&mut *conn).await {
            Ok(_) => ConstraintOutcome::Applied { name: self.name },
            Err(e) => ConstraintOutcome::Failed {
                name: self.name,
                message: e.to_string(),
            },
        }
    }
}

/// Result of applying one constraint or index
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConstraintOutcome {
    Applied { name: &'static str },
    AlreadyPresent { name: &'static str },
    Failed { name: &'static str, message: String },
}

impl ConstraintOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Applied { name } | Self::AlreadyPresent { name } | Self::Failed { name, .. } => {
                name
            },
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Foreign keys first, then their supporting indexes
pub const STAR_SCHEMA_CONSTRAINTS: &[Constraint] = &[
    Constraint::foreign_key(
        "fk__songplays__time",
        "ALTER TABLE songplays ADD CONSTRAINT fk__songplays__time \
         FOREIGN KEY (start_time) REFERENCES time \
         ON DELETE RESTRICT ON UPDATE CASCADE",
    ),
    Constraint::foreign_key(
        "fk__songplays__users",
        "ALTER TABLE songplays ADD CONSTRAINT fk__songplays__users \
         FOREIGN KEY (user_id) REFERENCES users \
         ON DELETE RESTRICT ON UPDATE CASCADE",
    ),
    Constraint::foreign_key(
        "fk__songplays__songs",
        "ALTER TABLE songplays ADD CONSTRAINT fk__songplays__songs \
         FOREIGN KEY (song_id) REFERENCES songs \
         ON DELETE RESTRICT ON UPDATE CASCADE",
    ),
    Constraint::foreign_key(
        "fk__songplays__artists",
        "ALTER TABLE songplays ADD CONSTRAINT fk__songplays__artists \
         FOREIGN KEY (artist_id) REFERENCES artists \
         ON DELETE RESTRICT ON UPDATE CASCADE",
    ),
    Constraint::foreign_key(
        "fk__songs__artists",
        "ALTER TABLE songs ADD CONSTRAINT fk__songs__artists \
         FOREIGN KEY (artist_id) REFERENCES artists \
         ON DELETE RESTRICT ON UPDATE CASCADE",
    ),
    Constraint::index(
        "idx_songplays_start_time",
        "CREATE INDEX IF NOT EXISTS idx_songplays_start_time ON songplays (start_time)",
    ),
    Constraint::index(
        "idx_songplays_user_id",
        "CREATE INDEX IF NOT EXISTS idx_songplays_user_id ON songplays (user_id)",
    ),
    Constraint::index(
        "idx_songplays_song_id",
        "CREATE INDEX IF NOT EXISTS idx_songplays_song_id ON songplays (song_id)",
    ),
    Constraint::index(
        "idx_songplays_artist_id",
        "CREATE INDEX IF NOT EXISTS idx_songplays_artist_id ON songplays (artist_id)",
    ),
    Constraint::index(
        "idx_songs_artist_id",
        "CREATE INDEX IF NOT EXISTS idx_songs_artist_id ON songs (artist_id)",
    ),
];

/// Apply every star-schema constraint, collecting one outcome per object
pub async fn apply_all(conn: &mut PgConnection) -> Vec<ConstraintOutcome> {
    let mut outcomes = Vec::with_capacity(STAR_SCHEMA_CONSTRAINTS.len());

    for constraint in STAR_SCHEMA_CONSTRAINTS {
        let outcome = constraint.apply(conn).await;
        match &outcome {
            ConstraintOutcome::Failed { name, message } => {
                warn!(constraint = name, error = %message, "Failed to apply constraint");
            },
            other => info!(constraint = other.name(), outcome = ?other, "Constraint checked"),
        }
        outcomes.push(outcome);
    }

    outcomes
}
