//! Database connection and schema setup
//!
//! The pipeline works over a single exclusive connection: staging tables,
//! COPY streams and merge transactions all share it.

use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;
use tracing::info;

use crate::error::{EtlError, Result};

/// Open a connection, giving up after `timeout`
pub async fn connect(url: &str, timeout: Duration) -> Result<PgConnection> {
    let options: PgConnectOptions = url.parse().map_err(EtlError::Connect)?;

    let conn = tokio::time::timeout(timeout, PgConnection::connect_with(&options))
        .await
        .map_err(|_| {
            EtlError::Connect(sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no connection after {}s", timeout.as_secs()),
            )))
        })?
        .map_err(EtlError::Connect)?;

    info!(
        host = options.get_host(),
        port = options.get_port(),
        database = options.get_database().unwrap_or_default(),
        "Connected to database"
    );

    Ok(conn)
}

/// Create the star schema tables if they are missing
pub async fn migrate(conn: &mut PgConnection) -> Result<()> {
    sqlx::migrate!("../../migrations").run(conn).await?;
    info!("Star schema migrations applied");
    Ok(())
}

/// `(resolved, total)` songplays, where resolved plays carry an artist
pub async fn songplay_counts(conn: &mut PgConnection) -> Result<(i64, i64)> {
    let counts: (i64, i64) = sqlx::query_as("SELECT COUNT(artist_id), COUNT(*) FROM songplays")
        .fetch_one(&mut *conn)
        .await?;
    Ok(counts)
}
