//! Staging tables
//!
//! A staging table is an `UNLOGGED` table with a `SERIAL` id and the
//! transformer's columns, with no keys or constraints. It receives one bulk
//! `COPY` per load and is dropped once its rows have been merged.

use sparkify_common::columns::{validate_identifier, ColumnSpec};
use sqlx::postgres::{PgConnection, PgCopyIn};
use tracing::{debug, info};

use crate::error::{EtlError, Result};
use crate::transform::copy_text::{self, COPY_OPTIONS};
use crate::transform::StagingRow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingTable {
    name: String,
    columns: ColumnSpec,
}

impl StagingTable {
    pub fn new(name: impl Into<String>, columns: ColumnSpec) -> Result<Self> {
        let name = name.into();
        validate_identifier(&name)?;
        Ok(Self { name, columns })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &ColumnSpec {
        &self.columns
    }

    pub fn create_sql(&self) -> String {
        format!(
            "CREATE UNLOGGED TABLE {} (id SERIAL, {})",
            self.name,
            self.columns.definitions()
        )
    }

    pub fn drop_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS {}", self.name)
    }

    pub fn copy_sql(&self) -> String {
        format!(
            "COPY {} ({}) FROM STDIN WITH ({})",
            self.name,
            self.columns.names(),
            COPY_OPTIONS
        )
    }

    /// Create the table, replacing one left behind by an interrupted run
    pub async fn create(&self, conn: &mut PgConnection) -> Result<()> {
        for sql in [self.drop_sql(), self.create_sql()] {
            sqlx::query(&sql)
                .execute(&mut *conn)
                .await
                .map_err(|e| EtlError::load(&self.name, e))?;
        }

        debug!(table = %self.name, columns = self.columns.len(), "Created staging table");
        Ok(())
    }

    /// Open the single `COPY` that feeds this table for the current load
    pub async fn bulk_append<'a>(&'a self, conn: &'a mut PgConnection) -> Result<BulkAppend<'a>> {
        let copy = conn
            .copy_in_raw(&self.copy_sql())
            .await
            .map_err(|e| EtlError::load(&self.name, e))?;

        Ok(BulkAppend {
            table: self,
            copy,
            buffer: Vec::new(),
            rows_sent: 0,
        })
    }

    /// Remove the table if it exists
    pub async fn drop(&self, conn: &mut PgConnection) -> Result<()> {
        sqlx::query(&self.drop_sql())
            .execute(&mut *conn)
            .await
            .map_err(|e| EtlError::cleanup(&self.name, e))?;

        debug!(table = %self.name, "Dropped staging table");
        Ok(())
    }
}

/// An open `COPY ... FROM STDIN` into a staging table
///
/// Rows can be sent in as many chunks as convenient; they all belong to the
/// same COPY. Call [`finish`](Self::finish) to commit them or
/// [`abort`](Self::abort) to discard everything sent so far.
pub struct BulkAppend<'a> {
    table: &'a StagingTable,
    copy: PgCopyIn<&'a mut PgConnection>,
    buffer: Vec<u8>,
    rows_sent: u64,
}

impl BulkAppend<'_> {
    pub async fn send(&mut self, rows: &[StagingRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        self.buffer.clear();
        copy_text::encode_rows(rows, &mut self.buffer);

        self.copy
            .send(self.buffer.as_slice())
            .await
            .map_err(|e| EtlError::load(&self.table.name, e))?;

        self.rows_sent += rows.len() as u64;
        Ok(())
    }

    pub fn rows_sent(&self) -> u64 {
        self.rows_sent
    }

    /// Complete the COPY; returns the number of rows the server stored
    pub async fn finish(self) -> Result<u64> {
        let table = self.table.name.clone();
        let rows = self
            .copy
            .finish()
            .await
            .map_err(|e| EtlError::load(&table, e))?;

        info!(table = %table, rows, "Bulk loaded staging table");
        Ok(rows)
    }

    pub async fn abort(self, reason: &str) -> Result<()> {
        let table = self.table.name.clone();
        self.copy
            .abort(reason)
            .await
            .map_err(|e| EtlError::load(&table, e))
    }
}
