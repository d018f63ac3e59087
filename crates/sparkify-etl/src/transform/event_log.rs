//! Listening-session event transformer
//!
//! Event files are newline-delimited JSON. Only `NextSong` events from a
//! known user are staged; everything else (page views, logged-out traffic)
//! is filtered out here and is not an error. Each staged event carries its
//! `ts` broken down into the fields of the `time` dimension.

use chrono::{DateTime, Datelike, NaiveDateTime, Timelike, Weekday};
use serde::Deserialize;
use serde_json::Number;
use sparkify_common::columns::{ColumnSpec, ColumnType};
use sparkify_common::CommonError;

use super::{reject_nul, scalar, text, Field, Scalar, StagingRow, TransformError};

/// The only page that represents a song being played
pub const NEXT_SONG: &str = "NextSong";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const COLUMNS: [(&str, ColumnType); 17] = [
    ("song", ColumnType::Text),
    ("artist", ColumnType::Text),
    ("user_id", ColumnType::Text),
    ("first_name", ColumnType::Text),
    ("last_name", ColumnType::Text),
    ("gender", ColumnType::Text),
    ("level", ColumnType::Text),
    ("session_id", ColumnType::Text),
    ("location", ColumnType::Text),
    ("user_agent", ColumnType::Text),
    ("ts", ColumnType::Timestamp),
    ("hour", ColumnType::Integer),
    ("day", ColumnType::Integer),
    ("week", ColumnType::Integer),
    ("month", ColumnType::Integer),
    ("year", ColumnType::Integer),
    ("weekday", ColumnType::Boolean),
];

pub fn columns() -> Result<ColumnSpec, CommonError> {
    ColumnSpec::new(COLUMNS)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLogEntry {
    pub song: Option<String>,
    pub artist: Option<String>,
    pub user_id: Option<Scalar>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub gender: Option<String>,
    pub level: Option<String>,
    pub session_id: Option<Scalar>,
    pub location: Option<String>,
    pub user_agent: Option<String>,
    /// Epoch milliseconds
    pub ts: Option<Number>,
    pub page: Option<String>,
}

impl EventLogEntry {
    /// A song play by an identified user
    pub fn is_eligible(&self) -> bool {
        self.page.as_deref() == Some(NEXT_SONG)
            && self.user_id.as_ref().is_some_and(|id| !id.is_blank())
    }

    /// Project an eligible entry; ineligible entries yield `Ok(None)`
    pub fn to_row(&self, line: usize) -> Result<Option<StagingRow>, TransformError> {
        if !self.is_eligible() {
            return Ok(None);
        }

        let ts = self
            .ts
            .as_ref()
            .ok_or(TransformError::MissingField { line, field: "ts" })?;
        let time = millis(ts)
            .and_then(EventTime::from_millis)
            .ok_or_else(|| TransformError::InvalidTimestamp {
                line,
                value: ts.to_string(),
            })?;

        let mut fields = vec![
            text(self.song.as_deref()),
            text(self.artist.as_deref()),
            scalar(self.user_id.as_ref()),
            text(self.first_name.as_deref()),
            text(self.last_name.as_deref()),
            text(self.gender.as_deref()),
            text(self.level.as_deref()),
            scalar(self.session_id.as_ref()),
            text(self.location.as_deref()),
            text(self.user_agent.as_deref().map(|ua| ua.trim_matches('"'))),
        ];
        fields.extend(time.fields());

        let row = StagingRow::new(fields);
        reject_nul(&row, &COLUMNS, line)?;
        Ok(Some(row))
    }
}

fn millis(ts: &Number) -> Option<i64> {
    ts.as_i64().or_else(|| {
        ts.as_f64()
            .filter(|f| f.is_finite())
            .map(|f| f.floor() as i64)
    })
}

/// `ts` decomposed into the columns of the `time` dimension
///
/// Milliseconds are truncated; wall-clock values are UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTime {
    pub start_time: NaiveDateTime,
    pub hour: u32,
    pub day: u32,
    /// ISO 8601 week number
    pub week: u32,
    pub month: u32,
    pub year: i32,
    /// Monday through Friday
    pub weekday: bool,
}

impl EventTime {
    pub fn from_millis(ms: i64) -> Option<Self> {
        let at = DateTime::from_timestamp(ms.div_euclid(1000), 0)?.naive_utc();

        Some(Self {
            start_time: at,
            hour: at.hour(),
            day: at.day(),
            week: at.iso_week().week(),
            month: at.month(),
            year: at.year(),
            weekday: !matches!(at.weekday(), Weekday::Sat | Weekday::Sun),
        })
    }

    fn fields(&self) -> [Field; 7] {
        [
            Some(self.start_time.format(TIMESTAMP_FORMAT).to_string()),
            Some(self.hour.to_string()),
            Some(self.day.to_string()),
            Some(self.week.to_string()),
            Some(self.month.to_string()),
            Some(self.year.to_string()),
            Some(self.weekday.to_string()),
        ]
    }
}

/// Parse one event file, keeping eligible events only
///
/// Blank lines are skipped. A malformed line fails the whole file.
pub fn transform(content: &str) -> Result<Vec<StagingRow>, TransformError> {
    let mut rows = Vec::new();

    for (index, line) in content.lines().enumerate() {
        let line_no = index + 1;
        if line.trim().is_empty() {
            continue;
        }

        let entry: EventLogEntry =
            serde_json::from_str(line).map_err(|e| TransformError::json(line_no, e))?;

        if let Some(row) = entry.to_row(line_no)? {
            rows.push(row);
        }
    }

    Ok(rows)
}
