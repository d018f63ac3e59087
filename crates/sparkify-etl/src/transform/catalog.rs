//! Song catalog transformer
//!
//! A catalog file holds one JSON object describing a song and its artist, or
//! several such objects one after another. Keys outside the staged set (such
//! as `num_songs`) are ignored.

use serde::Deserialize;
use serde_json::Number;
use sparkify_common::columns::{ColumnSpec, ColumnType};
use sparkify_common::CommonError;

use super::{number, reject_nul, text, StagingRow, TransformError};

const COLUMNS: [(&str, ColumnType); 9] = [
    ("artist_id", ColumnType::Text),
    ("artist_name", ColumnType::Text),
    ("artist_location", ColumnType::Text),
    ("artist_latitude", ColumnType::Decimal),
    ("artist_longitude", ColumnType::Decimal),
    ("song_id", ColumnType::Text),
    ("title", ColumnType::Text),
    ("year", ColumnType::Integer),
    ("duration", ColumnType::Decimal),
];

pub fn columns() -> Result<ColumnSpec, CommonError> {
    ColumnSpec::new(COLUMNS)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CatalogEntry {
    pub artist_id: Option<String>,
    pub artist_name: Option<String>,
    pub artist_location: Option<String>,
    pub artist_latitude: Option<Number>,
    pub artist_longitude: Option<Number>,
    pub song_id: Option<String>,
    pub title: Option<String>,
    pub year: Option<Number>,
    pub duration: Option<Number>,
}

impl CatalogEntry {
    pub fn to_row(&self) -> StagingRow {
        StagingRow::new(vec![
            text(self.artist_id.as_deref()),
            text(self.artist_name.as_deref()),
            text(self.artist_location.as_deref()),
            number(self.artist_latitude.as_ref()),
            number(self.artist_longitude.as_ref()),
            text(self.song_id.as_deref()),
            text(self.title.as_deref()),
            number(self.year.as_ref()),
            number(self.duration.as_ref()),
        ])
    }
}

/// Parse every catalog object in `content`
///
/// A malformed object fails the whole file; nothing from it is staged.
pub fn transform(content: &str) -> Result<Vec<StagingRow>, TransformError> {
    let mut stream = serde_json::Deserializer::from_str(content).into_iter::<CatalogEntry>();
    let mut rows = Vec::new();

    loop {
        let start = stream.byte_offset();
        let Some(entry) = stream.next() else {
            break;
        };
        let entry = entry.map_err(|e| TransformError::json(1, e))?;

        let row = entry.to_row();
        reject_nul(&row, &COLUMNS, line_of(content, start))?;
        rows.push(row);
    }

    Ok(rows)
}

/// 1-based line of the first non-blank character at or after `offset`
fn line_of(content: &str, offset: usize) -> usize {
    let rest = &content[offset..];
    let begin = offset + (rest.len() - rest.trim_start().len());
    content[..begin].matches('\n').count() + 1
}
