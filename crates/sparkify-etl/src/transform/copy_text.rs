//! PostgreSQL `COPY ... FORMAT text` encoding
//!
//! One row per line, fields separated by a tab, SQL NULL written as `\N`.
//! Field content has backslash, tab, newline and carriage return escaped, so
//! no value can be mistaken for the null marker or split a row, and an empty
//! string stays distinct from NULL.

use super::StagingRow;

pub const DELIMITER: u8 = b'\t';
pub const NULL_MARKER: &str = r"\N";

/// The `WITH (...)` options matching [`encode_rows`]
pub const COPY_OPTIONS: &str = r"FORMAT text, DELIMITER E'\t', NULL '\N'";

/// Append `rows` to `out`, one line each
pub fn encode_rows(rows: &[StagingRow], out: &mut Vec<u8>) {
    for row in rows {
        for (i, field) in row.fields().iter().enumerate() {
            if i > 0 {
                out.push(DELIMITER);
            }
            match field {
                Some(value) => escape_into(value, out),
                None => out.extend_from_slice(NULL_MARKER.as_bytes()),
            }
        }
        out.push(b'\n');
    }
}

fn escape_into(value: &str, out: &mut Vec<u8>) {
    for byte in value.bytes() {
        match byte {
            b'\\' => out.extend_from_slice(br"\\"),
            b'\t' => out.extend_from_slice(br"\t"),
            b'\n' => out.extend_from_slice(br"\n"),
            b'\r' => out.extend_from_slice(br"\r"),
            other => out.push(other),
        }
    }
}
