use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A named remote list to extract from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncTarget {
    pub name: String,
    pub list_id: String,
}

impl SyncTarget {
    pub fn new(name: impl Into<String>, list_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            list_id: list_id.into(),
        }
    }
}

/// Column name -> value, as returned in a list item's `fields`.
pub type OutputRow = Map<String, Value>;

/// Rows projected onto a fixed column schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Frame {
    /// Zero-row frame carrying the declared columns.
    pub fn empty(columns: &[String]) -> Self {
        Self {
            columns: columns.to_vec(),
            rows: Vec::new(),
        }
    }

    /// Project `rows` onto `columns`. Missing cells become `Null`; if no row
    /// carries any value for the schema, the result is a zero-row frame.
    pub fn from_rows(columns: &[String], rows: Vec<OutputRow>) -> Self {
        let all_empty = rows
            .iter()
            .all(|row| columns.iter().all(|c| is_blank(row.get(c))));
        if all_empty {
            return Self::empty(columns);
        }

        let rows = rows
            .into_iter()
            .map(|mut row| {
                columns
                    .iter()
                    .map(|c| row.remove(c).unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        Self {
            columns: columns.to_vec(),
            rows,
        }
    }

    #[cfg(test)]
    pub(crate) fn from_raw(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

/// Inclusive byte range of one upload chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` header value for a file of `total` bytes.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Split `size` bytes into consecutive ranges of at most `chunk` bytes.
pub fn chunk_ranges(size: u64, chunk: u64) -> Vec<ByteRange> {
    if chunk == 0 {
        return Vec::new();
    }
    (0..size)
        .step_by(chunk as usize)
        .map(|start| ByteRange {
            start,
            end: (start + chunk - 1).min(size - 1),
        })
        .collect()
}
