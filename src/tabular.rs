//! CSV input files for bulk operations and the CSV output sink.
use anyhow::{anyhow, Context, Result};
use serde_json::{Map, Number, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::SinkError;
use crate::model::Frame;
use crate::sync::RowSink;

/// Read every record of a CSV file as `header -> value`. Empty cells are
/// left out; numbers and booleans are typed.
pub fn read_records(path: &Path) -> Result<Vec<Map<String, Value>>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let headers = reader.headers()?.clone();

    let mut records = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("{}: bad record {}", path.display(), line + 1))?;
        let row = headers
            .iter()
            .zip(record.iter())
            .filter_map(|(name, cell)| infer_value(cell).map(|v| (name.to_string(), v)))
            .collect();
        records.push(row);
    }
    Ok(records)
}

/// Non-empty values of one column.
pub fn read_column(path: &Path, column: &str) -> Result<Vec<String>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let idx = reader
        .headers()?
        .iter()
        .position(|h| h == column)
        .ok_or_else(|| anyhow!("column '{}' not found in {}", column, path.display()))?;

    let mut values = Vec::new();
    for record in reader.records() {
        let record = record?;
        if let Some(cell) = record.get(idx).map(str::trim).filter(|c| !c.is_empty()) {
            values.push(cell.to_string());
        }
    }
    Ok(values)
}

pub fn infer_value(cell: &str) -> Option<Value> {
    let cell = cell.trim();
    if cell.is_empty() {
        return None;
    }
    if let Ok(i) = cell.parse::<i64>() {
        return Some(Value::from(i));
    }
    if let Some(n) = cell.parse::<f64>().ok().and_then(Number::from_f64) {
        return Some(Value::Number(n));
    }
    match cell {
        "True" | "true" => Some(Value::Bool(true)),
        "False" | "false" => Some(Value::Bool(false)),
        _ => Some(Value::String(cell.to_string())),
    }
}

/// Text of one output cell. Fractional numbers use a comma decimal mark.
pub fn format_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(true) => "True".into(),
        Value::Bool(false) => "False".into(),
        Value::Number(n) if n.is_f64() => n.to_string().replace('.', ","),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Appends frames to a CSV file whose header is written once, when the file
/// is first created.
#[derive(Debug)]
pub struct CsvSink {
    path: PathBuf,
}

impl CsvSink {
    pub fn open(path: impl Into<PathBuf>, columns: &[String]) -> Result<Self, SinkError> {
        let path = path.into();
        if !path.exists() {
            let mut writer = csv::Writer::from_path(&path)?;
            writer.write_record(columns)?;
            writer.flush()?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RowSink for CsvSink {
    /// The whole frame is encoded before the file is touched, so a failed
    /// frame leaves nothing behind.
    fn append(&mut self, frame: &Frame) -> Result<(), SinkError> {
        if frame.is_empty() {
            return Ok(());
        }
        let encoded = encode_rows(frame.rows())?;
        let mut file = OpenOptions::new().append(true).create(true).open(&self.path)?;
        file.write_all(&encoded)?;
        file.flush()?;
        Ok(())
    }
}

fn encode_rows(rows: &[Vec<Value>]) -> Result<Vec<u8>, SinkError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    for row in rows {
        writer.write_record(row.iter().map(format_cell))?;
    }
    writer.into_inner().map_err(|err| {
        let io = err.error();
        SinkError::Io(std::io::Error::new(io.kind(), io.to_string()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn cols() -> Vec<String> {
        vec!["col1".into(), "col2".into(), "col3".into()]
    }

    #[test]
    fn infer_value_types_cells() {
        assert_eq!(infer_value(""), None);
        assert_eq!(infer_value("  "), None);
        assert_eq!(infer_value("42"), Some(json!(42)));
        assert_eq!(infer_value("2.5"), Some(json!(2.5)));
        assert_eq!(infer_value("True"), Some(json!(true)));
        assert_eq!(infer_value("A-001"), Some(json!("A-001")));
    }

    #[test]
    fn format_cell_uses_comma_decimal() {
        assert_eq!(format_cell(&json!(2.5)), "2,5");
        assert_eq!(format_cell(&json!(12)), "12");
        assert_eq!(format_cell(&Value::Null), "");
        assert_eq!(format_cell(&json!("x.y")), "x.y");
    }

    #[test]
    fn read_records_and_column() {
        let td = tempdir().unwrap();
        let p = td.path().join("ajout.csv");
        std::fs::write(&p, "Title,Qty,Note\nA1,3,\nA2,1.5,fragile\n").unwrap();

        let rows = read_records(&p).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("Title"), Some(&json!("A1")));
        assert_eq!(rows[0].get("Qty"), Some(&json!(3)));
        assert!(rows[0].get("Note").is_none());
        assert_eq!(rows[1].get("Qty"), Some(&json!(1.5)));

        assert_eq!(read_column(&p, "Title").unwrap(), vec!["A1", "A2"]);
        assert!(read_column(&p, "CodeBarre").is_err());
    }

    #[test]
    fn failed_frame_leaves_the_file_untouched() {
        let td = tempdir().unwrap();
        let p = td.path().join("extraction.csv");
        let mut sink = CsvSink::open(&p, &cols()).unwrap();

        let ragged = Frame::from_raw(
            cols(),
            vec![
                vec![json!("a"), json!(1), json!("terminé")],
                vec![json!("b"), json!(2)],
            ],
        );
        assert!(sink.append(&ragged).is_err());
        assert_eq!(std::fs::read_to_string(&p).unwrap(), "col1,col2,col3\n");
    }

    #[test]
    fn sink_writes_header_once_and_appends() {
        let td = tempdir().unwrap();
        let p = td.path().join("extraction.csv");

        let mut sink = CsvSink::open(&p, &cols()).unwrap();
        sink.append(&Frame::empty(&cols())).unwrap();
        assert_eq!(std::fs::read_to_string(&p).unwrap(), "col1,col2,col3\n");

        let frame = Frame::from_rows(
            &cols(),
            vec![json!({"col1": "a", "col2": 2.5, "col3": "terminé"})
                .as_object()
                .cloned()
                .unwrap()],
        );
        sink.append(&frame).unwrap();

        let mut reopened = CsvSink::open(&p, &cols()).unwrap();
        reopened.append(&frame).unwrap();

        assert_eq!(
            std::fs::read_to_string(&p).unwrap(),
            "col1,col2,col3\na,\"2,5\",terminé\na,\"2,5\",terminé\n"
        );
    }
}
