//! Table sink: the collaborator flattened rows are handed to.
//!
//! The engine only depends on the narrow [`TableSink`] trait — one
//! `write_rows` call per page, with the table's declared key set and its
//! fixed column order. [`CsvSink`] is the default implementation: one CSV
//! file per table under the destination directory, plus a JSON column
//! manifest per table written at the end of the run so loaders know the
//! schema and primary key without sniffing the data.
//!
//! The sink offers no write-path transactionality; replay safety comes from
//! the checkpoint contract (at-least-once plus upsert-based loading).

use serde_json::json;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::config::LoadMode;
use crate::error::{ExtractError, Result};

/// One output row, cell-aligned to the table's ordered column list.
pub type Row = Vec<String>;

pub trait TableSink: Send {
    /// Append one page of rows to `table_name`. The column list must be
    /// identical on every call for the same table within a run.
    fn write_rows(
        &mut self,
        table_name: &str,
        primary_key_fields: &[&str],
        ordered_column_names: &[String],
        rows: &[Row],
    ) -> Result<()>;

    /// Flush everything and emit per-table metadata.
    fn finish(&mut self) -> Result<()>;
}

/// CSV file sink with per-table column manifests.
pub struct CsvSink {
    out_dir: PathBuf,
    incremental: bool,
    writers: HashMap<String, TableWriter>,
}

struct TableWriter {
    file: BufWriter<File>,
    columns: Vec<String>,
    primary_keys: Vec<String>,
    rows_written: u64,
}

impl CsvSink {
    pub fn new(out_dir: &Path, load_mode: LoadMode) -> Result<Self> {
        std::fs::create_dir_all(out_dir)?;
        Ok(Self {
            out_dir: out_dir.to_path_buf(),
            incremental: load_mode == LoadMode::IncrementalLoad,
            writers: HashMap::new(),
        })
    }
}

impl TableSink for CsvSink {
    fn write_rows(
        &mut self,
        table_name: &str,
        primary_key_fields: &[&str],
        ordered_column_names: &[String],
        rows: &[Row],
    ) -> Result<()> {
        if !self.writers.contains_key(table_name) {
            let path = self.out_dir.join(format!("{}.csv", table_name));
            let mut file = BufWriter::new(File::create(&path)?);
            write_csv_line(&mut file, ordered_column_names.iter().map(String::as_str))?;
            self.writers.insert(
                table_name.to_string(),
                TableWriter {
                    file,
                    columns: ordered_column_names.to_vec(),
                    primary_keys: primary_key_fields.iter().map(|k| k.to_string()).collect(),
                    rows_written: 0,
                },
            );
        }

        let writer = self
            .writers
            .get_mut(table_name)
            .expect("writer inserted above");

        if writer.columns != ordered_column_names {
            return Err(ExtractError::Sink(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("column set changed mid-run for table \"{}\"", table_name),
            )));
        }

        for row in rows {
            if row.len() != writer.columns.len() {
                return Err(ExtractError::Sink(std::io::Error::new(
                    ErrorKind::InvalidInput,
                    format!(
                        "row width {} does not match {} columns of table \"{}\"",
                        row.len(),
                        writer.columns.len(),
                        table_name
                    ),
                )));
            }
            write_csv_line(&mut writer.file, row.iter().map(String::as_str))?;
            writer.rows_written += 1;
        }

        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        for (table_name, writer) in self.writers.drain() {
            let mut file = writer.file;
            file.flush()?;

            let manifest = json!({
                "columns": writer.columns,
                "primary_key": writer.primary_keys,
                "incremental": self.incremental,
                "rows": writer.rows_written,
            });
            let manifest_path = self.out_dir.join(format!("{}.csv.manifest", table_name));
            std::fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest).expect("manifest always serializes"))?;
        }
        Ok(())
    }
}

fn write_csv_line<'a>(
    out: &mut impl Write,
    fields: impl Iterator<Item = &'a str>,
) -> Result<()> {
    let mut first = true;
    for field in fields {
        if !first {
            out.write_all(b",")?;
        }
        first = false;
        if field.contains(['"', ',', '\n', '\r']) {
            out.write_all(b"\"")?;
            out.write_all(field.replace('"', "\"\"").as_bytes())?;
            out.write_all(b"\"")?;
        } else {
            out.write_all(field.as_bytes())?;
        }
    }
    out.write_all(b"\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn writes_header_then_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::new(tmp.path(), LoadMode::IncrementalLoad).unwrap();

        let cols = columns(&["id", "email"]);
        sink.write_rows(
            "contact",
            &["id"],
            &cols,
            &[
                vec!["1".into(), "a@example.com".into()],
                vec!["2".into(), "".into()],
            ],
        )
        .unwrap();
        sink.write_rows("contact", &["id"], &cols, &[vec!["3".into(), "c@example.com".into()]])
            .unwrap();
        sink.finish().unwrap();

        let csv = std::fs::read_to_string(tmp.path().join("contact.csv")).unwrap();
        assert_eq!(csv, "id,email\n1,a@example.com\n2,\n3,c@example.com\n");
    }

    #[test]
    fn manifest_declares_schema_and_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::new(tmp.path(), LoadMode::FullLoad).unwrap();

        sink.write_rows("deal", &["id"], &columns(&["id", "amount"]), &[])
            .unwrap();
        sink.finish().unwrap();

        let manifest: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(tmp.path().join("deal.csv.manifest")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest["columns"], json!(["id", "amount"]));
        assert_eq!(manifest["primary_key"], json!(["id"]));
        assert_eq!(manifest["incremental"], json!(false));
        assert_eq!(manifest["rows"], json!(0));
    }

    #[test]
    fn quoting_covers_delimiters_and_quotes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::new(tmp.path(), LoadMode::IncrementalLoad).unwrap();

        sink.write_rows(
            "note",
            &["id"],
            &columns(&["id", "body"]),
            &[vec!["1".into(), "line one\nwith, \"quotes\"".into()]],
        )
        .unwrap();
        sink.finish().unwrap();

        let csv = std::fs::read_to_string(tmp.path().join("note.csv")).unwrap();
        assert_eq!(csv, "id,body\n1,\"line one\nwith, \"\"quotes\"\"\"\n");
    }

    #[test]
    fn column_drift_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::new(tmp.path(), LoadMode::IncrementalLoad).unwrap();

        sink.write_rows("contact", &["id"], &columns(&["id", "email"]), &[])
            .unwrap();
        let err = sink
            .write_rows("contact", &["id"], &columns(&["id", "phone"]), &[])
            .unwrap_err();
        assert!(matches!(err, ExtractError::Sink(_)));
    }
}
