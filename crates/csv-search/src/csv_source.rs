//! CSV row source for the ingestion pipeline.
//!
//! Wraps the `csv` crate: the first record is the header, later records may
//! have any number of fields, and a UTF-8 byte order mark is stripped.
//! A record that cannot be read becomes an [`Error::Record`] carrying its
//! row number, which stops the ingestion run at that row.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use csv_search_core::{Error, Result};

/// An opened CSV input: the header plus a lazy iterator over data rows.
pub struct CsvSource<R: Read> {
    header: Vec<String>,
    reader: csv::Reader<R>,
}

impl CsvSource<File> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            Error::configuration(format!("failed to open CSV file {}: {}", path.display(), e))
        })?;
        Self::from_reader(file)
    }
}

impl<R: Read> CsvSource<R> {
    pub fn from_reader(input: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(input);
        let header = reader
            .headers()
            .map_err(|e| Error::record(1, format!("read header: {}", e)))?
            .iter()
            .map(str::to_string)
            .collect();
        Ok(Self { header, reader })
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Consume the source, yielding one cell vector per data row.
    pub fn into_rows(self) -> (Vec<String>, impl Iterator<Item = Result<Vec<String>>>) {
        let rows = self
            .reader
            .into_records()
            .enumerate()
            .map(|(offset, record)| {
                // records, not physical lines; the header is row 1
                let row = offset as u64 + 2;
                record
                    .map(|r| r.iter().map(str::to_string).collect())
                    .map_err(|e| Error::record(row, format!("unreadable CSV row: {}", e)))
            });
        (self.header, rows)
    }
}
