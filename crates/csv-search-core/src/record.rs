//! Row parsing and content fingerprints.
//!
//! A [`ParsedRecord`] is what one input row means once the column roles are
//! applied. Its [`fingerprint`] decides whether a re-ingested row can be
//! skipped without calling the encoder.

use sha2::{Digest, Sha256};

use crate::columns::{ColumnRef, ResolvedColumns};
use crate::error::{Error, Result};
use crate::models::{Fields, SpatialEntry};

/// One input row after column resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    pub id: String,
    pub fields: Fields,
    /// Non-blank text cells in text-column order.
    pub text_parts: Vec<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

impl ParsedRecord {
    /// Text handed to the encoder and the lexical index.
    pub fn embedding_text(&self) -> String {
        self.text_parts.join("\n")
    }

    pub fn has_text(&self) -> bool {
        !self.text_parts.is_empty()
    }

    /// Point rectangle, present only when both coordinates are.
    pub fn spatial(&self) -> Option<SpatialEntry> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => Some(SpatialEntry::point(lat, lng)),
            _ => None,
        }
    }
}

fn cell<S: AsRef<str>>(row: &[S], index: usize) -> &str {
    row.get(index).map(|c| c.as_ref().trim()).unwrap_or("")
}

fn parse_coordinate<S: AsRef<str>>(
    row: &[S],
    col: Option<&ColumnRef>,
    row_number: u64,
) -> Result<Option<f64>> {
    let Some(col) = col else {
        return Ok(None);
    };
    let raw = cell(row, col.index);
    if raw.is_empty() {
        return Ok(None);
    }
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(Error::record(
            row_number,
            format!("{}: invalid coordinate {:?}", col.name, raw),
        )),
    }
}

/// Extract a record from one row.
///
/// Cells are trimmed and missing trailing cells read as blank. A blank
/// identifier or a non-numeric, non-blank coordinate is an
/// [`Error::Record`] carrying `row_number`.
pub fn parse_row<S: AsRef<str>>(
    row: &[S],
    cols: &ResolvedColumns,
    row_number: u64,
) -> Result<ParsedRecord> {
    if cols.id.index >= row.len() {
        return Err(Error::record(row_number, "id column missing in record"));
    }
    let id = cell(row, cols.id.index);
    if id.is_empty() {
        return Err(Error::record(row_number, "id column is empty"));
    }

    let fields: Fields = cols
        .metadata
        .iter()
        .map(|c| (c.name.clone(), cell(row, c.index).to_string()))
        .collect();

    let text_parts: Vec<String> = cols
        .text
        .iter()
        .map(|c| cell(row, c.index))
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect();

    let lat = parse_coordinate(row, cols.lat.column(), row_number)?;
    let lng = parse_coordinate(row, cols.lng.column(), row_number)?;

    Ok(ParsedRecord {
        id: id.to_string(),
        fields,
        text_parts,
        lat,
        lng,
    })
}

fn format_coordinate(v: Option<f64>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

/// Content hash of a record within `namespace`.
///
/// SHA-256 (hex) over the `|`-joined parts: namespace, id, joined text (only
/// when non-empty), `key=value` for every metadata entry in key order, lat
/// and lng (empty when absent).
pub fn fingerprint(namespace: &str, rec: &ParsedRecord) -> String {
    let mut parts: Vec<String> = vec![namespace.to_string(), rec.id.clone()];
    if rec.has_text() {
        parts.push(rec.embedding_text());
    }
    for (key, value) in &rec.fields {
        parts.push(format!("{}={}", key, value));
    }
    parts.push(format_coordinate(rec.lat));
    parts.push(format_coordinate(rec.lng));

    let mut hasher = Sha256::new();
    hasher.update(parts.join("|").as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::{resolve_columns, ColumnConfig};

    fn columns() -> ResolvedColumns {
        let header = ["id", "title", "body", "lat", "lng"];
        resolve_columns(
            &header,
            &ColumnConfig {
                id: "id".to_string(),
                text: vec!["title".to_string(), "body".to_string()],
                metadata: vec![],
                lat: Some("lat".to_string()),
                lng: Some("lng".to_string()),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_parse_full_row() {
        let rec = parse_row(&[" 1 ", "Red", "bicycle", "35.0", "139.5"], &columns(), 2).unwrap();
        assert_eq!(rec.id, "1");
        assert_eq!(rec.embedding_text(), "Red\nbicycle");
        assert_eq!(rec.lat, Some(35.0));
        assert_eq!(rec.lng, Some(139.5));
        assert_eq!(rec.fields.get("title").map(String::as_str), Some("Red"));
        assert_eq!(rec.fields.get("lat").map(String::as_str), Some("35.0"));
        assert_eq!(rec.spatial(), Some(SpatialEntry::point(35.0, 139.5)));
    }

    #[test]
    fn test_blank_text_parts_are_dropped() {
        let rec = parse_row(&["1", "  ", "bicycle", "", ""], &columns(), 2).unwrap();
        assert_eq!(rec.text_parts, vec!["bicycle".to_string()]);
        assert_eq!(rec.embedding_text(), "bicycle");
    }

    #[test]
    fn test_short_row_reads_blank_cells() {
        let rec = parse_row(&["1", "Red"], &columns(), 3).unwrap();
        assert_eq!(rec.lat, None);
        assert_eq!(rec.fields.get("body").map(String::as_str), Some(""));
        assert!(rec.spatial().is_none());
    }

    #[test]
    fn test_blank_id_is_record_error() {
        let err = parse_row(&["  ", "Red", "", "", ""], &columns(), 4).unwrap_err();
        assert!(matches!(err, Error::Record { row: 4, .. }));
    }

    #[test]
    fn test_malformed_coordinate_is_record_error() {
        let err = parse_row(&["1", "Red", "", "north", ""], &columns(), 9).unwrap_err();
        match err {
            Error::Record { row, message } => {
                assert_eq!(row, 9);
                assert!(message.contains("lat"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_non_finite_coordinate_is_rejected() {
        let err = parse_row(&["1", "Red", "", "NaN", "1"], &columns(), 2).unwrap_err();
        assert!(matches!(err, Error::Record { .. }));
    }

    #[test]
    fn test_single_coordinate_has_no_spatial_entry() {
        let rec = parse_row(&["1", "Red", "", "35", ""], &columns(), 2).unwrap();
        assert_eq!(rec.lat, Some(35.0));
        assert!(rec.spatial().is_none());
    }

    #[test]
    fn test_fingerprint_is_stable_and_hex() {
        let rec = parse_row(&["1", "Red", "bicycle", "35", "139"], &columns(), 2).unwrap();
        let a = fingerprint("items", &rec);
        let b = fingerprint("items", &rec.clone());
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_matches_documented_layout() {
        let rec = parse_row(&["1", "Red", "", "", ""], &columns(), 2).unwrap();
        let expected = {
            let mut hasher = Sha256::new();
            hasher.update(b"ns|1|Red|body=|id=1|lat=|lng=|title=Red||");
            format!("{:x}", hasher.finalize())
        };
        assert_eq!(fingerprint("ns", &rec), expected);
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let cols = columns();
        let base = parse_row(&["1", "Red", "bicycle", "35", "139"], &cols, 2).unwrap();
        let fp = fingerprint("items", &base);

        let text = parse_row(&["1", "Blue", "bicycle", "35", "139"], &cols, 2).unwrap();
        let coords = parse_row(&["1", "Red", "bicycle", "", ""], &cols, 2).unwrap();
        assert_ne!(fp, fingerprint("items", &text));
        assert_ne!(fp, fingerprint("items", &coords));
        assert_ne!(fp, fingerprint("other", &base));
    }
}
