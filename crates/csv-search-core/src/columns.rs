//! Column role resolution.
//!
//! Maps an input header plus a [`ColumnConfig`] to concrete column
//! positions once per ingestion run. Downstream code only ever sees the
//! validated [`ResolvedColumns`], never raw column names.
//!
//! # Rules
//!
//! - The identifier column is required.
//! - Names match the header trimmed and case-insensitively; the first header
//!   cell with a given name wins and blank header cells never match.
//! - Every explicitly named column must exist in the header.
//! - Metadata left empty (or exactly the wildcard `*`) means every
//!   non-blank header column; `*` next to a named column is an error. The id, lat and lng columns are always part
//!   of the metadata snapshot.
//! - Text left empty means every metadata column except id, lat and lng.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};

/// Metadata wildcard selecting every header column.
pub const WILDCARD: &str = "*";

/// Role configuration supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnConfig {
    /// Identifier column (required).
    pub id: String,
    /// Columns joined into the embeddable text.
    #[serde(default)]
    pub text: Vec<String>,
    /// Columns persisted in the metadata snapshot.
    #[serde(default)]
    pub metadata: Vec<String>,
    /// Latitude column, if any.
    #[serde(default)]
    pub lat: Option<String>,
    /// Longitude column, if any.
    #[serde(default)]
    pub lng: Option<String>,
}

/// A header column located by position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    /// Trimmed header spelling.
    pub name: String,
    pub index: usize,
}

/// An optional role that may or may not be mapped to a column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ColumnSlot {
    #[default]
    Absent,
    Present(ColumnRef),
}

impl ColumnSlot {
    pub fn column(&self) -> Option<&ColumnRef> {
        match self {
            ColumnSlot::Absent => None,
            ColumnSlot::Present(col) => Some(col),
        }
    }

    pub fn index(&self) -> Option<usize> {
        self.column().map(|c| c.index)
    }
}

/// Validated role → column mapping for one header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedColumns {
    pub id: ColumnRef,
    pub text: Vec<ColumnRef>,
    pub metadata: Vec<ColumnRef>,
    pub lat: ColumnSlot,
    pub lng: ColumnSlot,
}

impl ResolvedColumns {
    pub fn text_names(&self) -> Vec<&str> {
        self.text.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn metadata_names(&self) -> Vec<&str> {
        self.metadata.iter().map(|c| c.name.as_str()).collect()
    }
}

struct HeaderLookup {
    by_key: HashMap<String, ColumnRef>,
    ordered: Vec<ColumnRef>,
}

impl HeaderLookup {
    fn new<S: AsRef<str>>(header: &[S]) -> Self {
        let mut by_key = HashMap::with_capacity(header.len());
        let mut ordered = Vec::with_capacity(header.len());
        for (index, cell) in header.iter().enumerate() {
            let name = cell.as_ref().trim();
            if name.is_empty() {
                continue;
            }
            let key = name.to_lowercase();
            if by_key.contains_key(&key) {
                continue;
            }
            let col = ColumnRef {
                name: name.to_string(),
                index,
            };
            by_key.insert(key, col.clone());
            ordered.push(col);
        }
        Self { by_key, ordered }
    }

    fn find(&self, name: &str) -> Option<&ColumnRef> {
        self.by_key.get(&name.trim().to_lowercase())
    }

    fn require(&self, role: &str, name: &str) -> Result<ColumnRef> {
        self.find(name).cloned().ok_or_else(|| {
            Error::configuration(format!(
                "{} column {:?} not found in header",
                role,
                name.trim()
            ))
        })
    }

    fn optional(&self, role: &str, name: Option<&str>) -> Result<ColumnSlot> {
        match name.map(str::trim) {
            None | Some("") => Ok(ColumnSlot::Absent),
            Some(name) => self.require(role, name).map(ColumnSlot::Present),
        }
    }
}

/// Ordered, name-deduplicated column list.
#[derive(Default)]
struct ColumnSet {
    seen: HashSet<String>,
    cols: Vec<ColumnRef>,
}

impl ColumnSet {
    fn add(&mut self, col: &ColumnRef) {
        if self.seen.insert(col.name.clone()) {
            self.cols.push(col.clone());
        }
    }
}

fn non_blank(names: &[String]) -> impl Iterator<Item = &str> {
    names.iter().map(|n| n.trim()).filter(|n| !n.is_empty())
}

/// Resolve `config` against `header`.
///
/// Pure and deterministic: the same inputs always produce the same mapping.
/// Any problem is reported as [`Error::Configuration`].
pub fn resolve_columns<S: AsRef<str>>(
    header: &[S],
    config: &ColumnConfig,
) -> Result<ResolvedColumns> {
    let lookup = HeaderLookup::new(header);

    if config.id.trim().is_empty() {
        return Err(Error::configuration("id column is required"));
    }
    let id = lookup.require("id", &config.id)?;
    let lat = lookup.optional("lat", config.lat.as_deref())?;
    let lng = lookup.optional("lng", config.lng.as_deref())?;

    let mut metadata = ColumnSet::default();
    let has_wildcard = non_blank(&config.metadata).any(|n| n == WILDCARD);
    if has_wildcard && non_blank(&config.metadata).any(|n| n != WILDCARD) {
        return Err(Error::configuration(format!(
            "metadata wildcard {:?} cannot be combined with named columns",
            WILDCARD
        )));
    }
    if has_wildcard || non_blank(&config.metadata).next().is_none() {
        for col in &lookup.ordered {
            metadata.add(col);
        }
    } else {
        for name in non_blank(&config.metadata) {
            metadata.add(&lookup.require("metadata", name)?);
        }
    }
    metadata.add(&id);
    for col in [lat.column(), lng.column()].into_iter().flatten() {
        metadata.add(col);
    }

    let mut text = ColumnSet::default();
    if non_blank(&config.text).next().is_none() {
        let excluded = [Some(id.index), lat.index(), lng.index()];
        for col in &metadata.cols {
            if !excluded.contains(&Some(col.index)) {
                text.add(col);
            }
        }
    } else {
        for name in non_blank(&config.text) {
            text.add(&lookup.require("text", name)?);
        }
    }

    Ok(ResolvedColumns {
        id,
        text: text.cols,
        metadata: metadata.cols,
        lat,
        lng,
    })
}
