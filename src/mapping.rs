//! Lookup tables and field mapping entries.
//!
//! Code tables (FIPS codes to state names, state codes to abbreviations,
//! crop codes to land cover labels) are data, so they live in versioned JSON
//! files next to the job instead of in the code:
//!
//! ```json
//! {
//!   "name": "mx_state_abbrev",
//!   "version": "2019-08-07",
//!   "entries": { "05": "COA", "08": "CHI" },
//!   "default": null
//! }
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{FieldDef, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingTable {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub entries: BTreeMap<String, String>,
    /// Value returned for keys missing from `entries`
    #[serde(default)]
    pub default: Option<String>,
}

impl MappingTable {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let table: MappingTable = serde_json::from_reader(BufReader::new(file))?;
        debug!(
            "Loaded mapping table {} ({} entries) from {:?}",
            table.name,
            table.entries.len(),
            path
        );
        Ok(table)
    }

    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .or(self.default.as_ref())
            .map(String::as_str)
    }
}

/// Mapping tables addressed by name.
#[derive(Debug, Clone, Default)]
pub struct TableSet {
    tables: BTreeMap<String, MappingTable>,
}

impl TableSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: MappingTable) -> Result<()> {
        if self.tables.contains_key(&table.name) {
            return Err(Error::DuplicateTable { name: table.name });
        }
        self.tables.insert(table.name.clone(), table);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&MappingTable> {
        self.tables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Loads every `*.json` file in `dir`, in file name order.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("json")
            })
            .collect();
        paths.sort();

        let mut set = TableSet::new();
        for path in paths {
            set.insert(MappingTable::from_path(&path)?)?;
        }
        Ok(set)
    }
}

/// Expression that populates a derived field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    /// Copy of another field
    Field(String),
    Constant(Value),
    /// Value of `field` translated through the mapping table `table`
    Lookup { field: String, table: String },
    /// Text concatenation; null if any part is null
    Concat(Vec<FieldSource>),
}

impl FieldSource {
    pub fn referenced_fields(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_refs(&mut names, &mut Vec::new());
        names
    }

    pub fn referenced_tables(&self) -> Vec<&str> {
        let mut tables = Vec::new();
        self.collect_refs(&mut Vec::new(), &mut tables);
        tables
    }

    fn collect_refs<'a>(&'a self, fields: &mut Vec<&'a str>, tables: &mut Vec<&'a str>) {
        match self {
            FieldSource::Field(name) => fields.push(name),
            FieldSource::Constant(_) => {}
            FieldSource::Lookup { field, table } => {
                fields.push(field);
                tables.push(table);
            }
            FieldSource::Concat(parts) => {
                for part in parts {
                    part.collect_refs(fields, tables);
                }
            }
        }
    }

    pub fn evaluate(&self, row: &dyn Fn(&str) -> Option<Value>, tables: &TableSet) -> Option<Value> {
        match self {
            FieldSource::Field(name) => row(name.as_str()),
            FieldSource::Constant(value) => Some(value.clone()),
            FieldSource::Lookup { field, table } => {
                let key = row(field.as_str())?.as_text();
                let table = tables.get(table)?;
                table.lookup(&key).map(|v| Value::Text(v.to_string()))
            }
            FieldSource::Concat(parts) => {
                let mut text = String::new();
                for part in parts {
                    text.push_str(&part.evaluate(row, tables)?.as_text());
                }
                Some(Value::Text(text))
            }
        }
    }
}

/// Field mapping entry: a new output field and the expression filling it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedField {
    #[serde(flatten)]
    pub def: FieldDef,
    pub source: FieldSource,
}

impl DerivedField {
    pub fn new(def: FieldDef, source: FieldSource) -> Self {
        Self { def, source }
    }
}

/// Evaluates `fields` in order for one feature. Later entries see the values
/// of earlier ones.
pub fn evaluate_derived(
    fields: &[DerivedField],
    tables: &TableSet,
    input: &dyn Fn(&str) -> Option<Value>,
) -> Vec<Option<Value>> {
    let mut computed: Vec<(&str, Option<Value>)> = Vec::with_capacity(fields.len());

    for derived in fields {
        let lookup = |name: &str| {
            computed
                .iter()
                .rev()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v.clone())
                .unwrap_or_else(|| input(name))
        };

        let value = match derived.source.evaluate(&lookup, tables) {
            Some(raw) => {
                let coerced = raw.coerce(&derived.def);
                if coerced.is_none() {
                    warn!(
                        "Value {:?} cannot be stored in {} field {}, writing null",
                        raw, derived.def.field_type, derived.def.name
                    );
                }
                coerced
            }
            None => None,
        };
        computed.push((derived.def.name.as_str(), value));
    }

    computed.into_iter().map(|(_, v)| v).collect()
}
