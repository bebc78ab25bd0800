use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Semantic type of an attribute field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Integer,
    Float,
    Date,
    Geometry,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Date => "date",
            FieldType::Geometry => "geometry",
        };
        f.write_str(name)
    }
}

/// A single field descriptor of a [`Schema`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Maximum length, only meaningful for text fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            length: None,
        }
    }

    pub fn text(name: impl Into<String>, length: usize) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Text,
            length: Some(length),
        }
    }
}

/// Ordered list of field descriptors with unique names.
///
/// Names are compared case-sensitively. Storage drivers such as the
/// shapefile driver treat names case-insensitively, so two fields that only
/// differ by case are still rejected by the driver when written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<FieldDef>,
}

impl Schema {
    pub fn new(fields: Vec<FieldDef>) -> Result<Self> {
        let mut seen = HashSet::new();
        for field in &fields {
            if !seen.insert(field.name.as_str()) {
                return Err(Error::DuplicateField {
                    field: field.name.clone(),
                });
            }
        }
        Ok(Self { fields })
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn push(&mut self, field: FieldDef) -> Result<()> {
        if self.contains(&field.name) {
            return Err(Error::DuplicateField { field: field.name });
        }
        self.fields.push(field);
        Ok(())
    }

    /// Builds the schema made of `names`, in that order.
    pub fn select(&self, names: &[String], dataset: &DatasetRef) -> Result<Schema> {
        let fields = names
            .iter()
            .map(|name| {
                self.get(name)
                    .cloned()
                    .ok_or_else(|| Error::field_not_found(name, dataset))
            })
            .collect::<Result<Vec<_>>>()?;
        Schema::new(fields)
    }

    /// Union by name, keeping the first definition and first-seen order.
    pub fn union<'a>(schemas: impl IntoIterator<Item = &'a Schema>) -> Schema {
        let mut merged = Schema::default();
        for schema in schemas {
            for field in schema.iter() {
                if !merged.contains(&field.name) {
                    merged.fields.push(field.clone());
                }
            }
        }
        merged
    }
}

impl<'a> IntoIterator for &'a Schema {
    type Item = &'a FieldDef;
    type IntoIter = std::slice::Iter<'a, FieldDef>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

/// Attribute value. Null is represented as `None` by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Text(String),
    /// ISO-8601 date or date-time text
    Date(String),
}

impl Value {
    /// Text form used for lookups and concatenation.
    pub fn as_text(&self) -> String {
        match self {
            Value::Integer(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Text(s) | Value::Date(s) => s.clone(),
        }
    }

    /// Converts the value to `field`'s type, or `None` when it cannot be
    /// represented. Text is cut to the field length.
    pub fn coerce(&self, field: &FieldDef) -> Option<Value> {
        match field.field_type {
            FieldType::Text => {
                let text = self.as_text();
                Some(Value::Text(match field.length {
                    Some(len) => text.chars().take(len).collect(),
                    None => text,
                }))
            }
            FieldType::Integer => match self {
                Value::Integer(v) => Some(Value::Integer(*v)),
                Value::Float(v) if v.is_finite() => Some(Value::Integer(v.trunc() as i64)),
                Value::Text(s) => s.trim().parse().ok().map(Value::Integer),
                _ => None,
            },
            FieldType::Float => match self {
                Value::Integer(v) => Some(Value::Float(*v as f64)),
                Value::Float(v) => Some(Value::Float(*v)),
                Value::Text(s) => s.trim().parse().ok().map(Value::Float),
                Value::Date(_) => None,
            },
            FieldType::Date => match self {
                Value::Text(s) | Value::Date(s) => Some(Value::Date(s.clone())),
                _ => None,
            },
            FieldType::Geometry => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

/// Explicit location of a vector dataset: a path plus an optional layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatasetRef {
    pub path: PathBuf,
    pub layer: Option<String>,
}

impl DatasetRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            layer: None,
        }
    }

    pub fn with_layer(path: impl Into<PathBuf>, layer: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            layer: Some(layer.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether writing to `self` would replace `other`, entirely or the same
    /// layer of it.
    pub fn overwrites(&self, other: &DatasetRef) -> bool {
        let same_file = match (self.path.canonicalize(), other.path.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => self.path == other.path,
        };
        same_file && (self.layer.is_none() || other.layer.is_none() || self.layer == other.layer)
    }

    /// Layer name to use when creating this dataset.
    pub fn layer_name(&self) -> String {
        match &self.layer {
            Some(layer) => layer.clone(),
            None => self
                .path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("layer")
                .to_string(),
        }
    }
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.layer {
            Some(layer) => write!(f, "{}:{}", self.path.display(), layer),
            None => write!(f, "{}", self.path.display()),
        }
    }
}

impl From<&Path> for DatasetRef {
    fn from(path: &Path) -> Self {
        DatasetRef::new(path)
    }
}

impl From<PathBuf> for DatasetRef {
    fn from(path: PathBuf) -> Self {
        DatasetRef::new(path)
    }
}
