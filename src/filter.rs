//! Attribute selection: keep only the features whose field value is in a
//! fixed set, e.g. the basin states out of a national layer.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{DatasetRef, Schema, Value};

/// `field IN (values)` selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeFilter {
    pub field: String,
    pub values: Vec<Value>,
}

impl AttributeFilter {
    pub fn new(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            field: field.into(),
            values,
        }
    }

    /// Checks that the filter field exists in `schema` and that there is
    /// something to select.
    pub fn validate(&self, schema: &Schema, dataset: &DatasetRef) -> Result<()> {
        if !schema.contains(&self.field) {
            return Err(Error::field_not_found(&self.field, dataset));
        }
        if self.values.is_empty() {
            return Err(Error::EmptyFilter {
                field: self.field.clone(),
            });
        }
        Ok(())
    }

    /// Values are compared by their text form, so `"08"` matches `"08"` but
    /// not the integer 8.
    pub fn matches(&self, value: Option<&Value>) -> bool {
        match value {
            Some(value) => {
                let text = value.as_text();
                self.values.iter().any(|v| v.as_text() == text)
            }
            None => false,
        }
    }

    /// OGR SQL where clause: `"STATEFP" IN ('08', '35', '48')`.
    pub fn to_sql(&self) -> String {
        let values: Vec<String> = self.values.iter().map(sql_literal).collect();
        format!(
            "\"{}\" IN ({})",
            escape_identifier(&self.field),
            values.join(", ")
        )
    }
}

fn escape_identifier(name: &str) -> String {
    name.replace('"', "\"\"")
}

fn sql_literal(value: &Value) -> String {
    match value {
        Value::Integer(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Text(s) | Value::Date(s) => format!("'{}'", s.replace('\'', "''")),
    }
}
