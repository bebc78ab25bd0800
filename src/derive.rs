//! Adding harmonized fields to a dataset.
//!
//! This covers the "add field, then fill it" steps of the preparation
//! scripts: constant country codes, state codes translated through a lookup
//! table and GEOIDs built from other codes.

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::mapping::{DerivedField, TableSet};
use crate::model::{DatasetRef, FieldType, Schema};
use crate::store::VectorStore;

/// Schema of `dataset` once `fields` are appended.
///
/// Fails if a new name is already taken, a source field does not exist in
/// the input or among earlier derived fields, or a table is not loaded.
/// Geometry cannot be derived.
pub fn derived_schema(
    schema: &Schema,
    fields: &[DerivedField],
    tables: &TableSet,
    dataset: &DatasetRef,
) -> Result<Schema> {
    let mut out = schema.clone();
    for derived in fields {
        if derived.def.field_type == FieldType::Geometry {
            return Err(Error::UnsupportedFieldType {
                field: derived.def.name.clone(),
                field_type: derived.def.field_type.to_string(),
            });
        }
        for name in derived.source.referenced_fields() {
            if !out.contains(name) {
                return Err(Error::field_not_found(name, dataset));
            }
        }
        for table in derived.source.referenced_tables() {
            if !tables.contains(table) {
                return Err(Error::TableNotFound {
                    name: table.to_string(),
                });
            }
        }
        out.push(derived.def.clone())?;
    }
    Ok(out)
}

/// Writes `input` plus the derived `fields` to `output`.
pub fn derive_fields<S: VectorStore + ?Sized>(
    store: &S,
    input: &DatasetRef,
    fields: &[DerivedField],
    tables: &TableSet,
    output: &DatasetRef,
) -> Result<DatasetRef> {
    if output.overwrites(input) {
        return Err(Error::OutputIsInput {
            path: output.path.clone(),
        });
    }

    let schema = store.list_fields(input)?;
    let out_schema = derived_schema(&schema, fields, tables, input)?;
    debug!(
        "Deriving {} fields on {}: {:?}",
        fields.len(),
        input,
        out_schema.names().skip(schema.len()).collect::<Vec<_>>()
    );

    let written = store.derive(input, fields, tables, output)?;
    info!("Derived fields written to {}", written);
    Ok(written)
}
