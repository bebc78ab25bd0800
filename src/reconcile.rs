//! Reordering a dataset's attribute fields to a canonical order.
//!
//! Datasets built by different source pipelines (a U.S. census layer and a
//! Mexican INEGI layer, say) carry the same harmonized fields in different
//! positions. Reconciling both to one field order before merging gives every
//! output a stable column layout.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{DatasetRef, Schema};
use crate::store::VectorStore;

/// Output field order for `schema`.
///
/// `field_order` comes first, in that order. With `append_missing` the other
/// fields of `schema` follow in their original relative order, otherwise they
/// are dropped. Every name in `field_order` must exist in `schema` or be one
/// of the `required` columns (FID, geometry). Required columns are kept by the
/// store itself and are left out of the returned order.
pub fn plan_order(
    schema: &Schema,
    required: &[String],
    field_order: &[String],
    append_missing: bool,
    dataset: &DatasetRef,
) -> Result<Vec<String>> {
    let mut seen = HashSet::with_capacity(field_order.len());
    for name in field_order {
        let is_required = required.contains(name);
        if !is_required && !schema.contains(name) {
            return Err(Error::field_not_found(name, dataset));
        }
        if !seen.insert(name.as_str()) {
            return Err(Error::DuplicateField {
                field: name.clone(),
            });
        }
    }

    let mut order: Vec<String> = field_order
        .iter()
        .filter(|name| schema.contains(name))
        .cloned()
        .collect();
    if append_missing {
        order.extend(
            schema
                .names()
                .filter(|name| !seen.contains(name))
                .map(str::to_string),
        );
    }
    Ok(order)
}

/// Reorders (and optionally trims) the attribute schema of vector datasets.
pub struct SchemaReconciler<'a, S: VectorStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: VectorStore + ?Sized> SchemaReconciler<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Writes `input` to `output` with its fields in `field_order`.
    ///
    /// All names are validated before the output location is touched, so a
    /// failed call leaves nothing behind. Geometry, values and row count are
    /// copied unchanged and `input` is never modified.
    pub fn reconcile(
        &self,
        input: &DatasetRef,
        field_order: &[String],
        append_missing: bool,
        output: &DatasetRef,
    ) -> Result<DatasetRef> {
        if output.overwrites(input) {
            return Err(Error::OutputIsInput {
                path: output.path.clone(),
            });
        }

        let schema = self.store.list_fields(input)?;
        let required = self.store.required_fields(input)?;
        let order = plan_order(&schema, &required, field_order, append_missing, input)?;
        debug!("Field order for {}: {:?}", input, order);

        let written = self.store.project(input, &order, output)?;
        info!("Reordered fields of {} into {}", input, written);
        Ok(written)
    }
}

/// Shorthand for [`SchemaReconciler::reconcile`].
pub fn reconcile<S: VectorStore + ?Sized>(
    store: &S,
    input: &DatasetRef,
    field_order: &[String],
    append_missing: bool,
    output: &DatasetRef,
) -> Result<DatasetRef> {
    SchemaReconciler::new(store).reconcile(input, field_order, append_missing, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldDef, FieldType, Value};
    use crate::store::{MemoryDataset, MemoryStore};

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn places_schema() -> Schema {
        let mut fields = vec![FieldDef::new("OBJECTID", FieldType::Integer)];
        fields.extend(
            [
                "ADM0_ID", "NAME_0", "ID_0", "ADM1_ID", "NAME_1", "ID_1", "ADM3_ID", "NAME_3",
                "ADM3_GEOID",
            ]
            .iter()
            .map(|name| FieldDef::text(*name, 50)),
        );
        fields.push(FieldDef::new("Shape_Leng", FieldType::Float));
        fields.push(FieldDef::new("Shape_Area", FieldType::Float));
        Schema::new(fields).unwrap()
    }

    fn sample_store(schema: Schema, rows: usize) -> (MemoryStore, DatasetRef) {
        let store = MemoryStore::new();
        let input = DatasetRef::new("Places_cl.shp");
        let mut data = MemoryDataset::new(schema.clone(), Some("ESRI:102008"));
        for row in 0..rows {
            let values = schema
                .iter()
                .map(|field| match field.field_type {
                    FieldType::Integer => Some(Value::Integer(row as i64)),
                    FieldType::Float => Some(Value::Float(row as f64 * 1.5)),
                    _ => Some(Value::Text(format!("{}_{}", field.name, row))),
                })
                .collect();
            let wkt = format!("POLYGON (({0} 0, {0} 1, 1 1, {0} 0))", row);
            data.push(Some(wkt.as_str()), values);
        }
        store.insert(input.clone(), data);
        (store, input)
    }

    #[test]
    fn test_plan_appends_missing_in_original_order() {
        let schema = places_schema();
        let order = names(&[
            "OBJECTID", "ADM0_ID", "NAME_0", "ID_0", "ADM1_ID", "NAME_1", "ID_1", "ADM3_ID",
            "NAME_3", "ADM3_GEOID",
        ]);

        let plan = plan_order(&schema, &[], &order, true, &DatasetRef::new("Places.shp")).unwrap();

        let mut expected = order.clone();
        expected.extend(names(&["Shape_Leng", "Shape_Area"]));
        assert_eq!(plan, expected);
    }

    #[test]
    fn test_plan_moves_fields_forward() {
        let schema = places_schema();
        let order = names(&["Shape_Area", "NAME_1"]);

        let plan = plan_order(&schema, &[], &order, true, &DatasetRef::new("Places.shp")).unwrap();

        assert_eq!(plan.len(), schema.len());
        assert_eq!(&plan[..2], &order[..]);
        let rest: Vec<&str> = schema
            .names()
            .filter(|n| *n != "Shape_Area" && *n != "NAME_1")
            .collect();
        assert_eq!(plan[2..].iter().map(String::as_str).collect::<Vec<_>>(), rest);
    }

    #[test]
    fn test_plan_without_append_keeps_only_order() {
        let schema = places_schema();
        let order = names(&["NAME_3", "OBJECTID"]);

        let plan = plan_order(&schema, &[], &order, false, &DatasetRef::new("Places.shp")).unwrap();
        assert_eq!(plan, order);
    }

    #[test]
    fn test_plan_unknown_field() {
        let schema = Schema::new(vec![
            FieldDef::new("OBJECTID", FieldType::Integer),
            FieldDef::text("NAME_0", 50),
            FieldDef::text("ID_0", 3),
            FieldDef::text("ADM1_ID", 3),
            FieldDef::text("NAME_1", 50),
        ])
        .unwrap();
        let order = names(&["OBJECTID", "ADM0_ID", "NAME_0"]);

        let err = plan_order(&schema, &[], &order, true, &DatasetRef::new("States.shp")).unwrap_err();
        match err {
            Error::SchemaFieldNotFound { field, dataset } => {
                assert_eq!(field, "ADM0_ID");
                assert_eq!(dataset, "States.shp");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_plan_rejects_repeated_field() {
        let schema = places_schema();
        let order = names(&["NAME_0", "ID_0", "NAME_0"]);

        let err = plan_order(&schema, &[], &order, true, &DatasetRef::new("Places.shp")).unwrap_err();
        assert!(matches!(err, Error::DuplicateField { field } if field == "NAME_0"));
    }

    #[test]
    fn test_plan_accepts_required_columns() {
        let schema = Schema::new(vec![
            FieldDef::text("NAME_0", 50),
            FieldDef::text("ADM1_ID", 3),
            FieldDef::new("Shape_Area", FieldType::Float),
        ])
        .unwrap();
        let required = names(&["OBJECTID", "Shape"]);
        let dataset = DatasetRef::new("Census.gdb:Places");

        let plan = plan_order(&schema, &required, &names(&["OBJECTID", "ADM1_ID"]), true, &dataset)
            .unwrap();
        assert_eq!(plan, names(&["ADM1_ID", "NAME_0", "Shape_Area"]));

        let plan = plan_order(&schema, &required, &names(&["OBJECTID", "NAME_0"]), false, &dataset)
            .unwrap();
        assert_eq!(plan, names(&["NAME_0"]));

        let err = plan_order(&schema, &required, &names(&["OBJECTID", "OBJECTID"]), true, &dataset)
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateField { .. }));
    }

    #[test]
    fn test_reconcile_with_fid_column_in_order() {
        let (store, input) = sample_store(places_schema(), 2);
        let mut data = store.get(&input).unwrap();
        data.schema = Schema::new(data.schema.iter().skip(1).cloned().collect()).unwrap();
        for feature in &mut data.features {
            feature.values.remove(0);
        }
        store.insert(input.clone(), data.with_fid_column("OBJECTID"));
        let output = DatasetRef::new("Places.shp");

        reconcile(&store, &input, &names(&["OBJECTID", "ADM0_ID", "NAME_0"]), false, &output)
            .unwrap();

        let out = store.get(&output).unwrap();
        assert_eq!(out.schema.names().collect::<Vec<_>>(), vec!["ADM0_ID", "NAME_0"]);
        assert_eq!(out.fid_column.as_deref(), Some("OBJECTID"));
    }

    #[test]
    fn test_reconcile_keeps_rows_and_geometry() {
        let (store, input) = sample_store(places_schema(), 4);
        let output = DatasetRef::new("Places.shp");
        let order = names(&["NAME_3", "ADM3_GEOID", "OBJECTID"]);

        reconcile(&store, &input, &order, true, &output).unwrap();

        let before = store.get(&input).unwrap();
        let after = store.get(&output).unwrap();
        assert_eq!(after.features.len(), 4);
        assert_eq!(after.geometries(), before.geometries());
        assert_eq!(after.crs, before.crs);
        for row in 0..4 {
            for name in before.schema.names() {
                assert_eq!(after.value(row, name), before.value(row, name), "{name} row {row}");
            }
        }
        assert_eq!(
            after.schema.names().take(3).collect::<Vec<_>>(),
            vec!["NAME_3", "ADM3_GEOID", "OBJECTID"]
        );
    }

    #[test]
    fn test_reconcile_failure_writes_nothing() {
        let (store, input) = sample_store(places_schema(), 2);
        let output = DatasetRef::new("Places.shp");

        let err = reconcile(&store, &input, &names(&["OBJECTID", "ADM2_ID"]), true, &output)
            .unwrap_err();

        assert!(matches!(err, Error::SchemaFieldNotFound { .. }));
        assert!(!store.exists(&output));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let (store, input) = sample_store(places_schema(), 3);
        let order = names(&["ID_1", "NAME_1", "ADM1_ID"]);
        let once = DatasetRef::new("once.shp");
        let twice = DatasetRef::new("twice.shp");

        reconcile(&store, &input, &order, true, &once).unwrap();
        reconcile(&store, &once, &order, true, &twice).unwrap();

        assert_eq!(store.get(&once), store.get(&twice));
    }

    #[test]
    fn test_reconcile_refuses_to_overwrite_input() {
        let (store, input) = sample_store(places_schema(), 1);
        let store = store.with_overwrite(true);

        let err = reconcile(&store, &input, &names(&["OBJECTID"]), false, &input).unwrap_err();
        assert!(matches!(err, Error::OutputIsInput { .. }));
        assert_eq!(store.list_fields(&input).unwrap(), places_schema());
    }
}
