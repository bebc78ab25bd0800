use std::cell::RefCell;
use std::collections::HashMap;

use tracing::debug;

use super::VectorStore;
use crate::error::{Error, Result};
use crate::filter::AttributeFilter;
use crate::mapping::{evaluate_derived, DerivedField, TableSet};
use crate::model::{DatasetRef, Schema, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryFeature {
    /// Geometry as WKT
    pub geometry: Option<String>,
    /// One value per schema field
    pub values: Vec<Option<Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryDataset {
    pub schema: Schema,
    pub crs: Option<String>,
    /// Name of the feature id column, if the source format has one
    pub fid_column: Option<String>,
    pub features: Vec<MemoryFeature>,
}

impl MemoryDataset {
    pub fn new(schema: Schema, crs: Option<&str>) -> Self {
        Self {
            schema,
            crs: crs.map(str::to_string),
            fid_column: None,
            features: Vec::new(),
        }
    }

    pub fn with_fid_column(mut self, name: impl Into<String>) -> Self {
        self.fid_column = Some(name.into());
        self
    }

    /// Empty dataset with `schema` and the CRS and FID column of `self`.
    fn derive_empty(&self, schema: Schema) -> Self {
        Self {
            schema,
            crs: self.crs.clone(),
            fid_column: self.fid_column.clone(),
            features: Vec::new(),
        }
    }

    /// Adds a feature. `values` is padded with nulls, or cut, to the schema
    /// length.
    pub fn push(&mut self, geometry: Option<&str>, mut values: Vec<Option<Value>>) {
        values.resize(self.schema.len(), None);
        self.features.push(MemoryFeature {
            geometry: geometry.map(str::to_string),
            values,
        });
    }

    pub fn value(&self, row: usize, field: &str) -> Option<&Value> {
        let idx = self.schema.position(field)?;
        self.features.get(row)?.values.get(idx)?.as_ref()
    }

    pub fn geometries(&self) -> Vec<Option<&str>> {
        self.features.iter().map(|f| f.geometry.as_deref()).collect()
    }
}

/// In-memory [`VectorStore`]. Datasets are keyed by their [`DatasetRef`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    datasets: RefCell<HashMap<DatasetRef, MemoryDataset>>,
    overwrite: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn insert(&self, dataset: DatasetRef, data: MemoryDataset) {
        self.datasets.borrow_mut().insert(dataset, data);
    }

    pub fn get(&self, dataset: &DatasetRef) -> Option<MemoryDataset> {
        self.datasets.borrow().get(dataset).cloned()
    }

    pub fn len(&self) -> usize {
        self.datasets.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.borrow().is_empty()
    }

    fn load(&self, dataset: &DatasetRef) -> Result<MemoryDataset> {
        self.get(dataset).ok_or_else(|| Error::DatasetNotFound {
            dataset: dataset.to_string(),
        })
    }

    fn store(&self, output: &DatasetRef, data: MemoryDataset) -> Result<DatasetRef> {
        let mut datasets = self.datasets.borrow_mut();
        if datasets.contains_key(output) && !self.overwrite {
            return Err(Error::OutputExists {
                path: output.path.clone(),
            });
        }
        debug!(
            "Stored {} features in memory dataset {}",
            data.features.len(),
            output
        );
        datasets.insert(output.clone(), data);
        Ok(output.clone())
    }
}

impl VectorStore for MemoryStore {
    fn list_fields(&self, dataset: &DatasetRef) -> Result<Schema> {
        Ok(self.load(dataset)?.schema)
    }

    fn required_fields(&self, dataset: &DatasetRef) -> Result<Vec<String>> {
        Ok(self.load(dataset)?.fid_column.into_iter().collect())
    }

    fn feature_count(&self, dataset: &DatasetRef) -> Result<u64> {
        Ok(self.load(dataset)?.features.len() as u64)
    }

    fn exists(&self, dataset: &DatasetRef) -> bool {
        self.datasets.borrow().contains_key(dataset)
    }

    fn project(
        &self,
        dataset: &DatasetRef,
        fields: &[String],
        output: &DatasetRef,
    ) -> Result<DatasetRef> {
        let source = self.load(dataset)?;
        let schema = source.schema.select(fields, dataset)?;
        let indices: Vec<usize> = schema
            .names()
            .filter_map(|name| source.schema.position(name))
            .collect();

        let mut projected = source.derive_empty(schema);
        for feature in &source.features {
            let values = indices.iter().map(|&i| feature.values[i].clone()).collect();
            projected.push(feature.geometry.as_deref(), values);
        }
        self.store(output, projected)
    }

    fn select(
        &self,
        dataset: &DatasetRef,
        filter: &AttributeFilter,
        output: &DatasetRef,
    ) -> Result<DatasetRef> {
        let source = self.load(dataset)?;
        filter.validate(&source.schema, dataset)?;

        let mut selected = source.derive_empty(source.schema.clone());
        selected.features = source
            .features
            .iter()
            .enumerate()
            .filter(|(row, _)| filter.matches(source.value(*row, &filter.field)))
            .map(|(_, feature)| feature.clone())
            .collect();
        debug!(
            "Selected {} of {} features from {}",
            selected.features.len(),
            source.features.len(),
            dataset
        );
        self.store(output, selected)
    }

    fn merge(&self, inputs: &[DatasetRef], output: &DatasetRef) -> Result<DatasetRef> {
        let sources = inputs
            .iter()
            .map(|input| self.load(input))
            .collect::<Result<Vec<_>>>()?;
        let first = sources.first().ok_or(Error::EmptyMerge)?;

        let schema = Schema::union(sources.iter().map(|s| &s.schema));
        let mut merged = first.derive_empty(schema.clone());
        for source in &sources {
            for (row, feature) in source.features.iter().enumerate() {
                let values = schema
                    .names()
                    .map(|name| source.value(row, name).cloned())
                    .collect();
                merged.push(feature.geometry.as_deref(), values);
            }
        }
        self.store(output, merged)
    }

    fn derive(
        &self,
        dataset: &DatasetRef,
        fields: &[DerivedField],
        tables: &TableSet,
        output: &DatasetRef,
    ) -> Result<DatasetRef> {
        let source = self.load(dataset)?;
        let mut schema = source.schema.clone();
        for derived in fields {
            schema.push(derived.def.clone())?;
        }

        let mut derived_data = source.derive_empty(schema);
        for (row, feature) in source.features.iter().enumerate() {
            let mut values = feature.values.clone();
            values.extend(evaluate_derived(fields, tables, &|name| {
                source.value(row, name).cloned()
            }));
            derived_data.push(feature.geometry.as_deref(), values);
        }
        self.store(output, derived_data)
    }

    fn delete(&self, dataset: &DatasetRef) -> Result<()> {
        self.datasets.borrow_mut().remove(dataset);
        Ok(())
    }
}
