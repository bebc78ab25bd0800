//! Vector dataset storage.
//!
//! Everything that touches geometry or files goes through [`VectorStore`].
//! [`GdalStore`] is backed by GDAL/OGR, [`MemoryStore`] keeps datasets in
//! memory.

mod ogr;
mod memory;

pub use self::ogr::GdalStore;
pub use self::memory::{MemoryDataset, MemoryFeature, MemoryStore};

use crate::error::Result;
use crate::filter::AttributeFilter;
use crate::mapping::{DerivedField, TableSet};
use crate::model::{DatasetRef, Schema};

pub trait VectorStore {
    /// Attribute schema of `dataset`, geometry columns excluded.
    fn list_fields(&self, dataset: &DatasetRef) -> Result<Schema>;

    /// Columns the format maintains itself, such as the FID column
    /// (`OBJECTID`) or a named geometry column. They may appear in a field
    /// order but are never copied as attributes.
    fn required_fields(&self, _dataset: &DatasetRef) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn feature_count(&self, dataset: &DatasetRef) -> Result<u64>;

    fn exists(&self, dataset: &DatasetRef) -> bool;

    /// Copies geometry and the attribute columns `fields`, in that order, to
    /// `output`. Row order and the coordinate reference system are kept.
    fn project(&self, dataset: &DatasetRef, fields: &[String], output: &DatasetRef)
        -> Result<DatasetRef>;

    /// Copies the features of `dataset` matching `filter`, all fields kept.
    fn select(
        &self,
        dataset: &DatasetRef,
        filter: &AttributeFilter,
        output: &DatasetRef,
    ) -> Result<DatasetRef>;

    /// Appends the features of all `inputs` to one dataset whose schema is the
    /// union of the input schemas.
    fn merge(&self, inputs: &[DatasetRef], output: &DatasetRef) -> Result<DatasetRef>;

    /// Copies `dataset` and appends the derived fields.
    fn derive(
        &self,
        dataset: &DatasetRef,
        fields: &[DerivedField],
        tables: &TableSet,
        output: &DatasetRef,
    ) -> Result<DatasetRef>;

    /// Removes `dataset`, or only its layer when it names one inside a
    /// multi-layer container. Removing a missing dataset is not an error.
    fn delete(&self, dataset: &DatasetRef) -> Result<()>;
}
