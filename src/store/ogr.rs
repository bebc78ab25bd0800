use std::collections::HashMap;
use std::ffi::{c_char, c_int, CStr};
use std::fs;
use std::path::{Path, PathBuf};

use gdal::spatial_ref::SpatialRef;
use gdal::vector::{
    Feature, FieldDefn, FieldValue, Layer, LayerAccess, LayerOptions, OGRFieldType,
    OGRwkbGeometryType,
};
use gdal::{Dataset, DatasetOptions, DriverManager, GdalOpenFlags};
use tracing::{debug, info, warn};

use super::VectorStore;
use crate::error::{Error, Result};
use crate::filter::AttributeFilter;
use crate::mapping::{evaluate_derived, DerivedField, TableSet};
use crate::model::{DatasetRef, FieldDef, FieldType, Schema, Value};

const SHAPEFILE_PARTS: &[&str] = &["shp", "shx", "dbf", "prj", "cpg", "qix", "sbn", "sbx"];

/// [`VectorStore`] backed by GDAL/OGR.
///
/// The output driver follows the output extension: `.shp`, `.gpkg`,
/// `.geojson`/`.json` and `.kml`.
#[derive(Debug, Clone, Default)]
pub struct GdalStore {
    overwrite: bool,
}

/// Field definition as OGR sees it, so copies keep width and precision.
#[derive(Debug, Clone)]
struct OgrField {
    name: String,
    field_type: OGRFieldType::Type,
    width: i32,
    precision: i32,
}

impl OgrField {
    fn from_def(def: &FieldDef) -> Self {
        let field_type = match def.field_type {
            FieldType::Integer => OGRFieldType::OFTInteger64,
            FieldType::Float => OGRFieldType::OFTReal,
            FieldType::Date => OGRFieldType::OFTDate,
            FieldType::Text | FieldType::Geometry => OGRFieldType::OFTString,
        };
        Self {
            name: def.name.clone(),
            field_type,
            width: def.length.unwrap_or(0) as i32,
            precision: 0,
        }
    }

    fn to_def(&self) -> FieldDef {
        let field_type = match self.field_type {
            OGRFieldType::OFTInteger | OGRFieldType::OFTInteger64 => FieldType::Integer,
            OGRFieldType::OFTReal => FieldType::Float,
            OGRFieldType::OFTDate | OGRFieldType::OFTDateTime => FieldType::Date,
            _ => FieldType::Text,
        };
        let length = (field_type == FieldType::Text && self.width > 0).then_some(self.width as usize);
        FieldDef {
            name: self.name.clone(),
            field_type,
            length,
        }
    }
}

/// Columns OGR keeps outside the attribute fields.
#[derive(Debug, Clone, Default)]
struct LayerColumns {
    fid: Option<String>,
    geometry: Option<String>,
}

impl LayerColumns {
    fn of(layer: &Layer<'_>) -> Self {
        // SAFETY: both calls return null or a string owned by the layer,
        // copied before the layer can go away.
        unsafe {
            let c_layer = layer.c_layer();
            Self {
                fid: column_name(gdal_sys::OGR_L_GetFIDColumn(c_layer)),
                geometry: column_name(gdal_sys::OGR_L_GetGeometryColumn(c_layer)),
            }
        }
    }

    fn names(&self) -> Vec<String> {
        self.fid.iter().chain(&self.geometry).cloned().collect()
    }

    /// Layer creation options that keep the column names. Only GeoPackage
    /// lets them be chosen.
    fn creation_options(&self, driver: &str) -> Vec<String> {
        if driver != "GPKG" {
            return Vec::new();
        }
        let mut options = Vec::new();
        if let Some(fid) = &self.fid {
            options.push(format!("FID={}", fid));
        }
        if let Some(geometry) = &self.geometry {
            options.push(format!("GEOMETRY_NAME={}", geometry));
        }
        options
    }
}

unsafe fn column_name(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let name = CStr::from_ptr(ptr).to_string_lossy().into_owned();
    (!name.is_empty()).then_some(name)
}

/// Where a new output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    /// A new file
    File,
    /// A new layer inside an existing GeoPackage
    Layer,
}

impl GdalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    fn open(&self, dataset: &DatasetRef) -> Result<Dataset> {
        if !dataset.path.exists() {
            return Err(Error::DatasetNotFound {
                dataset: dataset.to_string(),
            });
        }
        Ok(Dataset::open(dataset.path())?)
    }

    /// Checks the output location before anything is written to it and
    /// clears what `overwrite` allows to be replaced.
    ///
    /// A named layer of an existing GeoPackage is written next to the other
    /// layers, which stay untouched.
    fn prepare_output(
        &self,
        inputs: &[DatasetRef],
        output: &DatasetRef,
    ) -> Result<(&'static str, Target)> {
        let driver = driver_name(output.path())?;

        if inputs.iter().any(|input| output.overwrites(input)) {
            return Err(Error::OutputIsInput {
                path: output.path.clone(),
            });
        }

        if !output.path.exists() {
            return Ok((driver, Target::File));
        }

        if let (Some(layer), "GPKG") = (&output.layer, driver) {
            if self.exists(output) {
                if !self.overwrite {
                    return Err(Error::OutputExists {
                        path: output.path.clone(),
                    });
                }
                debug!("Removing existing layer {}", output);
                delete_layer(output.path(), layer)?;
            }
            return Ok((driver, Target::Layer));
        }

        if !self.overwrite {
            return Err(Error::OutputExists {
                path: output.path.clone(),
            });
        }
        debug!("Removing existing output {:?}", output.path);
        remove_dataset_files(output.path())?;
        Ok((driver, Target::File))
    }

    /// Creates `output` with the given layout and lets `fill` write the
    /// features. The output is removed again if anything fails.
    #[allow(clippy::too_many_arguments)]
    fn write_output<F>(
        &self,
        inputs: &[DatasetRef],
        output: &DatasetRef,
        srs: Option<&SpatialRef>,
        geometry_type: OGRwkbGeometryType::Type,
        columns: &LayerColumns,
        fields: &[OgrField],
        fill: F,
    ) -> Result<u64>
    where
        F: FnOnce(&Layer<'_>) -> Result<u64>,
    {
        let (driver_name, target) = self.prepare_output(inputs, output)?;
        let mut guard = PartialOutput::new(output, target);

        let mut out_ds = match target {
            Target::File => {
                let driver = DriverManager::get_driver_by_name(driver_name)?;
                driver.create_vector_only(output.path())?
            }
            Target::Layer => open_for_update(output.path())?,
        };

        let count = {
            let layer_name = output.layer_name();
            let options = columns.creation_options(driver_name);
            let options: Vec<&str> = options.iter().map(String::as_str).collect();
            let out_layer = out_ds.create_layer(LayerOptions {
                name: &layer_name,
                srs,
                ty: geometry_type,
                options: (!options.is_empty()).then_some(options.as_slice()),
            })?;

            for field in fields {
                let defn = FieldDefn::new(&field.name, field.field_type)?;
                defn.set_width(field.width);
                defn.set_precision(field.precision);
                defn.add_to_layer(&out_layer)?;
            }

            fill(&out_layer)?
        };

        // データセットを閉じてから確定する
        drop(out_ds);
        guard.commit();

        info!("Written {} features: {}", count, output);
        Ok(count)
    }
}

impl VectorStore for GdalStore {
    fn list_fields(&self, dataset: &DatasetRef) -> Result<Schema> {
        let ds = self.open(dataset)?;
        let layer = open_layer(&ds, dataset)?;
        let fields = ogr_fields(&layer).iter().map(OgrField::to_def).collect();
        Schema::new(fields)
    }

    fn required_fields(&self, dataset: &DatasetRef) -> Result<Vec<String>> {
        let ds = self.open(dataset)?;
        let layer = open_layer(&ds, dataset)?;
        Ok(LayerColumns::of(&layer).names())
    }

    fn feature_count(&self, dataset: &DatasetRef) -> Result<u64> {
        let ds = self.open(dataset)?;
        let layer = open_layer(&ds, dataset)?;
        Ok(layer.feature_count())
    }

    fn exists(&self, dataset: &DatasetRef) -> bool {
        match self.open(dataset) {
            Ok(ds) => open_layer(&ds, dataset).is_ok(),
            Err(_) => false,
        }
    }

    fn project(
        &self,
        dataset: &DatasetRef,
        fields: &[String],
        output: &DatasetRef,
    ) -> Result<DatasetRef> {
        let ds = self.open(dataset)?;
        let mut layer = open_layer(&ds, dataset)?;

        let source_fields = ogr_fields(&layer);
        let mut selected = Vec::with_capacity(fields.len());
        let mut indices = Vec::with_capacity(fields.len());
        for name in fields {
            let idx = source_fields
                .iter()
                .position(|f| &f.name == name)
                .ok_or_else(|| Error::field_not_found(name, dataset))?;
            selected.push(source_fields[idx].clone());
            indices.push(idx);
        }

        let srs = layer.spatial_ref();
        let geometry_type = geometry_type(&layer);
        let columns = LayerColumns::of(&layer);
        debug!("Projecting {} onto fields {:?}", dataset, fields);

        self.write_output(
            std::slice::from_ref(dataset),
            output,
            srs.as_ref(),
            geometry_type,
            &columns,
            &selected,
            |out_layer| copy_features(&mut layer, out_layer, &indices),
        )?;
        Ok(output.clone())
    }

    fn select(
        &self,
        dataset: &DatasetRef,
        filter: &AttributeFilter,
        output: &DatasetRef,
    ) -> Result<DatasetRef> {
        let ds = self.open(dataset)?;
        let mut layer = open_layer(&ds, dataset)?;

        let fields = ogr_fields(&layer);
        let schema = Schema::new(fields.iter().map(OgrField::to_def).collect())?;
        filter.validate(&schema, dataset)?;

        let srs = layer.spatial_ref();
        let geometry_type = geometry_type(&layer);
        let columns = LayerColumns::of(&layer);
        let where_clause = filter.to_sql();
        debug!("Selecting {} where {}", dataset, where_clause);
        layer.set_attribute_filter(&where_clause)?;

        let indices: Vec<usize> = (0..fields.len()).collect();
        self.write_output(
            std::slice::from_ref(dataset),
            output,
            srs.as_ref(),
            geometry_type,
            &columns,
            &fields,
            |out_layer| copy_features(&mut layer, out_layer, &indices),
        )?;
        Ok(output.clone())
    }

    fn merge(&self, inputs: &[DatasetRef], output: &DatasetRef) -> Result<DatasetRef> {
        if inputs.is_empty() {
            return Err(Error::EmptyMerge);
        }

        let sources = inputs
            .iter()
            .map(|input| self.open(input))
            .collect::<Result<Vec<_>>>()?;
        let mut layers = sources
            .iter()
            .zip(inputs)
            .map(|(ds, input)| open_layer(ds, input))
            .collect::<Result<Vec<_>>>()?;

        // 全入力のフィールドを名前で統合
        let mut merged_fields: Vec<OgrField> = Vec::new();
        let mut layer_fields = Vec::with_capacity(layers.len());
        for layer in &layers {
            let fields = ogr_fields(layer);
            for field in &fields {
                if !merged_fields.iter().any(|f| f.name == field.name) {
                    merged_fields.push(field.clone());
                }
            }
            layer_fields.push(fields);
        }

        let srs = layers[0].spatial_ref();
        let geometry_type = geometry_type(&layers[0]);
        let columns = LayerColumns::of(&layers[0]);

        self.write_output(
            inputs,
            output,
            srs.as_ref(),
            geometry_type,
            &columns,
            &merged_fields,
            |out_layer| {
                let mut total = 0;
                for (layer, fields) in layers.iter_mut().zip(&layer_fields) {
                    let indices: Vec<Option<usize>> = merged_fields
                        .iter()
                        .map(|merged| fields.iter().position(|f| f.name == merged.name))
                        .collect();
                    total += copy_features_sparse(layer, out_layer, &indices)?;
                }
                Ok(total)
            },
        )?;
        Ok(output.clone())
    }

    fn derive(
        &self,
        dataset: &DatasetRef,
        fields: &[DerivedField],
        tables: &TableSet,
        output: &DatasetRef,
    ) -> Result<DatasetRef> {
        let ds = self.open(dataset)?;
        let mut layer = open_layer(&ds, dataset)?;

        let source_fields = ogr_fields(&layer);
        let mut out_fields = source_fields.clone();
        for derived in fields {
            if out_fields.iter().any(|f| f.name == derived.def.name) {
                return Err(Error::DuplicateField {
                    field: derived.def.name.clone(),
                });
            }
            out_fields.push(OgrField::from_def(&derived.def));
        }

        let srs = layer.spatial_ref();
        let geometry_type = geometry_type(&layer);
        let columns = LayerColumns::of(&layer);
        let source_index: HashMap<&str, usize> = source_fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.as_str(), i))
            .collect();

        self.write_output(
            std::slice::from_ref(dataset),
            output,
            srs.as_ref(),
            geometry_type,
            &columns,
            &out_fields,
            |out_layer| {
                let mut count = 0;
                for feature in layer.features() {
                    let mut out = new_feature(&feature, out_layer)?;
                    for idx in 0..source_fields.len() {
                        if let Some(value) = feature.field(idx)? {
                            out.set_field(idx, &value)?;
                        }
                    }

                    let row = |name: &str| {
                        source_index
                            .get(name)
                            .and_then(|&idx| feature.field(idx).ok().flatten())
                            .and_then(from_field_value)
                    };
                    let values = evaluate_derived(fields, tables, &row);
                    for (offset, value) in values.into_iter().enumerate() {
                        if let Some(value) = value {
                            out.set_field(source_fields.len() + offset, &to_field_value(value))?;
                        }
                    }

                    out.create(out_layer)?;
                    count += 1;
                }
                Ok(count)
            },
        )?;
        Ok(output.clone())
    }

    fn delete(&self, dataset: &DatasetRef) -> Result<()> {
        if let Some(layer) = &dataset.layer {
            if dataset.path.exists() && driver_name(dataset.path()).ok() == Some("GPKG") {
                return delete_layer(dataset.path(), layer);
            }
        }
        remove_dataset_files(dataset.path())?;
        Ok(())
    }
}

fn open_layer<'a>(ds: &'a Dataset, dataset: &DatasetRef) -> Result<Layer<'a>> {
    let layer = match &dataset.layer {
        Some(name) => ds.layer_by_name(name),
        None => ds.layer(0),
    };
    layer.map_err(|_| Error::DatasetNotFound {
        dataset: dataset.to_string(),
    })
}

fn ogr_fields(layer: &Layer<'_>) -> Vec<OgrField> {
    layer
        .defn()
        .fields()
        .map(|field| OgrField {
            name: field.name(),
            field_type: field.field_type(),
            width: field.width(),
            precision: field.precision(),
        })
        .collect()
}

fn geometry_type(layer: &Layer<'_>) -> OGRwkbGeometryType::Type {
    layer
        .defn()
        .geom_fields()
        .next()
        .map(|field| field.field_type())
        .unwrap_or(OGRwkbGeometryType::wkbUnknown)
}

fn new_feature<'a>(source: &Feature<'_>, out_layer: &'a Layer<'_>) -> Result<Feature<'a>> {
    let mut out = Feature::new(out_layer.defn())?;
    if let Some(geometry) = source.geometry() {
        out.set_geometry(geometry.clone())?;
    }
    Ok(out)
}

/// Copies every feature, output field `i` taken from source field `indices[i]`.
fn copy_features(layer: &mut Layer<'_>, out_layer: &Layer<'_>, indices: &[usize]) -> Result<u64> {
    let sparse: Vec<Option<usize>> = indices.iter().copied().map(Some).collect();
    copy_features_sparse(layer, out_layer, &sparse)
}

/// Like [`copy_features`], `None` leaves the output field null.
fn copy_features_sparse(
    layer: &mut Layer<'_>,
    out_layer: &Layer<'_>,
    indices: &[Option<usize>],
) -> Result<u64> {
    let mut count = 0;
    for feature in layer.features() {
        let mut out = new_feature(&feature, out_layer)?;
        for (out_idx, source_idx) in indices.iter().enumerate() {
            let Some(source_idx) = source_idx else {
                continue;
            };
            if let Some(value) = feature.field(*source_idx)? {
                out.set_field(out_idx, &value)?;
            }
        }
        out.create(out_layer)?;
        count += 1;
    }
    Ok(count)
}

fn from_field_value(value: FieldValue) -> Option<Value> {
    match value {
        FieldValue::IntegerValue(v) => Some(Value::Integer(v as i64)),
        FieldValue::Integer64Value(v) => Some(Value::Integer(v)),
        FieldValue::RealValue(v) => Some(Value::Float(v)),
        FieldValue::StringValue(v) => Some(Value::Text(v)),
        FieldValue::DateValue(v) => Some(Value::Date(v.to_string())),
        FieldValue::DateTimeValue(v) => Some(Value::Date(v.to_rfc3339())),
        _ => None,
    }
}

fn to_field_value(value: Value) -> FieldValue {
    match value {
        Value::Integer(v) => FieldValue::Integer64Value(v),
        Value::Float(v) => FieldValue::RealValue(v),
        // OGR parses date text when it is set on a date field
        Value::Text(v) | Value::Date(v) => FieldValue::StringValue(v),
    }
}

fn driver_name(path: &Path) -> Result<&'static str> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "shp" => Ok("ESRI Shapefile"),
        "gpkg" => Ok("GPKG"),
        "geojson" | "json" => Ok("GeoJSON"),
        "kml" => Ok("KML"),
        _ => Err(Error::UnsupportedFormat {
            path: path.to_path_buf(),
        }),
    }
}

fn open_for_update(path: &Path) -> Result<Dataset> {
    let options = DatasetOptions {
        open_flags: GdalOpenFlags::GDAL_OF_UPDATE | GdalOpenFlags::GDAL_OF_VECTOR,
        ..Default::default()
    };
    Ok(Dataset::open_ex(path, options)?)
}

/// Deletes one layer of a multi-layer dataset. A missing layer is not an
/// error.
fn delete_layer(path: &Path, name: &str) -> Result<()> {
    let ds = open_for_update(path)?;
    let Some(idx) = ds.layers().position(|layer| layer.name() == name) else {
        return Ok(());
    };

    // SAFETY: the handle belongs to `ds`, which outlives the call.
    let err = unsafe { gdal_sys::GDALDatasetDeleteLayer(ds.c_dataset(), idx as c_int) };
    if err != gdal_sys::OGRErr::OGRERR_NONE {
        return Err(Error::LayerNotDeleted {
            path: path.to_path_buf(),
            layer: name.to_string(),
        });
    }
    Ok(())
}

/// Removes a dataset from disk, including shapefile side files.
pub(crate) fn remove_dataset_files(path: &Path) -> std::io::Result<()> {
    let is_shapefile = path
        .extension()
        .and_then(|s| s.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("shp"));

    let mut parts: Vec<PathBuf> = vec![path.to_path_buf()];
    if is_shapefile {
        parts.extend(SHAPEFILE_PARTS.iter().map(|ext| path.with_extension(ext)));
        parts.push(path.with_extension("shp.xml"));
    }

    for part in parts {
        if part.is_dir() {
            fs::remove_dir_all(&part)?;
        } else if part.exists() {
            fs::remove_file(&part)?;
        }
    }
    Ok(())
}

/// Deletes a half-written output unless [`PartialOutput::commit`] was called.
/// Only the new layer is removed when it was added to an existing file.
struct PartialOutput {
    path: PathBuf,
    layer: Option<String>,
    committed: bool,
}

impl PartialOutput {
    fn new(output: &DatasetRef, target: Target) -> Self {
        Self {
            path: output.path.clone(),
            layer: match target {
                Target::File => None,
                Target::Layer => Some(output.layer_name()),
            },
            committed: false,
        }
    }

    fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for PartialOutput {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let result = match &self.layer {
            Some(layer) => delete_layer(&self.path, layer),
            None => remove_dataset_files(&self.path).map_err(Error::from),
        };
        if let Err(e) = result {
            warn!("Failed to remove partial output {:?}: {}", self.path, e);
        }
    }
}
