//! Error types for rgb-schema.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for schema operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A requested field is not part of the dataset schema
    #[error("Field: {field} not in {dataset}")]
    SchemaFieldNotFound { field: String, dataset: String },

    /// A field name appears twice where names must be unique
    #[error("Duplicate field name: {field}")]
    DuplicateField { field: String },

    /// The output location is the input dataset itself
    #[error("Output {path} would overwrite its own input")]
    OutputIsInput { path: PathBuf },

    /// The output already exists and overwriting is disabled
    #[error("Output already exists: {path}")]
    OutputExists { path: PathBuf },

    /// No vector driver is known for the output extension
    #[error("Unsupported vector format: {path}")]
    UnsupportedFormat { path: PathBuf },

    #[error("Dataset not found: {dataset}")]
    DatasetNotFound { dataset: String },

    #[error("Merge requires at least one input dataset")]
    EmptyMerge,

    #[error("Mapping table not found: {name}")]
    TableNotFound { name: String },

    #[error("Mapping table {name} loaded twice")]
    DuplicateTable { name: String },

    #[error("No KML document inside {path}")]
    KmzWithoutKml { path: PathBuf },

    /// An attribute filter without values would select nothing
    #[error("Filter on {field} has no values")]
    EmptyFilter { field: String },

    #[error("Field {field} cannot be derived as {field_type}")]
    UnsupportedFieldType { field: String, field_type: String },

    #[error("Failed to delete layer {layer} from {path}")]
    LayerNotDeleted { path: PathBuf, layer: String },

    #[error(transparent)]
    Gdal(#[from] gdal::errors::GdalError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn field_not_found(field: &str, dataset: impl ToString) -> Self {
        Error::SchemaFieldNotFound {
            field: field.to_string(),
            dataset: dataset.to_string(),
        }
    }
}
