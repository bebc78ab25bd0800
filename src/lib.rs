pub mod derive;
pub mod error;
pub mod filter;
pub mod job;
pub mod kmz;
pub mod mapping;
pub mod model;
pub mod reconcile;
pub mod scratch;
pub mod store;
pub mod workspace;

pub use error::{Error, Result};
pub use filter::AttributeFilter;
pub use job::{run_job, Job, JobReport};
pub use mapping::{DerivedField, FieldSource, MappingTable, TableSet};
pub use model::{DatasetRef, FieldDef, FieldType, Schema, Value};
pub use reconcile::{reconcile, SchemaReconciler};
pub use scratch::{ScratchLayer, ScratchWorkspace};
pub use store::{GdalStore, MemoryStore, VectorStore};
pub use workspace::Workspace;
