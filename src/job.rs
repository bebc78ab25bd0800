//! Harmonize jobs: bring several source datasets to one field layout and
//! merge them into a single output.
//!
//! A job is described in JSON:
//!
//! ```json
//! {
//!   "workspace": {
//!     "input": "original_input/Census",
//!     "intermediate": "inter_output/Census",
//!     "output": "final_output/Census"
//!   },
//!   "tables": "tables",
//!   "sources": [
//!     {
//!       "dataset": "areas_geoestadisticas_estatales.shp",
//!       "filter": { "field": "CVE_ENT", "values": ["05", "08", "10", "19", "28"] },
//!       "derive": [
//!         { "name": "ADM0_ID", "type": "text", "length": 3, "source": { "constant": "484" } }
//!       ]
//!     }
//!   ],
//!   "field_order": ["ADM0_ID", "NAME_0", "ADM1_ID"],
//!   "append_missing": false,
//!   "output": "States.shp"
//! }
//! ```
//!
//! Relative paths are relative to the job file.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::derive::{derive_fields, derived_schema};
use crate::error::{Error, Result};
use crate::filter::AttributeFilter;
use crate::mapping::{DerivedField, TableSet};
use crate::model::DatasetRef;
use crate::reconcile::{plan_order, reconcile};
use crate::scratch::ScratchWorkspace;
use crate::store::VectorStore;
use crate::workspace::Workspace;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSource {
    /// Dataset name inside the workspace input directory
    pub dataset: String,
    #[serde(default)]
    pub layer: Option<String>,
    /// Features to keep; all of them when absent
    #[serde(default)]
    pub filter: Option<AttributeFilter>,
    /// Fields to add before reordering
    #[serde(default)]
    pub derive: Vec<DerivedField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub name: Option<String>,
    pub workspace: Workspace,
    /// Directory of mapping table files
    #[serde(default)]
    pub tables: Option<PathBuf>,
    pub sources: Vec<JobSource>,
    pub field_order: Vec<String>,
    #[serde(default = "default_append_missing")]
    pub append_missing: bool,
    #[serde(default)]
    pub overwrite: bool,
    /// Output dataset name inside the workspace output directory
    pub output: String,
    #[serde(default)]
    pub output_layer: Option<String>,
}

fn default_append_missing() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub output: DatasetRef,
    pub sources: usize,
    pub features: u64,
}

impl Job {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut job: Job = serde_json::from_reader(BufReader::new(file))?;
        if let Some(base) = path.parent() {
            job.rebase(base);
        }
        Ok(job)
    }

    /// Makes relative workspace and table paths relative to `base`.
    pub fn rebase(&mut self, base: &Path) {
        self.workspace.rebase(base);
        if let Some(tables) = &mut self.tables {
            if tables.is_relative() {
                *tables = base.join(&*tables);
            }
        }
    }

    pub fn output_dataset(&self) -> DatasetRef {
        DatasetRef {
            path: self.workspace.output_path(&self.output),
            layer: self.output_layer.clone(),
        }
    }

    pub fn load_tables(&self) -> Result<TableSet> {
        match &self.tables {
            Some(dir) => TableSet::load_dir(dir),
            None => Ok(TableSet::new()),
        }
    }
}

/// Runs `job` against `store`.
///
/// Every source is checked (filter, fields, tables, field order) before
/// anything is written. Then each source is selected, derived and reconciled
/// into scratch layers and all of them are merged into the output.
pub fn run_job(store: &dyn VectorStore, job: &Job) -> Result<JobReport> {
    if job.sources.is_empty() {
        return Err(Error::EmptyMerge);
    }
    let label = job.name.as_deref().unwrap_or(&job.output);
    info!("Job {}: {} sources", label, job.sources.len());

    let output = job.output_dataset();
    if !job.overwrite && store.exists(&output) {
        return Err(Error::OutputExists { path: output.path });
    }

    let tables = job.load_tables()?;
    job.workspace.create_dirs()?;
    let scratch = ScratchWorkspace::new_in(store, &job.workspace.intermediate)?;

    // 1. 全ソースを先に検証
    let mut inputs = Vec::with_capacity(job.sources.len());
    for source in &job.sources {
        let dataset =
            job.workspace
                .resolve_source(&source.dataset, source.layer.as_deref(), scratch.path())?;
        if output.overwrites(&dataset) {
            return Err(Error::OutputIsInput {
                path: output.path.clone(),
            });
        }
        let schema = store.list_fields(&dataset)?;
        if let Some(filter) = &source.filter {
            filter.validate(&schema, &dataset)?;
        }
        let required = store.required_fields(&dataset)?;
        let schema = derived_schema(&schema, &source.derive, &tables, &dataset)?;
        plan_order(&schema, &required, &job.field_order, job.append_missing, &dataset)?;
        inputs.push(dataset);
    }

    // 2. 抽出、フィールド追加、並べ替え
    let mut layers = Vec::with_capacity(inputs.len());
    for (source, dataset) in job.sources.iter().zip(&inputs) {
        let selected = match &source.filter {
            Some(filter) => {
                let layer = scratch.layer("selected");
                store.select(dataset, filter, &layer)?;
                Some(layer)
            }
            None => None,
        };
        let dataset = selected.as_ref().map(|l| l.dataset()).unwrap_or(dataset);

        let derived = if source.derive.is_empty() {
            None
        } else {
            let layer = scratch.layer("derived");
            derive_fields(store, dataset, &source.derive, &tables, &layer)?;
            Some(layer)
        };
        let dataset = derived.as_ref().map(|l| l.dataset()).unwrap_or(dataset);

        let reconciled = scratch.layer("reconciled");
        reconcile(store, dataset, &job.field_order, job.append_missing, &reconciled)?;
        layers.push(reconciled);
    }

    // 3. 結合して出力
    if job.overwrite && store.exists(&output) {
        store.delete(&output)?;
    }
    let merge_inputs: Vec<DatasetRef> = layers.iter().map(|l| l.dataset().clone()).collect();
    store.merge(&merge_inputs, &output)?;
    let features = store.feature_count(&output)?;

    info!("Job {} written to {} ({} features)", label, output, features);
    Ok(JobReport {
        output,
        sources: inputs.len(),
        features,
    })
}
