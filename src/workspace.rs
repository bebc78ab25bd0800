use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::kmz;
use crate::model::DatasetRef;

/// Directories a preparation job reads from and writes to.
///
/// Every dataset name is resolved against one of these explicitly; nothing
/// depends on the process working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    /// Original source datasets
    pub input: PathBuf,
    /// Intermediate datasets and scratch layers
    pub intermediate: PathBuf,
    /// Final outputs
    pub output: PathBuf,
}

impl Workspace {
    pub fn new(
        input: impl Into<PathBuf>,
        intermediate: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
    ) -> Self {
        Self {
            input: input.into(),
            intermediate: intermediate.into(),
            output: output.into(),
        }
    }

    pub fn input_path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.input.join(name)
    }

    pub fn intermediate_path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.intermediate.join(name)
    }

    pub fn output_path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.output.join(name)
    }

    /// Creates the intermediate and output directories.
    pub fn create_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.intermediate)?;
        fs::create_dir_all(&self.output)?;
        Ok(())
    }

    /// Makes relative directories relative to `base`.
    pub fn rebase(&mut self, base: &Path) {
        for dir in [&mut self.input, &mut self.intermediate, &mut self.output] {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
    }

    /// Resolves a source dataset name. KMZ archives are unpacked into
    /// `extract_dir` and the contained KML is returned instead.
    pub fn resolve_source(
        &self,
        name: &str,
        layer: Option<&str>,
        extract_dir: &Path,
    ) -> Result<DatasetRef> {
        let mut path = self.input_path(name);
        if kmz::is_kmz(&path) {
            let kml = kmz::extract_kml(&path, extract_dir)?;
            info!("Extracted {:?} from {:?}", kml, path);
            path = kml;
        }
        Ok(DatasetRef {
            path,
            layer: layer.map(str::to_string),
        })
    }
}
