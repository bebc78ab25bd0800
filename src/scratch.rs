use std::cell::Cell;
use std::ops::Deref;
use std::path::Path;

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::DatasetRef;
use crate::store::VectorStore;

/// Temporary directory for intermediate datasets of one run.
///
/// Each [`ScratchLayer`] gets its own name, so no two steps share a handle.
/// Layers are deleted when dropped and the directory when the workspace is
/// dropped.
pub struct ScratchWorkspace<'s> {
    store: &'s dyn VectorStore,
    dir: TempDir,
    extension: String,
    counter: Cell<u32>,
}

impl<'s> ScratchWorkspace<'s> {
    pub fn new(store: &'s dyn VectorStore) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("rgb-scratch-").tempdir()?;
        Ok(Self::with_dir(store, dir))
    }

    pub fn new_in(store: &'s dyn VectorStore, parent: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("rgb-scratch-")
            .tempdir_in(parent)?;
        Ok(Self::with_dir(store, dir))
    }

    fn with_dir(store: &'s dyn VectorStore, dir: TempDir) -> Self {
        debug!("Scratch workspace at {:?}", dir.path());
        Self {
            store,
            dir,
            extension: "gpkg".to_string(),
            counter: Cell::new(0),
        }
    }

    /// File extension, and so vector format, of scratch layers.
    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.trim_start_matches('.').to_string();
        self
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn layer(&self, label: &str) -> ScratchLayer<'_> {
        let n = self.counter.get() + 1;
        self.counter.set(n);

        let label: String = label
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let path = self
            .dir
            .path()
            .join(format!("{}_{:03}.{}", label, n, self.extension));

        ScratchLayer {
            store: self.store,
            dataset: DatasetRef::new(path),
        }
    }
}

/// Uniquely named intermediate dataset, deleted on drop.
pub struct ScratchLayer<'w> {
    store: &'w dyn VectorStore,
    dataset: DatasetRef,
}

impl ScratchLayer<'_> {
    pub fn dataset(&self) -> &DatasetRef {
        &self.dataset
    }
}

impl Deref for ScratchLayer<'_> {
    type Target = DatasetRef;

    fn deref(&self) -> &DatasetRef {
        &self.dataset
    }
}

impl Drop for ScratchLayer<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.delete(&self.dataset) {
            warn!("Failed to release scratch layer {}: {}", self.dataset, e);
        }
    }
}
