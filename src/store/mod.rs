//! Content-addressed model store.
//!
//! Layout under the store root:
//!
//! ```text
//! blobs/sha256-<hex>                                   shared by every backend
//! blobs/.staging/                                      downloads whose hash is not known yet
//! models/<backend>/<org>/<name>/refs/<tag>.json        authoritative tag -> snapshot record
//! models/<backend>/<org>/<name>/snapshots/<hash>/...   human-readable links into blobs/
//! ```

pub mod gc;
pub mod link;
pub mod model_store;
pub mod reffile;
pub mod snapshot;

pub use gc::GcReport;
pub use model_store::{CachedFiles, ModelStore};
pub use reffile::{RefEntry, RefFile};
pub use snapshot::{FileKind, Snapshot, SnapshotFile};

use crate::digest::Digest;
use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// One `(backend, organization, name, tag)` present in the store
#[derive(Debug, Clone)]
pub struct ModelListing {
    pub backend: String,
    pub organization: String,
    pub name: String,
    pub tag: String,
    pub ref_file: RefFile,
    pub size_bytes: u64,
}

impl ModelListing {
    #[must_use]
    pub fn reference(&self) -> String {
        if self.organization.is_empty() {
            format!("{}://{}:{}", self.backend, self.name, self.tag)
        } else {
            format!("{}://{}/{}:{}", self.backend, self.organization, self.name, self.tag)
        }
    }
}

/// Root of the on-disk store
#[derive(Debug, Clone)]
pub struct GlobalStore {
    root: PathBuf,
}

impl GlobalStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Open the store, creating its top-level directories
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(root);
        fs::create_dir_all(store.blobs_dir())?;
        fs::create_dir_all(store.models_dir())?;
        Ok(store)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        self.blobs_dir().join(".staging")
    }

    #[must_use]
    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }

    #[must_use]
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir().join(digest.file_name())
    }

    /// Store slice for one model; `organization` may be empty or contain `/`
    pub fn model(&self, backend: &str, organization: &str, name: &str) -> Result<ModelStore> {
        ModelStore::new(self.clone(), backend, organization, name)
    }

    /// Every model directory (one containing `refs/`) below `models/`.
    ///
    /// Models nest: `hf://org/repo/file.gguf` lives inside the directory of
    /// `hf://org/repo`, so the walk continues below each model it finds.
    pub(crate) fn model_stores(&self) -> Result<Vec<ModelStore>> {
        let mut found = Vec::new();
        let models_dir = self.models_dir();
        if !models_dir.exists() {
            return Ok(found);
        }
        let mut pending = vec![models_dir.clone()];
        while let Some(dir) = pending.pop() {
            let is_model = dir.join("refs").is_dir();
            if is_model {
                if let Some(store) = self.model_store_at(&models_dir, &dir) {
                    found.push(store);
                }
            }
            for entry in fs::read_dir(&dir)?.flatten() {
                if !entry.file_type().is_ok_and(|t| t.is_dir()) {
                    continue;
                }
                if is_model && matches!(entry.file_name().to_str(), Some("refs" | "snapshots")) {
                    continue;
                }
                pending.push(entry.path());
            }
        }
        found.sort_by_key(ModelStore::base_dir);
        Ok(found)
    }

    fn model_store_at(&self, models_dir: &Path, dir: &Path) -> Option<ModelStore> {
        let rel = dir.strip_prefix(models_dir).ok()?;
        let parts: Vec<&str> = rel.iter().filter_map(|p| p.to_str()).collect();
        let (backend, rest) = parts.split_first()?;
        let (name, org) = rest.split_last()?;
        self.model(backend, &org.join("/"), name).ok()
    }

    /// Enumerate every pulled tag with its total size
    pub fn list_models(&self) -> Result<Vec<ModelListing>> {
        let mut listings = Vec::new();
        for store in self.model_stores()? {
            for tag in store.tags()? {
                let Some(ref_file) = store.read_ref(&tag)? else {
                    continue;
                };
                let size_bytes = ref_file
                    .files
                    .iter()
                    .filter_map(|f| fs::metadata(self.blob_path(&f.hash)).ok())
                    .map(|m| m.len())
                    .sum();
                listings.push(ModelListing {
                    backend: store.backend().to_string(),
                    organization: store.organization().to_string(),
                    name: store.name().to_string(),
                    tag,
                    ref_file,
                    size_bytes,
                });
            }
        }
        Ok(listings)
    }

    /// Delete blobs no surviving ref points at
    pub fn collect_garbage(&self) -> Result<GcReport> {
        gc::collect(self)
    }
}
