use crate::engine::strategy::{Strategy, StrategyKind, MOUNT_DIR};
use crate::error::{DepotError, Result};
use crate::oci::OciReference;
use crate::store::{GlobalStore, ModelStore, RefEntry, RefFile};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Where a path should be valid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathMode {
    /// Absolute path on this machine
    Host,
    /// Path as seen inside a container with the model mounted at the mount directory
    Container,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PathKind {
    Entry,
    Mmproj,
    ChatTemplate,
    Draft,
}

#[derive(Debug)]
enum Source {
    /// Materialized in the local store
    Store { model_store: ModelStore, ref_file: RefFile },
    /// Held by the container engine
    Engine { reference: OciReference, strategy: Strategy },
}

/// Outcome of resolving one reference
#[derive(Debug)]
pub struct ResolvedModel {
    reference: String,
    source: Source,
    strategy: Option<StrategyKind>,
    draft: Option<Box<ResolvedModel>>,
    mount_dir: String,
    paths: RefCell<HashMap<(PathKind, PathMode), Option<PathBuf>>>,
}

impl ResolvedModel {
    /// A snapshot in the store. `strategy` is `Some(Http)` for OCI references pulled over HTTP.
    #[must_use]
    pub fn from_store(
        reference: impl Into<String>,
        model_store: ModelStore,
        ref_file: RefFile,
        strategy: Option<StrategyKind>,
    ) -> Self {
        Self::build(reference.into(), Source::Store { model_store, ref_file }, strategy)
    }

    /// A model the engine mounts natively
    #[must_use]
    pub fn from_engine(reference: OciReference, strategy: Strategy) -> Self {
        let kind = strategy.kind();
        Self::build(reference.to_string(), Source::Engine { reference, strategy }, Some(kind))
    }

    fn build(reference: String, source: Source, strategy: Option<StrategyKind>) -> Self {
        Self {
            reference,
            source,
            strategy,
            draft: None,
            mount_dir: MOUNT_DIR.to_string(),
            paths: RefCell::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_draft(mut self, draft: ResolvedModel) -> Self {
        self.draft = Some(Box::new(draft));
        self.paths.borrow_mut().clear();
        self
    }

    #[must_use]
    pub fn with_mount_dir(mut self, mount_dir: impl Into<String>) -> Self {
        self.mount_dir = mount_dir.into().trim_end_matches('/').to_string();
        self.paths.borrow_mut().clear();
        self
    }

    #[must_use]
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// OCI strategy in use, `None` for registry backends
    #[must_use]
    pub fn strategy(&self) -> Option<StrategyKind> {
        self.strategy
    }

    #[must_use]
    pub fn ref_file(&self) -> Option<&RefFile> {
        match &self.source {
            Source::Store { ref_file, .. } => Some(ref_file),
            Source::Engine { .. } => None,
        }
    }

    #[must_use]
    pub fn draft(&self) -> Option<&ResolvedModel> {
        self.draft.as_deref()
    }

    #[must_use]
    pub fn mount_dir(&self) -> &str {
        &self.mount_dir
    }

    pub fn entry_path(&self, mode: PathMode) -> Result<PathBuf> {
        self.cached(PathKind::Entry, mode)?.ok_or_else(|| {
            DepotError::InvalidManifest(format!("{} has no model file", self.reference))
        })
    }

    pub fn mmproj_path(&self, mode: PathMode) -> Result<Option<PathBuf>> {
        self.cached(PathKind::Mmproj, mode)
    }

    pub fn chat_template_path(&self, mode: PathMode) -> Result<Option<PathBuf>> {
        self.cached(PathKind::ChatTemplate, mode)
    }

    /// Entry path of the draft model; in a container it lives under `<mount>/draft`
    pub fn draft_path(&self, mode: PathMode) -> Result<Option<PathBuf>> {
        self.cached(PathKind::Draft, mode)
    }

    /// Container mount argument exposing the model at `dest`
    pub fn mount_argument(&self, dest: &str) -> Result<String> {
        match &self.source {
            Source::Store {
                model_store,
                ref_file,
            } => Ok(format!(
                "--mount=type=bind,src={},destination={dest},ro",
                model_store.snapshot_dir(&ref_file.snapshot_hash).display()
            )),
            Source::Engine { reference, strategy } => strategy.mount_argument(reference, dest),
        }
    }

    /// Mount argument for the draft model, at `<mount>/draft`
    pub fn draft_mount_argument(&self) -> Result<Option<String>> {
        self.draft
            .as_ref()
            .map(|d| d.mount_argument(&format!("{}/draft", self.mount_dir)))
            .transpose()
    }

    fn cached(&self, kind: PathKind, mode: PathMode) -> Result<Option<PathBuf>> {
        if let Some(path) = self.paths.borrow().get(&(kind, mode)) {
            return Ok(path.clone());
        }
        let path = self.compute(kind, mode)?;
        self.paths.borrow_mut().insert((kind, mode), path.clone());
        Ok(path)
    }

    fn compute(&self, kind: PathKind, mode: PathMode) -> Result<Option<PathBuf>> {
        if kind == PathKind::Draft {
            return match &self.draft {
                Some(draft) => draft.entry_under(mode, &format!("{}/draft", self.mount_dir)).map(Some),
                None => Ok(None),
            };
        }

        match &self.source {
            Source::Store {
                model_store,
                ref_file,
            } => {
                let entry = match kind {
                    PathKind::Entry => ref_file.entry_model()?,
                    PathKind::Mmproj => ref_file.mmproj(),
                    PathKind::ChatTemplate => ref_file.chat_template(),
                    PathKind::Draft => None,
                };
                Ok(entry.map(|e| locate(model_store.global(), e, mode, &self.mount_dir)))
            }
            Source::Engine { reference, strategy } => {
                if mode == PathMode::Host {
                    return Err(DepotError::StrategyUnavailable(format!(
                        "{reference} is mounted by the {} strategy and has no host path",
                        strategy.kind()
                    )));
                }
                match kind {
                    PathKind::Entry => strategy
                        .entrypoint_path(reference, &self.mount_dir)
                        .map(|p| Some(PathBuf::from(p))),
                    _ => Ok(None),
                }
            }
        }
    }

    /// Entry path with the model mounted at `mount_dir`
    fn entry_under(&self, mode: PathMode, mount_dir: &str) -> Result<PathBuf> {
        let missing = || DepotError::InvalidManifest(format!("{} has no model file", self.reference));
        match &self.source {
            Source::Store {
                model_store,
                ref_file,
            } => {
                let entry = ref_file.entry_model()?.ok_or_else(missing)?;
                Ok(locate(model_store.global(), entry, mode, mount_dir))
            }
            Source::Engine { .. } if mode == PathMode::Host => self.entry_path(mode),
            Source::Engine { reference, strategy } => {
                Ok(PathBuf::from(strategy.entrypoint_path(reference, mount_dir)?))
            }
        }
    }
}

fn locate(store: &GlobalStore, entry: &RefEntry, mode: PathMode, mount_dir: &str) -> PathBuf {
    match mode {
        PathMode::Host => store.blob_path(&entry.hash),
        PathMode::Container => Path::new(mount_dir).join(&entry.name),
    }
}
