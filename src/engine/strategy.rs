use crate::engine::capabilities::ArtifactCapabilities;
use crate::engine::{Engine, EngineKind};
use crate::error::{DepotError, Result};
use crate::oci::spec::{Manifest, ANNOTATION_FILEPATH, ANNOTATION_TITLE};
use crate::oci::{artifact, OciReference, RegistryClient};
use crate::store::{GlobalStore, ModelStore, RefFile};
use crate::transfer::Transfer;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::str::FromStr;

/// Default in-container mount point for models
pub const MOUNT_DIR: &str = "/mnt/models";

/// File name image-packaged models expose inside the mount
pub const IMAGE_ENTRYPOINT: &str = "model.file";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    NativeArtifact,
    NativeImage,
    Http,
}

impl StrategyKind {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::NativeArtifact => "artifact",
            Self::NativeImage => "image",
            Self::Http => "http",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StrategyKind {
    type Err = DepotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "artifact" | "podman-artifact" => Ok(Self::NativeArtifact),
            "image" | "podman-image" => Ok(Self::NativeImage),
            "http" | "http-bind" => Ok(Self::Http),
            other => Err(DepotError::Config(format!(
                "unknown strategy '{other}', expected auto, artifact, image or http"
            ))),
        }
    }
}

/// `auto` or a caller override
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyMode {
    #[default]
    Auto,
    Explicit(StrategyKind),
}

impl FromStr for StrategyMode {
    type Err = DepotError;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().eq_ignore_ascii_case("auto") {
            Ok(Self::Auto)
        } else {
            s.parse().map(Self::Explicit)
        }
    }
}

/// Pick a strategy. An explicit override is honored only when the engine
/// supports it; it never silently downgrades.
pub fn select(mode: StrategyMode, caps: &ArtifactCapabilities) -> Result<StrategyKind> {
    match mode {
        StrategyMode::Auto => Ok(caps.preferred()),
        StrategyMode::Explicit(kind) if caps.supports(kind) => Ok(kind),
        StrategyMode::Explicit(StrategyKind::NativeArtifact) => Err(DepotError::StrategyUnavailable(format!(
            "artifact strategy requested but the engine does not support artifacts (version {})",
            caps.engine_version.map_or_else(|| "unknown".to_string(), |v| v.to_string())
        ))),
        StrategyMode::Explicit(kind) => Err(DepotError::StrategyUnavailable(format!(
            "{kind} strategy requested but no podman or docker engine is available"
        ))),
    }
}

/// One way of making an OCI-hosted model available to a container
pub trait OciStrategy {
    fn kind(&self) -> StrategyKind;

    fn pull(&self, reference: &OciReference) -> Result<()>;

    fn exists(&self, reference: &OciReference) -> bool;

    fn remove(&self, reference: &OciReference) -> Result<bool>;

    fn mount_argument(&self, reference: &OciReference, dest: &str) -> Result<String>;

    /// Sorted model file names as they appear under the mount
    fn entrypoint_filenames(&self, reference: &OciReference) -> Result<Vec<String>>;

    fn entrypoint_path(&self, reference: &OciReference, mount_dir: &str) -> Result<String> {
        let names = self.entrypoint_filenames(reference)?;
        let first = names
            .first()
            .ok_or_else(|| DepotError::InvalidManifest(format!("no model files found for {reference}")))?;
        Ok(format!("{}/{first}", mount_dir.trim_end_matches('/')))
    }
}

/// `podman artifact` objects mounted with `type=artifact`
#[derive(Debug)]
pub struct ArtifactStrategy {
    engine: Engine,
}

impl ArtifactStrategy {
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

/// Base names from the layer annotations of an `artifact inspect` manifest
fn annotated_filenames(manifest_json: &str, reference: &OciReference) -> Result<Vec<String>> {
    let manifest: Manifest = serde_json::from_str(manifest_json.trim())
        .map_err(|e| DepotError::InvalidManifest(format!("unreadable manifest for {reference}: {e}")))?;
    let mut names: Vec<String> = manifest
        .layers
        .iter()
        .filter_map(|layer| {
            layer
                .annotations
                .get(ANNOTATION_FILEPATH)
                .or_else(|| layer.annotations.get(ANNOTATION_TITLE))
        })
        .filter_map(|path| path.rsplit('/').next().filter(|n| !n.is_empty()))
        .map(str::to_string)
        .collect();
    if names.is_empty() {
        return Err(DepotError::InvalidManifest(format!(
            "no layer of {reference} carries a file path annotation"
        )));
    }
    names.sort();
    Ok(names)
}

impl OciStrategy for ArtifactStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::NativeArtifact
    }

    fn pull(&self, reference: &OciReference) -> Result<()> {
        self.engine
            .run_checked(&["artifact", "pull", &reference.canonical()])
            .map(|_| ())
    }

    fn exists(&self, reference: &OciReference) -> bool {
        self.engine
            .succeeds(&["artifact", "inspect", &reference.canonical()])
    }

    fn remove(&self, reference: &OciReference) -> Result<bool> {
        Ok(self.engine.succeeds(&["artifact", "rm", &reference.canonical()]))
    }

    fn mount_argument(&self, reference: &OciReference, dest: &str) -> Result<String> {
        Ok(format!(
            "--mount=type=artifact,src={},destination={dest}",
            reference.canonical()
        ))
    }

    fn entrypoint_filenames(&self, reference: &OciReference) -> Result<Vec<String>> {
        let json = self.engine.run_checked(&[
            "artifact",
            "inspect",
            "--format",
            "{{json .Manifest}}",
            &reference.canonical(),
        ])?;
        annotated_filenames(&json, reference)
    }

    /// A single-file artifact is mounted as the file itself
    fn entrypoint_path(&self, reference: &OciReference, mount_dir: &str) -> Result<String> {
        let names = self.entrypoint_filenames(reference)?;
        match names.as_slice() {
            [_] => Ok(mount_dir.to_string()),
            [first, ..] => Ok(format!("{}/{first}", mount_dir.trim_end_matches('/'))),
            [] => Err(DepotError::InvalidManifest(format!("no model files found for {reference}"))),
        }
    }
}

/// Model packaged as a container image
#[derive(Debug)]
pub struct ImageStrategy {
    engine: Engine,
}

impl ImageStrategy {
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

impl OciStrategy for ImageStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::NativeImage
    }

    fn pull(&self, reference: &OciReference) -> Result<()> {
        self.engine.run_checked(&["pull", &reference.canonical()]).map(|_| ())
    }

    fn exists(&self, reference: &OciReference) -> bool {
        self.engine.succeeds(&["image", "inspect", &reference.canonical()])
    }

    fn remove(&self, reference: &OciReference) -> Result<bool> {
        let name = reference.canonical();
        Ok(self.engine.succeeds(&["manifest", "rm", &name]) || self.engine.succeeds(&["image", "rm", &name]))
    }

    fn mount_argument(&self, reference: &OciReference, dest: &str) -> Result<String> {
        let src = reference.canonical();
        match self.engine.kind() {
            EngineKind::Podman => Ok(format!(
                "--mount=type=image,src={src},destination={dest},subpath=/models,rw=false"
            )),
            EngineKind::Docker => Ok(format!("--mount=type=volume,src={src},dst={dest},readonly")),
            EngineKind::Other => Err(DepotError::StrategyUnavailable(format!(
                "{} cannot mount images",
                self.engine.binary().display()
            ))),
        }
    }

    fn entrypoint_filenames(&self, _reference: &OciReference) -> Result<Vec<String>> {
        Ok(vec![IMAGE_ENTRYPOINT.to_string()])
    }
}

/// Pull over the registry API into the local store, then bind-mount the snapshot
#[derive(Debug)]
pub struct HttpStrategy {
    store: GlobalStore,
    transfer: Transfer,
}

impl HttpStrategy {
    #[must_use]
    pub fn new(store: GlobalStore, transfer: Transfer) -> Self {
        Self { store, transfer }
    }

    fn model_store(&self, reference: &OciReference) -> Result<ModelStore> {
        reference.model_store(&self.store)
    }

    /// Ref file of a completed pull
    pub fn ref_file(&self, reference: &OciReference) -> Result<RefFile> {
        let store = self.model_store(reference)?;
        store
            .read_ref(&reference.specifier())?
            .ok_or_else(|| DepotError::NotFound {
                reference: reference.to_string(),
                backend: "oci".to_string(),
                status: None,
            })
    }

    /// Host directory holding the pulled snapshot
    pub fn snapshot_dir(&self, reference: &OciReference) -> Result<PathBuf> {
        let ref_file = self.ref_file(reference)?;
        Ok(self.model_store(reference)?.snapshot_dir(&ref_file.snapshot_hash))
    }

    /// Blob path of a file in the pulled snapshot
    pub fn blob_path(&self, reference: &OciReference, name: &str) -> Result<PathBuf> {
        let ref_file = self.ref_file(reference)?;
        let entry = ref_file.find(name).ok_or_else(|| {
            DepotError::Other(format!("{reference} has no file named '{name}'"))
        })?;
        Ok(self.store.blob_path(&entry.hash))
    }

    #[must_use]
    pub fn store_root(&self) -> &Path {
        self.store.root()
    }
}

impl OciStrategy for HttpStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Http
    }

    fn pull(&self, reference: &OciReference) -> Result<()> {
        let client = Rc::new(RegistryClient::new(
            self.transfer.clone(),
            &reference.registry,
            &reference.repository,
        ));
        artifact::pull_artifact(&client, &self.model_store(reference)?, reference).map(|_| ())
    }

    fn exists(&self, reference: &OciReference) -> bool {
        self.model_store(reference)
            .and_then(|s| s.get_cached_files(&reference.specifier()))
            .is_ok_and(|cached| cached.is_some_and(|c| c.complete && !c.present.is_empty()))
    }

    fn remove(&self, reference: &OciReference) -> Result<bool> {
        self.model_store(reference)?.remove_snapshot(&reference.specifier())
    }

    fn mount_argument(&self, reference: &OciReference, dest: &str) -> Result<String> {
        let dir = self.snapshot_dir(reference)?;
        Ok(format!("--mount=type=bind,src={},destination={dest},ro", dir.display()))
    }

    fn entrypoint_filenames(&self, reference: &OciReference) -> Result<Vec<String>> {
        let ref_file = self.ref_file(reference)?;
        let mut names: Vec<String> = ref_file.model_files().map(|f| f.name.clone()).collect();
        if names.is_empty() {
            return Err(DepotError::InvalidManifest(format!("no model files in {reference}")));
        }
        names.sort();
        Ok(names)
    }
}

/// The three strategies behind one type, dispatched like the registry backends
#[derive(Debug)]
pub enum Strategy {
    Artifact(ArtifactStrategy),
    Image(ImageStrategy),
    Http(HttpStrategy),
}

impl Strategy {
    #[must_use]
    pub fn as_dyn(&self) -> &dyn OciStrategy {
        match self {
            Self::Artifact(s) => s,
            Self::Image(s) => s,
            Self::Http(s) => s,
        }
    }

    #[must_use]
    pub fn kind(&self) -> StrategyKind {
        self.as_dyn().kind()
    }

    pub fn pull(&self, reference: &OciReference) -> Result<()> {
        self.as_dyn().pull(reference)
    }

    #[must_use]
    pub fn exists(&self, reference: &OciReference) -> bool {
        self.as_dyn().exists(reference)
    }

    pub fn remove(&self, reference: &OciReference) -> Result<bool> {
        self.as_dyn().remove(reference)
    }

    pub fn mount_argument(&self, reference: &OciReference, dest: &str) -> Result<String> {
        self.as_dyn().mount_argument(reference, dest)
    }

    pub fn entrypoint_filenames(&self, reference: &OciReference) -> Result<Vec<String>> {
        self.as_dyn().entrypoint_filenames(reference)
    }

    pub fn entrypoint_path(&self, reference: &OciReference, mount_dir: &str) -> Result<String> {
        self.as_dyn().entrypoint_path(reference, mount_dir)
    }
}
