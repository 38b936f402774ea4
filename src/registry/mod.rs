//! Per-backend registry clients.
//!
//! Every backend turns a [`ModelReference`] into the file list of one snapshot,
//! with per-file checksums and download locators. The store then materializes
//! the snapshot; see [`pull`].

pub mod cli;
pub mod huggingface;
pub mod modelscope;
pub mod ollama;
pub mod split;
pub mod url;

pub use huggingface::HuggingFaceClient;
pub use modelscope::ModelScopeClient;
pub use ollama::OllamaClient;
pub use self::url::UrlClient;

use crate::context::Context;
use crate::digest::Digest;
use crate::error::{DepotError, Result};
use crate::resolver::reference::{ModelReference, Transport};
use crate::store::{GlobalStore, RefFile, Snapshot, SnapshotFile};
use cli::CliTool;
use reqwest::blocking::Response;
use reqwest::StatusCode;

/// Everything needed to build one snapshot
#[derive(Debug)]
pub struct RepoMetadata {
    pub snapshot_hash: Digest,
    pub files: Vec<SnapshotFile>,
}

/// A source of model metadata keyed by `(organization, name, tag)`
pub trait Repository {
    fn fetch_metadata(&self, reference: &ModelReference) -> Result<RepoMetadata>;

    /// Reinterpret the reference as a direct download when the registry API has no match
    fn fetch_direct(&self, reference: &ModelReference) -> Result<RepoMetadata> {
        Err(not_found(reference, None))
    }

    /// External downloader to try as a last resort
    fn cli_tool(&self) -> Option<CliTool> {
        None
    }
}

pub(crate) fn not_found(reference: &ModelReference, status: Option<u16>) -> DepotError {
    DepotError::NotFound {
        reference: reference.raw.clone(),
        backend: reference.transport.to_string(),
        status,
    }
}

/// Map a registry response onto `NotFound` / transfer errors
pub(crate) fn check_status(reference: &ModelReference, url: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(not_found(reference, Some(status.as_u16())));
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(DepotError::AuthenticationFailed {
            registry: url.to_string(),
            reason: format!("registry answered {status}"),
        });
    }
    if !status.is_success() {
        return Err(DepotError::http(url, status));
    }
    Ok(response)
}

/// Closed set of registry backends; OCI references go through the strategy resolver
pub enum Backend {
    HuggingFace(HuggingFaceClient),
    Ollama(OllamaClient),
    ModelScope(ModelScopeClient),
    Url(UrlClient),
}

impl Backend {
    pub fn for_transport(transport: Transport, ctx: &Context) -> Result<Self> {
        match transport {
            Transport::HuggingFace => Ok(Self::HuggingFace(HuggingFaceClient::from_context(ctx))),
            Transport::Ollama => Ok(Self::Ollama(OllamaClient::from_context(ctx))),
            Transport::ModelScope => Ok(Self::ModelScope(ModelScopeClient::from_context(ctx))),
            Transport::Url => Ok(Self::Url(UrlClient::from_context(ctx))),
            Transport::Oci => Err(DepotError::UnsupportedBackend(
                "oci references are pulled through a container strategy, not a registry backend".to_string(),
            )),
        }
    }

    #[must_use]
    pub fn repository(&self) -> &dyn Repository {
        match self {
            Self::HuggingFace(c) => c,
            Self::Ollama(c) => c,
            Self::ModelScope(c) => c,
            Self::Url(c) => c,
        }
    }
}

/// Fetch metadata, applying the not-found fallback chain: direct URL, then external CLI.
///
/// The fallback only applies when no explicit non-default tag was requested.
pub fn fetch_with_fallback(repo: &dyn Repository, reference: &ModelReference, store: &GlobalStore) -> Result<RepoMetadata> {
    let err = match repo.fetch_metadata(reference) {
        Ok(metadata) => return Ok(metadata),
        Err(e) => e,
    };
    if !err.is_not_found() || !reference.has_default_tag() {
        return Err(err);
    }

    tracing::debug!("{reference} not found in registry ({err}), trying it as a direct URL");
    match repo.fetch_direct(reference) {
        Ok(metadata) => return Ok(metadata),
        Err(e) => tracing::debug!("Direct URL for {reference} failed: {e}"),
    }

    if let Some(tool) = repo.cli_tool().filter(CliTool::is_available) {
        tracing::info!("Falling back to '{}' for {reference}", tool.program());
        let dir = store
            .staging_dir()
            .join(format!("cli-{}", reference.repo().replace(['/', ':'], "_")));
        return cli::download_and_import(&tool, &reference.repo(), &dir);
    }

    Err(err)
}

/// Pull `reference` into the store, skipping the network entirely when the tag is already complete
pub fn pull(backend: &Backend, reference: &ModelReference, store: &GlobalStore) -> Result<RefFile> {
    let model_store = store.model(
        reference.transport.namespace(),
        &reference.organization,
        &reference.name,
    )?;

    if let Some(cached) = model_store.get_cached_files(&reference.tag)? {
        if cached.complete {
            if let Some(ref_file) = model_store.read_ref(&reference.tag)? {
                tracing::info!("{reference} is already up to date");
                return Ok(ref_file);
            }
        }
        tracing::info!(
            "Resuming {reference}: {} file(s) already present",
            cached.present.len()
        );
    }

    let metadata = fetch_with_fallback(backend.repository(), reference, store)?;
    split::validate_parts(metadata.files.iter().map(SnapshotFile::name))?;
    let snapshot = Snapshot::new(metadata.snapshot_hash, metadata.files)?;
    model_store.new_snapshot(&reference.tag, snapshot)
}
