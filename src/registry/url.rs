use crate::context::Context;
use crate::digest::{sha256_file, sha256_str};
use crate::error::{DepotError, Result};
use crate::registry::{not_found, split, RepoMetadata, Repository};
use crate::resolver::reference::ModelReference;
use crate::store::snapshot::{HttpSource, LocalSource};
use crate::store::{FileKind, SnapshotFile};
use crate::transfer::Transfer;
use reqwest::header::HeaderMap;
use std::path::PathBuf;

/// Plain `http(s)://` downloads and `file://` imports
#[derive(Debug)]
pub struct UrlClient {
    transfer: Transfer,
    show_progress: bool,
}

impl UrlClient {
    #[must_use]
    pub fn new(transfer: Transfer, show_progress: bool) -> Self {
        Self {
            transfer,
            show_progress,
        }
    }

    #[must_use]
    pub fn from_context(ctx: &Context) -> Self {
        Self::new(ctx.transfer().clone(), ctx.show_progress())
    }

    fn http_metadata(&self, reference: &ModelReference, url: url::Url) -> Result<RepoMetadata> {
        let file_name = url
            .path_segments()
            .and_then(|mut s| s.next_back())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| not_found(reference, None))?;

        let mut files = Vec::new();
        for part in split::expand(&file_name)? {
            let mut part_url = url.clone();
            if part != file_name {
                part_url
                    .path_segments_mut()
                    .map_err(|()| DepotError::InvalidReference {
                        reference: reference.raw.clone(),
                        reason: "URL cannot carry a path".to_string(),
                    })?
                    .pop()
                    .push(&part);
            }
            let kind = FileKind::from_path(&part);
            files.push(
                SnapshotFile::new(
                    part,
                    kind,
                    HttpSource::new(self.transfer.clone(), part_url.to_string(), HeaderMap::new()),
                )
                .with_progress(self.show_progress && kind == FileKind::Model),
            );
        }

        Ok(RepoMetadata {
            snapshot_hash: sha256_str(url.as_str()),
            files,
        })
    }

    fn file_metadata(&self, reference: &ModelReference, url: &url::Url) -> Result<RepoMetadata> {
        let path: PathBuf = url.to_file_path().map_err(|()| DepotError::InvalidReference {
            reference: reference.raw.clone(),
            reason: "not a local file path".to_string(),
        })?;
        if !path.is_file() {
            return Err(not_found(reference, None));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| not_found(reference, None))?;

        let mut files = Vec::new();
        let mut snapshot_hash = None;
        for part in split::expand(&name)? {
            let part_path = path.with_file_name(&part);
            if !part_path.is_file() {
                return Err(DepotError::AmbiguousSplitModel(format!(
                    "{} is missing next to {}",
                    part_path.display(),
                    path.display()
                )));
            }
            let digest = sha256_file(&part_path)?;
            snapshot_hash.get_or_insert_with(|| digest.clone());
            let kind = FileKind::from_path(&part);
            files.push(SnapshotFile::new(part, kind, LocalSource::new(part_path)).with_digest(digest));
        }

        let snapshot_hash = snapshot_hash.ok_or_else(|| not_found(reference, None))?;
        Ok(RepoMetadata { snapshot_hash, files })
    }
}

impl Repository for UrlClient {
    fn fetch_metadata(&self, reference: &ModelReference) -> Result<RepoMetadata> {
        let url = url::Url::parse(&reference.raw).map_err(|e| DepotError::InvalidReference {
            reference: reference.raw.clone(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "http" | "https" => self.http_metadata(reference, url),
            "file" => self.file_metadata(reference, &url),
            other => Err(DepotError::UnsupportedBackend(format!("URL scheme '{other}'"))),
        }
    }
}
