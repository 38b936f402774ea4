//! ModelScope backend. Single files are fetched over HTTP with checksums from
//! the repository metadata API; whole repositories go through the `modelscope` CLI.

use crate::context::Context;
use crate::digest::Digest;
use crate::error::{DepotError, Result};
use crate::oci::spec::normalize_layer_filepath;
use crate::registry::cli::CliTool;
use crate::registry::{check_status, not_found, split, RepoMetadata, Repository};
use crate::resolver::reference::ModelReference;
use crate::store::snapshot::HttpSource;
use crate::store::{FileKind, SnapshotFile};
use crate::transfer::Transfer;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use std::time::Duration;

const REVISION: &str = "master";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawFileResponse {
    data: Option<RawFileData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawFileData {
    meta_content: Option<MetaContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MetaContent {
    sha256: Option<String>,
}

#[derive(Debug)]
pub struct ModelScopeClient {
    transfer: Transfer,
    endpoint: String,
    timeout: Duration,
    show_progress: bool,
}

impl ModelScopeClient {
    #[must_use]
    pub fn new(transfer: Transfer, endpoint: &str, timeout: Duration, show_progress: bool) -> Self {
        Self {
            transfer,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            timeout,
            show_progress,
        }
    }

    #[must_use]
    pub fn from_context(ctx: &Context) -> Self {
        Self::new(
            ctx.transfer().clone(),
            &ctx.config().network.modelscope_endpoint,
            ctx.metadata_timeout(),
            ctx.show_progress(),
        )
    }

    #[must_use]
    pub fn resolve_url(&self, repo: &str, file: &str) -> String {
        format!("{}/{repo}/resolve/{REVISION}/{file}", self.endpoint)
    }

    /// sha256 recorded by the repository metadata API
    pub fn fetch_checksum(&self, reference: &ModelReference, repo: &str, file: &str) -> Result<Digest> {
        let url = format!("{}/api/v1/models/{repo}/repo/raw", self.endpoint);
        let response = self
            .transfer
            .client()
            .get(&url)
            .query(&[("Revision", REVISION), ("FilePath", file), ("Needmeta", "true")])
            .timeout(self.timeout)
            .send()?;
        let body: RawFileResponse = check_status(reference, &url, response)?.json()?;

        let sha = body
            .data
            .and_then(|d| d.meta_content)
            .and_then(|m| m.sha256)
            .ok_or_else(|| DepotError::InvalidManifest(format!("no sha256 recorded for {repo}/{file}")))?;
        format!("sha256:{}", sha.to_ascii_lowercase()).parse()
    }

    fn file_metadata(&self, reference: &ModelReference, repo: &str, file: &str) -> Result<RepoMetadata> {
        let mut files = Vec::new();
        let mut snapshot_hash = None;
        for part in split::expand(file)? {
            let digest = self.fetch_checksum(reference, repo, &part)?;
            snapshot_hash.get_or_insert_with(|| digest.clone());

            let kind = FileKind::from_path(&part);
            let url = self.resolve_url(repo, &part);
            files.push(
                SnapshotFile::new(
                    normalize_layer_filepath(&part)?,
                    kind,
                    HttpSource::new(self.transfer.clone(), url, HeaderMap::new()),
                )
                .with_digest(digest)
                .with_progress(self.show_progress && kind == FileKind::Model),
            );
        }

        let snapshot_hash = snapshot_hash.ok_or_else(|| not_found(reference, None))?;
        Ok(RepoMetadata { snapshot_hash, files })
    }
}

impl Repository for ModelScopeClient {
    fn fetch_metadata(&self, reference: &ModelReference) -> Result<RepoMetadata> {
        match reference.organization.split_once('/') {
            Some((org, rest)) => {
                let (repo_name, subdir) = rest.split_once('/').map_or((rest, None), |(r, s)| (r, Some(s)));
                let file = subdir.map_or_else(|| reference.name.clone(), |s| format!("{s}/{}", reference.name));
                self.file_metadata(reference, &format!("{org}/{repo_name}"), &file)
            }
            // No metadata API for whole repositories
            None => Err(not_found(reference, None)),
        }
    }

    fn fetch_direct(&self, reference: &ModelReference) -> Result<RepoMetadata> {
        if reference.organization.is_empty() {
            return Err(not_found(reference, None));
        }
        self.file_metadata(reference, &reference.organization, &reference.name)
    }

    fn cli_tool(&self) -> Option<CliTool> {
        Some(CliTool::ModelScope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_file_response() {
        let hex = "C".repeat(64);
        let json = format!(r#"{{"Code":200,"Data":{{"MetaContent":{{"Sha256":"{hex}","Size":12}}}},"Success":true}}"#);
        let body: RawFileResponse = serde_json::from_str(&json).unwrap();
        let sha = body.data.unwrap().meta_content.unwrap().sha256.unwrap();
        assert_eq!(sha, hex);
    }

    #[test]
    fn test_resolve_url() {
        let transfer = Transfer::new(reqwest::blocking::Client::new(), Duration::from_millis(100));
        let client = ModelScopeClient::new(transfer, "https://modelscope.cn/", Duration::from_secs(5), false);
        assert_eq!(
            client.resolve_url("qwen/tiny-gguf", "tiny.gguf"),
            "https://modelscope.cn/qwen/tiny-gguf/resolve/master/tiny.gguf"
        );
    }
}
