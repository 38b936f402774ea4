//! HuggingFace Hub backend.
//!
//! GGUF repositories are resolved through the llama.cpp-compatible manifest
//! endpoint (`/v2/<repo>/manifests/<tag>`), which names the model file, its
//! sha256 and an optional mmproj. Repositories without a GGUF manifest fall
//! back to the file tree, where safetensors weights carry LFS checksums.

use crate::context::Context;
use crate::digest::{sha256_str, Digest};
use crate::error::{DepotError, Result};
use crate::oci::spec::normalize_layer_filepath;
use crate::registry::cli::CliTool;
use crate::registry::{check_status, not_found, split, RepoMetadata, Repository};
use crate::resolver::reference::ModelReference;
use crate::store::snapshot::HttpSource;
use crate::store::{FileKind, SnapshotFile};
use crate::transfer::Transfer;
use reqwest::blocking::RequestBuilder;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, LINK, USER_AGENT};
use reqwest::StatusCode;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Extra files fetched next to GGUF weights when the repository has them
const GGUF_SIDECARS: [&str; 3] = ["config.json", "generation_config.json", "tokenizer_config.json"];

/// Files required to load safetensors weights
const SAFETENSORS_REQUIRED: [&str; 1] = ["config.json"];

/// Weight formats never pulled alongside safetensors
const FOREIGN_WEIGHTS: [&str; 8] = [".bin", ".pt", ".pth", ".ckpt", ".h5", ".msgpack", ".onnx", ".gguf"];

/// The manifest endpoint only answers llama.cpp's user agent
const MANIFEST_USER_AGENT: &str = "llama-cpp";

#[derive(Debug, Deserialize)]
struct ManifestResponse {
    #[serde(rename = "ggufFile")]
    gguf_file: Option<ManifestFile>,
    #[serde(rename = "mmprojFile")]
    mmproj_file: Option<ManifestFile>,
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    rfilename: String,
    #[serde(rename = "blobId")]
    blob_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TreeEntry {
    #[serde(rename = "type")]
    kind: String,
    path: String,
    lfs: Option<LfsPointer>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LfsPointer {
    oid: String,
}

pub struct HuggingFaceClient {
    transfer: Transfer,
    endpoint: String,
    token: Option<String>,
    timeout: Duration,
    show_progress: bool,
}

impl fmt::Debug for HuggingFaceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HuggingFaceClient")
            .field("endpoint", &self.endpoint)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .finish_non_exhaustive()
    }
}

/// Digest of a HuggingFace blob id / LFS oid (bare sha256 hex or `sha256:` form)
fn lfs_digest(oid: &str) -> Result<Digest> {
    let oid = oid.trim();
    if oid.contains(':') {
        oid.parse()
    } else {
        format!("sha256:{oid}").parse()
    }
}

/// Extract the `oid sha256:<hex>` line of a git-lfs pointer file
pub(crate) fn parse_lfs_pointer(body: &str) -> Option<Digest> {
    body.lines()
        .find_map(|l| l.trim().strip_prefix("oid sha256:"))
        .and_then(|hex| lfs_digest(hex).ok())
}

/// `rel="next"` target of an RFC 8288 `Link` header
pub(crate) fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        let is_next = params
            .split(';')
            .any(|p| matches!(p.trim(), "rel=\"next\"" | "rel=next"));
        is_next.then(|| {
            target
                .trim()
                .trim_start_matches('<')
                .trim_end_matches('>')
                .to_string()
        })
    })
}

impl HuggingFaceClient {
    #[must_use]
    pub fn new(transfer: Transfer, endpoint: &str, token: Option<String>, timeout: Duration, show_progress: bool) -> Self {
        Self {
            transfer,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
            timeout,
            show_progress,
        }
    }

    #[must_use]
    pub fn from_context(ctx: &Context) -> Self {
        Self::new(
            ctx.transfer().clone(),
            &ctx.config().network.huggingface_endpoint,
            ctx.hf_token().map(str::to_string),
            ctx.metadata_timeout(),
            ctx.show_progress(),
        )
    }

    /// Download URL of one file on the main revision
    #[must_use]
    pub fn resolve_url(&self, repo: &str, file: &str) -> String {
        format!("{}/{repo}/resolve/main/{file}", self.endpoint)
    }

    fn auth_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = self
            .token
            .as_ref()
            .and_then(|t| HeaderValue::from_str(&format!("Bearer {t}")).ok())
        {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }

    fn get(&self, url: &str) -> RequestBuilder {
        self.transfer
            .client()
            .get(url)
            .headers(self.auth_headers())
            .timeout(self.timeout)
    }

    fn http_file(&self, repo: &str, name: &str, kind: FileKind) -> Result<SnapshotFile> {
        let url = self.resolve_url(repo, name);
        let name = normalize_layer_filepath(name)?;
        Ok(
            SnapshotFile::new(name, kind, HttpSource::new(self.transfer.clone(), url, self.auth_headers()))
                .with_progress(self.show_progress && kind == FileKind::Model),
        )
    }

    /// sha256 of an LFS-tracked file, read from its raw pointer
    pub fn fetch_checksum(&self, reference: &ModelReference, repo: &str, file: &str) -> Result<Digest> {
        let url = format!("{}/{repo}/raw/main/{file}", self.endpoint);
        let response = check_status(reference, &url, self.get(&url).send()?)?;
        let body = response.text()?;
        parse_lfs_pointer(&body).ok_or_else(|| {
            DepotError::InvalidManifest(format!("{repo}/{file} is not tracked by git-lfs, no checksum available"))
        })
    }

    /// Files of the llama.cpp manifest for `tag`
    fn manifest_metadata(&self, reference: &ModelReference, repo: &str, tag: &str) -> Result<RepoMetadata> {
        let url = format!("{}/v2/{repo}/manifests/{tag}", self.endpoint);
        let response = self
            .get(&url)
            .header(USER_AGENT, MANIFEST_USER_AGENT)
            .header(ACCEPT, "application/json")
            .send()?;
        let manifest: ManifestResponse = check_status(reference, &url, response)?.json()?;

        let gguf = manifest.gguf_file.ok_or_else(|| not_found(reference, None))?;
        let model_digest = lfs_digest(&gguf.blob_id)?;
        let mut files = Vec::new();

        match split::SplitName::parse(&gguf.rfilename) {
            Some(first) => {
                for part in first.parts()? {
                    let digest = if part == gguf.rfilename {
                        model_digest.clone()
                    } else {
                        self.fetch_checksum(reference, repo, &part)?
                    };
                    files.push(self.http_file(repo, &part, FileKind::Model)?.with_digest(digest));
                }
            }
            None => files.push(
                self.http_file(repo, &gguf.rfilename, FileKind::Model)?
                    .with_digest(model_digest.clone()),
            ),
        }

        if let Some(mmproj) = manifest.mmproj_file {
            files.push(
                self.http_file(repo, &mmproj.rfilename, FileKind::Mmproj)?
                    .with_digest(lfs_digest(&mmproj.blob_id)?),
            );
        }
        for sidecar in GGUF_SIDECARS {
            files.push(self.http_file(repo, sidecar, FileKind::Other)?.optional());
        }

        Ok(RepoMetadata {
            snapshot_hash: model_digest,
            files,
        })
    }

    /// Every file entry of the main revision, following pagination
    fn tree(&self, reference: &ModelReference, repo: &str) -> Result<Vec<TreeEntry>> {
        let mut url = format!("{}/api/models/{repo}/tree/main", self.endpoint);
        let mut entries = Vec::new();
        loop {
            let response = check_status(reference, &url, self.get(&url).send()?)?;
            let next = response
                .headers()
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(next_link);
            let page: Vec<TreeEntry> = response.json()?;
            entries.extend(page.into_iter().filter(|e| e.kind == "file"));

            match next {
                Some(next) => {
                    url = url::Url::parse(&url)
                        .and_then(|base| base.join(&next))
                        .map_err(|e| DepotError::Other(format!("bad pagination link '{next}': {e}")))?
                        .to_string();
                }
                None => return Ok(entries),
            }
        }
    }

    /// Snapshot of a safetensors repository built from its file tree
    fn tree_metadata(&self, reference: &ModelReference, repo: &str) -> Result<RepoMetadata> {
        let mut entries = self.tree(reference, repo)?;
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        let mut files = Vec::new();
        let mut snapshot_hash = None;
        for entry in &entries {
            let lower = entry.path.to_ascii_lowercase();
            let base = lower.rsplit('/').next().unwrap_or(&lower);
            if base.starts_with('.') || FOREIGN_WEIGHTS.iter().any(|ext| base.ends_with(ext)) {
                continue;
            }

            if base.ends_with(".safetensors") {
                let digest = match &entry.lfs {
                    Some(lfs) => lfs_digest(&lfs.oid)?,
                    None => self.fetch_checksum(reference, repo, &entry.path)?,
                };
                snapshot_hash.get_or_insert_with(|| digest.clone());
                files.push(self.http_file(repo, &entry.path, FileKind::Model)?.with_digest(digest));
            } else {
                let kind = match FileKind::from_path(&entry.path) {
                    FileKind::ChatTemplate if files.iter().any(|f: &SnapshotFile| f.kind() == FileKind::ChatTemplate) => {
                        FileKind::Other
                    }
                    kind => kind,
                };
                let file = self.http_file(repo, &entry.path, kind)?;
                let required = base.ends_with(".safetensors.index.json") || SAFETENSORS_REQUIRED.contains(&base);
                files.push(if required { file } else { file.optional() });
            }
        }

        let snapshot_hash = snapshot_hash.ok_or_else(|| not_found(reference, None))?;
        Ok(RepoMetadata { snapshot_hash, files })
    }

    /// One file (or split set) addressed as `repo/path/to/file`
    fn file_metadata(&self, reference: &ModelReference, repo: &str, file: &str) -> Result<RepoMetadata> {
        let mut files = Vec::new();
        let mut snapshot_hash = None;
        for part in split::expand(file)? {
            let digest = match self.fetch_checksum(reference, repo, &part) {
                Ok(digest) => Some(digest),
                Err(e) if e.is_not_found() => {
                    self.ensure_exists(reference, repo, &part)?;
                    None
                }
                Err(DepotError::InvalidManifest(reason)) => {
                    tracing::debug!("{reason}; hashing after download");
                    None
                }
                Err(e) => return Err(e),
            };
            let kind = FileKind::from_path(&part);
            let mut snapshot_file = self.http_file(repo, &part, kind)?;
            if let Some(digest) = digest {
                snapshot_hash.get_or_insert_with(|| digest.clone());
                snapshot_file = snapshot_file.with_digest(digest);
            }
            files.push(snapshot_file);
        }

        let snapshot_hash = snapshot_hash
            .unwrap_or_else(|| sha256_str(&self.resolve_url(repo, file)));
        Ok(RepoMetadata { snapshot_hash, files })
    }

    /// HEAD the download URL so a missing file is reported before any transfer starts
    fn ensure_exists(&self, reference: &ModelReference, repo: &str, file: &str) -> Result<()> {
        let url = self.resolve_url(repo, file);
        let response = self
            .transfer
            .client()
            .head(&url)
            .headers(self.auth_headers())
            .timeout(self.timeout)
            .send()?;
        if response.status() == StatusCode::METHOD_NOT_ALLOWED {
            return Ok(());
        }
        check_status(reference, &url, response).map(|_| ())
    }
}

impl Repository for HuggingFaceClient {
    fn fetch_metadata(&self, reference: &ModelReference) -> Result<RepoMetadata> {
        if reference.organization.is_empty() {
            return Err(DepotError::InvalidReference {
                reference: reference.raw.clone(),
                reason: "HuggingFace references need an organization: hf://<org>/<repo>".to_string(),
            });
        }

        // hf://org/repo/path/file.gguf addresses a single file
        if let Some((org, repo_name)) = reference.organization.split_once('/') {
            let (repo_name, subdir) = match repo_name.split_once('/') {
                Some((repo_name, subdir)) => (repo_name, Some(subdir)),
                None => (repo_name, None),
            };
            let repo = format!("{org}/{repo_name}");
            let file = match subdir {
                Some(subdir) => format!("{subdir}/{}", reference.name),
                None => reference.name.clone(),
            };
            return self.file_metadata(reference, &repo, &file);
        }

        let repo = reference.repo();
        let tag = if reference.has_default_tag() {
            reference.tag.clone()
        } else {
            reference.tag.to_uppercase()
        };
        match self.manifest_metadata(reference, &repo, &tag) {
            Ok(metadata) => Ok(metadata),
            Err(e) if e.is_not_found() && reference.has_default_tag() => {
                tracing::debug!("No GGUF manifest for {reference}, reading the repository tree");
                self.tree_metadata(reference, &repo)
            }
            Err(e) => Err(e),
        }
    }

    /// `hf://org/file.gguf` read as file `file.gguf` in repository `org`
    fn fetch_direct(&self, reference: &ModelReference) -> Result<RepoMetadata> {
        if reference.organization.is_empty() {
            return Err(not_found(reference, None));
        }
        self.file_metadata(reference, &reference.organization, &reference.name)
    }

    fn cli_tool(&self) -> Option<CliTool> {
        Some(CliTool::HuggingFace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lfs_pointer() {
        let hex = "a".repeat(64);
        let body = format!("version https://git-lfs.github.com/spec/v1\noid sha256:{hex}\nsize 1234\n");
        assert_eq!(parse_lfs_pointer(&body).unwrap().encoded(), hex);
        assert!(parse_lfs_pointer("{\"architectures\": []}").is_none());
    }

    #[test]
    fn test_lfs_digest_forms() {
        let hex = "b".repeat(64);
        assert_eq!(lfs_digest(&hex).unwrap().to_string(), format!("sha256:{hex}"));
        assert_eq!(lfs_digest(&format!("sha256:{hex}")).unwrap().encoded(), hex);
        assert!(lfs_digest("not-a-digest").is_err());
    }

    #[test]
    fn test_next_link() {
        let header = r#"<https://huggingface.co/api/models/a/b/tree/main?cursor=xyz>; rel="next""#;
        assert_eq!(
            next_link(header).as_deref(),
            Some("https://huggingface.co/api/models/a/b/tree/main?cursor=xyz")
        );
        assert!(next_link(r#"<https://x/prev>; rel="prev""#).is_none());
    }

    #[test]
    fn test_tree_entry_deserialize() {
        let json = r#"[{"type":"file","oid":"1","size":2,"path":"model.safetensors","lfs":{"oid":"abc","size":2,"pointerSize":1}},{"type":"directory","oid":"2","size":0,"path":"sub"}]"#;
        let entries: Vec<TreeEntry> = serde_json::from_str(json).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].lfs.as_ref().unwrap().oid, "abc");
        assert_eq!(entries[1].kind, "directory");
    }

    #[test]
    fn test_debug_hides_token() {
        let transfer = Transfer::new(reqwest::blocking::Client::new(), Duration::from_millis(100));
        let client = HuggingFaceClient::new(
            transfer,
            "https://huggingface.co/",
            Some("hf_secret".into()),
            Duration::from_secs(5),
            false,
        );
        assert!(!format!("{client:?}").contains("hf_secret"));
        assert_eq!(
            client.resolve_url("acme/tiny", "m.gguf"),
            "https://huggingface.co/acme/tiny/resolve/main/m.gguf"
        );
    }
}
