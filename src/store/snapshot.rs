use crate::digest::{sha256_bytes, sha256_file, Digest};
use crate::error::{DepotError, Result};
use crate::store::link;
use crate::transfer::{partial_path, Transfer};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Role of a file inside a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    #[serde(alias = "gguf", alias = "safetensor")]
    Model,
    Mmproj,
    ChatTemplate,
    Other,
}

impl FileKind {
    /// Guess a kind from a file path inside an artifact
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        let lower = path.to_ascii_lowercase();
        let base = lower.rsplit('/').next().unwrap_or(&lower);
        if base.ends_with(".mmproj") || (base.starts_with("mmproj") && base.ends_with(".gguf")) {
            Self::Mmproj
        } else if base.ends_with(".gguf") || base.ends_with(".safetensors") {
            Self::Model
        } else if base.ends_with(".jinja") || base.starts_with("chat_template") {
            Self::ChatTemplate
        } else {
            Self::Other
        }
    }
}

/// Where the bytes of one snapshot file come from
pub trait BlobSource: fmt::Debug {
    /// Write the content to `dest`, verifying it against `expected` when given.
    /// Must never leave a file at `dest` whose content does not match `expected`.
    fn fetch(&self, dest: &Path, expected: Option<&Digest>, show_progress: bool) -> Result<u64>;

    /// Human-readable origin, used in logs and errors
    fn locator(&self) -> String;
}

/// Plain HTTP(S) download through the transfer engine
pub struct HttpSource {
    transfer: Transfer,
    url: String,
    headers: HeaderMap,
}

impl HttpSource {
    #[must_use]
    pub fn new(transfer: Transfer, url: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            transfer,
            url: url.into(),
            headers,
        }
    }
}

impl fmt::Debug for HttpSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Headers may carry bearer tokens
        f.debug_struct("HttpSource")
            .field("url", &self.url)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl BlobSource for HttpSource {
    fn fetch(&self, dest: &Path, expected: Option<&Digest>, show_progress: bool) -> Result<u64> {
        self.transfer
            .fetch_verified(&self.url, &self.headers, dest, show_progress, expected)
    }

    fn locator(&self) -> String {
        self.url.clone()
    }
}

/// Content generated in memory
#[derive(Debug)]
pub struct InlineSource {
    label: String,
    content: Vec<u8>,
}

impl InlineSource {
    #[must_use]
    pub fn new(label: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            label: label.into(),
            content: content.into(),
        }
    }

    #[must_use]
    pub fn digest(&self) -> Digest {
        sha256_bytes(&self.content)
    }
}

impl BlobSource for InlineSource {
    fn fetch(&self, dest: &Path, expected: Option<&Digest>, _show_progress: bool) -> Result<u64> {
        if let Some(want) = expected.filter(|d| d.is_verifiable()) {
            let actual = self.digest();
            if &actual != want {
                return Err(DepotError::DigestMismatch {
                    subject: self.label.clone(),
                    expected: want.to_string(),
                    actual: actual.to_string(),
                });
            }
        }
        let partial = partial_path(dest);
        fs::write(&partial, &self.content)?;
        fs::rename(&partial, dest)?;
        Ok(self.content.len() as u64)
    }

    fn locator(&self) -> String {
        format!("inline:{}", self.label)
    }
}

/// A file already on this host, linked into the store instead of copied
#[derive(Debug)]
pub struct LocalSource {
    path: PathBuf,
}

impl LocalSource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl BlobSource for LocalSource {
    fn fetch(&self, dest: &Path, expected: Option<&Digest>, _show_progress: bool) -> Result<u64> {
        if let Some(want) = expected.filter(|d| d.is_verifiable()) {
            let actual = sha256_file(&self.path)?;
            if &actual != want {
                return Err(DepotError::DigestMismatch {
                    subject: self.path.display().to_string(),
                    expected: want.to_string(),
                    actual: actual.to_string(),
                });
            }
        }
        let linked = link::link_or_copy(&self.path, dest)?;
        tracing::debug!(
            "Materialized {} via {:?}",
            self.path.display(),
            linked.method
        );
        Ok(fs::metadata(dest)?.len())
    }

    fn locator(&self) -> String {
        format!("file://{}", self.path.display())
    }
}

/// One file belonging to a snapshot
#[derive(Debug)]
pub struct SnapshotFile {
    name: String,
    kind: FileKind,
    digest: Option<Digest>,
    show_progress: bool,
    verify_checksum: bool,
    required: bool,
    source: Box<dyn BlobSource>,
}

impl SnapshotFile {
    /// A required, checksum-verified file without progress output
    pub fn new(name: impl Into<String>, kind: FileKind, source: impl BlobSource + 'static) -> Self {
        Self {
            name: name.into(),
            kind,
            digest: None,
            show_progress: false,
            verify_checksum: true,
            required: true,
            source: Box::new(source),
        }
    }

    #[must_use]
    pub fn with_digest(mut self, digest: Digest) -> Self {
        self.digest = Some(digest);
        self
    }

    #[must_use]
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    #[must_use]
    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    #[must_use]
    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    #[must_use]
    pub fn is_required(&self) -> bool {
        self.required
    }

    #[must_use]
    pub fn locator(&self) -> String {
        self.source.locator()
    }

    /// Fetch into `dest`; a no-op when `dest` already exists
    pub fn download(&self, dest: &Path) -> Result<u64> {
        if dest.exists() {
            tracing::debug!("Using cached {} at {}", self.name, dest.display());
            return Ok(0);
        }
        let expected = if self.verify_checksum {
            self.digest.as_ref()
        } else {
            None
        };
        tracing::info!("Fetching {} from {}", self.name, self.source.locator());
        self.source.fetch(dest, expected, self.show_progress)
    }
}

/// Immutable ordered file list for one `(model, tag)` pull
#[derive(Debug)]
pub struct Snapshot {
    hash: Digest,
    files: Vec<SnapshotFile>,
}

impl Snapshot {
    /// Validates that at most one chat template and one mmproj are present
    /// and that file names are unique.
    pub fn new(hash: Digest, files: Vec<SnapshotFile>) -> Result<Self> {
        let count = |kind| files.iter().filter(|f| f.kind == kind).count();
        if count(FileKind::ChatTemplate) > 1 {
            return Err(DepotError::InvalidManifest(format!(
                "snapshot {hash} has more than one chat template"
            )));
        }
        if count(FileKind::Mmproj) > 1 {
            return Err(DepotError::InvalidManifest(format!(
                "snapshot {hash} has more than one mmproj file"
            )));
        }
        for (i, f) in files.iter().enumerate() {
            if files[..i].iter().any(|g| g.name == f.name) {
                return Err(DepotError::InvalidManifest(format!(
                    "snapshot {hash} lists '{}' twice",
                    f.name
                )));
            }
        }
        Ok(Self { hash, files })
    }

    #[must_use]
    pub fn hash(&self) -> &Digest {
        &self.hash
    }

    #[must_use]
    pub fn files(&self) -> &[SnapshotFile] {
        &self.files
    }

    #[must_use]
    pub fn into_parts(self) -> (Digest, Vec<SnapshotFile>) {
        (self.hash, self.files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sha256_str;
    use tempfile::TempDir;

    fn inline(name: &str, kind: FileKind, body: &str) -> SnapshotFile {
        SnapshotFile::new(name, kind, InlineSource::new(name, body))
    }

    #[test]
    fn test_kind_from_path() {
        assert_eq!(FileKind::from_path("models/x.gguf"), FileKind::Model);
        assert_eq!(FileKind::from_path("model-00001-of-00002.safetensors"), FileKind::Model);
        assert_eq!(FileKind::from_path("vision.mmproj"), FileKind::Mmproj);
        assert_eq!(FileKind::from_path("mmproj-model-f16.gguf"), FileKind::Mmproj);
        assert_eq!(FileKind::from_path("chat_template.jinja"), FileKind::ChatTemplate);
        assert_eq!(FileKind::from_path("README.md"), FileKind::Other);
    }

    #[test]
    fn test_kind_serde_names() {
        assert_eq!(serde_json::to_string(&FileKind::ChatTemplate).unwrap(), "\"chat_template\"");
        let legacy: FileKind = serde_json::from_str("\"gguf\"").unwrap();
        assert_eq!(legacy, FileKind::Model);
    }

    #[test]
    fn test_snapshot_rejects_two_chat_templates() {
        let files = vec![
            inline("m.gguf", FileKind::Model, "m"),
            inline("a.jinja", FileKind::ChatTemplate, "a"),
            inline("b.jinja", FileKind::ChatTemplate, "b"),
        ];
        assert!(Snapshot::new(sha256_str("x"), files).is_err());
    }

    #[test]
    fn test_snapshot_rejects_two_mmproj() {
        let files = vec![
            inline("a.mmproj", FileKind::Mmproj, "a"),
            inline("b.mmproj", FileKind::Mmproj, "b"),
        ];
        assert!(Snapshot::new(sha256_str("x"), files).is_err());
    }

    #[test]
    fn test_snapshot_rejects_duplicate_names() {
        let files = vec![
            inline("m.gguf", FileKind::Model, "a"),
            inline("m.gguf", FileKind::Model, "b"),
        ];
        assert!(Snapshot::new(sha256_str("x"), files).is_err());
    }

    #[test]
    fn test_download_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("blob");
        let file = inline("m.gguf", FileKind::Model, "weights");

        assert_eq!(file.download(&dest).unwrap(), 7);
        assert_eq!(file.download(&dest).unwrap(), 0);
        assert_eq!(fs::read_to_string(&dest).unwrap(), "weights");
    }

    #[test]
    fn test_inline_mismatch_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let wrong = sha256_str("something else");
        let dest = dir.path().join(wrong.file_name());
        let file = inline("m.gguf", FileKind::Model, "weights").with_digest(wrong);

        let err = file.download(&dest).unwrap_err();
        assert!(matches!(err, DepotError::DigestMismatch { .. }));
        assert!(!dest.exists());
    }

    #[test]
    fn test_unverified_file_skips_digest_check() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("blob");
        let file = inline("m.gguf", FileKind::Model, "weights")
            .with_digest(sha256_str("other"))
            .with_verification(false);
        assert!(file.download(&dest).is_ok());
    }
}
