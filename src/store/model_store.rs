use crate::digest::{sha256_file, Digest};
use crate::error::{DepotError, Result};
use crate::store::link;
use crate::store::reffile::{RefEntry, RefFile};
use crate::store::snapshot::{Snapshot, SnapshotFile};
use crate::store::GlobalStore;
use std::fs;
use std::path::PathBuf;

/// What the store already holds for one tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFiles {
    pub snapshot_hash: Digest,
    pub present: Vec<String>,
    pub complete: bool,
}

/// The slice of the store belonging to one `(backend, organization, name)`
#[derive(Debug, Clone)]
pub struct ModelStore {
    global: GlobalStore,
    backend: String,
    organization: String,
    name: String,
}

/// Map a tag or digest onto a file-name-safe form
#[must_use]
pub fn sanitize_tag(tag: &str) -> String {
    tag.replace([':', '/'], "-")
}

fn valid_component(part: &str) -> bool {
    !part.is_empty() && part != "." && part != ".." && !part.contains('\\')
}

impl ModelStore {
    pub(crate) fn new(global: GlobalStore, backend: &str, organization: &str, name: &str) -> Result<Self> {
        let bad = |what: &str| DepotError::InvalidReference {
            reference: format!("{backend}://{organization}/{name}"),
            reason: format!("{what} is not a valid store path"),
        };
        if !valid_component(backend) || backend.contains('/') {
            return Err(bad("backend"));
        }
        if !organization.is_empty() && !organization.split('/').all(valid_component) {
            return Err(bad("organization"));
        }
        if !valid_component(name) || name.contains('/') {
            return Err(bad("name"));
        }
        Ok(Self {
            global,
            backend: backend.to_string(),
            organization: organization.to_string(),
            name: name.to_string(),
        })
    }

    #[must_use]
    pub fn backend(&self) -> &str {
        &self.backend
    }

    #[must_use]
    pub fn organization(&self) -> &str {
        &self.organization
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn global(&self) -> &GlobalStore {
        &self.global
    }

    #[must_use]
    pub fn base_dir(&self) -> PathBuf {
        let mut dir = self.global.models_dir().join(&self.backend);
        if !self.organization.is_empty() {
            dir = dir.join(&self.organization);
        }
        dir.join(&self.name)
    }

    #[must_use]
    pub fn refs_dir(&self) -> PathBuf {
        self.base_dir().join("refs")
    }

    #[must_use]
    pub fn snapshots_dir(&self) -> PathBuf {
        self.base_dir().join("snapshots")
    }

    #[must_use]
    pub fn ref_path(&self, tag: &str) -> PathBuf {
        self.refs_dir().join(format!("{}.json", sanitize_tag(tag)))
    }

    #[must_use]
    pub fn snapshot_dir(&self, snapshot_hash: &Digest) -> PathBuf {
        self.snapshots_dir().join(snapshot_hash.file_name())
    }

    /// Human-readable path of one file inside a snapshot
    #[must_use]
    pub fn snapshot_file_path(&self, snapshot_hash: &Digest, name: &str) -> PathBuf {
        self.snapshot_dir(snapshot_hash).join(name)
    }

    /// Display form used in errors: `backend://org/name:tag`
    #[must_use]
    pub fn display_ref(&self, tag: &str) -> String {
        if self.organization.is_empty() {
            format!("{}://{}:{tag}", self.backend, self.name)
        } else {
            format!("{}://{}/{}:{tag}", self.backend, self.organization, self.name)
        }
    }

    pub fn read_ref(&self, tag: &str) -> Result<Option<RefFile>> {
        RefFile::load(&self.ref_path(tag))
    }

    /// `Ok(None)` when the tag has never been pulled
    pub fn get_cached_files(&self, tag: &str) -> Result<Option<CachedFiles>> {
        let Some(ref_file) = self.read_ref(tag)? else {
            return Ok(None);
        };
        let present: Vec<String> = ref_file
            .files
            .iter()
            .filter(|f| self.global.blob_path(&f.hash).exists())
            .map(|f| f.name.clone())
            .collect();
        let complete = present.len() == ref_file.files.len();
        Ok(Some(CachedFiles {
            snapshot_hash: ref_file.snapshot_hash,
            present,
            complete,
        }))
    }

    /// True when the tag's ref exists and every blob it names is on disk
    pub fn is_complete(&self, tag: &str) -> Result<bool> {
        Ok(self.get_cached_files(tag)?.is_some_and(|c| c.complete))
    }

    /// Download every file of `snapshot` into the blob directory, then point `tag` at it.
    ///
    /// The ref file is written last; if a required file fails the previous ref
    /// (if any) is left untouched and already-downloaded blobs stay for a retry.
    pub fn new_snapshot(&self, tag: &str, snapshot: Snapshot) -> Result<RefFile> {
        fs::create_dir_all(self.global.blobs_dir())?;
        fs::create_dir_all(self.refs_dir())?;

        let previous = match self.read_ref(tag) {
            Ok(previous) => previous,
            Err(e) => {
                tracing::warn!("Ignoring unreadable ref for {}: {e}", self.display_ref(tag));
                None
            }
        };

        let (snapshot_hash, files) = snapshot.into_parts();
        let mut entries = Vec::with_capacity(files.len());
        for file in &files {
            let reusable = previous
                .as_ref()
                .filter(|p| p.snapshot_hash == snapshot_hash)
                .and_then(|p| p.find(file.name()))
                .filter(|e| self.global.blob_path(&e.hash).exists())
                .map(|e| e.hash.clone());

            let result = match reusable {
                Some(hash) => Ok(hash),
                None => self.materialize(&snapshot_hash, file),
            };

            match result {
                Ok(hash) => entries.push(RefEntry {
                    name: file.name().to_string(),
                    hash,
                    kind: file.kind(),
                }),
                Err(e) if !file.is_required() => {
                    tracing::warn!("Skipping optional file {}: {e}", file.name());
                }
                Err(e) if entries.is_empty() => return Err(e),
                Err(e) => {
                    return Err(DepotError::PartialPullAborted {
                        reference: self.display_ref(tag),
                        file: file.name().to_string(),
                        source: Box::new(e),
                    })
                }
            }
        }

        self.link_snapshot(&snapshot_hash, &entries)?;

        let ref_file = RefFile::new(snapshot_hash, entries);
        ref_file.save(&self.ref_path(tag))?;
        tracing::info!(
            "Stored {} ({} files) at {}",
            self.display_ref(tag),
            ref_file.files.len(),
            self.ref_path(tag).display()
        );
        Ok(ref_file)
    }

    /// Put one file's blob in place and return its content hash
    fn materialize(&self, snapshot_hash: &Digest, file: &SnapshotFile) -> Result<Digest> {
        if let Some(digest) = file.digest() {
            let blob = self.global.blob_path(digest);
            discard_dangling(&blob)?;
            retry_on_mismatch(file, || file.download(&blob))?;
            return Ok(digest.clone());
        }

        // Hash only known after download: stage, hash, then move into place
        let staging_dir = self.global.staging_dir();
        fs::create_dir_all(&staging_dir)?;
        let staged = staging_dir.join(format!(
            "{}-{}",
            snapshot_hash.file_name(),
            sanitize_tag(file.name())
        ));
        discard_dangling(&staged)?;
        retry_on_mismatch(file, || file.download(&staged))?;

        let digest = sha256_file(&staged)?;
        let blob = self.global.blob_path(&digest);
        discard_dangling(&blob)?;
        if blob.exists() {
            fs::remove_file(&staged)?;
        } else {
            fs::rename(&staged, &blob)?;
        }
        Ok(digest)
    }

    /// Human-readable snapshot directory linking names to blobs
    fn link_snapshot(&self, snapshot_hash: &Digest, entries: &[RefEntry]) -> Result<()> {
        let dir = self.snapshot_dir(snapshot_hash);
        for entry in entries {
            let target = self.global.blob_path(&entry.hash);
            let path = dir.join(&entry.name);
            link::relink(&target, &path)?;
        }
        Ok(())
    }

    /// Delete the ref for `tag`. Blobs are left for garbage collection.
    ///
    /// Returns false when the tag was not present.
    pub fn remove_snapshot(&self, tag: &str) -> Result<bool> {
        let Some(ref_file) = self.read_ref(tag)? else {
            return Ok(false);
        };
        fs::remove_file(self.ref_path(tag))?;

        let still_used = self
            .tags()?
            .iter()
            .filter_map(|t| self.read_ref(t).ok().flatten())
            .any(|r| r.snapshot_hash == ref_file.snapshot_hash);
        if !still_used {
            let dir = self.snapshot_dir(&ref_file.snapshot_hash);
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
        }
        tracing::info!("Removed {}", self.display_ref(tag));
        Ok(true)
    }

    /// Every tag with a ref file, sorted
    pub fn tags(&self) -> Result<Vec<String>> {
        let dir = self.refs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut tags: Vec<String> = fs::read_dir(dir)?
            .flatten()
            .filter_map(|e| {
                let name = e.file_name().to_str()?.to_string();
                name.strip_suffix(".json").map(str::to_string)
            })
            .collect();
        tags.sort();
        Ok(tags)
    }
}

fn discard_dangling(path: &std::path::Path) -> Result<()> {
    if path.symlink_metadata().is_ok() && !path.exists() {
        tracing::debug!("Removing dangling link {}", path.display());
        fs::remove_file(path)?;
    }
    Ok(())
}

fn retry_on_mismatch(file: &SnapshotFile, mut attempt: impl FnMut() -> Result<u64>) -> Result<u64> {
    match attempt() {
        Err(DepotError::DigestMismatch { actual, .. }) => {
            tracing::warn!(
                "Checksum mismatch for {} (got {actual}), retrying once",
                file.name()
            );
            attempt()
        }
        other => other,
    }
}
