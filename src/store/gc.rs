use crate::digest::Digest;
use crate::error::Result;
use crate::store::GlobalStore;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Symlink hops followed when tracing a blob back to its target
const MAX_LINK_DEPTH: usize = 40;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcReport {
    pub removed_blobs: Vec<Digest>,
    pub reclaimed_bytes: u64,
    pub removed_snapshots: usize,
    pub kept_blobs: usize,
}

/// Blob paths reachable from `path` by following symlinks that stay inside `blobs_dir`
fn link_chain(path: &Path, blobs_dir: &Path) -> Vec<PathBuf> {
    let mut chain = vec![path.to_path_buf()];
    let mut current = path.to_path_buf();
    for _ in 0..MAX_LINK_DEPTH {
        let Ok(target) = fs::read_link(&current) else {
            break;
        };
        let target = match current.parent() {
            Some(parent) if target.is_relative() => parent.join(target),
            _ => target,
        };
        if !target.starts_with(blobs_dir) || chain.contains(&target) {
            break;
        }
        chain.push(target.clone());
        current = target;
    }
    chain
}

pub(crate) fn collect(store: &GlobalStore) -> Result<GcReport> {
    let blobs_dir = store.blobs_dir();
    let mut report = GcReport::default();
    if !blobs_dir.exists() {
        return Ok(report);
    }

    let mut referenced: HashSet<PathBuf> = HashSet::new();
    for model in store.model_stores()? {
        let mut live_snapshots = HashSet::new();
        for tag in model.tags()? {
            let Some(ref_file) = model.read_ref(&tag)? else {
                continue;
            };
            for entry in &ref_file.files {
                referenced.extend(link_chain(&store.blob_path(&entry.hash), &blobs_dir));
            }
            live_snapshots.insert(ref_file.snapshot_hash.file_name());
        }

        let snapshots_dir = model.snapshots_dir();
        if snapshots_dir.exists() {
            for entry in fs::read_dir(&snapshots_dir)?.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if !live_snapshots.contains(&name) {
                    fs::remove_dir_all(entry.path())?;
                    report.removed_snapshots += 1;
                }
            }
        }
    }

    for entry in fs::read_dir(&blobs_dir)?.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        // Only touch finished blobs; .partial and staging data speed up retries
        let Ok(digest) = Digest::from_file_name(name) else {
            continue;
        };
        if referenced.contains(&path) {
            report.kept_blobs += 1;
            continue;
        }
        let size = fs::symlink_metadata(&path).map(|m| m.len()).unwrap_or(0);
        fs::remove_file(&path)?;
        tracing::info!("Removed unreferenced blob {digest}");
        report.reclaimed_bytes += size;
        report.removed_blobs.push(digest);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sha256_str;
    use crate::store::snapshot::InlineSource;
    use crate::store::{FileKind, Snapshot, SnapshotFile};
    use tempfile::TempDir;

    fn file(body: &str) -> SnapshotFile {
        SnapshotFile::new("m.gguf", FileKind::Model, InlineSource::new("m", body)).with_digest(sha256_str(body))
    }

    #[test]
    fn test_shared_blob_survives_until_last_ref() {
        let dir = TempDir::new().unwrap();
        let store = GlobalStore::open(dir.path()).unwrap();
        let model = store.model("hf", "acme", "tiny").unwrap();
        model.new_snapshot("a", Snapshot::new(sha256_str("a"), vec![file("same")]).unwrap()).unwrap();
        model.new_snapshot("b", Snapshot::new(sha256_str("b"), vec![file("same")]).unwrap()).unwrap();
        let blob = store.blob_path(&sha256_str("same"));

        model.remove_snapshot("a").unwrap();
        let report = store.collect_garbage().unwrap();
        assert!(report.removed_blobs.is_empty());
        assert!(blob.exists());

        model.remove_snapshot("b").unwrap();
        let report = store.collect_garbage().unwrap();
        assert_eq!(report.removed_blobs, vec![sha256_str("same")]);
        assert_eq!(report.reclaimed_bytes, 4);
        assert!(!blob.exists());
    }

    #[test]
    fn test_nested_model_refs_keep_their_blobs() {
        let dir = TempDir::new().unwrap();
        let store = GlobalStore::open(dir.path()).unwrap();
        let repo = store.model("huggingface", "org", "repo").unwrap();
        let single = store.model("huggingface", "org/repo", "file.gguf").unwrap();
        repo.new_snapshot("latest", Snapshot::new(sha256_str("r"), vec![file("repo")]).unwrap()).unwrap();
        single.new_snapshot("latest", Snapshot::new(sha256_str("s"), vec![file("single")]).unwrap()).unwrap();

        assert_eq!(store.list_models().unwrap().len(), 2);
        let report = store.collect_garbage().unwrap();
        assert!(report.removed_blobs.is_empty(), "{:?}", report.removed_blobs);
        assert_eq!(report.removed_snapshots, 0);
        assert!(store.blob_path(&sha256_str("single")).exists());
        assert!(store.blob_path(&sha256_str("repo")).exists());

        repo.remove_snapshot("latest").unwrap();
        let report = store.collect_garbage().unwrap();
        assert_eq!(report.removed_blobs, vec![sha256_str("repo")]);
        assert!(single.read_ref("latest").unwrap().is_some());
        assert!(store.blob_path(&sha256_str("single")).exists());
    }

    #[test]
    fn test_partials_and_staging_are_kept() {
        let dir = TempDir::new().unwrap();
        let store = GlobalStore::open(dir.path()).unwrap();
        let partial = store.blobs_dir().join(format!("{}.partial", sha256_str("x").file_name()));
        fs::write(&partial, "half").unwrap();
        fs::create_dir_all(store.staging_dir()).unwrap();

        let report = store.collect_garbage().unwrap();
        assert!(report.removed_blobs.is_empty());
        assert!(partial.exists());
        assert!(store.staging_dir().exists());
    }

    #[test]
    fn test_blob_reached_through_symlink_chain_is_kept() {
        let dir = TempDir::new().unwrap();
        let store = GlobalStore::open(dir.path()).unwrap();
        let real = store.blob_path(&sha256_str("real"));
        fs::write(&real, "data").unwrap();
        let alias = store.blob_path(&sha256_str("alias"));
        std::os::unix::fs::symlink(&real, &alias).unwrap();

        let model = store.model("file", "", "alias.gguf").unwrap();
        let f = SnapshotFile::new("alias.gguf", FileKind::Model, InlineSource::new("unused", "unused"))
            .with_digest(sha256_str("alias"));
        model.new_snapshot("latest", Snapshot::new(sha256_str("alias"), vec![f]).unwrap()).unwrap();

        let report = store.collect_garbage().unwrap();
        assert!(report.removed_blobs.is_empty());
        assert!(real.exists());
        assert_eq!(report.kept_blobs, 2);
    }

    #[test]
    fn test_orphan_snapshot_dirs_removed() {
        let dir = TempDir::new().unwrap();
        let store = GlobalStore::open(dir.path()).unwrap();
        let model = store.model("hf", "acme", "tiny").unwrap();
        model.new_snapshot("latest", Snapshot::new(sha256_str("s"), vec![file("w")]).unwrap()).unwrap();
        fs::create_dir_all(model.snapshots_dir().join("sha256-stale")).unwrap();

        let report = store.collect_garbage().unwrap();
        assert_eq!(report.removed_snapshots, 1);
        assert!(model.snapshot_dir(&sha256_str("s")).exists());
    }
}
