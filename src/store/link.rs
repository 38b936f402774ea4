//! Local-file materialization: hardlink, then symlink, then copy.
//!
//! Snapshot entries use a different order: a symlink relative to the
//! snapshot directory first, so the store can be moved as a whole.

use crate::error::{DepotError, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMethod {
    Hardlink,
    Symlink,
    RelativeSymlink,
    Copy,
}

impl LinkMethod {
    const LOCAL_ORDER: [Self; 3] = [Self::Hardlink, Self::Symlink, Self::Copy];
    const SNAPSHOT_ORDER: [Self; 3] = [Self::RelativeSymlink, Self::Hardlink, Self::Copy];

    /// `src` is canonical; `base` is the canonical parent of `dst`
    fn apply(self, src: &Path, dst: &Path, base: &Path) -> std::io::Result<()> {
        match self {
            Self::Hardlink => fs::hard_link(src, dst),
            Self::Symlink => std::os::unix::fs::symlink(src, dst),
            Self::RelativeSymlink => std::os::unix::fs::symlink(relative_path(src, base), dst),
            Self::Copy => fs::copy(src, dst).map(|_| ()),
        }
    }
}

/// Path of `target` as seen from directory `base`; both must be absolute
fn relative_path(target: &Path, base: &Path) -> PathBuf {
    let target: Vec<Component> = target.components().collect();
    let base: Vec<Component> = base.components().collect();
    let common = target.iter().zip(&base).take_while(|(a, b)| a == b).count();

    let mut rel = PathBuf::new();
    for _ in common..base.len() {
        rel.push("..");
    }
    for part in &target[common..] {
        rel.push(part.as_os_str());
    }
    rel
}

/// Why one method was passed over
#[derive(Debug, Clone)]
pub struct LinkFailure {
    pub method: LinkMethod,
    pub reason: String,
}

/// Outcome of a successful materialization
#[derive(Debug, Clone)]
pub struct Linked {
    pub method: LinkMethod,
    /// Methods tried before the one that succeeded
    pub failures: Vec<LinkFailure>,
}

/// Make `dst` refer to the contents of `src`.
///
/// The symlink variant always points at the canonical absolute path of `src`.
/// `dst` must not exist yet.
pub fn link_or_copy(src: &Path, dst: &Path) -> Result<Linked> {
    link_in_order(&LinkMethod::LOCAL_ORDER, src, dst)
}

fn link_in_order(order: &[LinkMethod], src: &Path, dst: &Path) -> Result<Linked> {
    let src = fs::canonicalize(src)?;
    let base = match dst.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent)?;
            fs::canonicalize(parent)?
        }
        _ => std::env::current_dir()?,
    };

    let mut failures: Vec<LinkFailure> = Vec::new();
    for &method in order {
        match method.apply(&src, dst, &base) {
            Ok(()) => {
                for f in &failures {
                    tracing::debug!("{:?} of {} failed: {}", f.method, src.display(), f.reason);
                }
                return Ok(Linked { method, failures });
            }
            Err(e) => failures.push(LinkFailure {
                method,
                reason: e.to_string(),
            }),
        }
    }

    let chain = failures
        .iter()
        .map(|f| format!("{:?}: {}", f.method, f.reason))
        .collect::<Vec<_>>()
        .join("; ");
    Err(DepotError::Other(format!(
        "Could not materialize {} at {} ({chain})",
        src.display(),
        dst.display()
    )))
}

/// Replace whatever is at `dst` with a snapshot entry for the blob `src`:
/// a relative symlink, else a hardlink, else a copy
pub fn relink(src: &Path, dst: &Path) -> Result<Linked> {
    if dst.symlink_metadata().is_ok() {
        fs::remove_file(dst)?;
    }
    link_in_order(&LinkMethod::SNAPSHOT_ORDER, src, dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_hardlink_preferred() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.gguf");
        fs::write(&src, "weights").unwrap();
        let dst = dir.path().join("blobs/sha256-x");

        let linked = link_or_copy(&src, &dst).unwrap();
        assert_eq!(linked.method, LinkMethod::Hardlink);
        assert!(linked.failures.is_empty());
        assert_eq!(fs::read_to_string(&dst).unwrap(), "weights");
    }

    #[test]
    fn test_failures_are_retained() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.gguf");
        fs::write(&src, "weights").unwrap();
        let dst = dir.path().join("taken");
        fs::create_dir(&dst).unwrap();

        let err = link_or_copy(&src, &dst).unwrap_err().to_string();
        assert!(err.contains("Hardlink"));
        assert!(err.contains("Symlink"));
    }

    #[test]
    fn test_relink_replaces_existing() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        fs::write(&src, "new").unwrap();
        let dst = dir.path().join("dst");
        fs::write(&dst, "old").unwrap();

        relink(&src, &dst).unwrap();
        assert_eq!(fs::read_to_string(&dst).unwrap(), "new");
    }

    #[test]
    fn test_snapshot_entry_is_relative_symlink() {
        let dir = TempDir::new().unwrap();
        let blob = dir.path().join("blobs/sha256-abc");
        fs::create_dir_all(blob.parent().unwrap()).unwrap();
        fs::write(&blob, "weights").unwrap();
        let entry = dir.path().join("models/hf/acme/tiny/snapshots/sha256-s/tiny.gguf");

        let linked = relink(&blob, &entry).unwrap();
        assert_eq!(linked.method, LinkMethod::RelativeSymlink);
        assert_eq!(
            fs::read_link(&entry).unwrap(),
            Path::new("../../../../../../blobs/sha256-abc")
        );
        assert_eq!(fs::read_to_string(&entry).unwrap(), "weights");

        // Still resolves after the whole store moves
        let moved = TempDir::new().unwrap();
        let root = moved.path().join("store");
        fs::rename(dir.path(), &root).unwrap();
        let entry = root.join("models/hf/acme/tiny/snapshots/sha256-s/tiny.gguf");
        assert_eq!(fs::read_to_string(entry).unwrap(), "weights");
    }

    #[test]
    fn test_relative_path_between_siblings() {
        assert_eq!(relative_path(Path::new("/s/blobs/b"), Path::new("/s/models/x")), Path::new("../../blobs/b"));
        assert_eq!(relative_path(Path::new("/s/b"), Path::new("/s")), Path::new("b"));
    }

    #[test]
    fn test_missing_source_fails() {
        let dir = TempDir::new().unwrap();
        assert!(link_or_copy(&dir.path().join("nope"), &dir.path().join("dst")).is_err());
    }
}
