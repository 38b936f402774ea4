use crate::digest::{sha256_file, sha256_str};
use crate::error::{DepotError, Result};
use crate::registry::RepoMetadata;
use crate::store::snapshot::LocalSource;
use crate::store::{FileKind, SnapshotFile};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// External downloader a backend can fall back to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliTool {
    HuggingFace,
    ModelScope,
}

impl CliTool {
    #[must_use]
    pub fn program(&self) -> &'static str {
        match self {
            Self::HuggingFace => "hf",
            Self::ModelScope => "modelscope",
        }
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        which::which(self.program()).is_ok()
    }

    /// Arguments to download `repo` into `dir`
    #[must_use]
    pub fn args(&self, repo: &str, dir: &Path) -> Vec<String> {
        let dir = dir.display().to_string();
        match self {
            Self::HuggingFace => vec!["download".into(), repo.into(), "--local-dir".into(), dir],
            Self::ModelScope => vec!["download".into(), "--local_dir".into(), dir, repo.into()],
        }
    }
}

/// Run `tool` to fetch `repo` into `dir`, then describe the result as a snapshot
pub fn download_and_import(tool: &CliTool, repo: &str, dir: &Path) -> Result<RepoMetadata> {
    fs::create_dir_all(dir)?;
    let args = tool.args(repo, dir);
    tracing::debug!("Running {} {}", tool.program(), args.join(" "));

    let status = Command::new(tool.program())
        .args(&args)
        .stdin(Stdio::null())
        .status()
        .map_err(|e| DepotError::Other(format!("Failed to run {}: {e}", tool.program())))?;
    if !status.success() {
        return Err(DepotError::Other(format!(
            "{} download {repo} exited with {status}",
            tool.program()
        )));
    }

    import_directory(dir)
}

/// Snapshot every regular file under `dir`, skipping hidden entries.
///
/// The snapshot hash is derived from the sorted `(name, digest)` list, so
/// importing the same content twice yields the same snapshot.
pub fn import_directory(dir: &Path) -> Result<RepoMetadata> {
    let mut paths = Vec::new();
    collect_files(dir, dir, &mut paths)?;
    paths.sort();

    let mut files = Vec::with_capacity(paths.len());
    let mut listing = String::new();
    let mut have_template = false;
    let mut have_mmproj = false;
    for (name, path) in paths {
        let digest = sha256_file(&path)?;
        listing.push_str(&format!("{name} {digest}\n"));

        let kind = match FileKind::from_path(&name) {
            FileKind::ChatTemplate if have_template => FileKind::Other,
            FileKind::Mmproj if have_mmproj => FileKind::Other,
            kind => kind,
        };
        have_template |= kind == FileKind::ChatTemplate;
        have_mmproj |= kind == FileKind::Mmproj;

        files.push(SnapshotFile::new(name, kind, LocalSource::new(path)).with_digest(digest));
    }

    if !files.iter().any(|f| f.kind() == FileKind::Model) {
        return Err(DepotError::InvalidManifest(format!(
            "no model weights found in {}",
            dir.display()
        )));
    }

    Ok(RepoMetadata {
        snapshot_hash: sha256_str(&listing),
        files,
    })
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        if file_name.to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            let name = path
                .strip_prefix(root)
                .map_err(|e| DepotError::Other(e.to_string()))?
                .to_string_lossy()
                .into_owned();
            out.push((name, path));
        }
    }
    Ok(())
}
