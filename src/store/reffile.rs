use crate::digest::Digest;
use crate::error::{DepotError, Result};
use crate::registry::split;
use crate::store::snapshot::FileKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const REF_FILE_VERSION: &str = "v1";

/// One file owned by a ref, by content hash
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefEntry {
    pub name: String,
    pub hash: Digest,
    #[serde(rename = "type")]
    pub kind: FileKind,
}

/// On-disk pointer from a tag to its current snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefFile {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(rename = "hash")]
    pub snapshot_hash: Digest,
    #[serde(default)]
    pub pulled_at: String,
    pub files: Vec<RefEntry>,
}

fn default_version() -> String {
    REF_FILE_VERSION.to_string()
}

impl RefFile {
    #[must_use]
    pub fn new(snapshot_hash: Digest, files: Vec<RefEntry>) -> Self {
        Self {
            version: default_version(),
            snapshot_hash,
            pulled_at: chrono::Utc::now().to_rfc3339(),
            files,
        }
    }

    /// Load a ref file; `Ok(None)` when the tag has never been pulled
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&content).map(Some).map_err(|e| {
            DepotError::Other(format!("Failed to parse ref file {}: {e}", path.display()))
        })
    }

    /// Save ref file atomically (tmp + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, path)?;

        Ok(())
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<&RefEntry> {
        self.files.iter().find(|f| f.name == name)
    }

    pub fn model_files(&self) -> impl Iterator<Item = &RefEntry> {
        self.files.iter().filter(|f| f.kind == FileKind::Model)
    }

    /// The file an inference engine should load.
    ///
    /// For split models this is the single part-1 file; otherwise the first model file.
    pub fn entry_model(&self) -> Result<Option<&RefEntry>> {
        let models: Vec<&RefEntry> = self.model_files().collect();
        if models.iter().any(|f| split::SplitName::parse(&f.name).is_some()) {
            let firsts: Vec<&&RefEntry> = models
                .iter()
                .filter(|f| split::SplitName::parse(&f.name).is_some_and(|s| s.index == 1))
                .collect();
            return match firsts.as_slice() {
                [only] => Ok(Some(**only)),
                [] => Err(DepotError::AmbiguousSplitModel(format!(
                    "snapshot {} has no part-1 file",
                    self.snapshot_hash
                ))),
                many => Err(DepotError::AmbiguousSplitModel(format!(
                    "snapshot {} has {} part-1 files",
                    self.snapshot_hash,
                    many.len()
                ))),
            };
        }
        Ok(models.first().copied())
    }

    #[must_use]
    pub fn mmproj(&self) -> Option<&RefEntry> {
        self.files.iter().find(|f| f.kind == FileKind::Mmproj)
    }

    #[must_use]
    pub fn chat_template(&self) -> Option<&RefEntry> {
        self.files.iter().rev().find(|f| f.kind == FileKind::ChatTemplate)
    }
}
