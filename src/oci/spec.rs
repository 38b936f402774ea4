//! OCI manifest and descriptor types, plus the CNCF model-artifact conventions.

use crate::digest::Digest;
use crate::error::{DepotError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const OCI_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_ARTIFACT_MANIFEST: &str = "application/vnd.oci.artifact.manifest.v1+json";
pub const OCI_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";

pub const CNAI_ARTIFACT_TYPE: &str = "application/vnd.cncf.model.manifest.v1+json";
pub const CNAI_CONFIG_MEDIA_TYPE: &str = "application/vnd.cncf.model.config.v1+json";

pub const ANNOTATION_FILEPATH: &str = "org.cncf.model.filepath";
pub const ANNOTATION_FILE_METADATA: &str = "org.cncf.model.file.metadata+json";
pub const ANNOTATION_MEDIATYPE_UNTESTED: &str = "org.cncf.model.file.mediatype.untested";
pub const ANNOTATION_TITLE: &str = "org.opencontainers.image.title";

const LAYER_KINDS: [&str; 5] = ["weight", "weight.config", "doc", "code", "dataset"];
const LAYER_FORMATS: [&str; 4] = ["raw", "tar", "tar+gzip", "tar+zstd"];

/// Manifest media types sent in `Accept`, most preferred first
pub const MANIFEST_ACCEPT: [&str; 3] = [OCI_ARTIFACT_MANIFEST, OCI_IMAGE_MANIFEST, DOCKER_MANIFEST_V2];

/// `application/vnd.cncf.model.<kind>.v1.<format>`
#[must_use]
pub fn is_model_layer_media_type(media_type: &str) -> bool {
    let Some(rest) = media_type.strip_prefix("application/vnd.cncf.model.") else {
        return false;
    };
    let Some((kind, format)) = rest.split_once(".v1.") else {
        return false;
    };
    LAYER_KINDS.contains(&kind) && LAYER_FORMATS.contains(&format)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Per-file metadata carried in the `org.cncf.model.file.metadata+json` annotation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMetadata {
    pub name: String,
    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mtime: String,
    #[serde(default)]
    pub typeflag: u8,
}

impl Descriptor {
    /// Decoded file metadata annotation, if present
    pub fn file_metadata(&self) -> Result<Option<FileMetadata>> {
        self.annotations
            .get(ANNOTATION_FILE_METADATA)
            .map(|raw| {
                serde_json::from_str(raw).map_err(|e| {
                    DepotError::InvalidManifest(format!("bad file metadata on {}: {e}", self.digest))
                })
            })
            .transpose()
    }

    /// Relative path this layer should be materialized at
    pub fn filepath(&self) -> Result<String> {
        if let Some(path) = self.annotations.get(ANNOTATION_FILEPATH) {
            return normalize_layer_filepath(path);
        }
        if let Some(meta) = self.file_metadata()? {
            return normalize_layer_filepath(&meta.name);
        }
        Err(DepotError::InvalidManifest(format!(
            "layer {} has no '{ANNOTATION_FILEPATH}' annotation",
            self.digest
        )))
    }

    #[must_use]
    pub fn media_type_untested(&self) -> bool {
        self.annotations
            .get(ANNOTATION_MEDIATYPE_UNTESTED)
            .is_some_and(|v| v == "true")
    }
}

/// Normalize a layer path, rejecting anything that could escape the target directory
pub fn normalize_layer_filepath(path: &str) -> Result<String> {
    let bad = |why: &str| DepotError::InvalidManifest(format!("layer path '{path}' {why}"));
    if path.is_empty() {
        return Err(bad("is empty"));
    }
    if path.starts_with('/') {
        return Err(bad("is absolute"));
    }
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(bad("escapes the model directory"));
                }
            }
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        return Err(bad("names no file"));
    }
    Ok(parts.join("/"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub artifact_type: Option<String>,
    #[serde(default)]
    pub config: Option<Descriptor>,
    #[serde(default, alias = "blobs")]
    pub layers: Vec<Descriptor>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl Manifest {
    /// Parse manifest bytes according to the content type the registry declared
    pub fn parse(bytes: &[u8], content_type: &str) -> Result<Self> {
        let content_type = content_type.split(';').next().unwrap_or("").trim();
        if content_type == OCI_IMAGE_INDEX {
            return Err(DepotError::InvalidManifest(
                "got an image index; a single-platform manifest is required".to_string(),
            ));
        }
        let known = MANIFEST_ACCEPT.contains(&content_type);
        if !known && !content_type.is_empty() && content_type != "application/json" {
            return Err(DepotError::InvalidManifest(format!(
                "unexpected manifest content type '{content_type}'"
            )));
        }

        let mut manifest: Self = serde_json::from_slice(bytes)
            .map_err(|e| DepotError::InvalidManifest(format!("malformed manifest: {e}")))?;
        if manifest.media_type.is_none() && known {
            manifest.media_type = Some(content_type.to_string());
        }
        Ok(manifest)
    }

    /// Every layer must be non-empty and carry an allowed media type
    pub fn validate_layers(&self, allowed: impl Fn(&str) -> bool) -> Result<()> {
        if self.layers.is_empty() {
            return Err(DepotError::InvalidManifest("manifest has no layers".to_string()));
        }
        for layer in &self.layers {
            if !allowed(&layer.media_type) {
                return Err(DepotError::InvalidManifest(format!(
                    "layer {} has unsupported media type '{}'",
                    layer.digest, layer.media_type
                )));
            }
        }
        Ok(())
    }

    /// Full check for a CNCF model artifact manifest
    pub fn validate_model_artifact(&self) -> Result<()> {
        if self.artifact_type.as_deref() != Some(CNAI_ARTIFACT_TYPE) {
            return Err(DepotError::InvalidManifest(format!(
                "artifactType must be '{CNAI_ARTIFACT_TYPE}', got {:?}",
                self.artifact_type
            )));
        }
        let media_type = self.media_type.as_deref().unwrap_or(OCI_IMAGE_MANIFEST);
        if media_type != OCI_IMAGE_MANIFEST {
            return Err(DepotError::InvalidManifest(format!(
                "mediaType must be '{OCI_IMAGE_MANIFEST}', got '{media_type}'"
            )));
        }
        match &self.config {
            Some(c) if c.media_type == CNAI_CONFIG_MEDIA_TYPE => {}
            Some(c) => {
                return Err(DepotError::InvalidManifest(format!(
                    "config mediaType must be '{CNAI_CONFIG_MEDIA_TYPE}', got '{}'",
                    c.media_type
                )))
            }
            None => return Err(DepotError::InvalidManifest("manifest has no config".to_string())),
        }
        self.validate_layers(is_model_layer_media_type)
    }

    /// Whether this manifest describes a model artifact rather than a container image
    #[must_use]
    pub fn is_cncf_artifact(&self) -> bool {
        self.artifact_type.as_deref() == Some(CNAI_ARTIFACT_TYPE)
            || self
                .config
                .as_ref()
                .is_some_and(|c| c.media_type == CNAI_CONFIG_MEDIA_TYPE)
            || self.layers.iter().any(|l| is_model_layer_media_type(&l.media_type))
    }
}
