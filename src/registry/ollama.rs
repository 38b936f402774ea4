use crate::context::Context;
use crate::error::Result;
use crate::oci::client::{RegistryBlobSource, RegistryClient};
use crate::oci::spec::{Descriptor, DOCKER_MANIFEST_V2};
use crate::registry::{not_found, RepoMetadata, Repository};
use crate::resolver::reference::ModelReference;
use crate::store::snapshot::LocalSource;
use crate::store::{FileKind, SnapshotFile};
use crate::transfer::Transfer;
use std::path::PathBuf;
use std::rc::Rc;

const LAYER_PREFIX: &str = "application/vnd.ollama.image.";
const LAYER_KINDS: [&str; 8] = [
    "model", "template", "projector", "params", "license", "system", "adapter", "messages",
];

/// Ollama-specific layer media types
#[must_use]
pub fn is_ollama_layer(media_type: &str) -> bool {
    media_type
        .strip_prefix(LAYER_PREFIX)
        .is_some_and(|kind| LAYER_KINDS.contains(&kind))
}

/// Client for the Ollama registry, which speaks the Docker v2 distribution API
#[derive(Debug)]
pub struct OllamaClient {
    transfer: Transfer,
    registry: String,
    models_dir: Option<PathBuf>,
    show_progress: bool,
}

impl OllamaClient {
    #[must_use]
    pub fn new(transfer: Transfer, registry: &str, models_dir: Option<PathBuf>, show_progress: bool) -> Self {
        Self {
            transfer,
            registry: registry.to_string(),
            models_dir,
            show_progress,
        }
    }

    #[must_use]
    pub fn from_context(ctx: &Context) -> Self {
        let network = &ctx.config().network;
        Self::new(
            ctx.transfer().clone(),
            &network.ollama_registry,
            network.ollama_models_dir.clone(),
            ctx.show_progress(),
        )
    }

    /// Repository path on the registry; bare names live under `library/`
    #[must_use]
    pub fn repository(reference: &ModelReference) -> String {
        if reference.organization.is_empty() {
            format!("library/{}", reference.name)
        } else {
            reference.repo()
        }
    }

    /// Link from the local Ollama cache when it already holds the blob
    fn snapshot_file(&self, client: &Rc<RegistryClient>, name: String, kind: FileKind, layer: &Descriptor) -> SnapshotFile {
        let cached = self
            .models_dir
            .as_ref()
            .map(|dir| dir.join("blobs").join(layer.digest.file_name()))
            .filter(|p| p.is_file());

        let file = match cached {
            Some(path) => {
                tracing::debug!("Reusing Ollama blob {}", path.display());
                SnapshotFile::new(name, kind, LocalSource::new(path))
            }
            None => SnapshotFile::new(
                name,
                kind,
                RegistryBlobSource::new(Rc::clone(client), layer.digest.clone()),
            )
            .with_progress(self.show_progress && kind == FileKind::Model),
        };
        file.with_digest(layer.digest.clone())
    }
}

impl Repository for OllamaClient {
    fn fetch_metadata(&self, reference: &ModelReference) -> Result<RepoMetadata> {
        let client = Rc::new(RegistryClient::new(
            self.transfer.clone(),
            &self.registry,
            &Self::repository(reference),
        ));

        let fetched = client
            .get_manifest_accepting(&reference.tag, &[DOCKER_MANIFEST_V2])
            .map_err(|e| if e.is_not_found() { not_found(reference, e.http_status()) } else { e })?;
        let manifest = fetched.manifest;
        manifest.validate_layers(is_ollama_layer)?;

        let mut files = Vec::new();
        if let Some(config) = &manifest.config {
            files.push(self.snapshot_file(&client, "config.json".to_string(), FileKind::Other, config));
        }

        let models: Vec<&Descriptor> = manifest
            .layers
            .iter()
            .filter(|l| l.media_type == format!("{LAYER_PREFIX}model"))
            .collect();
        let total = models.len();
        for (i, layer) in models.into_iter().enumerate() {
            let name = if total == 1 {
                format!("{}.gguf", reference.name)
            } else {
                format!("{}-{:05}-of-{total:05}.gguf", reference.name, i + 1)
            };
            files.push(self.snapshot_file(&client, name, FileKind::Model, layer));
        }
        if total == 0 {
            return Err(not_found(reference, None));
        }

        for layer in &manifest.layers {
            let kind = layer.media_type.strip_prefix(LAYER_PREFIX).unwrap_or_default();
            let (name, file_kind, required) = match kind {
                "model" => continue,
                "template" => ("chat_template".to_string(), FileKind::ChatTemplate, true),
                "projector" => (format!("mmproj-{}.gguf", reference.name), FileKind::Mmproj, true),
                "adapter" => (format!("adapter-{}.gguf", layer.digest.encoded()), FileKind::Other, true),
                "params" => ("params.json".to_string(), FileKind::Other, false),
                "messages" => ("messages.json".to_string(), FileKind::Other, false),
                other => (other.to_string(), FileKind::Other, false),
            };
            if files.iter().any(|f| f.name() == name) {
                tracing::debug!("Ignoring extra {kind} layer {}", layer.digest);
                continue;
            }
            let file = self.snapshot_file(&client, name, file_kind, layer);
            files.push(if required { file } else { file.optional() });
        }

        Ok(RepoMetadata {
            snapshot_hash: fetched.digest,
            files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::reference::Transport;

    #[test]
    fn test_layer_allow_list() {
        assert!(is_ollama_layer("application/vnd.ollama.image.model"));
        assert!(is_ollama_layer("application/vnd.ollama.image.projector"));
        assert!(!is_ollama_layer("application/vnd.ollama.image.unknown"));
        assert!(!is_ollama_layer("application/vnd.oci.image.layer.v1.tar"));
    }

    #[test]
    fn test_repository_defaults_to_library() {
        let bare = ModelReference::parse("ollama://smollm:135m", Transport::Ollama).unwrap();
        assert_eq!(OllamaClient::repository(&bare), "library/smollm");
        let user = ModelReference::parse("ollama://someone/custom", Transport::Ollama).unwrap();
        assert_eq!(OllamaClient::repository(&user), "someone/custom");
    }
}
