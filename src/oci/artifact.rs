use crate::error::Result;
use crate::oci::client::{RegistryBlobSource, RegistryClient};
use crate::oci::reference::OciReference;
use crate::oci::spec::Manifest;
use crate::registry::split;
use crate::store::{FileKind, ModelStore, RefFile, Snapshot, SnapshotFile};
use std::rc::Rc;

/// One snapshot file per manifest layer, named by its file-path annotation
pub fn snapshot_files(client: &Rc<RegistryClient>, manifest: &Manifest) -> Result<Vec<SnapshotFile>> {
    manifest
        .layers
        .iter()
        .map(|layer| {
            let path = layer.filepath()?;
            let kind = FileKind::from_path(&path);
            Ok(SnapshotFile::new(
                path,
                kind,
                RegistryBlobSource::new(Rc::clone(client), layer.digest.clone()),
            )
            .with_digest(layer.digest.clone())
            .with_progress(kind == FileKind::Model))
        })
        .collect()
}

/// Pull a CNCF model artifact over HTTP into the store
pub fn pull_artifact(client: &Rc<RegistryClient>, store: &ModelStore, reference: &OciReference) -> Result<RefFile> {
    let tag = reference.specifier();
    let fetched = client.get_manifest(&tag)?;
    fetched.manifest.validate_model_artifact()?;

    let files = snapshot_files(client, &fetched.manifest)?;
    split::validate_parts(files.iter().map(SnapshotFile::name))?;

    tracing::info!(
        "Pulling {reference} ({} layers, manifest {})",
        files.len(),
        fetched.digest
    );
    store.new_snapshot(&tag, Snapshot::new(fetched.digest, files)?)
}
