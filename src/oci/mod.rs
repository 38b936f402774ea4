//! OCI distribution protocol: references, manifests, and a read-only registry client.

pub mod artifact;
pub mod client;
pub mod reference;
pub mod spec;

pub use client::{FetchedManifest, RegistryBlobSource, RegistryClient};
pub use reference::OciReference;
pub use spec::{Descriptor, Manifest};
