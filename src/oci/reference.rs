use crate::digest::Digest;
use crate::error::{DepotError, Result};
use crate::store::{GlobalStore, ModelStore};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_TAG: &str = "latest";

/// `rlcr://<model>` is shorthand for a model image under this namespace
pub const RLCR_NAMESPACE: &str = "rlcr.io/ramalama";

/// `registry/repository[:tag][@digest]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OciReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<Digest>,
}

impl OciReference {
    /// What to ask the registry for: the digest if pinned, else the tag, else `latest`
    #[must_use]
    pub fn specifier(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(d), _) => d.to_string(),
            (None, Some(t)) => t.clone(),
            (None, None) => DEFAULT_TAG.to_string(),
        }
    }

    /// Fully qualified name handed to container engines; a digest wins over the tag
    #[must_use]
    pub fn canonical(&self) -> String {
        match &self.digest {
            Some(d) => format!("{}/{}@{d}", self.registry, self.repository),
            None => format!("{}/{}:{}", self.registry, self.repository, self.specifier()),
        }
    }

    /// Registries that can be classified by fetching their manifest
    #[must_use]
    pub fn looks_like_host(&self) -> bool {
        self.registry.contains('.') || self.registry.contains(':') || self.registry == "localhost"
    }

    /// Store slice: backend `oci`, organization `registry/namespace`, name = last path segment
    pub fn model_store(&self, store: &GlobalStore) -> Result<ModelStore> {
        let (namespace, name) = match self.repository.rsplit_once('/') {
            Some((ns, name)) => (format!("{}/{ns}", self.registry), name),
            None => (self.registry.clone(), self.repository.as_str()),
        };
        store.model("oci", &namespace.replace(':', "_"), name)
    }
}

impl FromStr for OciReference {
    type Err = DepotError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| DepotError::InvalidReference {
            reference: s.to_string(),
            reason: reason.to_string(),
        };
        if let Some(model) = s.strip_prefix("rlcr://") {
            return format!("{RLCR_NAMESPACE}/{model}").parse();
        }
        let stripped = s
            .strip_prefix("oci://")
            .or_else(|| s.strip_prefix("docker://"))
            .unwrap_or(s);

        let (name, digest) = match stripped.split_once('@') {
            Some((name, digest)) => (name, Some(digest.parse::<Digest>()?)),
            None => (stripped, None),
        };

        let (registry, path) = name
            .split_once('/')
            .ok_or_else(|| invalid("expected registry/repository"))?;

        // A ':' after the last '/' starts the tag; one before it is a registry port
        let last_slash = path.rfind('/').map_or(0, |i| i + 1);
        let (repository, tag) = match path[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&path[..split], Some(path[split + 1..].to_string()))
            }
            None => (path, None),
        };

        if registry.is_empty() || repository.is_empty() || repository.ends_with('/') {
            return Err(invalid("registry and repository must not be empty"));
        }
        if tag.as_deref() == Some("") {
            return Err(invalid("empty tag"));
        }

        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag,
            digest,
        })
    }
}

impl fmt::Display for OciReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_tagged() {
        let r: OciReference = "oci://registry.example.org/team/llm:v2".parse().unwrap();
        assert_eq!(r.registry, "registry.example.org");
        assert_eq!(r.repository, "team/llm");
        assert_eq!(r.tag.as_deref(), Some("v2"));
        assert_eq!(r.specifier(), "v2");
        assert_eq!(r.to_string(), "registry.example.org/team/llm:v2");
    }

    #[test]
    fn test_parse_default_tag_and_port() {
        let r: OciReference = "localhost:5000/models/tiny".parse().unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "models/tiny");
        assert!(r.tag.is_none());
        assert_eq!(r.specifier(), "latest");
        assert_eq!(r.canonical(), "localhost:5000/models/tiny:latest");
        assert!(r.looks_like_host());
    }

    #[test]
    fn test_rlcr_shorthand() {
        let r: OciReference = "rlcr://granite:2b".parse().unwrap();
        assert_eq!(r.registry, "rlcr.io");
        assert_eq!(r.repository, "ramalama/granite");
        assert_eq!(r.canonical(), "rlcr.io/ramalama/granite:2b");
    }

    #[test]
    fn test_parse_digest() {
        let digest = crate::digest::sha256_str("m");
        let r: OciReference = format!("quay.io/a/b:v1@{digest}").parse().unwrap();
        assert_eq!(r.tag.as_deref(), Some("v1"));
        assert_eq!(r.specifier(), digest.to_string());
    }

    #[test]
    fn test_parse_rejects_bare_name() {
        assert!("llm".parse::<OciReference>().is_err());
        assert!("quay.io/".parse::<OciReference>().is_err());
        assert!("quay.io/a:".parse::<OciReference>().is_err());
    }

    #[test]
    fn test_host_detection() {
        let r: OciReference = "library/llm".parse().unwrap();
        assert!(!r.looks_like_host());
        let r: OciReference = "localhost/llm".parse().unwrap();
        assert!(r.looks_like_host());
    }

    #[test]
    fn test_model_store_location() {
        let dir = TempDir::new().unwrap();
        let store = GlobalStore::new(dir.path());
        let r: OciReference = "localhost:5000/team/llm:v2".parse().unwrap();
        let m = r.model_store(&store).unwrap();
        assert_eq!(m.organization(), "localhost_5000/team");
        assert_eq!(m.name(), "llm");
    }
}
