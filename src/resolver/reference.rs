use crate::error::{DepotError, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

pub const DEFAULT_TAG: &str = "latest";

/// The closed set of backends a reference can resolve to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    HuggingFace,
    Ollama,
    ModelScope,
    Oci,
    Url,
}

/// Known prefixes, checked in order
const PREFIXES: &[(&str, Transport)] = &[
    ("huggingface://", Transport::HuggingFace),
    ("hf://", Transport::HuggingFace),
    ("hf.co/", Transport::HuggingFace),
    ("modelscope://", Transport::ModelScope),
    ("ms://", Transport::ModelScope),
    ("ollama://", Transport::Ollama),
    ("ollama.com/library/", Transport::Ollama),
    ("oci://", Transport::Oci),
    ("docker://", Transport::Oci),
    ("rlcr://", Transport::Oci),
    ("http://", Transport::Url),
    ("https://", Transport::Url),
    ("file://", Transport::Url),
];

/// Host fragments removed after the scheme
const HOST_FRAGMENTS: &[&str] = &["hf.co/", "huggingface.co/", "modelscope.cn/", "ollama.com/library/"];

impl Transport {
    /// Directory name of this backend inside the store
    #[must_use]
    pub fn namespace(self) -> &'static str {
        match self {
            Self::HuggingFace => "huggingface",
            Self::Ollama => "ollama",
            Self::ModelScope => "modelscope",
            Self::Oci => "oci",
            Self::Url => "url",
        }
    }

    /// Parse a configured default backend name
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "huggingface" | "hf" => Ok(Self::HuggingFace),
            "ollama" => Ok(Self::Ollama),
            "modelscope" | "ms" => Ok(Self::ModelScope),
            "oci" | "docker" | "rlcr" => Ok(Self::Oci),
            "url" | "http" | "https" | "file" => Ok(Self::Url),
            other => Err(DepotError::UnsupportedBackend(format!(
                "unknown transport '{other}'"
            ))),
        }
    }

    /// Backend named by an explicit prefix, if any
    #[must_use]
    pub fn detect(reference: &str) -> Option<Self> {
        PREFIXES
            .iter()
            .find(|(prefix, _)| reference.starts_with(prefix))
            .map(|(_, t)| *t)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

/// Scheme that a default transport name stands for when it is an alias for
/// a fixed registry rather than a backend of its own
#[must_use]
pub fn alias_scheme(name: &str) -> Option<&'static str> {
    match name.to_ascii_lowercase().as_str() {
        "rlcr" => Some("rlcr://"),
        _ => None,
    }
}

static IMPLICIT_DEFAULT_WARNED: AtomicBool = AtomicBool::new(false);

/// Warn (once per process) that a reference fell through to the default backend.
/// Returns whether the warning was emitted by this call.
pub fn warn_implicit_default(reference: &str, transport: Transport) -> bool {
    if IMPLICIT_DEFAULT_WARNED.swap(true, Ordering::SeqCst) {
        return false;
    }
    tracing::warn!(
        "'{reference}' has no transport prefix; using default transport '{transport}'. \
         Prefix the reference (e.g. {transport}://) to silence this warning"
    );
    true
}

/// Strip the scheme and any backend host fragment
#[must_use]
pub fn prune(reference: &str) -> &str {
    let rest = reference.split_once("://").map_or(reference, |(_, r)| r);
    HOST_FRAGMENTS
        .iter()
        .find_map(|h| rest.strip_prefix(h))
        .unwrap_or(rest)
}

/// A parsed model reference for a registry-style backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelReference {
    pub raw: String,
    pub transport: Transport,
    pub organization: String,
    pub name: String,
    pub tag: String,
    pub explicit_tag: bool,
}

impl ModelReference {
    /// Parse `reference`, using `default` when no prefix is recognized
    pub fn parse(reference: &str, default: Transport) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(DepotError::InvalidReference {
                reference: String::new(),
                reason: "empty reference".to_string(),
            });
        }

        let transport = match Transport::detect(reference) {
            Some(t) => t,
            None => {
                warn_implicit_default(reference, default);
                default
            }
        };
        Self::with_transport(reference, transport)
    }

    pub fn with_transport(reference: &str, transport: Transport) -> Result<Self> {
        let pruned = prune(reference).trim_end_matches('/');
        let invalid = |reason: &str| DepotError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        // URLs carry ports and query strings; the whole locator is the identity
        let (path, tag, explicit_tag) = if transport == Transport::Url {
            let path = pruned.split(['?', '#']).next().unwrap_or(pruned);
            (path.trim_start_matches('/'), DEFAULT_TAG.to_string(), false)
        } else {
            let last_slash = pruned.rfind('/').map_or(0, |i| i + 1);
            match pruned[last_slash..].rfind(':') {
                Some(i) => {
                    let split = last_slash + i;
                    let tag = &pruned[split + 1..];
                    if tag.is_empty() {
                        return Err(invalid("empty tag"));
                    }
                    (&pruned[..split], tag.to_string(), true)
                }
                None => (pruned, DEFAULT_TAG.to_string(), false),
            }
        };

        let (organization, name) = match path.rsplit_once('/') {
            Some((org, name)) => (org.to_string(), name.to_string()),
            None => (String::new(), path.to_string()),
        };
        if name.is_empty() {
            return Err(invalid("missing model name"));
        }

        Ok(Self {
            raw: reference.to_string(),
            transport,
            organization,
            name,
            tag,
            explicit_tag,
        })
    }

    /// True unless the caller explicitly asked for a non-default tag
    #[must_use]
    pub fn has_default_tag(&self) -> bool {
        self.tag == DEFAULT_TAG
    }

    /// `organization/name`, or just `name`
    #[must_use]
    pub fn repo(&self) -> String {
        if self.organization.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.organization, self.name)
        }
    }
}

impl fmt::Display for ModelReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
