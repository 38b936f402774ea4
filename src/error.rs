use thiserror::Error;

/// Main error type for depot
#[derive(Error, Debug)]
pub enum DepotError {
    #[error("Model '{reference}' not found on {backend}{}", status_suffix(.status))]
    NotFound {
        reference: String,
        backend: String,
        status: Option<u16>,
    },

    #[error("Digest mismatch for {subject}: expected {expected}, got {actual}\n\nTroubleshooting:\n- The download was corrupted or the registry served different content\n- Retry the pull; partial data for this file has been discarded")]
    DigestMismatch {
        subject: String,
        expected: String,
        actual: String,
    },

    #[error("Ambiguous split model: {0}\n\nTroubleshooting:\n- Split models must contain exactly one '-00001-of-' file\n- Check that every part 1..N is present exactly once")]
    AmbiguousSplitModel(String),

    #[error("Unsupported backend: {0}\n\nTroubleshooting:\n- Known prefixes: hf://, huggingface://, ollama://, ms://, modelscope://, oci://, docker://, http(s)://, file://\n- Check 'default' under [transport] in ~/.config/depot/config.toml")]
    UnsupportedBackend(String),

    #[error("Strategy unavailable: {0}\n\nTroubleshooting:\n- Native artifacts need podman >= 5.7.0 with 'podman artifact' enabled\n- Use --strategy auto to let depot pick a supported strategy")]
    StrategyUnavailable(String),

    #[error("Authentication failed for {registry}: {reason}\n\nTroubleshooting:\n- Log in to the registry with your container engine\n- For HuggingFace, check the token in $HF_HOME/token")]
    AuthenticationFailed { registry: String, reason: String },

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Pull of '{reference}' aborted at '{file}' (blobs kept for retry): {source}")]
    PartialPullAborted {
        reference: String,
        file: String,
        #[source]
        source: Box<DepotError>,
    },

    #[error("Transfer of {url} failed{}: {reason}", status_suffix(.status))]
    TransferFailed {
        url: String,
        status: Option<u16>,
        reason: String,
    },

    #[error("Invalid model reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("Container engine error: {0}\n\nTroubleshooting:\n- Is podman or docker installed and in PATH?\n- Set 'binary' under [engine] in config or pass --engine")]
    Engine(String),

    #[error("Config error: {0}\n\nTroubleshooting:\n- Check config file: ~/.config/depot/config.toml\n- Run with RUST_LOG=debug for more details")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl DepotError {
    /// True for "the registry has no such thing", as opposed to transient failures
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::TransferFailed { status, .. } => matches!(status, Some(404)),
            _ => false,
        }
    }

    /// HTTP status attached to the error, if any
    #[must_use]
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::NotFound { status, .. } | Self::TransferFailed { status, .. } => *status,
            Self::PartialPullAborted { source, .. } => source.http_status(),
            _ => None,
        }
    }

    pub(crate) fn transfer(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TransferFailed {
            url: url.into(),
            status: None,
            reason: reason.into(),
        }
    }

    pub(crate) fn http(url: impl Into<String>, status: reqwest::StatusCode) -> Self {
        Self::TransferFailed {
            url: url.into(),
            status: Some(status.as_u16()),
            reason: status
                .canonical_reason()
                .unwrap_or("unexpected status")
                .to_string(),
        }
    }
}

impl From<reqwest::Error> for DepotError {
    fn from(e: reqwest::Error) -> Self {
        Self::TransferFailed {
            url: e.url().map(ToString::to_string).unwrap_or_default(),
            status: e.status().map(|s| s.as_u16()),
            reason: e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DepotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        let nf = DepotError::NotFound {
            reference: "hf://acme/x".into(),
            backend: "huggingface".into(),
            status: Some(404),
        };
        assert!(nf.is_not_found());

        let http404 = DepotError::http("https://x/y", reqwest::StatusCode::NOT_FOUND);
        assert!(http404.is_not_found());
        assert_eq!(http404.http_status(), Some(404));

        let http500 = DepotError::http("https://x/y", reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!http500.is_not_found());
    }

    #[test]
    fn test_messages_carry_context() {
        let err = DepotError::NotFound {
            reference: "ollama://tiny:q4".into(),
            backend: "ollama".into(),
            status: Some(404),
        };
        let msg = err.to_string();
        assert!(msg.contains("ollama://tiny:q4"));
        assert!(msg.contains("HTTP 404"));

        let aborted = DepotError::PartialPullAborted {
            reference: "hf://a/b".into(),
            file: "model.gguf".into(),
            source: Box::new(DepotError::transfer("https://x", "connection reset")),
        };
        assert!(aborted.to_string().contains("model.gguf"));
        assert!(aborted.to_string().contains("connection reset"));
    }
}
