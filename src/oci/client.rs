use crate::digest::{sha256_bytes, Digest};
use crate::error::{DepotError, Result};
use crate::oci::spec::{Manifest, MANIFEST_ACCEPT};
use crate::store::snapshot::BlobSource;
use crate::transfer::Transfer;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, RANGE, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Deserialize;
use std::cell::RefCell;
use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::rc::Rc;

const CONTENT_DIGEST: &str = "Docker-Content-Digest";

/// Parsed `WWW-Authenticate: Bearer realm=...,service=...,scope=...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

/// Parse a bearer challenge; `None` for other schemes or a missing realm
#[must_use]
pub fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let (scheme, params) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    let mut rest = params.trim();
    while !rest.is_empty() {
        let (key, after) = rest.split_once('=')?;
        let key = key.trim().trim_start_matches(',').trim();
        let after = after.trim_start();
        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            let end = quoted.find('"')?;
            (&quoted[..end], &quoted[end + 1..])
        } else {
            let end = after.find(',').unwrap_or(after.len());
            (after[..end].trim(), &after[end..])
        };
        match key.to_ascii_lowercase().as_str() {
            "realm" => realm = Some(value.to_string()),
            "service" => service = Some(value.to_string()),
            "scope" => scope = Some(value.to_string()),
            _ => {}
        }
        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }

    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}

/// Loopback registries are spoken to over plain HTTP, as container engines do
#[must_use]
pub fn registry_base_url(registry: &str) -> String {
    let host = registry
        .rsplit_once(':')
        .filter(|(_, port)| port.bytes().all(|b| b.is_ascii_digit()))
        .map_or(registry, |(host, _)| host);
    let scheme = match host {
        "localhost" | "127.0.0.1" | "[::1]" => "http",
        _ => "https",
    };
    format!("{scheme}://{registry}")
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// A manifest plus what the registry told us about it
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    pub manifest: Manifest,
    pub digest: Digest,
    pub content_type: String,
}

/// Read-only client for one repository on an OCI distribution registry.
///
/// Bearer tokens obtained from an auth challenge are cached for the life of
/// the instance; an expired token is replaced on the next 401.
pub struct RegistryClient {
    registry: String,
    repository: String,
    base_url: String,
    transfer: Transfer,
    token: RefCell<Option<String>>,
}

impl fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryClient")
            .field("registry", &self.registry)
            .field("repository", &self.repository)
            .field("base_url", &self.base_url)
            .field("token", &self.token.borrow().as_ref().map(|_| "***"))
            .finish_non_exhaustive()
    }
}

impl RegistryClient {
    #[must_use]
    pub fn new(transfer: Transfer, registry: &str, repository: &str) -> Self {
        let base_url = format!("{}/v2/{repository}", registry_base_url(registry));
        Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            base_url,
            transfer,
            token: RefCell::new(None),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &str {
        &self.registry
    }

    #[must_use]
    pub fn repository(&self) -> &str {
        &self.repository
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn http(&self) -> &Client {
        self.transfer.client()
    }

    #[must_use]
    pub fn blob_url(&self, digest: &Digest) -> String {
        format!("{}/blobs/{digest}", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token.borrow().as_deref() {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    fn auth_failed(&self, reason: impl Into<String>) -> DepotError {
        DepotError::AuthenticationFailed {
            registry: self.registry.clone(),
            reason: reason.into(),
        }
    }

    /// Send a request, answering one bearer challenge if the registry issues it
    fn send(&self, build: impl Fn(&Client) -> RequestBuilder) -> Result<Response> {
        let response = self.authorize(build(self.http())).send()?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer_challenge)
            .ok_or_else(|| self.auth_failed("401 without a bearer challenge"))?;

        let token = self.fetch_token(&challenge)?;
        *self.token.borrow_mut() = Some(token);

        let retry = self.authorize(build(self.http())).send()?;
        if retry.status() == StatusCode::UNAUTHORIZED {
            *self.token.borrow_mut() = None;
            return Err(self.auth_failed("registry rejected the bearer token"));
        }
        Ok(retry)
    }

    fn fetch_token(&self, challenge: &BearerChallenge) -> Result<String> {
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", self.repository));
        let mut query = vec![("scope", scope)];
        if let Some(service) = &challenge.service {
            query.push(("service", service.clone()));
        }

        tracing::debug!("Requesting registry token from {}", challenge.realm);
        let response = self
            .http()
            .get(&challenge.realm)
            .query(&query)
            .send()
            .map_err(|e| self.auth_failed(format!("token request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(self.auth_failed(format!("token endpoint answered {}", response.status())));
        }

        let body: TokenResponse = response
            .json()
            .map_err(|e| self.auth_failed(format!("unreadable token response: {e}")))?;
        body.token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| self.auth_failed("token response carried no token"))
    }

    /// Fetch a manifest, offering the OCI artifact, OCI image and Docker v2 types
    pub fn get_manifest(&self, reference: &str) -> Result<FetchedManifest> {
        self.get_manifest_accepting(reference, &MANIFEST_ACCEPT)
    }

    pub fn get_manifest_accepting(&self, reference: &str, accept: &[&str]) -> Result<FetchedManifest> {
        let url = format!("{}/manifests/{reference}", self.base_url);
        let accept = accept.join(", ");
        let response = self.send(|c| c.get(&url).header(ACCEPT, accept.as_str()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(DepotError::NotFound {
                reference: format!("{}/{}:{reference}", self.registry, self.repository),
                backend: "oci".to_string(),
                status: Some(status.as_u16()),
            });
        }
        if !status.is_success() {
            return Err(DepotError::http(url, status));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let advertised = response
            .headers()
            .get(CONTENT_DIGEST)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<Digest>().ok());
        let bytes = response.bytes()?;

        let digest = advertised.unwrap_or_else(|| sha256_bytes(&bytes));
        let manifest = Manifest::parse(&bytes, &content_type)?;
        tracing::debug!("Fetched manifest {digest} ({content_type}) from {url}");

        Ok(FetchedManifest {
            manifest,
            digest,
            content_type,
        })
    }

    /// Stream a blob to `dest`, verifying its sha256 digest
    pub fn download_blob(&self, digest: &Digest, dest: &Path, show_progress: bool) -> Result<u64> {
        let url = self.blob_url(digest);
        let written = self.transfer.download(&url, dest, show_progress, Some(digest), |offset| {
            self.send(|c| {
                let request = c.get(&url);
                match offset {
                    Some(offset) => request.header(RANGE, format!("bytes={offset}-")),
                    None => request,
                }
            })
        })?;
        fs::set_permissions(dest, fs::Permissions::from_mode(0o644))?;
        Ok(written)
    }
}

/// A blob on a registry, fetched through a shared client
#[derive(Debug)]
pub struct RegistryBlobSource {
    client: Rc<RegistryClient>,
    digest: Digest,
}

impl RegistryBlobSource {
    #[must_use]
    pub fn new(client: Rc<RegistryClient>, digest: Digest) -> Self {
        Self { client, digest }
    }
}

impl BlobSource for RegistryBlobSource {
    fn fetch(&self, dest: &Path, _expected: Option<&Digest>, show_progress: bool) -> Result<u64> {
        self.client.download_blob(&self.digest, dest, show_progress)
    }

    fn locator(&self) -> String {
        self.client.blob_url(&self.digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_challenge() {
        let c = parse_bearer_challenge(
            r#"Bearer realm="https://auth.example.io/token",service="registry.example.io",scope="repository:team/llm:pull""#,
        )
        .unwrap();
        assert_eq!(c.realm, "https://auth.example.io/token");
        assert_eq!(c.service.as_deref(), Some("registry.example.io"));
        assert_eq!(c.scope.as_deref(), Some("repository:team/llm:pull"));
    }

    #[test]
    fn test_parse_bearer_challenge_minimal() {
        let c = parse_bearer_challenge(r#"bearer realm="https://auth/token""#).unwrap();
        assert!(c.service.is_none());
        assert!(c.scope.is_none());
    }

    #[test]
    fn test_parse_bearer_challenge_scope_with_commas() {
        let c = parse_bearer_challenge(
            r#"Bearer realm="https://a/t", scope="repository:x:pull,push", service=reg"#,
        )
        .unwrap();
        assert_eq!(c.scope.as_deref(), Some("repository:x:pull,push"));
        assert_eq!(c.service.as_deref(), Some("reg"));
    }

    #[test]
    fn test_non_bearer_challenge_ignored() {
        assert!(parse_bearer_challenge(r#"Basic realm="registry""#).is_none());
        assert!(parse_bearer_challenge(r#"Bearer service="x""#).is_none());
    }

    #[test]
    fn test_registry_base_url() {
        assert_eq!(registry_base_url("quay.io"), "https://quay.io");
        assert_eq!(registry_base_url("localhost:5000"), "http://localhost:5000");
        assert_eq!(registry_base_url("127.0.0.1:8080"), "http://127.0.0.1:8080");
        assert_eq!(registry_base_url("registry.example.org:443"), "https://registry.example.org:443");
    }

    #[test]
    fn test_debug_hides_token() {
        let transfer = Transfer::new(Client::new(), std::time::Duration::from_millis(100));
        let client = RegistryClient::new(transfer, "quay.io", "team/llm");
        *client.token.borrow_mut() = Some("secret-token".into());
        let dbg = format!("{client:?}");
        assert!(!dbg.contains("secret-token"));
        assert!(dbg.contains("***"));
    }
}
