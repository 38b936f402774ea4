//! Content digests (`sha256:<hex>`) used as cache keys and integrity checks.

use crate::error::{DepotError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

pub const SHA256: &str = "sha256";

const BLOCK_SIZE: usize = 4096;

/// A parsed `algorithm:encoded` content digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: String,
    encoded: String,
}

impl Digest {
    /// Build a sha256 digest from raw hash output
    #[must_use]
    pub fn from_sha256(hash: &[u8]) -> Self {
        Self {
            algorithm: SHA256.to_string(),
            encoded: hash.iter().map(|b| format!("{b:02x}")).collect(),
        }
    }

    #[must_use]
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    #[must_use]
    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// Only sha256 digests are verified against content
    #[must_use]
    pub fn is_verifiable(&self) -> bool {
        self.algorithm == SHA256
    }

    /// Filesystem-safe name: `sha256-<hex>`
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}-{}", self.algorithm, self.encoded)
    }

    /// Parse a blob file name (`sha256-<hex>` or `sha256:<hex>`)
    pub fn from_file_name(name: &str) -> Result<Self> {
        let rest = name
            .strip_prefix("sha256:")
            .or_else(|| name.strip_prefix("sha256-"))
            .ok_or_else(|| unverifiable(name))?;
        if !is_sha256_hex(rest) {
            return Err(unverifiable(name));
        }
        Ok(Self {
            algorithm: SHA256.to_string(),
            encoded: rest.to_string(),
        })
    }
}

fn unverifiable(name: &str) -> DepotError {
    DepotError::Other(format!(
        "'{name}' does not carry a sha256:<64 hex chars> digest and cannot be verified"
    ))
}

fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn valid_algorithm(s: &str) -> bool {
    !s.is_empty()
        && s.split(['+', '.', '_', '-'])
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()))
}

fn valid_encoded(s: &str) -> bool {
    !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'=' | b'_' | b'-'))
}

impl FromStr for Digest {
    type Err = DepotError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| DepotError::InvalidManifest(format!("invalid digest '{s}': {reason}"));
        let (algorithm, encoded) = s.split_once(':').ok_or_else(|| invalid("missing ':'"))?;
        if !valid_algorithm(algorithm) {
            return Err(invalid("bad algorithm"));
        }
        if algorithm == SHA256 {
            if !is_sha256_hex(encoded) {
                return Err(invalid("sha256 needs 64 lowercase hex characters"));
            }
        } else if !valid_encoded(encoded) {
            return Err(invalid("bad encoding"));
        }
        Ok(Self {
            algorithm: algorithm.to_string(),
            encoded: encoded.to_string(),
        })
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental sha256 over streamed chunks
#[derive(Default, Clone)]
pub struct Hasher(Sha256);

impl Hasher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.0.update(chunk);
    }

    #[must_use]
    pub fn finish(self) -> Digest {
        Digest::from_sha256(&self.0.finalize())
    }

    /// Feed an entire reader through the hasher
    pub fn consume(&mut self, reader: &mut impl Read) -> Result<u64> {
        let mut buf = [0u8; BLOCK_SIZE];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                return Ok(total);
            }
            self.update(&buf[..n]);
            total += n as u64;
        }
    }
}

/// sha256 of a file's contents
pub fn sha256_file(path: &Path) -> Result<Digest> {
    let mut hasher = Hasher::new();
    hasher.consume(&mut File::open(path)?)?;
    Ok(hasher.finish())
}

#[must_use]
pub fn sha256_bytes(bytes: &[u8]) -> Digest {
    Digest::from_sha256(&Sha256::digest(bytes))
}

/// Derived hash for things that have no registry-native digest
#[must_use]
pub fn sha256_str(s: &str) -> Digest {
    sha256_bytes(s.as_bytes())
}

/// Check a cached file against the digest embedded in its own file name
pub fn verify_checksum(path: &Path) -> Result<bool> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| unverifiable(&path.display().to_string()))?;
    let expected = Digest::from_file_name(name)?;
    let actual = sha256_file(path)?;
    if actual != expected {
        tracing::debug!("Checksum mismatch for {}: got {actual}", path.display());
    }
    Ok(actual == expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_sha256_str() {
        assert_eq!(sha256_str("hello").to_string(), format!("sha256:{HELLO}"));
    }

    #[test]
    fn test_parse_and_display() {
        let d: Digest = format!("sha256:{HELLO}").parse().unwrap();
        assert_eq!(d.algorithm(), "sha256");
        assert_eq!(d.encoded(), HELLO);
        assert_eq!(d.file_name(), format!("sha256-{HELLO}"));
        assert!(d.is_verifiable());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("sha256:abc".parse::<Digest>().is_err());
        assert!(format!("sha256:{}", HELLO.to_uppercase()).parse::<Digest>().is_err());
        assert!(HELLO.parse::<Digest>().is_err());
        assert!(":abc".parse::<Digest>().is_err());
    }

    #[test]
    fn test_other_algorithms_accepted_but_unverifiable() {
        let d: Digest = "sha512:abcDEF012".parse().unwrap();
        assert!(!d.is_verifiable());
    }

    #[test]
    fn test_from_file_name() {
        assert!(Digest::from_file_name(&format!("sha256-{HELLO}")).is_ok());
        assert!(Digest::from_file_name(&format!("sha256:{HELLO}")).is_ok());
        assert!(Digest::from_file_name("model.gguf").is_err());
        assert!(Digest::from_file_name("sha256-1234").is_err());
    }

    #[test]
    fn test_verify_checksum() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join(format!("sha256-{HELLO}"));
        std::fs::write(&good, "hello").unwrap();
        assert!(verify_checksum(&good).unwrap());

        std::fs::write(&good, "tampered").unwrap();
        assert!(!verify_checksum(&good).unwrap());

        let unnamed = dir.path().join("weights.bin");
        std::fs::write(&unnamed, "hello").unwrap();
        assert!(verify_checksum(&unnamed).is_err());
    }

    #[test]
    fn test_serde_roundtrip_as_string() {
        let d = sha256_str("hello");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"sha256:{HELLO}\""));
    }
}
