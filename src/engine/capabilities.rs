use crate::engine::strategy::StrategyKind;
use crate::engine::{Engine, EngineKind};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Oldest podman whose `artifact` objects can be mounted into containers
pub const MIN_ARTIFACT_VERSION: Version = Version::new(5, 7, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// First dotted version in `text`, e.g. `podman version 5.7.1` or
    /// `Docker version 27.3.1, build ce12230`. Suffixes like `-dev` are ignored.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let token = text
            .split_whitespace()
            .map(|t| t.trim_end_matches(',').trim_start_matches('v'))
            .find(|t| t.starts_with(|c: char| c.is_ascii_digit()) && t.contains('.'))?;

        let mut numbers = token.split('.').map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<u32>().ok()
        });
        let major = numbers.next().flatten()?;
        let minor = numbers.next().flatten().unwrap_or(0);
        let patch = numbers.next().flatten().unwrap_or(0);
        Some(Self::new(major, minor, patch))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// What the configured engine can do, most preferred strategy first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactCapabilities {
    pub engine_kind: Option<EngineKind>,
    pub engine_version: Option<Version>,
    pub artifact_objects_supported: bool,
    pub strategy_order: Vec<StrategyKind>,
}

impl ArtifactCapabilities {
    #[must_use]
    pub fn new(engine_kind: Option<EngineKind>, engine_version: Option<Version>, artifact_objects_supported: bool) -> Self {
        let images = engine_kind.is_some_and(EngineKind::supports_native_images);
        let strategy_order = match (artifact_objects_supported, images) {
            (true, _) => vec![StrategyKind::NativeArtifact, StrategyKind::NativeImage, StrategyKind::Http],
            (false, true) => vec![StrategyKind::NativeImage, StrategyKind::Http],
            (false, false) => vec![StrategyKind::Http],
        };
        Self {
            engine_kind,
            engine_version,
            artifact_objects_supported,
            strategy_order,
        }
    }

    /// No container engine at all: only the HTTP strategy is possible
    #[must_use]
    pub fn without_engine() -> Self {
        Self::new(None, None, false)
    }

    #[must_use]
    pub fn supports(&self, kind: StrategyKind) -> bool {
        self.strategy_order.contains(&kind)
    }

    #[must_use]
    pub fn preferred(&self) -> StrategyKind {
        self.strategy_order.first().copied().unwrap_or(StrategyKind::Http)
    }
}

/// Probe an engine. Artifact support needs podman at or above
/// [`MIN_ARTIFACT_VERSION`] *and* a working `artifact ls`, since builds can
/// disable the feature.
#[must_use]
pub fn detect(engine: &Engine) -> ArtifactCapabilities {
    let kind = engine.kind();
    if kind == EngineKind::Other {
        tracing::debug!("{} is not a known container engine", engine.binary().display());
        return ArtifactCapabilities::new(Some(kind), None, false);
    }

    let version = match engine.run(&["--version"]) {
        Ok(output) if output.success => Version::parse(&output.stdout),
        Ok(output) => {
            tracing::debug!("{} --version failed: {}", engine.binary().display(), output.stderr.trim());
            None
        }
        Err(e) => {
            tracing::debug!("{e}");
            None
        }
    };

    let artifacts = kind == EngineKind::Podman
        && version.is_some_and(|v| v >= MIN_ARTIFACT_VERSION)
        && engine.succeeds(&["artifact", "ls"]);

    let caps = ArtifactCapabilities::new(Some(kind), version, artifacts);
    tracing::debug!(
        "Engine {} ({kind:?} {}): strategies {:?}",
        engine.binary().display(),
        version.map_or_else(|| "unknown version".to_string(), |v| v.to_string()),
        caps.strategy_order
    );
    caps
}

/// Memoizes [`detect`] per engine binary for the life of the probe
#[derive(Debug, Default)]
pub struct CapabilityProbe {
    cache: RefCell<HashMap<PathBuf, ArtifactCapabilities>>,
}

impl CapabilityProbe {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn probe(&self, engine: &Engine) -> ArtifactCapabilities {
        if let Some(caps) = self.cache.borrow().get(engine.binary()) {
            return caps.clone();
        }
        let caps = detect(engine);
        self.cache
            .borrow_mut()
            .insert(engine.binary().to_path_buf(), caps.clone());
        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::ScriptedRunner;
    use std::rc::Rc;

    #[test]
    fn test_version_parse() {
        assert_eq!(Version::parse("podman version 5.7.1"), Some(Version::new(5, 7, 1)));
        assert_eq!(
            Version::parse("Docker version 27.3.1, build ce12230"),
            Some(Version::new(27, 3, 1))
        );
        assert_eq!(Version::parse("podman version 5.8.0-dev"), Some(Version::new(5, 8, 0)));
        assert_eq!(Version::parse("podman version 6"), None);
        assert_eq!(Version::parse("garbage"), None);
        assert!(Version::new(5, 7, 0) >= MIN_ARTIFACT_VERSION);
        assert!(Version::new(5, 6, 9) < MIN_ARTIFACT_VERSION);
    }

    #[test]
    fn test_order_with_artifacts() {
        let runner = Rc::new(
            ScriptedRunner::new()
                .ok("--version", "podman version 5.7.0\n")
                .ok("artifact ls", ""),
        );
        let caps = detect(&Engine::new("/usr/bin/podman", runner));
        assert!(caps.artifact_objects_supported);
        assert_eq!(
            caps.strategy_order,
            [StrategyKind::NativeArtifact, StrategyKind::NativeImage, StrategyKind::Http]
        );
    }

    #[test]
    fn test_version_alone_is_not_enough() {
        let runner = Rc::new(
            ScriptedRunner::new()
                .ok("--version", "podman version 5.7.2\n")
                .fail("artifact ls"),
        );
        let caps = detect(&Engine::new("podman", runner));
        assert!(!caps.artifact_objects_supported);
        assert_eq!(caps.strategy_order, [StrategyKind::NativeImage, StrategyKind::Http]);
    }

    #[test]
    fn test_old_podman_skips_artifact_probe() {
        let runner = Rc::new(
            ScriptedRunner::new()
                .ok("--version", "podman version 5.2.0\n")
                .ok("artifact ls", ""),
        );
        let caps = detect(&Engine::new("podman", runner.clone()));
        assert!(!caps.artifact_objects_supported);
        assert_eq!(runner.count("artifact ls"), 0);
    }

    #[test]
    fn test_docker_and_unknown_engines() {
        let runner = Rc::new(ScriptedRunner::new().ok("--version", "Docker version 27.3.1, build x"));
        let caps = detect(&Engine::new("docker", runner));
        assert_eq!(caps.strategy_order, [StrategyKind::NativeImage, StrategyKind::Http]);

        let caps = detect(&Engine::new("nerdctl", Rc::new(ScriptedRunner::new())));
        assert_eq!(caps.strategy_order, [StrategyKind::Http]);
        assert_eq!(ArtifactCapabilities::without_engine().preferred(), StrategyKind::Http);
    }

    #[test]
    fn test_probe_is_memoized_per_binary() {
        let runner = Rc::new(ScriptedRunner::new().ok("--version", "podman version 5.7.0").ok("artifact ls", ""));
        let probe = CapabilityProbe::new();
        let engine = Engine::new("/usr/bin/podman", runner.clone());
        let first = probe.probe(&engine);
        let second = probe.probe(&engine);
        assert_eq!(first, second);
        assert_eq!(runner.count("--version"), 1);

        let other = Engine::new("/usr/local/bin/podman", runner.clone());
        probe.probe(&other);
        assert_eq!(runner.count("--version"), 2);
    }
}
