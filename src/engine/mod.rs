//! Container engine integration: capability probing and the strategies that
//! decide how an OCI-hosted model is materialized (native artifact, image, or
//! HTTP fetch plus bind mount).
//!
//! Engine commands go through [`CommandRunner`] so tests can script the engine.

pub mod capabilities;
pub mod resolver;
pub mod strategy;

pub use capabilities::{ArtifactCapabilities, CapabilityProbe};
pub use resolver::StrategyResolver;
pub use strategy::{Strategy, StrategyKind, StrategyMode};

use crate::error::{DepotError, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::rc::Rc;

/// Captured result of one engine invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs engine commands
pub trait CommandRunner: fmt::Debug {
    fn run(&self, binary: &Path, args: &[&str]) -> Result<CommandOutput>;
}

/// Spawns the real binary
#[derive(Debug, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, binary: &Path, args: &[&str]) -> Result<CommandOutput> {
        tracing::debug!("Running {} {}", binary.display(), args.join(" "));
        let output = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| DepotError::Engine(format!("Failed to run {}: {e}", binary.display())))?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Podman,
    Docker,
    Other,
}

impl EngineKind {
    /// Identify the engine from the binary's base name
    #[must_use]
    pub fn from_binary(binary: &Path) -> Self {
        match binary.file_name().and_then(|n| n.to_str()) {
            Some("podman") => Self::Podman,
            Some("docker") => Self::Docker,
            _ => Self::Other,
        }
    }

    /// Engines that can mount a model image into a container
    #[must_use]
    pub fn supports_native_images(self) -> bool {
        matches!(self, Self::Podman | Self::Docker)
    }
}

/// A container engine binary plus the runner used to invoke it
#[derive(Debug, Clone)]
pub struct Engine {
    binary: PathBuf,
    kind: EngineKind,
    runner: Rc<dyn CommandRunner>,
}

impl Engine {
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>, runner: Rc<dyn CommandRunner>) -> Self {
        let binary = binary.into();
        let kind = EngineKind::from_binary(&binary);
        Self { binary, kind, runner }
    }

    #[must_use]
    pub fn system(binary: impl Into<PathBuf>) -> Self {
        Self::new(binary, Rc::new(SystemRunner))
    }

    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    #[must_use]
    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    pub fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        self.runner.run(&self.binary, args)
    }

    /// True when the command ran and exited 0; failures are only logged
    #[must_use]
    pub fn succeeds(&self, args: &[&str]) -> bool {
        match self.run(args) {
            Ok(output) => output.success,
            Err(e) => {
                tracing::debug!("{e}");
                false
            }
        }
    }

    /// Stdout of a command that must succeed
    pub fn run_checked(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args)?;
        if !output.success {
            return Err(DepotError::Engine(format!(
                "'{} {}' failed: {}",
                self.binary.display(),
                args.join(" "),
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedRunner;
    use super::*;

    #[test]
    fn test_engine_kind_from_binary() {
        assert_eq!(EngineKind::from_binary(Path::new("/usr/bin/podman")), EngineKind::Podman);
        assert_eq!(EngineKind::from_binary(Path::new("docker")), EngineKind::Docker);
        assert_eq!(EngineKind::from_binary(Path::new("/opt/nerdctl")), EngineKind::Other);
        assert!(!EngineKind::Other.supports_native_images());
    }

    #[test]
    fn test_run_checked_reports_stderr() {
        let runner = Rc::new(ScriptedRunner::new().ok("image inspect", "[]").fail("pull"));
        let engine = Engine::new("/usr/bin/podman", runner);
        assert_eq!(engine.run_checked(&["image", "inspect", "x"]).unwrap(), "[]");
        let err = engine.run_checked(&["pull", "x"]).unwrap_err();
        assert!(err.to_string().contains("no such object"));
        assert!(!engine.succeeds(&["artifact", "ls"]));
    }
}
