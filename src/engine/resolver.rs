use crate::context::Context;
use crate::engine::capabilities::{ArtifactCapabilities, CapabilityProbe};
use crate::engine::strategy::{
    self, ArtifactStrategy, HttpStrategy, ImageStrategy, OciStrategy, Strategy, StrategyKind, StrategyMode,
};
use crate::engine::Engine;
use crate::error::{DepotError, Result};
use crate::oci::{OciReference, RegistryClient};
use crate::store::GlobalStore;
use crate::transfer::Transfer;
use std::rc::Rc;

/// Decides how an OCI reference is materialized.
///
/// Resolution order in `auto` mode:
/// 1. a complete local snapshot means HTTP, since that is what created it
/// 2. an artifact or image the engine already holds
/// 3. the remote manifest's declared type, for host-qualified references
/// 4. the most preferred strategy the engine supports
#[derive(Debug)]
pub struct StrategyResolver {
    engine: Option<Engine>,
    probe: Rc<CapabilityProbe>,
    store: GlobalStore,
    transfer: Transfer,
    mode: StrategyMode,
}

impl StrategyResolver {
    #[must_use]
    pub fn new(
        engine: Option<Engine>,
        probe: Rc<CapabilityProbe>,
        store: GlobalStore,
        transfer: Transfer,
        mode: StrategyMode,
    ) -> Self {
        Self {
            engine,
            probe,
            store,
            transfer,
            mode,
        }
    }

    /// Engine and mode from the configuration
    pub fn from_context(ctx: &Context, probe: Rc<CapabilityProbe>) -> Result<Self> {
        let mode = ctx.config().engine.strategy.parse::<StrategyMode>()?;
        let engine = ctx.config().engine.resolve_binary().map(Engine::system);
        if engine.is_none() {
            tracing::debug!("No container engine found, only the http strategy is available");
        }
        Ok(Self::new(
            engine,
            probe,
            ctx.store().clone(),
            ctx.transfer().clone(),
            mode,
        ))
    }

    #[must_use]
    pub fn engine(&self) -> Option<&Engine> {
        self.engine.as_ref()
    }

    #[must_use]
    pub fn mode(&self) -> StrategyMode {
        self.mode
    }

    #[must_use]
    pub fn capabilities(&self) -> ArtifactCapabilities {
        self.engine
            .as_ref()
            .map_or_else(ArtifactCapabilities::without_engine, |e| self.probe.probe(e))
    }

    fn http(&self) -> HttpStrategy {
        HttpStrategy::new(self.store.clone(), self.transfer.clone())
    }

    pub fn resolve(&self, reference: &OciReference) -> Result<StrategyKind> {
        let caps = self.capabilities();
        if let StrategyMode::Explicit(_) = self.mode {
            return strategy::select(self.mode, &caps);
        }

        if let Some(kind) = self.held_locally(reference, &caps) {
            return Ok(kind);
        }

        if reference.looks_like_host() {
            if let Some(kind) = self.classify(reference, &caps)? {
                return Ok(kind);
            }
        }

        Ok(caps.preferred())
    }

    fn held_locally(&self, reference: &OciReference, caps: &ArtifactCapabilities) -> Option<StrategyKind> {
        if self.http().exists(reference) {
            tracing::debug!("{reference} has a local snapshot");
            return Some(StrategyKind::Http);
        }
        let engine = self.engine.as_ref()?;
        if caps.artifact_objects_supported && ArtifactStrategy::new(engine.clone()).exists(reference) {
            tracing::debug!("{reference} is a local artifact");
            return Some(StrategyKind::NativeArtifact);
        }
        if caps.supports(StrategyKind::NativeImage) && ImageStrategy::new(engine.clone()).exists(reference) {
            tracing::debug!("{reference} is a local image");
            return Some(StrategyKind::NativeImage);
        }
        None
    }

    /// Strategy already holding `reference`, if any. Only the local store and
    /// the engine are consulted, never a registry.
    pub fn locate(&self, reference: &OciReference) -> Result<Option<Strategy>> {
        let caps = self.capabilities();
        if let StrategyMode::Explicit(_) = self.mode {
            let strategy = self.strategy(strategy::select(self.mode, &caps)?)?;
            return Ok(strategy.exists(reference).then_some(strategy));
        }
        self.held_locally(reference, &caps)
            .map(|kind| self.strategy(kind))
            .transpose()
    }

    /// Classify by the remote manifest. Registry failures fall through to the
    /// capability order; only a type no strategy can handle is an error.
    fn classify(&self, reference: &OciReference, caps: &ArtifactCapabilities) -> Result<Option<StrategyKind>> {
        let client = RegistryClient::new(self.transfer.clone(), &reference.registry, &reference.repository);
        let fetched = match client.get_manifest(&reference.specifier()) {
            Ok(fetched) => fetched,
            Err(e) => {
                tracing::debug!("Could not inspect {reference}: {e}");
                return Ok(None);
            }
        };

        if fetched.manifest.is_cncf_artifact() {
            let kind = if caps.artifact_objects_supported {
                StrategyKind::NativeArtifact
            } else {
                StrategyKind::Http
            };
            tracing::debug!("{reference} is a model artifact, using {kind}");
            return Ok(Some(kind));
        }

        if caps.supports(StrategyKind::NativeImage) {
            tracing::debug!("{reference} is a container image");
            return Ok(Some(StrategyKind::NativeImage));
        }
        Err(DepotError::StrategyUnavailable(format!(
            "{reference} is a container image ({}) but no podman or docker engine is available",
            fetched.content_type
        )))
    }

    /// Instantiate a strategy; engine-backed kinds need an engine
    pub fn strategy(&self, kind: StrategyKind) -> Result<Strategy> {
        let engine = || {
            self.engine.clone().ok_or_else(|| {
                DepotError::StrategyUnavailable(format!("{kind} strategy needs a container engine"))
            })
        };
        Ok(match kind {
            StrategyKind::NativeArtifact => Strategy::Artifact(ArtifactStrategy::new(engine()?)),
            StrategyKind::NativeImage => Strategy::Image(ImageStrategy::new(engine()?)),
            StrategyKind::Http => Strategy::Http(self.http()),
        })
    }

    /// [`resolve`](Self::resolve) then [`strategy`](Self::strategy)
    pub fn resolve_strategy(&self, reference: &OciReference) -> Result<Strategy> {
        let kind = self.resolve(reference)?;
        self.strategy(kind)
    }

    /// Make sure the model is available through its strategy, pulling if needed
    pub fn ensure(&self, reference: &OciReference) -> Result<Strategy> {
        let strategy = self.resolve_strategy(reference)?;
        if strategy.exists(reference) {
            tracing::info!("{reference} is already available ({})", strategy.kind());
        } else {
            tracing::info!("Pulling {reference} with the {} strategy", strategy.kind());
            strategy.pull(reference)?;
        }
        Ok(strategy)
    }

    /// Remove the reference from whichever strategy holds it
    pub fn remove(&self, reference: &OciReference) -> Result<bool> {
        let mut removed = self.http().remove(reference)?;
        if let Some(engine) = &self.engine {
            let caps = self.capabilities();
            if caps.artifact_objects_supported {
                removed |= ArtifactStrategy::new(engine.clone()).remove(reference)?;
            }
            if caps.supports(StrategyKind::NativeImage) {
                let image = ImageStrategy::new(engine.clone());
                if image.exists(reference) {
                    removed |= image.remove(reference)?;
                }
            }
        }
        Ok(removed)
    }
}
