//! Reference resolution: pick a backend from the reference prefix, pull the
//! model, and hand back a [`ResolvedModel`] with host or container paths.

pub mod reference;
pub mod resolved;

pub use reference::{ModelReference, Transport};
pub use resolved::{PathMode, ResolvedModel};

use crate::context::Context;
use crate::engine::strategy::{Strategy, StrategyKind};
use crate::engine::{CapabilityProbe, StrategyResolver};
use crate::error::{DepotError, Result};
use crate::oci::OciReference;
use crate::registry::{self, Backend};
use std::borrow::Cow;
use std::rc::Rc;

pub struct Resolver<'a> {
    ctx: &'a Context,
    default_transport: Transport,
    /// Scheme given to bare references when the default is an alias like `rlcr`
    default_scheme: Option<&'static str>,
    strategies: StrategyResolver,
}

impl<'a> Resolver<'a> {
    /// Resolver using the configured default transport and container engine
    pub fn new(ctx: &'a Context) -> Result<Self> {
        let strategies = StrategyResolver::from_context(ctx, Rc::new(CapabilityProbe::new()))?;
        Self::with_strategies(ctx, strategies)
    }

    pub fn with_strategies(ctx: &'a Context, strategies: StrategyResolver) -> Result<Self> {
        let name = &ctx.config().transport.default;
        let default_transport = Transport::from_name(name)?;
        Ok(Self {
            ctx,
            default_transport,
            default_scheme: reference::alias_scheme(name),
            strategies,
        })
    }

    #[must_use]
    pub fn default_transport(&self) -> Transport {
        self.default_transport
    }

    #[must_use]
    pub fn strategies(&self) -> &StrategyResolver {
        &self.strategies
    }

    /// Backend for `reference`, warning once when the default is used implicitly
    #[must_use]
    pub fn transport_for(&self, reference: &str) -> Transport {
        Transport::detect(reference.trim()).unwrap_or_else(|| {
            reference::warn_implicit_default(reference, self.default_transport);
            self.default_transport
        })
    }

    /// Trim `reference`, prefixing it with the default alias scheme when it has no prefix
    fn qualify<'r>(&self, reference: &'r str) -> Cow<'r, str> {
        let reference = reference.trim();
        match self.default_scheme {
            Some(scheme) if Transport::detect(reference).is_none() => {
                reference::warn_implicit_default(reference, self.default_transport);
                Cow::Owned(format!("{scheme}{reference}"))
            }
            _ => Cow::Borrowed(reference),
        }
    }

    /// Pull `reference` if needed and resolve it
    pub fn resolve(&self, reference: &str) -> Result<ResolvedModel> {
        let reference = self.qualify(reference);
        let reference = reference.as_ref();
        match self.transport_for(reference) {
            Transport::Oci => self.resolve_oci(reference),
            transport => {
                let parsed = ModelReference::with_transport(reference.trim(), transport)?;
                let backend = Backend::for_transport(transport, self.ctx)?;
                let ref_file = registry::pull(&backend, &parsed, self.ctx.store())?;
                let model_store =
                    self.ctx
                        .store()
                        .model(transport.namespace(), &parsed.organization, &parsed.name)?;
                Ok(ResolvedModel::from_store(parsed.raw, model_store, ref_file, None))
            }
        }
    }

    /// Resolve a model and, when given, its draft model for speculative decoding
    pub fn resolve_with_draft(&self, reference: &str, draft: Option<&str>) -> Result<ResolvedModel> {
        let model = self.resolve(reference)?;
        match draft {
            Some(draft) => {
                tracing::debug!("Resolving draft model {draft}");
                Ok(model.with_draft(self.resolve(draft)?))
            }
            None => Ok(model),
        }
    }

    fn resolve_oci(&self, reference: &str) -> Result<ResolvedModel> {
        let oci: OciReference = reference.parse()?;
        match self.strategies.ensure(&oci)? {
            Strategy::Http(http) => {
                let ref_file = http.ref_file(&oci)?;
                let model_store = oci.model_store(self.ctx.store())?;
                Ok(ResolvedModel::from_store(
                    oci.to_string(),
                    model_store,
                    ref_file,
                    Some(StrategyKind::Http),
                ))
            }
            strategy => Ok(ResolvedModel::from_engine(oci, strategy)),
        }
    }

    /// Drop the tag's ref (blobs are left for garbage collection).
    /// Returns whether anything was removed.
    pub fn remove(&self, reference: &str) -> Result<bool> {
        let reference = self.qualify(reference);
        let reference = reference.as_ref();
        match self.transport_for(reference) {
            Transport::Oci => self.strategies.remove(&reference.parse()?),
            transport => {
                let parsed = ModelReference::with_transport(reference.trim(), transport)?;
                self.ctx
                    .store()
                    .model(transport.namespace(), &parsed.organization, &parsed.name)?
                    .remove_snapshot(&parsed.tag)
            }
        }
    }

    /// Resolve an already-pulled model without touching the network
    pub fn lookup(&self, reference: &str) -> Result<ResolvedModel> {
        let reference = self.qualify(reference);
        let reference = reference.as_ref();
        let transport = self.transport_for(reference);
        if transport == Transport::Oci {
            let oci: OciReference = reference.parse()?;
            let Some(strategy) = self.strategies.locate(&oci)? else {
                return Err(DepotError::NotFound {
                    reference: reference.to_string(),
                    backend: transport.to_string(),
                    status: None,
                });
            };
            return match strategy {
                Strategy::Http(http) => Ok(ResolvedModel::from_store(
                    oci.to_string(),
                    oci.model_store(self.ctx.store())?,
                    http.ref_file(&oci)?,
                    Some(StrategyKind::Http),
                )),
                strategy => Ok(ResolvedModel::from_engine(oci, strategy)),
            };
        }

        let parsed = ModelReference::with_transport(reference.trim(), transport)?;
        let model_store = self
            .ctx
            .store()
            .model(transport.namespace(), &parsed.organization, &parsed.name)?;
        let ref_file = model_store
            .read_ref(&parsed.tag)?
            .ok_or_else(|| DepotError::NotFound {
                reference: parsed.raw.clone(),
                backend: transport.to_string(),
                status: None,
            })?;
        Ok(ResolvedModel::from_store(parsed.raw, model_store, ref_file, None))
    }
}
