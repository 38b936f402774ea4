pub mod config;
pub mod context;
pub mod digest;
pub mod engine;
pub mod error;
pub mod oci;
pub mod registry;
pub mod resolver;
pub mod store;
pub mod transfer;

pub use context::Context;
pub use error::{DepotError, Result};
pub use resolver::{PathMode, ResolvedModel, Resolver};
